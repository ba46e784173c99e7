/// Errors raised by fence creation and waiting.
#[derive(Debug, thiserror::Error)]
pub enum FenceError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("poll error: {0}")]
	Poll(#[from] nix::Error),
}
