use scanout_sync::FenceError;

/// Errors surfaced to producers. Contract violations (sequence going
/// backwards, double release) are not errors; they abort.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
	#[error("no free frame in the display pool (is release_frame being called?)")]
	NoFreeFrame,
	#[error("failed to snapshot layer stack: {0}")]
	Snapshot(#[from] FenceError),
	#[error("failed to grow the frame layer array: {0}")]
	LayerAlloc(#[from] std::collections::TryReserveError),
}
