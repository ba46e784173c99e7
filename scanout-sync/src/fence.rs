use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{MsgFlags, send};

use crate::error::FenceError;

/// Owned read side of a signalling channel.
///
/// A fence becomes signalled when its [`FenceSignaller`] writes, or when the
/// signaller is dropped (hang-up reads the same as a signal at the descriptor
/// level, so keep the signaller alive until the real completion).
#[derive(Debug)]
pub struct Fence {
	fd: OwnedFd,
}

impl Fence {
	/// Create a fence and the handle that signals it.
	pub fn pair() -> Result<(Fence, FenceSignaller), FenceError> {
		let (rx, tx) = UnixStream::pair()?;
		Ok((Fence { fd: rx.into() }, FenceSignaller { fd: tx.into() }))
	}

	/// Duplicate the descriptor. Both copies observe the same signal and are
	/// closed independently.
	pub fn dup(&self) -> Result<Fence, FenceError> {
		Ok(Fence {
			fd: self.fd.try_clone()?,
		})
	}

	/// Block until signalled or until `timeout` elapses. `None` waits forever.
	/// Returns `true` when the fence is signalled.
	pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, FenceError> {
		let deadline = timeout.map(|t| Instant::now() + t);
		loop {
			let poll_timeout = match deadline {
				None => PollTimeout::NONE,
				Some(d) => {
					let remaining = d.saturating_duration_since(Instant::now());
					let ms = remaining.as_millis().min(u16::MAX as u128) as u16;
					// Round sub-millisecond remainders up so short waits still sleep.
					let ms = if ms == 0 && !remaining.is_zero() { 1 } else { ms };
					PollTimeout::from(ms)
				}
			};
			let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
			match poll(&mut fds, poll_timeout) {
				// A long timeout is polled in clamped slices; only give up once
				// the real deadline has passed.
				Ok(0) => {
					if deadline.is_some_and(|d| Instant::now() >= d) {
						return Ok(false);
					}
				}
				Ok(_) => return Ok(true),
				Err(Errno::EINTR) => {}
				Err(err) => return Err(FenceError::Poll(err)),
			}
		}
	}

	/// Non-blocking probe.
	pub fn is_signalled(&self) -> bool {
		self.wait(Some(Duration::ZERO)).unwrap_or(false)
	}
}

/// Write side of a [`Fence`].
#[derive(Debug)]
pub struct FenceSignaller {
	fd: OwnedFd,
}

impl FenceSignaller {
	/// Mark the fence signalled. Safe to call more than once; a fence whose
	/// every read side is already closed is quietly ignored.
	pub fn signal(&self) {
		match send(self.fd.as_raw_fd(), &[1u8], MsgFlags::MSG_NOSIGNAL) {
			Ok(_) | Err(Errno::EPIPE) => {}
			Err(err) => {
				tracing::warn!(%err, "fence signal failed");
			}
		}
	}
}

/// Whether a release fence is a native timeline slot or a foreign one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
	/// Tied to a hardware timeline slot; advancing the timeline is the
	/// release signal, so consumers do not retain these.
	Native,
	/// Owned by another engine (e.g. a composition buffer); retained so the
	/// buffer can be released out of order with respect to scanout.
	Foreign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
	Pending,
	Signalled,
	Cancelled,
}

/// Shared release-fence handle. Cloning retains it; the first `signal` or
/// `cancel` decides the outcome and later transitions are no-ops.
#[derive(Debug, Clone)]
pub struct ReleaseFence {
	inner: Arc<ReleaseInner>,
}

#[derive(Debug)]
struct ReleaseInner {
	state: Mutex<ReleaseOutcome>,
	cond: Condvar,
}

impl ReleaseFence {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(ReleaseInner {
				state: Mutex::new(ReleaseOutcome::Pending),
				cond: Condvar::new(),
			}),
		}
	}

	pub fn signal(&self) {
		self.transition(ReleaseOutcome::Signalled);
	}

	/// Drop the promise of a signal so the buffer behind this fence can be
	/// recycled immediately.
	pub fn cancel(&self) {
		self.transition(ReleaseOutcome::Cancelled);
	}

	fn transition(&self, to: ReleaseOutcome) {
		let mut state = self.inner.state.lock().expect("release fence lock poisoned");
		if *state == ReleaseOutcome::Pending {
			*state = to;
			self.inner.cond.notify_all();
		}
	}

	pub fn outcome(&self) -> ReleaseOutcome {
		*self.inner.state.lock().expect("release fence lock poisoned")
	}

	/// Wait for a signal. Returns `false` on timeout or cancellation.
	pub fn wait_signalled(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		let mut state = self.inner.state.lock().expect("release fence lock poisoned");
		loop {
			match *state {
				ReleaseOutcome::Signalled => return true,
				ReleaseOutcome::Cancelled => return false,
				ReleaseOutcome::Pending => {}
			}
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return false;
			}
			let (guard, _) = self
				.inner
				.cond
				.wait_timeout(state, remaining)
				.expect("release fence lock poisoned");
			state = guard;
		}
	}
}

impl Default for ReleaseFence {
	fn default() -> Self {
		Self::new()
	}
}

/// A release fence together with its kind.
#[derive(Debug, Clone)]
pub struct ReleaseFenceRef {
	pub kind: FenceKind,
	pub fence: ReleaseFence,
}

impl ReleaseFenceRef {
	pub fn native(fence: ReleaseFence) -> Self {
		Self {
			kind: FenceKind::Native,
			fence,
		}
	}

	pub fn foreign(fence: ReleaseFence) -> Self {
		Self {
			kind: FenceKind::Foreign,
			fence,
		}
	}
}
