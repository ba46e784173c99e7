use crate::frame::{Event, Frame};

/// Token naming a pool frame the backend holds between a flip and its
/// release. Passed back through [`DisplayQueue::release_frame`](crate::DisplayQueue::release_frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLease(pub(crate) usize);

/// Report of a failed flip.
#[derive(Debug, thiserror::Error)]
#[error("flip failed: {0}")]
pub struct FlipError(pub String);

/// Downward contract to the display device.
pub trait DisplayBackend: Send + Sync {
	/// Level-triggered readiness poll. The worker re-polls after every wake,
	/// so a missed edge costs at most one ready-timeout interval.
	fn ready_for_next_work(&self) -> bool;

	/// Take ownership of an event's side effect; returns once it has been
	/// initiated.
	fn consume_event(&self, event: &Event);

	/// Initiate a page flip.
	///
	/// `Ok` means the backend holds `lease` until it calls `release_frame`,
	/// from any thread, any time after this call begins returning. `Err` is
	/// the synchronous-failure path: the queue releases the lease itself and
	/// the backend must not release it again.
	fn consume_frame(&self, frame: &Frame, lease: FrameLease) -> Result<(), FlipError>;

	/// Block until the most recently issued flip has fully retired.
	fn sync_flip(&self);
}
