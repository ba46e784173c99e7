use std::fmt;

/// Monotone identity of a queued frame: the producer-visible frame index and
/// the hardware timeline slot it will retire.
///
/// Both indices wrap; ordering is signed subtraction mod 2^32, so the pair
/// stays comparable across wrap as long as live frames span less than half
/// the index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameId {
	pub frame_index: u32,
	pub timeline_index: u32,
}

fn index_at_or_after(a: u32, b: u32) -> bool {
	a.wrapping_sub(b) as i32 >= 0
}

impl FrameId {
	pub fn new(frame_index: u32, timeline_index: u32) -> Self {
		Self {
			frame_index,
			timeline_index,
		}
	}

	pub fn is_at_or_after(&self, other: &FrameId) -> bool {
		index_at_or_after(self.frame_index, other.frame_index)
			&& index_at_or_after(self.timeline_index, other.timeline_index)
	}

	/// The sequence observed by the queue is future-only; a step backwards is
	/// a producer contract violation and aborts.
	pub fn validate_future(&self, next: FrameId) {
		assert!(
			next.is_at_or_after(self),
			"frame sequence went backwards: {self} -> {next}"
		);
	}
}

impl fmt::Display for FrameId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "f{}/t{}", self.frame_index, self.timeline_index)
	}
}
