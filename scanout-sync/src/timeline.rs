use std::sync::Mutex;

use tracing::trace;

use crate::error::FenceError;
use crate::fence::{Fence, FenceSignaller};

/// Software timeline minting fences that signal when a slot is reached.
///
/// Points wrap around; comparisons use signed subtraction mod 2^32, the same
/// arithmetic as frame identifiers, so a timeline survives index wrap.
#[derive(Debug)]
pub struct Timeline {
	name: String,
	state: Mutex<TimelineState>,
}

#[derive(Debug, Default)]
struct TimelineState {
	current: u32,
	pending: Vec<(u32, FenceSignaller)>,
}

fn reached(current: u32, point: u32) -> bool {
	current.wrapping_sub(point) as i32 >= 0
}

impl Timeline {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			state: Mutex::new(TimelineState::default()),
		}
	}

	/// Create a fence for `point`. A point the timeline has already passed
	/// yields an immediately signalled fence.
	pub fn create_fence(&self, point: u32) -> Result<Fence, FenceError> {
		let (fence, signaller) = Fence::pair()?;
		let mut state = self.state.lock().expect("timeline lock poisoned");
		if reached(state.current, point) {
			signaller.signal();
		} else {
			state.pending.push((point, signaller));
		}
		Ok(fence)
	}

	/// Advance the timeline, signalling every fence at a slot at or before
	/// `point`. Moving backwards is a no-op.
	pub fn advance_to(&self, point: u32) {
		let mut state = self.state.lock().expect("timeline lock poisoned");
		if reached(state.current, point) {
			return;
		}
		state.current = point;
		trace!(timeline = %self.name, point, "advance");
		state.pending.retain(|(slot, signaller)| {
			if reached(point, *slot) {
				signaller.signal();
				false
			} else {
				true
			}
		});
	}

	/// The most recently reached point.
	pub fn current(&self) -> u32 {
		self.state.lock().expect("timeline lock poisoned").current
	}
}
