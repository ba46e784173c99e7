use std::time::Duration;

use tracing::warn;

use crate::buffer::BufferHandle;
use crate::error::FenceError;
use crate::fence::{Fence, ReleaseFenceRef};

/// One producer layer as handed to the display queue.
///
/// A `Layer` owns its fences; [`Layer::snapshot`] produces a copy deep enough
/// that the producer may mutate or free the original afterwards.
#[derive(Debug, Default)]
pub struct Layer {
	handle: Option<BufferHandle>,
	device_id: u64,
	acquire_fence: Option<Fence>,
	release_fence: Option<ReleaseFenceRef>,
	disabled: bool,
}

impl Layer {
	pub fn new(handle: BufferHandle, device_id: u64) -> Self {
		Self {
			handle: Some(handle),
			device_id,
			..Self::default()
		}
	}

	/// A layer that takes part in z-ordering but presents nothing.
	pub fn disabled() -> Self {
		Self {
			disabled: true,
			..Self::default()
		}
	}

	pub fn with_acquire_fence(mut self, fence: Fence) -> Self {
		self.acquire_fence = Some(fence);
		self
	}

	pub fn with_release_fence(mut self, fence: ReleaseFenceRef) -> Self {
		self.release_fence = Some(fence);
		self
	}

	/// Deep-enough copy: the acquire fence is duplicated and the release
	/// reference retained, so the copy's lifetime is independent.
	pub fn snapshot(&self) -> Result<Layer, FenceError> {
		let acquire_fence = match &self.acquire_fence {
			Some(fence) => Some(fence.dup()?),
			None => None,
		};
		Ok(Layer {
			handle: self.handle,
			device_id: self.device_id,
			acquire_fence,
			release_fence: self.release_fence.clone(),
			disabled: self.disabled,
		})
	}

	pub fn handle(&self) -> Option<BufferHandle> {
		self.handle
	}

	pub fn device_id(&self) -> u64 {
		self.device_id
	}

	pub fn is_disabled(&self) -> bool {
		self.disabled
	}

	pub fn acquire_fence(&self) -> Option<&Fence> {
		self.acquire_fence.as_ref()
	}

	pub fn release_fence(&self) -> Option<&ReleaseFenceRef> {
		self.release_fence.as_ref()
	}

	pub fn set_acquire_fence(&mut self, fence: Option<Fence>) {
		self.acquire_fence = fence;
	}

	pub fn take_acquire_fence(&mut self) -> Option<Fence> {
		self.acquire_fence.take()
	}

	/// Forget the release reference without deciding its outcome.
	pub fn clear_release_fence(&mut self) {
		self.release_fence = None;
	}

	/// Cancel the release fence and drop the reference, so the buffer behind
	/// it can be recycled without ever being issued.
	pub fn cancel_release_fence(&mut self) {
		if let Some(release) = self.release_fence.take() {
			release.fence.cancel();
		}
	}

	/// Wait until the source buffer's rendering is complete. Disabled and
	/// fence-less layers are trivially complete.
	pub fn wait_rendering(&self, timeout: Option<Duration>) -> bool {
		if self.disabled {
			return true;
		}
		let Some(fence) = &self.acquire_fence else {
			return true;
		};
		match fence.wait(timeout) {
			Ok(done) => done,
			Err(err) => {
				warn!(%err, "acquire fence wait failed, treating as complete");
				true
			}
		}
	}
}
