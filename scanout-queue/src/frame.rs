use std::time::Duration;

use scanout_sync::{AcquiredBuffer, BufferManager, BufferUsage, FenceKind, Layer};
use tracing::trace;

use crate::error::QueueError;
use crate::frame_id::FrameId;

// Minimum layer allocation, so common stack sizes never reallocate across
// pool cycles. The array only ever grows.
const MIN_LAYER_ALLOC: usize = 8;

/// Pool frames are `DisplayQueue`; a derived display may queue `Custom`
/// frames it owns privately, and the drop policies leave those alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
	Custom,
	DisplayQueue,
}

/// Snapshot of one producer layer held for the lifetime of a queued frame:
/// the layer copy (owning a duplicated acquire fence), and a reference on the
/// underlying buffer.
#[derive(Debug, Default)]
pub struct FrameLayer {
	layer: Layer,
	acquired_buffer: Option<AcquiredBuffer>,
	set: bool,
}

impl FrameLayer {
	/// Capture `layer`. The snapshot is deep enough that the producer may
	/// mutate or free its original; the acquire fence is duplicated into the
	/// snapshot and owned here. Native release references are cleared (the
	/// timeline advance is their signal); foreign ones are retained so
	/// composition buffers can be released out of order.
	pub(crate) fn set(
		&mut self,
		layer: &Layer,
		buffers: &dyn BufferManager,
	) -> Result<(), QueueError> {
		debug_assert!(!self.set, "frame layer set twice without reset");
		debug_assert!(self.acquired_buffer.is_none());

		let mut snapshot = layer.snapshot()?;
		if snapshot
			.release_fence()
			.is_some_and(|release| release.kind == FenceKind::Native)
		{
			snapshot.clear_release_fence();
		}

		if let Some(handle) = snapshot.handle() {
			let acquired = buffers.acquire_buffer(handle);
			if cfg!(debug_assertions) {
				buffers.validate(&acquired, handle, snapshot.device_id());
			}
			buffers.set_buffer_usage(handle, BufferUsage::Display);
			trace!(%handle, device = snapshot.device_id(), "frame layer set");
			self.acquired_buffer = Some(acquired);
		}

		self.layer = snapshot;
		self.set = true;
		Ok(())
	}

	/// Release everything held by this snapshot. `cancel` additionally
	/// cancels the release fence so a composition buffer can be recycled
	/// without its timeline slot ever being issued.
	pub(crate) fn reset(&mut self, cancel: bool) {
		if !self.set {
			return;
		}
		self.layer.set_acquire_fence(None);
		if cancel {
			self.layer.cancel_release_fence();
		} else {
			self.layer.clear_release_fence();
		}
		self.acquired_buffer = None;
		self.set = false;
	}

	/// Block until the source buffer's rendering is complete or `timeout`
	/// elapses, then proceed either way.
	pub fn wait_rendering(&self, timeout: Option<Duration>) -> bool {
		if !self.set {
			return true;
		}
		self.layer.wait_rendering(timeout)
	}

	pub fn is_rendering_complete(&self) -> bool {
		self.wait_rendering(Some(Duration::ZERO))
	}

	pub fn is_disabled(&self) -> bool {
		self.layer.is_disabled() || self.layer.device_id() == 0
	}

	pub fn layer(&self) -> &Layer {
		&self.layer
	}

	pub fn is_set(&self) -> bool {
		self.set
	}
}

/// Display configuration captured with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameConfig {
	pub timing_index: u32,
	pub width: u32,
	pub height: u32,
}

/// A pool-allocated work item carrying an ordered stack of layer snapshots.
///
/// Frames are not destroyed on consume; they return to the pool on release,
/// which is what lets `layers` keep its grown capacity between uses.
#[derive(Debug)]
pub struct Frame {
	kind: FrameKind,
	layers: Vec<FrameLayer>,
	layer_count: usize,
	zorder: u32,
	frame_id: FrameId,
	config: FrameConfig,
	valid: bool,
}

impl Default for Frame {
	fn default() -> Self {
		Self {
			kind: FrameKind::Custom,
			layers: Vec::new(),
			layer_count: 0,
			zorder: 0,
			frame_id: FrameId::default(),
			config: FrameConfig::default(),
			valid: false,
		}
	}
}

impl Frame {
	pub(crate) fn with_kind(kind: FrameKind) -> Self {
		Self {
			kind,
			..Self::default()
		}
	}

	/// Capture a layer stack. On failure the frame is left reset and the
	/// caller may retry with another frame.
	pub(crate) fn set(
		&mut self,
		stack: &[Layer],
		zorder: u32,
		id: FrameId,
		config: FrameConfig,
		buffers: &dyn BufferManager,
	) -> Result<(), QueueError> {
		debug_assert_eq!(self.layer_count, 0, "frame set without reset");

		let wanted = stack.len().max(MIN_LAYER_ALLOC);
		if self.layers.capacity() < wanted {
			self.layers.try_reserve(wanted - self.layers.len())?;
		}

		for (ly, layer) in stack.iter().enumerate() {
			if self.layers.len() == ly {
				self.layers.push(FrameLayer::default());
			}
			if let Err(err) = self.layers[ly].set(layer, buffers) {
				for done in &mut self.layers[..ly] {
					done.reset(true);
				}
				return Err(err);
			}
		}

		self.layer_count = stack.len();
		self.zorder = zorder;
		self.frame_id = id;
		self.config = config;
		self.valid = true;
		Ok(())
	}

	/// Release all layer resources. See [`FrameLayer::reset`] for `cancel`.
	pub(crate) fn reset(&mut self, cancel: bool) {
		for layer in &mut self.layers[..self.layer_count] {
			layer.reset(cancel);
		}
		self.layer_count = 0;
		self.valid = false;
	}

	pub(crate) fn invalidate(&mut self) {
		self.valid = false;
	}

	/// Wait for every layer's source rendering, bounded by `timeout` each.
	pub fn wait_rendering(&self, timeout: Option<Duration>) {
		for layer in &self.layers[..self.layer_count] {
			layer.wait_rendering(timeout);
		}
	}

	pub fn is_rendering_complete(&self) -> bool {
		self.layers[..self.layer_count]
			.iter()
			.all(FrameLayer::is_rendering_complete)
	}

	pub fn kind(&self) -> FrameKind {
		self.kind
	}

	pub fn layer_count(&self) -> usize {
		self.layer_count
	}

	pub fn layer(&self, ly: usize) -> Option<&FrameLayer> {
		self.layers[..self.layer_count].get(ly)
	}

	pub fn zorder(&self) -> u32 {
		self.zorder
	}

	pub fn frame_id(&self) -> FrameId {
		self.frame_id
	}

	pub fn config(&self) -> FrameConfig {
		self.config
	}

	/// Frames invalidated by a failed flush still flow through the queue to
	/// advance the issued index, but the display should short-circuit them.
	pub fn is_valid(&self) -> bool {
		self.valid
	}
}

/// A display-side side effect, ordered relative to frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
	id: u32,
}

impl Event {
	pub fn new(id: u32) -> Self {
		Self { id }
	}

	pub fn id(&self) -> u32 {
		self.id
	}
}
