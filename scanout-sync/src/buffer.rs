use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;

/// Opaque identifier for a pixel buffer owned by the buffer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

impl fmt::Display for BufferHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "fb{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
	Render,
	Display,
}

/// Ref-count guard on an acquired buffer; dropping it releases the reference.
#[derive(Debug, Clone)]
pub struct AcquiredBuffer {
	record: Arc<BufferRecord>,
}

#[derive(Debug)]
struct BufferRecord {
	handle: BufferHandle,
}

impl AcquiredBuffer {
	pub fn handle(&self) -> BufferHandle {
		self.record.handle
	}
}

/// Downward seam to whatever owns the pixel buffers.
pub trait BufferManager: Send + Sync {
	fn acquire_buffer(&self, handle: BufferHandle) -> AcquiredBuffer;
	fn set_buffer_usage(&self, handle: BufferHandle, usage: BufferUsage);
	/// Consistency check between an acquisition and the layer it came from.
	/// Contract violations abort; this is a no-op on healthy state.
	fn validate(&self, acquired: &AcquiredBuffer, handle: BufferHandle, device_id: u64);
}

/// In-tree buffer manager: a registry tracking live acquisitions and the last
/// usage mark per handle.
#[derive(Debug, Default)]
pub struct BufferTable {
	entries: Mutex<HashMap<BufferHandle, TableEntry>>,
}

#[derive(Debug)]
struct TableEntry {
	token: Arc<BufferRecord>,
	usage: Option<BufferUsage>,
	device_id: u64,
}

impl BufferTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, handle: BufferHandle, device_id: u64) {
		let mut entries = self.entries.lock().expect("buffer table lock poisoned");
		entries.entry(handle).or_insert_with(|| TableEntry {
			token: Arc::new(BufferRecord { handle }),
			usage: None,
			device_id,
		});
	}

	/// Number of outstanding [`AcquiredBuffer`] guards for `handle`.
	pub fn live_acquisitions(&self, handle: BufferHandle) -> usize {
		let entries = self.entries.lock().expect("buffer table lock poisoned");
		entries
			.get(&handle)
			.map(|entry| Arc::strong_count(&entry.token) - 1)
			.unwrap_or(0)
	}

	pub fn usage(&self, handle: BufferHandle) -> Option<BufferUsage> {
		let entries = self.entries.lock().expect("buffer table lock poisoned");
		entries.get(&handle).and_then(|entry| entry.usage)
	}
}

impl BufferManager for BufferTable {
	fn acquire_buffer(&self, handle: BufferHandle) -> AcquiredBuffer {
		let mut entries = self.entries.lock().expect("buffer table lock poisoned");
		let entry = entries.entry(handle).or_insert_with(|| TableEntry {
			token: Arc::new(BufferRecord { handle }),
			usage: None,
			device_id: 0,
		});
		trace!(%handle, "acquire buffer");
		AcquiredBuffer {
			record: entry.token.clone(),
		}
	}

	fn set_buffer_usage(&self, handle: BufferHandle, usage: BufferUsage) {
		let mut entries = self.entries.lock().expect("buffer table lock poisoned");
		if let Some(entry) = entries.get_mut(&handle) {
			entry.usage = Some(usage);
		}
	}

	fn validate(&self, acquired: &AcquiredBuffer, handle: BufferHandle, device_id: u64) {
		assert_eq!(
			acquired.handle(),
			handle,
			"acquired buffer does not match layer handle"
		);
		let entries = self.entries.lock().expect("buffer table lock poisoned");
		if let Some(entry) = entries.get(&handle) {
			debug_assert!(
				entry.device_id == 0 || device_id == 0 || entry.device_id == device_id,
				"buffer {handle} registered for device {} but validated against {device_id}",
				entry.device_id,
			);
		}
	}
}
