use std::time::Duration;

/// Builder-style configuration for a [`DisplayQueue`](crate::DisplayQueue).
#[derive(Debug, Clone)]
pub struct QueueConfig {
	pub name: String,
	/// Number of frames in the pool.
	pub pool_count: usize,
	/// Soft bound on pool usage; producers stall briefly once it is reached.
	/// Clamped below `pool_count`.
	pub pool_limit: usize,
	/// How long the worker sleeps when the display is not ready before
	/// re-polling, to recover from a missed readiness edge.
	pub timeout_for_ready: Duration,
	/// Total time a producer may stall in `queue_frame` waiting for the pool
	/// to drain below `pool_limit`.
	pub timeout_for_limit: Duration,
	/// Upper bound on waiting for a frame's source rendering to complete.
	pub timeout_wait_rendering: Duration,
	/// Wait for all source buffers before flipping, and prefer the newest
	/// ready frame once the wait is over.
	pub sync_before_flip: bool,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			name: "scanout".to_string(),
			pool_count: 4,
			pool_limit: 3,
			timeout_for_ready: Duration::from_millis(100),
			timeout_for_limit: Duration::from_millis(50),
			timeout_wait_rendering: Duration::from_millis(500),
			sync_before_flip: false,
		}
	}
}

impl QueueConfig {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..Self::default()
		}
	}

	pub fn pool_count(mut self, count: usize) -> Self {
		self.pool_count = count;
		self
	}

	pub fn pool_limit(mut self, limit: usize) -> Self {
		self.pool_limit = limit;
		self
	}

	pub fn timeout_for_ready(mut self, timeout: Duration) -> Self {
		self.timeout_for_ready = timeout;
		self
	}

	pub fn timeout_for_limit(mut self, timeout: Duration) -> Self {
		self.timeout_for_limit = timeout;
		self
	}

	pub fn timeout_wait_rendering(mut self, timeout: Duration) -> Self {
		self.timeout_wait_rendering = timeout;
		self
	}

	pub fn sync_before_flip(mut self, sync: bool) -> Self {
		self.sync_before_flip = sync;
		self
	}
}
