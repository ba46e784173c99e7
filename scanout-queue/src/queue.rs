use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use scanout_sync::{BufferManager, Layer};
use tracing::{debug, error, trace, warn};

use crate::backend::{DisplayBackend, FrameLease};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::frame::{Event, Frame, FrameConfig, FrameKind};
use crate::frame_id::FrameId;
use crate::ring::{self, NodeStore, RingNode, WorkKey};
use crate::worker::Worker;

// A producer this far ahead of the display while a frame is on screen means
// the display has stalled or the backend stopped releasing.
const FALL_BEHIND_WARN_THRESHOLD: i32 = 16;

/// Counter snapshot for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
	pub queued_work: u32,
	pub queued_frames: u32,
	pub frames_locked_for_display: u32,
	pub frame_pool_used: u32,
	pub frame_pool_peak: u32,
	pub consumed_work: u32,
	pub consumed_frames_since_init: u32,
	pub last_queued: FrameId,
	pub last_issued: FrameId,
	pub last_dropped: FrameId,
}

/// Bounded, single-consumer pipeline between a producer of per-frame display
/// work and a display device.
///
/// Producers enqueue frames and events; a dedicated worker drains the queue
/// into the [`DisplayBackend`], respecting hardware readiness and acquire
/// fences. Dropped frames collapse their effect into whatever item is finally
/// issued, so the externally observable issued frame index only ever moves
/// forward. Cloning the handle is cheap and all clones drive the same queue.
#[derive(Clone)]
pub struct DisplayQueue {
	inner: Arc<QueueShared>,
}

impl DisplayQueue {
	pub fn new(
		config: QueueConfig,
		backend: Arc<dyn DisplayBackend>,
		buffers: Arc<dyn BufferManager>,
	) -> Self {
		let pool_count = config.pool_count.max(2);
		let pool_limit = config.pool_limit.clamp(1, pool_count - 1);
		let name = config.name.clone();
		let frames = (0..pool_count)
			.map(|_| FrameSlot::new())
			.collect::<Vec<_>>()
			.into_boxed_slice();
		let inner = Arc::new_cyclic(|self_ref| QueueShared {
			self_ref: self_ref.clone(),
			backend,
			buffers,
			config,
			pool_count,
			pool_limit,
			state: Mutex::new(QueueState {
				name,
				head: None,
				items: WorkItems {
					frames,
					events: HashMap::new(),
					next_event_key: 0,
				},
				queued_work: 0,
				queued_frames: 0,
				frames_locked_for_display: 0,
				frame_pool_used: 0,
				frame_pool_peak: 0,
				consumed_work: 0,
				consumed_frames_since_init: 0,
				last_queued: FrameId::default(),
				last_issued: FrameId::default(),
				last_dropped: FrameId::default(),
				consumer_blocked: false,
			}),
			work_consumed: Condvar::new(),
			frame_released: Condvar::new(),
			worker: Mutex::new(None),
		});
		Self { inner }
	}

	/// (Re)name the queue and reset the per-init consumption counter.
	pub fn init(&self, name: impl Into<String>) {
		self.inner.init(name.into());
	}

	/// Queue a display-side side effect, ordered after everything already
	/// queued. The queue takes ownership.
	pub fn queue_event(&self, event: Event) {
		self.inner.queue_event(event);
	}

	/// Queue a frame for scanout. `id` must not go backwards.
	pub fn queue_frame(
		&self,
		stack: &[Layer],
		zorder: u32,
		id: FrameId,
		config: FrameConfig,
	) -> Result<(), QueueError> {
		self.inner.queue_frame(stack, zorder, id, config)
	}

	/// Record that the producer dropped `id` without queueing it. The issued
	/// index will reach `id` once the queue tail (or, on an empty queue,
	/// immediately) is consumed.
	pub fn queue_drop(&self, id: FrameId) {
		self.inner.queue_drop(id);
	}

	/// Drop every queued frame that is not locked for display. Events are
	/// preserved.
	pub fn drop_all_frames(&self) {
		self.inner.drop_all_frames();
	}

	/// Drop every queued frame shadowed by a newer frame whose rendering is
	/// already complete.
	pub fn drop_redundant_frames(&self) {
		self.inner.drop_redundant_frames();
	}

	/// Wait until the display has retired every frame up to `frame_index`
	/// (all queued work if zero), then synchronise the flip. On timeout or a
	/// blocked consumer this returns `false` and the queued backlog is
	/// invalidated so it retires cheaply. `None` waits without bound.
	pub fn flush(&self, frame_index: u32, timeout: Option<Duration>) -> bool {
		self.inner.flush(frame_index, timeout)
	}

	/// The backend is temporarily unable to consume (e.g. mode change).
	pub fn consumer_blocked(&self) {
		self.inner.consumer_blocked();
	}

	pub fn consumer_unblocked(&self) {
		self.inner.consumer_unblocked();
	}

	/// Hint that the backend's readiness may have changed; wakes the worker.
	pub fn notify_ready(&self) {
		self.inner.signal_worker();
	}

	/// The backend retired a flipped (or failed) frame.
	pub fn release_frame(&self, lease: FrameLease) {
		self.inner.release_frame(lease);
	}

	/// Wait until no frame is locked for display. Useful before teardown,
	/// after the final flush.
	pub fn wait_all_frames_released(&self, timeout: Duration) -> bool {
		self.inner.wait_all_frames_released(timeout)
	}

	/// Stop the worker thread. Outstanding queued work stays queued; callers
	/// normally `flush` first.
	pub fn stop_worker(&self) {
		self.inner.stop_worker();
	}

	pub fn stats(&self) -> QueueStats {
		self.inner.stats()
	}

	/// Formatted queue state for diagnostics.
	pub fn dump(&self) -> String {
		self.inner.dump()
	}
}

struct FrameSlot {
	node: RingNode,
	frame: Frame,
	locked_for_display: bool,
	/// Content is out of the slot for the duration of an unlocked backend
	/// window.
	in_flight: bool,
	/// A release arrived while the content was out; completed by the worker.
	pending_release: bool,
	/// Id recorded when the frame was locked, for diagnostics while the
	/// content is out.
	display_id: FrameId,
}

impl FrameSlot {
	fn new() -> Self {
		Self {
			node: RingNode::default(),
			frame: Frame::with_kind(FrameKind::DisplayQueue),
			locked_for_display: false,
			in_flight: false,
			pending_release: false,
			display_id: FrameId::default(),
		}
	}
}

struct EventSlot {
	node: RingNode,
	event: Event,
}

/// Item storage; the ring links live inside these slots.
struct WorkItems {
	frames: Box<[FrameSlot]>,
	events: HashMap<u64, EventSlot>,
	next_event_key: u64,
}

impl WorkItems {
	fn insert_event(&mut self, event: Event, effective: FrameId) -> WorkKey {
		let key = self.next_event_key;
		self.next_event_key = self.next_event_key.wrapping_add(1);
		self.events.insert(
			key,
			EventSlot {
				node: RingNode::with_effective(effective),
				event,
			},
		);
		WorkKey::Event(key)
	}
}

impl NodeStore for WorkItems {
	fn node(&self, key: WorkKey) -> &RingNode {
		match key {
			WorkKey::Frame(idx) => &self.frames[idx].node,
			WorkKey::Event(key) => {
				&self
					.events
					.get(&key)
					.expect("event missing from work table")
					.node
			}
		}
	}

	fn node_mut(&mut self, key: WorkKey) -> &mut RingNode {
		match key {
			WorkKey::Frame(idx) => &mut self.frames[idx].node,
			WorkKey::Event(key) => {
				&mut self
					.events
					.get_mut(&key)
					.expect("event missing from work table")
					.node
			}
		}
	}
}

struct QueueState {
	name: String,
	head: Option<WorkKey>,
	items: WorkItems,
	queued_work: u32,
	queued_frames: u32,
	frames_locked_for_display: u32,
	frame_pool_used: u32,
	frame_pool_peak: u32,
	consumed_work: u32,
	consumed_frames_since_init: u32,
	last_queued: FrameId,
	last_issued: FrameId,
	last_dropped: FrameId,
	consumer_blocked: bool,
}

pub(crate) struct QueueShared {
	self_ref: Weak<QueueShared>,
	backend: Arc<dyn DisplayBackend>,
	buffers: Arc<dyn BufferManager>,
	config: QueueConfig,
	pool_count: usize,
	pool_limit: usize,
	state: Mutex<QueueState>,
	work_consumed: Condvar,
	frame_released: Condvar,
	worker: Mutex<Option<Worker>>,
}

impl QueueShared {
	fn lock_state(&self) -> MutexGuard<'_, QueueState> {
		self.state.lock().expect("queue lock poisoned")
	}

	fn init(&self, name: String) {
		let mut guard = self.lock_state();
		guard.name = name;
		guard.consumed_frames_since_init = 0;
	}

	fn queue_event(&self, event: Event) {
		let mut guard = self.lock_state();
		let st = &mut *guard;
		// An event repeats the effect of the last queued frame.
		let effective = st.last_queued;
		let key = st.items.insert_event(event, effective);
		trace!(queue = %st.name, event = event.id(), effective = %effective, "queue event");
		self.do_queue_work(st, key);
	}

	fn queue_frame(
		&self,
		stack: &[Layer],
		zorder: u32,
		id: FrameId,
		config: FrameConfig,
	) -> Result<(), QueueError> {
		let mut guard = self.lock_state();
		guard.last_queued.validate_future(id);

		{
			let st = &*guard;
			let delta = id.frame_index.wrapping_sub(st.last_issued.frame_index) as i32;
			if st.consumed_frames_since_init > 0
				&& st.frames_locked_for_display > 0
				&& delta > FALL_BEHIND_WARN_THRESHOLD
			{
				warn!(
					queue = %st.name,
					last_issued = %st.last_issued,
					new = %id,
					"display is falling behind the producer"
				);
			}
		}

		guard = self.limit_used_frames(guard);
		let st = &mut *guard;

		let Some(idx) = self.find_free(st) else {
			error!(
				queue = %st.name,
				queued = st.queued_frames,
				on_display = st.frames_locked_for_display,
				pool = self.pool_count,
				"all frames on display - check release_frame() is being called"
			);
			return Err(QueueError::NoFreeFrame);
		};
		debug_assert_eq!(st.items.frames[idx].frame.kind(), FrameKind::DisplayQueue);

		st.frame_pool_used += 1;
		if st.frame_pool_used > st.frame_pool_peak {
			st.frame_pool_peak = st.frame_pool_used;
			debug!(queue = %st.name, peak = st.frame_pool_peak, "frame pool peak");
		}

		if let Err(err) = st.items.frames[idx]
			.frame
			.set(stack, zorder, id, config, self.buffers.as_ref())
		{
			st.frame_pool_used -= 1;
			warn!(queue = %st.name, %err, "failed to capture display frame");
			return Err(err);
		}

		st.items.frames[idx].node.effective = id;
		st.last_queued = id;
		self.do_queue_work(st, WorkKey::Frame(idx));
		Ok(())
	}

	fn queue_drop(&self, id: FrameId) {
		let mut guard = self.lock_state();
		let st = &mut *guard;
		st.last_queued.validate_future(id);
		match ring::tail(&st.head, &st.items) {
			None => {
				// Nothing queued; the dropped frame takes effect immediately.
				debug!(queue = %st.name, frame = %id, "drop frame on empty queue");
				self.advance_issued(st, id);
			}
			Some(tail) => {
				// Coalesce the drop into the most recent item; the issued
				// index catches up when that item is consumed.
				st.items.node_mut(tail).effective = id;
				debug!(queue = %st.name, frame = %id, "drop frame coalesced into queue tail");
			}
		}
		st.last_queued = id;
		self.validate_state(st);
	}

	fn drop_all_frames(&self) {
		let mut guard = self.lock_state();
		let st = &mut *guard;
		self.validate_state(st);
		let mut to_drop = Vec::new();
		if let Some(head) = st.head {
			let mut key = head;
			loop {
				if let WorkKey::Frame(idx) = key {
					let slot = &st.items.frames[idx];
					if !slot.locked_for_display && slot.frame.kind() == FrameKind::DisplayQueue {
						to_drop.push(idx);
					}
				}
				key = st.items.node(key).next().expect("ring link broken");
				if key == head {
					break;
				}
			}
		}
		for idx in to_drop {
			self.drop_frame(st, idx);
		}
		self.validate_state(st);
	}

	pub(crate) fn drop_redundant_frames(&self) {
		let mut guard = self.lock_state();
		self.do_drop_redundant(&mut guard);
	}

	fn do_drop_redundant(&self, st: &mut QueueState) {
		let Some(head) = st.head else { return };
		let newest = st.items.node(head).prev().expect("ring link broken");
		if newest == head {
			return;
		}
		// Is the most recent item a frame that is ready to present?
		let mut newer_complete = match newest {
			WorkKey::Frame(idx) => st.items.frames[idx].frame.is_rendering_complete(),
			WorkKey::Event(_) => false,
		};
		// Step from newer to older; a frame shadowed by any newer renderable
		// frame can be skipped without the producer noticing, because the
		// issued index overtakes it on the next consume.
		let mut cursor = st.items.node(newest).prev().expect("ring link broken");
		loop {
			let reached_head = cursor == head;
			let next = st.items.node(cursor).prev().expect("ring link broken");
			if let WorkKey::Frame(idx) = cursor {
				if newer_complete {
					let slot = &st.items.frames[idx];
					if !slot.locked_for_display && slot.frame.kind() == FrameKind::DisplayQueue {
						self.drop_frame(st, idx);
					}
				} else {
					newer_complete = st.items.frames[idx].frame.is_rendering_complete();
				}
			}
			if reached_head {
				break;
			}
			cursor = next;
		}
	}

	fn do_invalidate_frames(&self, st: &mut QueueState) {
		debug!(queue = %st.name, work = st.queued_work, "invalidating queued frames");
		let Some(head) = st.head else { return };
		let mut key = head;
		loop {
			if let WorkKey::Frame(idx) = key {
				let slot = &mut st.items.frames[idx];
				if !slot.locked_for_display && slot.frame.kind() == FrameKind::DisplayQueue {
					slot.frame.invalidate();
				}
			}
			key = st.items.node(key).next().expect("ring link broken");
			if key == head {
				break;
			}
		}
	}

	/// Dequeue a frame that will never be issued. Its effect reaches the
	/// issued index only through coalescing.
	fn drop_frame(&self, st: &mut QueueState, idx: usize) {
		{
			let slot = &st.items.frames[idx];
			debug_assert!(slot.node.is_linked());
			debug_assert!(!slot.locked_for_display);
			debug_assert_eq!(slot.frame.kind(), FrameKind::DisplayQueue);
		}
		debug_assert!(st.queued_frames > 0 && st.queued_work > 0 && st.frame_pool_used > 0);
		st.last_dropped = st.items.frames[idx].frame.frame_id();
		debug!(
			queue = %st.name,
			frame = %st.last_dropped,
			work = st.queued_work - 1,
			frames = st.queued_frames - 1,
			pool = st.frame_pool_used - 1,
			"drop frame"
		);
		ring::dequeue(&mut st.head, &mut st.items, WorkKey::Frame(idx));
		st.queued_frames -= 1;
		st.queued_work -= 1;
		st.frame_pool_used -= 1;
		// Cancelled, not signalled: the frame never reaches the display.
		st.items.frames[idx].frame.reset(true);
		self.work_consumed.notify_all();
	}

	/// Find an unused pool frame, or sacrifice the oldest queued one. `None`
	/// means every frame is locked for display.
	fn find_free(&self, st: &mut QueueState) -> Option<usize> {
		let mut oldest: Option<usize> = None;
		for idx in 0..st.items.frames.len() {
			let slot = &st.items.frames[idx];
			if slot.locked_for_display {
				continue;
			}
			if !slot.node.is_linked() {
				return Some(idx);
			}
			let older = match oldest {
				None => true,
				Some(o) => {
					let current = st.items.frames[o].frame.frame_id().timeline_index;
					current.wrapping_sub(slot.frame.frame_id().timeline_index) as i32 > 0
				}
			};
			if older {
				oldest = Some(idx);
			}
		}
		let idx = oldest?;
		self.drop_frame(st, idx);
		Some(idx)
	}

	/// Stall the producer briefly once pool usage reaches the soft limit, to
	/// give the display a chance to drain. On timeout `find_free` falls back
	/// to dropping the oldest queued frame.
	fn limit_used_frames<'a>(
		&'a self,
		mut guard: MutexGuard<'a, QueueState>,
	) -> MutexGuard<'a, QueueState> {
		self.do_drop_redundant(&mut guard);
		if (guard.frame_pool_used as usize) < self.pool_limit {
			return guard;
		}
		let deadline = Instant::now() + self.config.timeout_for_limit;
		loop {
			debug!(
				queue = %guard.name,
				used = guard.frame_pool_used,
				limit = self.pool_limit,
				"waiting for the frame pool to drain"
			);
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				debug!(queue = %guard.name, "frame pool limit wait timed out");
				break;
			}
			guard = self
				.work_consumed
				.wait_timeout(guard, remaining)
				.expect("queue lock poisoned")
				.0;
			if (guard.frame_pool_used as usize) < self.pool_limit {
				break;
			}
		}
		guard
	}

	fn do_queue_work(&self, st: &mut QueueState, key: WorkKey) {
		debug_assert_eq!(st.queued_work == 0, st.head.is_none());
		let is_frame = matches!(key, WorkKey::Frame(_));
		// Issued frame indices must always trail queued ones.
		st.last_issued.validate_future(st.items.node(key).effective);
		ring::queue(&mut st.head, &mut st.items, key);
		st.queued_work += 1;
		if is_frame {
			st.queued_frames += 1;
		}
		trace!(
			queue = %st.name,
			work = st.queued_work,
			frames = st.queued_frames,
			pool = st.frame_pool_used,
			"queued work"
		);
		self.ensure_worker(&st.name);
		self.validate_state(st);
	}

	fn advance_issued(&self, st: &mut QueueState, id: FrameId) {
		st.last_issued.validate_future(id);
		st.last_issued = id;
		self.work_consumed.notify_all();
	}

	/// Consume the head work item, if any. Called only by the worker.
	pub(crate) fn consume_work(&self) -> bool {
		let guard = self.lock_state();
		self.validate_state(&guard);
		let Some(head) = guard.head else {
			debug_assert_eq!(guard.queued_work, 0);
			return false;
		};
		match head {
			WorkKey::Event(key) => self.do_consume_event(guard, key),
			WorkKey::Frame(idx) => self.do_consume_frame(guard, idx),
		}
		true
	}

	fn do_consume_event(&self, guard: MutexGuard<'_, QueueState>, key: u64) {
		let event = {
			let st = &*guard;
			debug_assert!(st.queued_work > 0);
			let slot = st.items.events.get(&key).expect("event missing from work table");
			st.last_issued.validate_future(slot.node.effective);
			trace!(queue = %st.name, event = slot.event.id(), "consume event");
			slot.event
		};
		// Issue the side effect without the lock so producers keep queueing.
		drop(guard);
		self.backend.consume_event(&event);
		let mut guard = self.lock_state();
		let st = &mut *guard;
		self.validate_state(st);
		debug_assert!(st.queued_work > 0);
		ring::dequeue(&mut st.head, &mut st.items, WorkKey::Event(key));
		let slot = st
			.items
			.events
			.remove(&key)
			.expect("event missing from work table");
		st.queued_work -= 1;
		st.consumed_work = st.consumed_work.wrapping_add(1);
		// Re-read the effective frame: drops may have coalesced into this
		// event while the lock was released.
		self.advance_issued(st, slot.node.effective);
	}

	fn do_consume_frame<'a>(&'a self, mut guard: MutexGuard<'a, QueueState>, mut idx: usize) {
		{
			let st = &*guard;
			debug_assert!(st.queued_work > 0 && st.queued_frames > 0);
			// The display reports ready only once the previous flip is
			// complete, so at most one frame is still locked here.
			debug_assert!(st.frames_locked_for_display <= 1);
			let slot = &st.items.frames[idx];
			debug_assert_eq!(slot.frame.kind(), FrameKind::DisplayQueue);
			st.last_issued.validate_future(slot.node.effective);
			st.last_issued.validate_future(slot.frame.frame_id());
		}
		// Lock the frame immediately so it cannot be reused or dropped while
		// the queue lock is released below.
		self.lock_frame_for_display(&mut guard, idx);

		if self.config.sync_before_flip {
			let frame = {
				let st = &mut *guard;
				st.items.frames[idx].in_flight = true;
				mem::take(&mut st.items.frames[idx].frame)
			};
			drop(guard);
			// Wait for source rendering with the lock released.
			frame.wait_rendering(Some(self.config.timeout_wait_rendering));
			guard = self.lock_state();
			{
				let st = &mut *guard;
				st.items.frames[idx].frame = frame;
				st.items.frames[idx].in_flight = false;
				self.validate_state(st);
				// Only the worker dequeues, so this frame still heads the ring.
				debug_assert_eq!(st.head, Some(WorkKey::Frame(idx)));
				debug_assert!(st.items.frames[idx].locked_for_display);
			}
			self.unlock_frame_for_display(&mut guard, idx);
			{
				let st = &mut *guard;
				// Newer frames may have completed rendering while waiting;
				// flip the newest ready frame and drop the older ones.
				self.do_drop_redundant(st);
				debug_assert!(st.head.is_some());
			}
			match guard.head {
				Some(WorkKey::Frame(new_idx)) => {
					idx = new_idx;
					self.lock_frame_for_display(&mut guard, idx);
					debug_assert_eq!(
						guard.items.frames[idx].frame.kind(),
						FrameKind::DisplayQueue
					);
				}
				// The head is an event now; it is consumed on the next pass.
				_ => return,
			}
		}

		let (frame, effective_issued) = {
			let st = &mut *guard;
			// Dequeue before flipping; a failed flip returns the frame to
			// the pool for immediate reuse.
			debug_assert!(st.queued_frames > 0 && st.queued_work > 0);
			ring::dequeue(&mut st.head, &mut st.items, WorkKey::Frame(idx));
			st.queued_frames -= 1;
			st.queued_work -= 1;
			st.consumed_frames_since_init = st.consumed_frames_since_init.wrapping_add(1);
			st.consumed_work = st.consumed_work.wrapping_add(1);
			let slot = &mut st.items.frames[idx];
			// Coalesced drops can advance the effect past the frame's own id.
			let effective = slot.node.effective;
			debug_assert!(effective.is_at_or_after(&slot.frame.frame_id()));
			slot.in_flight = true;
			let frame = mem::take(&mut slot.frame);
			trace!(queue = %st.name, frame = %frame.frame_id(), effective = %effective, "flip");
			(frame, effective)
		};
		drop(guard);
		// Flip with the lock released. On failure the lease dies here; on
		// success the backend holds it until release_frame.
		let flip = self.backend.consume_frame(&frame, FrameLease(idx));
		let mut guard = self.lock_state();
		let st = &mut *guard;
		{
			let slot = &mut st.items.frames[idx];
			slot.frame = frame;
			slot.in_flight = false;
		}
		match flip {
			Err(err) => {
				warn!(queue = %st.name, %err, "flip failed, releasing frame");
				st.items.frames[idx].pending_release = false;
				self.do_release_frame(st, idx);
			}
			Ok(()) => {
				// The backend may have released the lease while the content
				// was still out of the slot.
				if st.items.frames[idx].pending_release {
					st.items.frames[idx].pending_release = false;
					self.do_release_frame(st, idx);
				}
			}
		}
		self.validate_state(st);
		self.advance_issued(st, effective_issued);
	}

	fn lock_frame_for_display(&self, st: &mut QueueState, idx: usize) {
		debug_assert!(!st.items.frames[idx].locked_for_display);
		st.items.frames[idx].locked_for_display = true;
		st.items.frames[idx].display_id = st.items.frames[idx].frame.frame_id();
		st.frames_locked_for_display += 1;
	}

	fn unlock_frame_for_display(&self, st: &mut QueueState, idx: usize) {
		debug_assert!(st.items.frames[idx].locked_for_display);
		st.items.frames[idx].locked_for_display = false;
		debug_assert!(st.frames_locked_for_display > 0);
		st.frames_locked_for_display -= 1;
	}

	fn release_frame(&self, lease: FrameLease) {
		let mut guard = self.lock_state();
		let st = &mut *guard;
		let idx = lease.0;
		assert!(idx < st.items.frames.len(), "release of an unknown frame lease");
		assert!(
			st.items.frames[idx].locked_for_display,
			"release of a frame that is not on display"
		);
		if st.items.frames[idx].in_flight {
			// The flip call is still returning; the worker completes the
			// release when it puts the frame content back.
			st.items.frames[idx].pending_release = true;
			trace!(queue = %st.name, slot = idx, "release parked behind in-flight flip");
			return;
		}
		self.do_release_frame(st, idx);
	}

	fn do_release_frame(&self, st: &mut QueueState, idx: usize) {
		self.validate_state(st);
		debug_assert!(st.items.frames[idx].locked_for_display);
		debug_assert_eq!(st.items.frames[idx].frame.kind(), FrameKind::DisplayQueue);
		debug_assert!(st.frames_locked_for_display > 0 && st.frame_pool_used > 0);
		debug!(
			queue = %st.name,
			frame = %st.items.frames[idx].display_id,
			work = st.queued_work,
			frames = st.queued_frames,
			pool = st.frame_pool_used - 1,
			"release frame"
		);
		st.items.frames[idx].frame.reset(false);
		st.items.frames[idx].locked_for_display = false;
		st.frames_locked_for_display -= 1;
		st.frame_pool_used -= 1;
		self.validate_state(st);
		self.frame_released.notify_all();
	}

	fn flush(&self, frame_index: u32, timeout: Option<Duration>) -> bool {
		// The worker cannot wait on itself.
		let from_worker = self.worker_thread_id() == Some(thread::current().id());
		let mut guard = self.lock_state();
		let mut flushed = false;
		if !from_worker && !guard.consumer_blocked {
			let deadline = timeout.map(|t| Instant::now() + t);
			let max_consume = guard.queued_work;
			let start_consumed = guard.consumed_work;
			let mut timed_out = false;
			if self.has_worker() {
				loop {
					if guard.consumer_blocked
						|| guard.queued_work == 0
						|| guard.consumed_work.wrapping_sub(start_consumed) >= max_consume
						|| (frame_index != 0
							&& frame_index.wrapping_sub(guard.last_issued.frame_index) as i32 <= 0)
					{
						break;
					}
					self.signal_worker();
					let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
					if remaining.is_some_and(|r| r.is_zero()) {
						timed_out = true;
						break;
					}
					guard = match remaining {
						None => self.work_consumed.wait(guard).expect("queue lock poisoned"),
						Some(r) => {
							self.work_consumed
								.wait_timeout(guard, r)
								.expect("queue lock poisoned")
								.0
						}
					};
				}
			}
			if timed_out {
				warn!(queue = %guard.name, frame_index, "flush timed out");
			} else if !guard.consumer_blocked {
				debug!(
					queue = %guard.name,
					frame = guard.last_issued.frame_index,
					"flushed, synchronising flip"
				);
				drop(guard);
				// Synchronise the flip completion with the lock released.
				self.backend.sync_flip();
				guard = self.lock_state();
				trace!(queue = %guard.name, frame = guard.last_issued.frame_index, "flip synchronised");
				flushed = true;
			}
		}
		if !flushed {
			// Mark the backlog skippable so it retires cheaply later.
			self.do_invalidate_frames(&mut guard);
		}
		flushed
	}

	fn consumer_blocked(&self) {
		let mut guard = self.lock_state();
		guard.consumer_blocked = true;
		self.work_consumed.notify_all();
	}

	fn consumer_unblocked(&self) {
		let mut guard = self.lock_state();
		assert!(guard.consumer_blocked, "consumer was not blocked");
		guard.consumer_blocked = false;
		self.work_consumed.notify_all();
	}

	fn wait_all_frames_released(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		let mut guard = self.lock_state();
		while guard.frames_locked_for_display > 0 {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return false;
			}
			guard = self
				.frame_released
				.wait_timeout(guard, remaining)
				.expect("queue lock poisoned")
				.0;
		}
		true
	}

	fn stats(&self) -> QueueStats {
		let guard = self.lock_state();
		QueueStats {
			queued_work: guard.queued_work,
			queued_frames: guard.queued_frames,
			frames_locked_for_display: guard.frames_locked_for_display,
			frame_pool_used: guard.frame_pool_used,
			frame_pool_peak: guard.frame_pool_peak,
			consumed_work: guard.consumed_work,
			consumed_frames_since_init: guard.consumed_frames_since_init,
			last_queued: guard.last_queued,
			last_issued: guard.last_issued,
			last_dropped: guard.last_dropped,
		}
	}

	fn dump(&self) -> String {
		use std::fmt::Write as _;
		let guard = self.lock_state();
		let st = &*guard;
		let mut out = String::new();
		let _ = write!(
			out,
			"{}: Work {} Frames {} PoolUsed {}/{} (peak {}) OnDisplay {} Consumed {} SinceInit {} LastQueued {} LastIssued {} LastDropped {}",
			st.name,
			st.queued_work,
			st.queued_frames,
			st.frame_pool_used,
			self.pool_count,
			st.frame_pool_peak,
			st.frames_locked_for_display,
			st.consumed_work,
			st.consumed_frames_since_init,
			st.last_queued,
			st.last_issued,
			st.last_dropped,
		);
		let _ = write!(out, " Queue={{");
		let mut walked_work = 0u32;
		if let Some(head) = st.head {
			let mut key = head;
			loop {
				walked_work += 1;
				match key {
					WorkKey::Frame(idx) => {
						let slot = &st.items.frames[idx];
						let _ = write!(out, " frame {} eff {}", slot.frame.frame_id(), slot.node.effective);
					}
					WorkKey::Event(k) => {
						let slot = &st.items.events[&k];
						let _ = write!(out, " event {} eff {}", slot.event.id(), slot.node.effective);
					}
				}
				key = st.items.node(key).next().expect("ring link broken");
				if key == head {
					break;
				}
			}
		}
		let _ = write!(out, " }} OnDisplay={{");
		let mut walked_locked = 0u32;
		for slot in st.items.frames.iter() {
			if slot.locked_for_display {
				walked_locked += 1;
				let _ = write!(
					out,
					" frame {}{}",
					slot.display_id,
					if slot.in_flight { " (in flight)" } else { "" }
				);
			}
		}
		let _ = write!(out, " }}");
		debug_assert_eq!(walked_work, st.queued_work);
		debug_assert_eq!(walked_locked, st.frames_locked_for_display);
		out
	}

	// Worker plumbing.

	pub(crate) fn backend_ready(&self) -> bool {
		self.backend.ready_for_next_work()
	}

	pub(crate) fn timeout_for_ready(&self) -> Duration {
		self.config.timeout_for_ready
	}

	pub(crate) fn has_queued_work(&self) -> bool {
		self.lock_state().queued_work > 0
	}

	fn ensure_worker(&self, name: &str) {
		let mut worker = self.worker.lock().expect("worker registry poisoned");
		if worker.is_none() {
			debug!(queue = name, "starting display worker");
			*worker = Some(Worker::spawn(name, self.self_ref.clone()));
		}
		if let Some(worker) = worker.as_ref() {
			worker.signal_work();
		}
	}

	pub(crate) fn signal_worker(&self) {
		if let Some(worker) = self
			.worker
			.lock()
			.expect("worker registry poisoned")
			.as_ref()
		{
			worker.signal_work();
		}
	}

	fn has_worker(&self) -> bool {
		self.worker.lock().expect("worker registry poisoned").is_some()
	}

	fn worker_thread_id(&self) -> Option<ThreadId> {
		self.worker
			.lock()
			.expect("worker registry poisoned")
			.as_ref()
			.map(Worker::thread_id)
	}

	fn stop_worker(&self) {
		let worker = self.worker.lock().expect("worker registry poisoned").take();
		if let Some(worker) = worker {
			worker.stop();
		}
	}

	/// Full accounting walk; runs after every mutation in debug builds,
	/// exactly where timing bugs would corrupt the counters.
	#[cfg(debug_assertions)]
	fn validate_state(&self, st: &QueueState) {
		let mut work = 0u32;
		let mut frames = 0u32;
		let mut pool = 0u32;
		if let Some(head) = st.head {
			let mut key = head;
			loop {
				work += 1;
				if let WorkKey::Frame(idx) = key {
					frames += 1;
					let slot = &st.items.frames[idx];
					if slot.frame.kind() == FrameKind::DisplayQueue && !slot.locked_for_display {
						pool += 1;
					}
				}
				let next = st.items.node(key).next().expect("ring link broken");
				if next == head {
					break;
				}
				// Adjacent items never step the effective frame backwards.
				st.items
					.node(key)
					.effective
					.validate_future(st.items.node(next).effective);
				key = next;
			}
		}
		assert_eq!(work, st.queued_work, "ring walk disagrees with queued_work");
		assert_eq!(frames, st.queued_frames, "ring walk disagrees with queued_frames");
		assert_eq!(
			pool + st.frames_locked_for_display,
			st.frame_pool_used,
			"pool accounting out of sync"
		);
		// Issued indices always trail queued ones.
		st.last_issued.validate_future(st.last_queued);
	}

	#[cfg(not(debug_assertions))]
	fn validate_state(&self, _st: &QueueState) {}
}

impl Drop for QueueShared {
	fn drop(&mut self) {
		if let Some(worker) = self.worker.get_mut().ok().and_then(|worker| worker.take()) {
			worker.stop();
		}
		if let Ok(st) = self.state.get_mut() {
			debug_assert_eq!(st.queued_work, 0, "queue dropped with work still queued");
			debug_assert_eq!(
				st.frames_locked_for_display, 0,
				"queue dropped with frames still on display"
			);
		}
	}
}
