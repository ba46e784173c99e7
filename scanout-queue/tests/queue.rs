use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use scanout_queue::{
	DisplayBackend, DisplayQueue, Event, FlipError, Frame, FrameConfig, FrameId, FrameLease,
	QueueConfig, QueueError, QueueStats,
};
use scanout_sync::{BufferHandle, BufferTable, Fence, FenceSignaller, Layer};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Consumed {
	Frame { id: FrameId, valid: bool },
	Event(u32),
}

/// Records every backend call; readiness, release policy and failure
/// injection are switchable per test.
#[derive(Default)]
struct TestBackend {
	queue: Mutex<Option<DisplayQueue>>,
	ready: AtomicBool,
	auto_release: AtomicBool,
	fail_next_flip: AtomicBool,
	blocked: Mutex<bool>,
	unblock: Condvar,
	consumed: Mutex<Vec<Consumed>>,
	held: Mutex<Vec<FrameLease>>,
	max_locked_at_consume: Mutex<u32>,
}

impl TestBackend {
	fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	fn attach(&self, queue: &DisplayQueue) {
		*self.queue.lock().unwrap() = Some(queue.clone());
	}

	fn queue(&self) -> DisplayQueue {
		self.queue.lock().unwrap().clone().expect("backend not attached")
	}

	fn set_ready(&self, ready: bool) {
		self.ready.store(ready, Ordering::SeqCst);
		if let Some(queue) = self.queue.lock().unwrap().clone() {
			queue.notify_ready();
		}
	}

	fn set_auto_release(&self, on: bool) {
		self.auto_release.store(on, Ordering::SeqCst);
	}

	fn set_blocking(&self, on: bool) {
		let mut blocked = self.blocked.lock().unwrap();
		*blocked = on;
		self.unblock.notify_all();
	}

	fn consumed(&self) -> Vec<Consumed> {
		self.consumed.lock().unwrap().clone()
	}

	fn consumed_frames(&self) -> Vec<FrameId> {
		self.consumed()
			.into_iter()
			.filter_map(|call| match call {
				Consumed::Frame { id, .. } => Some(id),
				Consumed::Event(_) => None,
			})
			.collect()
	}

	fn release_held(&self) {
		let held: Vec<_> = std::mem::take(&mut *self.held.lock().unwrap());
		let queue = self.queue();
		for lease in held {
			queue.release_frame(lease);
		}
	}

	fn max_locked_at_consume(&self) -> u32 {
		*self.max_locked_at_consume.lock().unwrap()
	}
}

impl DisplayBackend for TestBackend {
	fn ready_for_next_work(&self) -> bool {
		self.ready.load(Ordering::SeqCst)
	}

	fn consume_event(&self, event: &Event) {
		self.consumed.lock().unwrap().push(Consumed::Event(event.id()));
	}

	fn consume_frame(&self, frame: &Frame, lease: FrameLease) -> Result<(), FlipError> {
		if let Some(queue) = self.queue.lock().unwrap().clone() {
			let locked = queue.stats().frames_locked_for_display;
			let mut max = self.max_locked_at_consume.lock().unwrap();
			if locked > *max {
				*max = locked;
			}
		}
		self.consumed.lock().unwrap().push(Consumed::Frame {
			id: frame.frame_id(),
			valid: frame.is_valid(),
		});
		let mut blocked = self.blocked.lock().unwrap();
		while *blocked {
			blocked = self.unblock.wait(blocked).unwrap();
		}
		drop(blocked);
		if self.fail_next_flip.swap(false, Ordering::SeqCst) {
			return Err(FlipError("injected flip failure".into()));
		}
		if self.auto_release.load(Ordering::SeqCst) {
			self.queue().release_frame(lease);
		} else {
			self.held.lock().unwrap().push(lease);
		}
		Ok(())
	}

	fn sync_flip(&self) {}
}

fn make_queue(backend: &Arc<TestBackend>, config: QueueConfig) -> DisplayQueue {
	let buffers = Arc::new(BufferTable::new());
	let queue = DisplayQueue::new(config, backend.clone(), buffers);
	backend.attach(&queue);
	queue
}

fn id(n: u32) -> FrameId {
	FrameId::new(n, n)
}

fn plain_stack(handle: u64) -> Vec<Layer> {
	vec![Layer::new(BufferHandle(handle), handle)]
}

fn fenced_stack(handle: u64) -> (Vec<Layer>, FenceSignaller) {
	let (fence, signaller) = Fence::pair().unwrap();
	(
		vec![Layer::new(BufferHandle(handle), handle).with_acquire_fence(fence)],
		signaller,
	)
}

fn wait_until(queue: &DisplayQueue, pred: impl Fn(&QueueStats) -> bool) -> bool {
	let deadline = Instant::now() + Duration::from_secs(2);
	while Instant::now() < deadline {
		if pred(&queue.stats()) {
			return true;
		}
		thread::sleep(Duration::from_millis(1));
	}
	false
}

#[test]
fn simple_flip_issues_and_returns_the_frame() {
	let backend = TestBackend::new();
	backend.set_ready(true);
	backend.set_auto_release(true);
	let queue = make_queue(&backend, QueueConfig::new("simple"));
	queue.init("simple");

	queue
		.queue_frame(&plain_stack(1), 0, id(1), FrameConfig::default())
		.unwrap();
	assert!(queue.flush(0, Some(Duration::from_secs(2))));
	assert!(queue.wait_all_frames_released(Duration::from_secs(2)));

	assert_eq!(
		backend.consumed(),
		vec![Consumed::Frame { id: id(1), valid: true }]
	);
	let stats = queue.stats();
	assert_eq!(stats.last_issued, id(1));
	assert_eq!(stats.consumed_frames_since_init, 1);
	assert_eq!(stats.frame_pool_used, 0);
	assert_eq!(stats.frames_locked_for_display, 0);
	assert!(backend.max_locked_at_consume() <= 1);

	queue.stop_worker();
}

#[test]
fn drops_coalesce_into_the_queue_tail() {
	let backend = TestBackend::new();
	backend.set_ready(false);
	backend.set_auto_release(true);
	let queue = make_queue(&backend, QueueConfig::new("coalesce"));

	queue
		.queue_frame(&plain_stack(1), 0, id(1), FrameConfig::default())
		.unwrap();
	queue.queue_drop(id(2));
	queue.queue_drop(id(3));

	let stats = queue.stats();
	assert_eq!(stats.queued_work, 1);
	assert_eq!(stats.last_queued, id(3));
	assert!(queue.dump().contains("frame f1/t1 eff f3/t3"), "{}", queue.dump());

	backend.set_ready(true);
	assert!(queue.flush(0, Some(Duration::from_secs(2))));
	assert!(queue.wait_all_frames_released(Duration::from_secs(2)));

	// The frame keeps its own id, but its consumption advances the issued
	// index to the coalesced drop.
	assert_eq!(backend.consumed_frames(), vec![id(1)]);
	assert_eq!(queue.stats().last_issued, id(3));

	queue.stop_worker();
}

#[test]
fn drop_on_an_empty_queue_advances_immediately() {
	let backend = TestBackend::new();
	let queue = make_queue(&backend, QueueConfig::new("empty-drop"));

	queue.queue_drop(id(4));
	let stats = queue.stats();
	assert_eq!(stats.last_issued, id(4));
	assert_eq!(stats.last_queued, id(4));
	assert_eq!(stats.queued_work, 0);
}

#[test]
fn redundant_frames_are_skipped_for_the_newest_ready_one() {
	let backend = TestBackend::new();
	backend.set_ready(false);
	backend.set_auto_release(true);
	let queue = make_queue(&backend, QueueConfig::new("redundant").pool_count(8).pool_limit(7));

	// No acquire fences, so every frame is immediately renderable.
	for n in 1..=4 {
		queue
			.queue_frame(&plain_stack(n as u64), 0, id(n), FrameConfig::default())
			.unwrap();
	}
	backend.set_ready(true);
	assert!(queue.flush(0, Some(Duration::from_secs(2))));
	assert!(queue.wait_all_frames_released(Duration::from_secs(2)));

	// Only the newest frame reaches the display.
	assert_eq!(backend.consumed_frames(), vec![id(4)]);
	let stats = queue.stats();
	assert_eq!(stats.consumed_frames_since_init, 1);
	assert_eq!(stats.last_issued, id(4));
	// The walk drops newest-shadowed frames back to front, so the oldest is
	// recorded last.
	assert_eq!(stats.last_dropped, id(1));

	queue.stop_worker();
}

#[test]
fn pool_exhaustion_sacrifices_the_oldest_queued_frame() {
	let backend = TestBackend::new();
	backend.set_ready(true);
	backend.set_auto_release(false);
	let config = QueueConfig::new("pool")
		.pool_count(4)
		.pool_limit(3)
		.timeout_for_limit(Duration::from_millis(5));
	let queue = make_queue(&backend, config);

	// Unsignalled acquire fences keep later frames from looking redundant.
	let mut signallers = Vec::new();
	let (stack, signaller) = fenced_stack(1);
	signallers.push(signaller);
	queue.queue_frame(&stack, 0, id(1), FrameConfig::default()).unwrap();
	assert!(wait_until(&queue, |stats| stats.frames_locked_for_display == 1));
	backend.set_ready(false);

	for n in 2..=4 {
		let (stack, signaller) = fenced_stack(n as u64);
		signallers.push(signaller);
		queue.queue_frame(&stack, 0, id(n), FrameConfig::default()).unwrap();
	}
	assert_eq!(queue.stats().frame_pool_used, 4);

	// Fifth frame: the pool is full but one queued frame is unlocked, so the
	// oldest queued frame is dropped to make room.
	let (stack, signaller) = fenced_stack(5);
	signallers.push(signaller);
	queue.queue_frame(&stack, 0, id(5), FrameConfig::default()).unwrap();

	let stats = queue.stats();
	assert_eq!(stats.last_dropped, id(2));
	assert_eq!(stats.frame_pool_used, 4);
	assert!(stats.frames_locked_for_display <= 4);

	queue.drop_all_frames();
	backend.release_held();
	queue.stop_worker();
}

#[test]
fn a_fully_locked_pool_reports_no_free_frame() {
	let backend = TestBackend::new();
	backend.set_ready(true);
	backend.set_auto_release(false);
	let config = QueueConfig::new("locked-pool")
		.pool_count(2)
		.pool_limit(1)
		.timeout_for_limit(Duration::from_millis(5));
	let queue = make_queue(&backend, config);

	queue.queue_frame(&plain_stack(1), 0, id(1), FrameConfig::default()).unwrap();
	assert!(wait_until(&queue, |stats| stats.frames_locked_for_display == 1));
	queue.queue_frame(&plain_stack(2), 0, id(2), FrameConfig::default()).unwrap();
	assert!(wait_until(&queue, |stats| stats.frames_locked_for_display == 2));

	// Every pool frame is on display and unreleased.
	let err = queue
		.queue_frame(&plain_stack(3), 0, id(3), FrameConfig::default())
		.unwrap_err();
	assert!(matches!(err, QueueError::NoFreeFrame));

	backend.release_held();
	assert!(queue.wait_all_frames_released(Duration::from_secs(2)));
	queue.stop_worker();
}

#[test]
fn flush_times_out_and_invalidates_the_backlog() {
	let backend = TestBackend::new();
	backend.set_ready(true);
	backend.set_auto_release(true);
	backend.set_blocking(true);
	let queue = make_queue(&backend, QueueConfig::new("wedge"));

	queue.queue_frame(&plain_stack(1), 0, id(1), FrameConfig::default()).unwrap();
	// Wait for the worker to enter the blocked flip.
	assert!(wait_until(&queue, |stats| stats.consumed_work == 1));
	queue.queue_frame(&plain_stack(2), 0, id(2), FrameConfig::default()).unwrap();

	let start = Instant::now();
	assert!(!queue.flush(0, Some(Duration::from_millis(20))));
	assert!(start.elapsed() < Duration::from_millis(500));

	// The queue is not wedged: producers keep working.
	queue.queue_frame(&plain_stack(3), 0, id(3), FrameConfig::default()).unwrap();

	backend.set_blocking(false);
	assert!(queue.flush(0, Some(Duration::from_secs(2))));
	assert!(queue.wait_all_frames_released(Duration::from_secs(2)));

	// The frame queued before the failed flush was invalidated; the one
	// queued after it was not.
	let consumed = backend.consumed();
	assert!(consumed.contains(&Consumed::Frame { id: id(2), valid: false }));
	assert!(consumed.contains(&Consumed::Frame { id: id(3), valid: true }));

	queue.stop_worker();
}

#[test]
fn events_are_ordered_between_frames() {
	let backend = TestBackend::new();
	backend.set_ready(false);
	backend.set_auto_release(true);
	let queue = make_queue(&backend, QueueConfig::new("events"));

	// Unsignalled fences keep the later frame from shadowing the earlier one.
	let (stack5, _sig5) = fenced_stack(5);
	let (stack6, _sig6) = fenced_stack(6);
	queue.queue_frame(&stack5, 0, id(5), FrameConfig::default()).unwrap();
	queue.queue_event(Event::new(42));
	queue.queue_frame(&stack6, 0, id(6), FrameConfig::default()).unwrap();

	// The event repeats the effect of the frame queued before it.
	assert!(queue.dump().contains("event 42 eff f5/t5"), "{}", queue.dump());

	backend.set_ready(true);
	assert!(queue.flush(0, Some(Duration::from_secs(2))));
	assert!(queue.wait_all_frames_released(Duration::from_secs(2)));

	assert_eq!(
		backend.consumed(),
		vec![
			Consumed::Frame { id: id(5), valid: true },
			Consumed::Event(42),
			Consumed::Frame { id: id(6), valid: true },
		]
	);
	assert_eq!(queue.stats().last_issued, id(6));
	assert!(backend.max_locked_at_consume() <= 1);

	queue.stop_worker();
}

#[test]
fn drop_all_frames_preserves_events() {
	let backend = TestBackend::new();
	backend.set_ready(false);
	backend.set_auto_release(true);
	let queue = make_queue(&backend, QueueConfig::new("drop-all"));

	let (stack1, _sig1) = fenced_stack(1);
	let (stack2, _sig2) = fenced_stack(2);
	queue.queue_frame(&stack1, 0, id(1), FrameConfig::default()).unwrap();
	queue.queue_event(Event::new(7));
	queue.queue_frame(&stack2, 0, id(2), FrameConfig::default()).unwrap();

	queue.drop_all_frames();
	let stats = queue.stats();
	assert_eq!(stats.queued_work, 1);
	assert_eq!(stats.queued_frames, 0);
	assert_eq!(stats.frame_pool_used, 0);
	assert_eq!(stats.last_dropped, id(2));

	backend.set_ready(true);
	assert!(queue.flush(0, Some(Duration::from_secs(2))));

	// A dropped frame's effect only reaches the issued index through
	// coalescing; the surviving event still carries its enqueue-time effect.
	assert_eq!(backend.consumed(), vec![Consumed::Event(7)]);
	assert_eq!(queue.stats().last_issued, id(1));

	queue.stop_worker();
}

#[test]
fn failed_flips_release_synchronously() {
	let backend = TestBackend::new();
	backend.set_ready(true);
	backend.set_auto_release(true);
	backend.fail_next_flip.store(true, Ordering::SeqCst);
	let queue = make_queue(&backend, QueueConfig::new("failed-flip"));

	queue.queue_frame(&plain_stack(1), 0, id(1), FrameConfig::default()).unwrap();
	assert!(queue.flush(0, Some(Duration::from_secs(2))));
	assert!(queue.wait_all_frames_released(Duration::from_secs(2)));

	// The failed frame went straight back to the pool and the issued index
	// still advanced.
	let stats = queue.stats();
	assert_eq!(stats.frame_pool_used, 0);
	assert_eq!(stats.frames_locked_for_display, 0);
	assert_eq!(stats.last_issued, id(1));

	queue.stop_worker();
}

#[test]
fn sync_before_flip_prefers_the_newest_ready_frame() {
	let backend = TestBackend::new();
	backend.set_ready(true);
	backend.set_auto_release(true);
	let config = QueueConfig::new("sync-flip")
		.sync_before_flip(true)
		.timeout_wait_rendering(Duration::from_millis(500));
	let queue = make_queue(&backend, config);

	let (stack1, sig1) = fenced_stack(1);
	queue.queue_frame(&stack1, 0, id(1), FrameConfig::default()).unwrap();
	// Give the worker time to park in the rendering wait.
	thread::sleep(Duration::from_millis(20));
	queue.queue_frame(&plain_stack(2), 0, id(2), FrameConfig::default()).unwrap();
	sig1.signal();

	assert!(queue.flush(0, Some(Duration::from_secs(2))));
	assert!(queue.wait_all_frames_released(Duration::from_secs(2)));

	// The older frame was skipped in favour of the newer ready one.
	assert_eq!(backend.consumed_frames(), vec![id(2)]);
	let stats = queue.stats();
	assert_eq!(stats.consumed_frames_since_init, 1);
	assert_eq!(stats.last_dropped, id(1));
	assert_eq!(stats.last_issued, id(2));

	queue.stop_worker();
}

#[test]
fn issued_index_is_monotone_under_a_producer_stream() {
	let backend = TestBackend::new();
	backend.set_ready(true);
	backend.set_auto_release(true);
	let queue = make_queue(&backend, QueueConfig::new("stream"));

	let sampler_queue = queue.clone();
	let stop = Arc::new(AtomicBool::new(false));
	let sampler_stop = stop.clone();
	let sampler = thread::spawn(move || {
		let mut previous = FrameId::default();
		while !sampler_stop.load(Ordering::SeqCst) {
			let stats = sampler_queue.stats();
			assert!(
				stats.last_issued.is_at_or_after(&previous),
				"issued index went backwards: {} -> {}",
				previous,
				stats.last_issued
			);
			assert!(stats.last_queued.is_at_or_after(&stats.last_issued));
			previous = stats.last_issued;
			thread::sleep(Duration::from_micros(200));
		}
	});

	for n in 1..=30u32 {
		if n % 3 == 0 {
			queue.queue_drop(id(n));
		} else {
			queue
				.queue_frame(&plain_stack(n as u64), 0, id(n), FrameConfig::default())
				.unwrap();
		}
	}
	assert!(queue.flush(0, Some(Duration::from_secs(2))));
	assert!(queue.wait_all_frames_released(Duration::from_secs(2)));
	stop.store(true, Ordering::SeqCst);
	sampler.join().unwrap();

	let stats = queue.stats();
	assert_eq!(stats.queued_work, 0);
	assert_eq!(stats.last_issued, stats.last_queued);
	assert_eq!(stats.last_issued, id(30));

	// Every queued frame either reached the display or was overtaken by the
	// issued index.
	let consumed = backend.consumed_frames();
	for n in 1..=30u32 {
		if n % 3 != 0 {
			assert!(
				consumed.contains(&id(n)) || stats.last_issued.is_at_or_after(&id(n)),
				"frame {n} neither consumed nor overtaken"
			);
		}
	}

	queue.stop_worker();
}

#[test]
fn flush_fails_while_the_consumer_is_blocked() {
	let backend = TestBackend::new();
	backend.set_ready(false);
	backend.set_auto_release(true);
	let queue = make_queue(&backend, QueueConfig::new("blocked"));

	let (stack, _sig) = fenced_stack(1);
	queue.queue_frame(&stack, 0, id(1), FrameConfig::default()).unwrap();
	queue.consumer_blocked();
	assert!(!queue.flush(0, Some(Duration::from_millis(50))));
	queue.consumer_unblocked();

	backend.set_ready(true);
	assert!(queue.flush(0, Some(Duration::from_secs(2))));
	assert!(queue.wait_all_frames_released(Duration::from_secs(2)));
	// The frame survived the blocked flush but was invalidated by it.
	assert_eq!(
		backend.consumed(),
		vec![Consumed::Frame { id: id(1), valid: false }]
	);

	queue.stop_worker();
}
