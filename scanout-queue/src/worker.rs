use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, trace};

use crate::queue::QueueShared;

// Scanout latency is user visible; ask the scheduler for a modest boost.
const WORKER_NICE: libc::c_int = -8;

/// Signalling state shared between the queue and its worker thread. Guards
/// only the signal counter; never held across queue operations.
pub(crate) struct WorkerSignal {
	signalled: Mutex<u32>,
	work: Condvar,
	exit: AtomicBool,
}

impl WorkerSignal {
	fn new() -> Self {
		Self {
			signalled: Mutex::new(0),
			work: Condvar::new(),
			exit: AtomicBool::new(false),
		}
	}

	pub fn signal_work(&self) {
		let mut signalled = self.signalled.lock().expect("worker lock poisoned");
		*signalled += 1;
		self.work.notify_all();
	}

	fn request_exit(&self) {
		let _guard = self.signalled.lock().expect("worker lock poisoned");
		self.exit.store(true, Ordering::SeqCst);
		self.work.notify_all();
	}

	fn exit_pending(&self) -> bool {
		self.exit.load(Ordering::SeqCst)
	}
}

/// The dedicated consumer thread. Holds only a weak reference to the queue,
/// so dropping every queue handle also retires the worker.
pub(crate) struct Worker {
	signal: Arc<WorkerSignal>,
	thread: Option<JoinHandle<()>>,
	thread_id: ThreadId,
}

impl Worker {
	pub fn spawn(name: &str, queue: Weak<QueueShared>) -> Worker {
		let signal = Arc::new(WorkerSignal::new());
		let thread_signal = Arc::clone(&signal);
		let thread = thread::Builder::new()
			.name(name.to_string())
			.spawn(move || run(queue, thread_signal))
			.expect("failed to spawn display worker");
		let thread_id = thread.thread().id();
		Worker {
			signal,
			thread: Some(thread),
			thread_id,
		}
	}

	pub fn signal_work(&self) {
		self.signal.signal_work();
	}

	pub fn thread_id(&self) -> ThreadId {
		self.thread_id
	}

	/// Request exit and join. A worker stopping itself (teardown initiated
	/// from its own callback) detaches instead of joining.
	pub fn stop(mut self) {
		self.signal.request_exit();
		if let Some(thread) = self.thread.take() {
			if thread::current().id() != self.thread_id {
				let _ = thread.join();
			}
		}
	}
}

impl Drop for Worker {
	fn drop(&mut self) {
		if self.thread.is_some() {
			self.signal.request_exit();
		}
	}
}

fn run(queue: Weak<QueueShared>, signal: Arc<WorkerSignal>) {
	let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, WORKER_NICE) };
	if rc != 0 {
		debug!("display worker priority boost refused");
	}

	loop {
		if signal.exit_pending() {
			break;
		}
		let Some(queue) = queue.upgrade() else { break };

		// Drop redundant frames as early as possible.
		queue.drop_redundant_frames();

		let wait_for_ready = !queue.backend_ready();
		let wait_for_work = !wait_for_ready && !queue.has_queued_work();

		if !wait_for_ready && !wait_for_work {
			queue.consume_work();
			continue;
		}
		let timeout_for_ready = queue.timeout_for_ready();
		drop(queue);

		let mut signalled = signal.signalled.lock().expect("worker lock poisoned");
		if signal.exit_pending() {
			break;
		}
		// Re-check we didn't already get signalled, then wait and re-poll.
		if *signalled > 0 {
			*signalled -= 1;
			continue;
		}
		if wait_for_ready {
			// Display is not ready; a bounded wait covers a missed ready
			// edge after a failed flip.
			trace!("display not ready");
			let (mut signalled, timeout) = signal
				.work
				.wait_timeout(signalled, timeout_for_ready)
				.expect("worker lock poisoned");
			if *signalled > 0 {
				*signalled -= 1;
			} else if timeout.timed_out() {
				trace!("timed out waiting for display ready");
			}
		} else {
			// Display is ready but there is no work yet; new work always
			// signals.
			trace!("out of work");
			let mut signalled = signal
				.work
				.wait(signalled)
				.expect("worker lock poisoned");
			if *signalled > 0 {
				*signalled -= 1;
			}
		}
	}
	debug!("display worker exiting");
}
