use crate::frame_id::FrameId;

/// Identity of a work item inside the queue state: a pool slot for frames, a
/// table key for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkKey {
	Frame(usize),
	Event(u64),
}

/// Link-and-effect state embedded in every work item slot. Keeping the links
/// inside the slots means enqueueing a pool frame allocates nothing.
#[derive(Debug, Default)]
pub(crate) struct RingNode {
	prev: Option<WorkKey>,
	next: Option<WorkKey>,
	/// The frame index the issued counter advances to when this item is
	/// consumed; drops coalesce into it, so it can run ahead of the item's
	/// own id.
	pub effective: FrameId,
}

impl RingNode {
	pub fn with_effective(effective: FrameId) -> Self {
		Self {
			effective,
			..Self::default()
		}
	}

	pub fn is_linked(&self) -> bool {
		self.prev.is_some() && self.next.is_some()
	}

	pub fn next(&self) -> Option<WorkKey> {
		self.next
	}

	pub fn prev(&self) -> Option<WorkKey> {
		self.prev
	}
}

/// Resolves keys to the node storage embedded in the item slots.
pub(crate) trait NodeStore {
	fn node(&self, key: WorkKey) -> &RingNode;
	fn node_mut(&mut self, key: WorkKey) -> &mut RingNode;
}

/// Append to the circular ring; `(*head).prev` is the tail.
pub(crate) fn queue(head: &mut Option<WorkKey>, store: &mut dyn NodeStore, key: WorkKey) {
	assert!(!store.node(key).is_linked(), "work item is already queued");
	match *head {
		None => {
			let node = store.node_mut(key);
			node.prev = Some(key);
			node.next = Some(key);
			*head = Some(key);
		}
		Some(first) => {
			let tail = store.node(first).prev.expect("ring head has no tail link");
			store.node_mut(tail).next = Some(key);
			{
				let node = store.node_mut(key);
				node.prev = Some(tail);
				node.next = Some(first);
			}
			store.node_mut(first).prev = Some(key);
		}
	}
}

/// Unlink from the ring, promoting the successor if the head was removed.
pub(crate) fn dequeue(head: &mut Option<WorkKey>, store: &mut dyn NodeStore, key: WorkKey) {
	let node = store.node(key);
	assert!(node.is_linked(), "work item is not queued");
	let prev = node.prev.expect("linked node missing prev");
	let next = node.next.expect("linked node missing next");
	store.node_mut(prev).next = Some(next);
	store.node_mut(next).prev = Some(prev);
	{
		let node = store.node_mut(key);
		node.prev = None;
		node.next = None;
	}
	if *head == Some(key) {
		*head = if next == key { None } else { Some(next) };
	}
}

/// The most recently queued item.
pub(crate) fn tail(head: &Option<WorkKey>, store: &dyn NodeStore) -> Option<WorkKey> {
	let first = (*head)?;
	store.node(first).prev
}
