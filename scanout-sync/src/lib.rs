//! Synchronisation and content primitives shared between the compositor side
//! and the display work queue.
//! - fd-backed fences (signal/dup/poll) and a software timeline minting them
//! - release-fence references with explicit cancel semantics
//! - the buffer-manager seam and a ref-counting in-tree implementation
//! - producer layer snapshots

mod buffer;
mod error;
mod fence;
mod layer;
mod timeline;

pub use buffer::{AcquiredBuffer, BufferHandle, BufferManager, BufferTable, BufferUsage};
pub use error::FenceError;
pub use fence::{Fence, FenceKind, FenceSignaller, ReleaseFence, ReleaseFenceRef, ReleaseOutcome};
pub use layer::Layer;
pub use timeline::Timeline;
