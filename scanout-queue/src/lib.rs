//! A bounded, single-consumer display work queue.
//! - producers enqueue frames (layer stacks at a z-order) and events
//! - a dedicated worker drains them into a [`DisplayBackend`], respecting
//!   hardware readiness and buffer acquire fences
//! - dropped frames coalesce their effect into the next issued item, keeping
//!   the issued frame index monotone

mod backend;
mod config;
mod error;
mod frame;
mod frame_id;
mod queue;
mod ring;
mod worker;

pub use backend::{DisplayBackend, FlipError, FrameLease};
pub use config::QueueConfig;
pub use error::QueueError;
pub use frame::{Event, Frame, FrameConfig, FrameKind, FrameLayer};
pub use frame_id::FrameId;
pub use queue::{DisplayQueue, QueueStats};
