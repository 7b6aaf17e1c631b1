//! Thumbnail pipeline.
//!
//! - `FrameExtractor` / `FfmpegExtractor` - grab and encode one frame
//! - `ThumbnailCoordinator` - deduplicating worker pool
//! - `ThumbnailLedger` - terminal job status kept across restarts

pub mod coordinator;
pub mod generator;
pub mod ledger;

pub use coordinator::{CoordinatorConfig, ThumbnailCoordinator, ThumbnailStatus};
pub use generator::{FfmpegExtractor, FrameExtractor};
pub use ledger::ThumbnailLedger;
