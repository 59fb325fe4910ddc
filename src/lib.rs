//! Windowed preload and eviction of media resources for a vertically scrolling feed.
//!
//! The [`IndexChangeCoordinator`] keeps a window of prepared players around the
//! current item: it prepares the current item first, preloads neighbours in
//! priority order, and evicts everything that falls outside the window.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod eviction;
pub mod feed;
pub mod pipeline;
pub mod player;
pub mod pool;
pub mod resolver;
#[cfg(feature = "gstreamer")]
pub mod video;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Settings;
pub use coordinator::{CycleOutcome, IndexChangeCoordinator};
pub use error::{CoordinatorError, PrepareError, ResolveError};
pub use events::{EventBus, FeedEvent};
pub use feed::{FeedItem, FeedSource, FeedState, Media};
pub use pipeline::PreparationPipeline;
pub use player::{MediaBackend, PlaybackSink, PlayerEvent};
pub use pool::{HandleState, ResourceHandle, ResourcePool};
pub use resolver::MediaResolver;
pub use window::{Direction, Window};
