//! Streaming change-feed parsing.

pub mod stream;
pub mod transform;

pub use stream::{ChangeFeedStream, RecordDecoder};
pub use transform::{ChangeFeedTransform, FeedFraming};
