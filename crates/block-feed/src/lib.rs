//! Live block header feed
//!
//! Features:
//! - One persistent WebSocket per subscriber, JSON-RPC `eth_subscribe`
//! - Bounded newest-first buffer of recent headers
//! - Explicit connection state machine with idempotent teardown
//! - Optional reconnect-with-backoff supervisor layered outside the subscriber

pub mod buffer;
pub mod callbacks;
pub mod protocol;
pub mod reconnect;
pub mod subscriber;

pub use buffer::BlockBuffer;
pub use callbacks::FeedCallbacks;
pub use reconnect::{FeedExit, ReconnectPolicy, ReconnectingFeed};
pub use subscriber::{BlockSubscriber, FeedView, FrameOutcome};
