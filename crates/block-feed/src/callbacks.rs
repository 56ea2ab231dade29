//! Listener registry handed to a subscriber at construction

use std::sync::Arc;

use ecoho_core::{BlockHeader, ConnectionState, ErrorDetail};

type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type BlockListener = Arc<dyn Fn(&BlockHeader) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&ErrorDetail) + Send + Sync>;

/// Listeners run on the subscriber's reader task, in frame order.
/// Cloning shares the same listeners, so one registry can serve successive
/// subscribers.
#[derive(Clone, Default)]
pub struct FeedCallbacks {
    state: Vec<StateListener>,
    block: Vec<BlockListener>,
    error: Vec<ErrorListener>,
}

impl FeedCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_state_change(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.state.push(Arc::new(f));
        self
    }

    pub fn on_block(mut self, f: impl Fn(&BlockHeader) + Send + Sync + 'static) -> Self {
        self.block.push(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ErrorDetail) + Send + Sync + 'static) -> Self {
        self.error.push(Arc::new(f));
        self
    }

    pub(crate) fn emit_state(&self, state: ConnectionState) {
        for listener in &self.state {
            listener(state);
        }
    }

    pub(crate) fn emit_block(&self, header: &BlockHeader) {
        for listener in &self.block {
            listener(header);
        }
    }

    pub(crate) fn emit_error(&self, detail: &ErrorDetail) {
        for listener in &self.error {
            listener(detail);
        }
    }
}

impl std::fmt::Debug for FeedCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedCallbacks")
            .field("state", &self.state.len())
            .field("block", &self.block.len())
            .field("error", &self.error.len())
            .finish()
    }
}
