//! WebSocket block header subscriber

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use ecoho_core::{BlockHeader, ConnectionState, ErrorDetail, StreamConfig, StreamError};

use crate::buffer::BlockBuffer;
use crate::callbacks::FeedCallbacks;
use crate::protocol::{classify, decode_header, Frame, SubscribeRequest, FEED_SOURCE};

const WS_SCHEMES: &[&str] = &["ws", "wss"];

/// How long `close` waits for the reader to finish the close handshake
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Current state and recent blocks, as rendered by the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub struct FeedView {
    pub state: ConnectionState,
    /// Newest first
    pub blocks: Vec<BlockHeader>,
    pub last_error: Option<ErrorDetail>,
    pub subscription_id: Option<String>,
}

/// What handling one inbound frame did
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Subscribed(String),
    Block(BlockHeader),
    Rejected(ErrorDetail),
    Ignored,
}

struct FeedInner {
    state: ConnectionState,
    buffer: BlockBuffer,
    last_error: Option<ErrorDetail>,
    subscription_id: Option<String>,
}

/// State shared between the subscriber handle and its reader task
struct FeedShared {
    inner: Mutex<FeedInner>,
    callbacks: FeedCallbacks,
    updates: watch::Sender<FeedView>,
    request_id: u64,
    notification_method: String,
}

impl FeedShared {
    fn view_of(inner: &FeedInner) -> FeedView {
        FeedView {
            state: inner.state,
            blocks: inner.buffer.to_vec(),
            last_error: inner.last_error.clone(),
            subscription_id: inner.subscription_id.clone(),
        }
    }

    fn publish(&self, inner: &FeedInner) {
        self.updates.send_replace(Self::view_of(inner));
    }

    fn view(&self) -> FeedView {
        Self::view_of(&self.inner.lock())
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.state;
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            debug!(from = %current, to = %next, "Ignoring state transition");
            return false;
        }

        inner.state = next;
        self.publish(&inner);
        drop(inner);

        info!(from = %current, to = %next, "Block feed state changed");
        self.callbacks.emit_state(next);
        true
    }

    fn fail(&self, detail: ErrorDetail) {
        let mut inner = self.inner.lock();
        let current = inner.state;
        if !current.can_transition_to(ConnectionState::Error) {
            debug!(state = %current, "Ignoring failure after teardown: {}", detail);
            return;
        }

        inner.state = ConnectionState::Error;
        inner.last_error = Some(detail.clone());
        self.publish(&inner);
        drop(inner);

        error!(kind = %detail.kind, from = %current, "Block feed failed: {}", detail.message);
        self.callbacks.emit_error(&detail);
        self.callbacks.emit_state(ConnectionState::Error);
    }

    fn handle_frame(&self, text: &str) -> Result<FrameOutcome, ErrorDetail> {
        match classify(text, self.request_id, &self.notification_method)? {
            Frame::Ack { subscription, .. } => {
                let mut inner = self.inner.lock();
                inner.subscription_id = Some(subscription.clone());
                self.publish(&inner);
                drop(inner);

                info!(subscription = %subscription, "Subscription confirmed");
                Ok(FrameOutcome::Subscribed(subscription))
            }
            Frame::Rejected { code, message, .. } => {
                let detail = ErrorDetail::protocol(
                    FEED_SOURCE,
                    format!("subscription rejected ({code}): {message}"),
                );
                self.fail(detail.clone());
                Ok(FrameOutcome::Rejected(detail))
            }
            Frame::Notification { subscription, header } => {
                let header = decode_header(header, Utc::now())?;

                let mut inner = self.inner.lock();
                if inner.state.is_terminal() {
                    return Ok(FrameOutcome::Ignored);
                }
                if let Some(expected) = &inner.subscription_id {
                    if *expected != subscription {
                        debug!(%subscription, %expected, "Notification for another subscription");
                        return Ok(FrameOutcome::Ignored);
                    }
                }
                if !inner.buffer.push(header.clone()) {
                    debug!(number = header.number, "Duplicate block hash dropped");
                    return Ok(FrameOutcome::Ignored);
                }
                self.publish(&inner);
                drop(inner);

                debug!(number = header.number, hash = %header.hash, "New block");
                self.callbacks.emit_block(&header);
                Ok(FrameOutcome::Block(header))
            }
            Frame::Other => Ok(FrameOutcome::Ignored),
        }
    }

    fn teardown(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.buffer.clear();
        inner.subscription_id = None;
        inner.state = ConnectionState::Disconnected;
        self.publish(&inner);
        drop(inner);

        if previous != ConnectionState::Disconnected {
            info!(from = %previous, "Block feed closed");
            self.callbacks.emit_state(ConnectionState::Disconnected);
        }
    }
}

/// One persistent subscription to new block headers.
///
/// Lifecycle is `Idle -> Connecting -> Connected -> {Disconnected, Error}`.
/// Nothing reconnects automatically: once terminal, build a new subscriber
/// (see [`crate::ReconnectingFeed`]).
pub struct BlockSubscriber {
    config: StreamConfig,
    shared: Arc<FeedShared>,
    shutdown: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for BlockSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSubscriber")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BlockSubscriber {
    pub fn new(config: StreamConfig, callbacks: FeedCallbacks) -> Self {
        let inner = FeedInner {
            state: ConnectionState::Idle,
            buffer: BlockBuffer::new(config.capacity),
            last_error: None,
            subscription_id: None,
        };
        let (updates, _) = watch::channel(FeedShared::view_of(&inner));

        let shared = Arc::new(FeedShared {
            inner: Mutex::new(inner),
            callbacks,
            updates,
            request_id: config.request_id,
            notification_method: config.notification_method.clone(),
        });

        Self {
            config,
            shared,
            shutdown: None,
            reader: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Recent headers, newest first
    pub fn blocks(&self) -> Vec<BlockHeader> {
        self.shared.inner.lock().buffer.to_vec()
    }

    pub fn last_error(&self) -> Option<ErrorDetail> {
        self.shared.inner.lock().last_error.clone()
    }

    pub fn view(&self) -> FeedView {
        self.shared.view()
    }

    /// Receiver that always holds the latest view
    pub fn updates(&self) -> watch::Receiver<FeedView> {
        self.shared.updates.subscribe()
    }

    /// Stream of views, starting with the current one
    pub fn watch(&self) -> WatchStream<FeedView> {
        WatchStream::new(self.updates())
    }

    /// Connect, send the subscribe request and start reading frames.
    ///
    /// Only valid from `Idle`. Failures move the state to `Error` and are
    /// also returned.
    pub async fn open(&mut self) -> Result<(), StreamError> {
        if self.state() != ConnectionState::Idle {
            return Err(StreamError::AlreadyOpened);
        }
        self.shared.transition(ConnectionState::Connecting);

        let endpoint = match self.config.endpoint.validate(FEED_SOURCE, WS_SCHEMES) {
            Ok(endpoint) => endpoint,
            Err(detail) => return Err(self.abort_open(detail)),
        };

        info!(url = %endpoint.url, "Connecting to block feed");

        let url = endpoint.url_with_key_param("key");
        let connect_timeout = self.config.connect_timeout();
        let ws = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                return Err(self.abort_open(ErrorDetail::network(FEED_SOURCE, format!("connect failed: {e}"))))
            }
            Err(_) => {
                return Err(self.abort_open(ErrorDetail::timeout(
                    FEED_SOURCE,
                    format!("connect exceeded {connect_timeout:?}"),
                )))
            }
        };

        let (mut write, read) = ws.split();
        self.shared.transition(ConnectionState::Connected);

        let request = SubscribeRequest::new(
            self.config.request_id,
            &self.config.subscribe_method,
            &self.config.event,
        );
        if let Err(e) = write.send(Message::Text(request.to_json())).await {
            return Err(self.abort_open(ErrorDetail::network(FEED_SOURCE, format!("subscribe failed: {e}"))));
        }
        debug!(method = %self.config.subscribe_method, event = %self.config.event, "Subscribe request sent");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown = Some(shutdown_tx);
        self.reader = Some(tokio::spawn(run_reader(
            Arc::clone(&self.shared),
            write,
            read,
            shutdown_rx,
        )));

        Ok(())
    }

    fn abort_open(&self, detail: ErrorDetail) -> StreamError {
        self.shared.fail(detail.clone());
        StreamError::Failed(detail)
    }

    /// Handle one inbound text frame. The reader task calls this for every
    /// frame, in arrival order.
    pub fn on_message(&self, frame: &str) -> Result<FrameOutcome, ErrorDetail> {
        self.shared.handle_frame(frame)
    }

    /// Close the socket, clear the buffer and settle in `Disconnected`.
    /// Safe to call in any state, any number of times.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        if let Some(mut reader) = self.reader.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut reader).await.is_err() {
                warn!("Block feed reader did not stop within {:?}, aborting", CLOSE_GRACE);
                reader.abort();
            }
        }

        self.shared.teardown();
    }
}

impl Drop for BlockSubscriber {
    fn drop(&mut self) {
        // Reader closes the socket once the shutdown side is gone
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn run_reader(
    shared: Arc<FeedShared>,
    mut write: SplitSink<WsStream, Message>,
    mut read: SplitStream<WsStream>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Closing block feed socket");
                if let Err(e) = write.close().await {
                    debug!("Close handshake failed: {}", e);
                }
                shared.transition(ConnectionState::Disconnected);
                return;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match shared.handle_frame(&text) {
                    Ok(FrameOutcome::Rejected(_)) => {
                        let _ = write.close().await;
                        return;
                    }
                    Ok(_) => {}
                    Err(detail) => warn!("Dropping frame: {}", detail.message),
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        shared.fail(ErrorDetail::network(FEED_SOURCE, format!("pong failed: {e}")));
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Block feed closed by server");
                    shared.transition(ConnectionState::Disconnected);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    shared.fail(ErrorDetail::network(FEED_SOURCE, format!("socket error: {e}")));
                    return;
                }
                None => {
                    shared.transition(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }
}
