use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_async, accept_hdr_async, tungstenite::Message, WebSocketStream};

use ecoho_block_feed::{
    BlockSubscriber, FeedCallbacks, FeedExit, FeedView, ReconnectPolicy, ReconnectingFeed,
};
use ecoho_core::{ConnectionState, ErrorKind, StreamConfig};

type ServerSocket = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

/// Accept one WebSocket connection and hand it to `handler`
async fn serve_once<F, Fut, T>(handler: F) -> (String, JoinHandle<T>)
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        handler(ws).await
    });
    (format!("ws://{addr}"), handle)
}

/// Read the subscribe request and acknowledge it
async fn expect_subscribe(ws: &mut ServerSocket, subscription: &str) -> Value {
    let request = match ws.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<Value>(&text).unwrap(),
        other => panic!("expected subscribe request, got {other:?}"),
    };
    let ack = json!({ "jsonrpc": "2.0", "id": request["id"], "result": subscription });
    ws.send(Message::Text(ack.to_string())).await.unwrap();
    request
}

async fn notify(ws: &mut ServerSocket, subscription: &str, number: u64) {
    let frame = json!({
        "jsonrpc": "2.0",
        "method": "eth_subscription",
        "params": {
            "subscription": subscription,
            "result": {
                "number": format!("{number:#x}"),
                "hash": format!("0x{number:064x}"),
                "timestamp": "0x6655f0a0"
            }
        }
    });
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Drain the socket, true if the client sent a close frame
async fn saw_client_close(ws: &mut ServerSocket) -> bool {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Close(_)) => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
    false
}

async fn wait_until(subscriber: &BlockSubscriber, pred: impl Fn(&FeedView) -> bool) -> FeedView {
    let mut updates = subscriber.updates();
    timeout(WAIT, async {
        loop {
            let view = updates.borrow_and_update().clone();
            if pred(&view) {
                return view;
            }
            updates.changed().await.unwrap();
        }
    })
    .await
    .expect("feed did not reach the expected view")
}

fn recording() -> (FeedCallbacks, Arc<Mutex<Vec<ConnectionState>>>) {
    let states = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&states);
    let callbacks = FeedCallbacks::new().on_state_change(move |s| sink.lock().unwrap().push(s));
    (callbacks, states)
}

#[tokio::test]
async fn streams_headers_newest_first_and_closes_cleanly() {
    let (url, server) = serve_once(|mut ws| async move {
        let request = expect_subscribe(&mut ws, "sub-1").await;
        for n in 1..=6 {
            notify(&mut ws, "sub-1", n).await;
        }
        let closed = saw_client_close(&mut ws).await;
        (request, closed)
    })
    .await;

    let (callbacks, states) = recording();
    let mut subscriber = BlockSubscriber::new(StreamConfig::with_endpoint(url), callbacks);
    subscriber.open().await.unwrap();

    let view = wait_until(&subscriber, |v| v.blocks.first().map(|b| b.number) == Some(6)).await;
    let numbers: Vec<u64> = view.blocks.iter().map(|b| b.number).collect();
    assert_eq!(numbers, vec![6, 5, 4, 3, 2]);
    assert_eq!(view.state, ConnectionState::Connected);
    assert_eq!(view.subscription_id.as_deref(), Some("sub-1"));
    assert!(view.blocks[0].timestamp.is_some());

    subscriber.close().await;
    subscriber.close().await;
    assert_eq!(subscriber.state(), ConnectionState::Disconnected);
    assert!(subscriber.blocks().is_empty());

    let (request, closed) = timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(
        request,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "eth_subscribe", "params": ["newHeads"] })
    );
    assert!(closed);
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected
        ]
    );
}

#[tokio::test]
async fn api_key_travels_as_query_parameter() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (tx, rx) = oneshot::channel();
        let _ws = accept_hdr_async(stream, move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = tx.send(req.uri().to_string());
            Ok(resp)
        })
        .await
        .unwrap();
        rx.await.unwrap()
    });

    let mut config = StreamConfig::with_endpoint(format!("ws://{addr}/rpc"));
    config.endpoint.api_key = Some("secret-key".into());
    let mut subscriber = BlockSubscriber::new(config, FeedCallbacks::new());
    subscriber.open().await.unwrap();

    let uri = timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(uri, "/rpc?key=secret-key");
    subscriber.close().await;
}

#[tokio::test]
async fn rejected_subscription_moves_to_error() {
    let (url, server) = serve_once(|mut ws| async move {
        let _ = ws.next().await;
        let rejection = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32601, "message": "method not found" }
        });
        ws.send(Message::Text(rejection.to_string())).await.unwrap();
        saw_client_close(&mut ws).await
    })
    .await;

    let errors = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&errors);
    let callbacks = FeedCallbacks::new().on_error(move |e| sink.lock().unwrap().push(e.clone()));
    let mut subscriber = BlockSubscriber::new(StreamConfig::with_endpoint(url), callbacks);
    subscriber.open().await.unwrap();

    let view = wait_until(&subscriber, |v| v.state == ConnectionState::Error).await;
    let error = view.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::ProtocolError);
    assert!(error.message.contains("method not found"));

    assert!(timeout(WAIT, server).await.unwrap().unwrap());
    assert_eq!(errors.lock().unwrap().len(), 1);

    subscriber.close().await;
    assert_eq!(subscriber.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn server_close_moves_to_disconnected() {
    let (url, _server) = serve_once(|mut ws| async move {
        expect_subscribe(&mut ws, "sub-1").await;
        notify(&mut ws, "sub-1", 1).await;
        ws.close(None).await.unwrap();
    })
    .await;

    let mut subscriber = BlockSubscriber::new(StreamConfig::with_endpoint(url), FeedCallbacks::new());
    subscriber.open().await.unwrap();

    let view = wait_until(&subscriber, |v| v.state == ConnectionState::Disconnected).await;
    assert!(view.last_error.is_none());

    // The same instance never reconnects
    assert!(subscriber.open().await.is_err());
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (url, server) = serve_once(|mut ws| async move {
        expect_subscribe(&mut ws, "sub-1").await;
        ws.send(Message::Ping(b"hb".to_vec())).await.unwrap();
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Pong(payload) = frame {
                return payload;
            }
        }
        vec![]
    })
    .await;

    let mut subscriber = BlockSubscriber::new(StreamConfig::with_endpoint(url), FeedCallbacks::new());
    subscriber.open().await.unwrap();

    let payload = timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(payload, b"hb".to_vec());
    subscriber.close().await;
}

#[tokio::test]
async fn dropping_subscriber_closes_socket() {
    let (url, server) = serve_once(|mut ws| async move {
        expect_subscribe(&mut ws, "sub-1").await;
        saw_client_close(&mut ws).await
    })
    .await;

    let mut subscriber = BlockSubscriber::new(StreamConfig::with_endpoint(url), FeedCallbacks::new());
    subscriber.open().await.unwrap();
    wait_until(&subscriber, |v| v.subscription_id.is_some()).await;
    drop(subscriber);

    assert!(timeout(WAIT, server).await.unwrap().unwrap());
}

#[tokio::test]
async fn watch_stream_yields_current_view_first() {
    let subscriber = BlockSubscriber::new(StreamConfig::default(), FeedCallbacks::new());
    let mut views = subscriber.watch();

    let first = timeout(WAIT, views.next()).await.unwrap().unwrap();
    assert_eq!(first.state, ConnectionState::Idle);
    assert!(first.blocks.is_empty());
}

#[tokio::test]
async fn reconnecting_feed_builds_fresh_subscribers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for n in 1..=2u64 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let subscription = format!("sub-{n}");
            expect_subscribe(&mut ws, &subscription).await;
            notify(&mut ws, &subscription, n).await;
            ws.close(None).await.unwrap();
        }
        // Further attempts hang in the handshake until shutdown
        let (_parked, _) = listener.accept().await.unwrap();
        std::future::pending::<()>().await;
    });

    let seen = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&seen);
    let (second_tx, second_rx) = oneshot::channel();
    let second_tx = Arc::new(Mutex::new(Some(second_tx)));
    let callbacks = FeedCallbacks::new().on_block(move |b| {
        sink.lock().unwrap().push(b.number);
        if b.number == 2 {
            if let Some(tx) = second_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
    });

    let feed = ReconnectingFeed::new(
        StreamConfig::with_endpoint(format!("ws://{addr}")),
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            max_attempts: 5,
        },
        callbacks,
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let runner = tokio::spawn(async move { feed.run(shutdown_rx).await });

    timeout(WAIT, second_rx).await.unwrap().unwrap();
    shutdown_tx.send(()).unwrap();

    let exit = timeout(WAIT, runner).await.unwrap().unwrap();
    assert_eq!(exit, FeedExit::Shutdown);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
}

/// Accept connections forever, running `handler` on each and counting them
async fn serve_forever<F, Fut>(handler: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(ws) = accept_async(stream).await {
                tokio::spawn(handler(ws));
            }
        }
    });
    (format!("ws://{addr}"), connections)
}

fn quick_retries(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(10),
        max_attempts,
    }
}

#[tokio::test]
async fn reconnecting_feed_stops_on_rejected_subscription() {
    let (url, connections) = serve_forever(|mut ws| async move {
        let _ = ws.next().await;
        let rejection = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32601, "message": "method not found" }
        });
        let _ = ws.send(Message::Text(rejection.to_string())).await;
        saw_client_close(&mut ws).await;
    })
    .await;

    let feed = ReconnectingFeed::new(StreamConfig::with_endpoint(url), quick_retries(2), FeedCallbacks::new());
    let (_shutdown_tx, shutdown_rx) = oneshot::channel();

    let exit = timeout(WAIT, feed.run(shutdown_rx)).await.expect("feed kept retrying");
    match exit {
        FeedExit::Fatal(detail) => {
            assert_eq!(detail.kind, ErrorKind::ProtocolError);
            assert!(detail.message.contains("method not found"));
        }
        other => panic!("unexpected exit {other:?}"),
    }
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unacknowledged_connections_use_up_retry_budget() {
    let (url, connections) = serve_forever(|mut ws| async move {
        let _ = ws.next().await;
        let _ = ws.close(None).await;
    })
    .await;

    let feed = ReconnectingFeed::new(StreamConfig::with_endpoint(url), quick_retries(2), FeedCallbacks::new());
    let (_shutdown_tx, shutdown_rx) = oneshot::channel();

    let exit = timeout(WAIT, feed.run(shutdown_rx)).await.expect("feed kept retrying");
    match exit {
        FeedExit::GaveUp { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected exit {other:?}"),
    }
    assert_eq!(connections.load(Ordering::SeqCst), 3);
}
