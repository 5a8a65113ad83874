//! Shared helpers: a local WebSocket echo server and event waiting.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use runtime_proxy::protocol::ProxyEvent;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Text frame that makes the echo server close the socket with code 4001.
pub const PLEASE_CLOSE: &str = "please-close";
pub const SERVER_CLOSE_CODE: u16 = 4001;
pub const SERVER_CLOSE_REASON: &str = "bye";

/// A WebSocket server that echoes every text and binary frame.
pub struct EchoServer {
    pub url: String,
    accepted: Arc<AtomicUsize>,
    close_frames: Arc<AtomicUsize>,
}

impl EchoServer {
    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Number of close frames received from clients.
    pub fn close_frames(&self) -> usize {
        self.close_frames.load(Ordering::SeqCst)
    }
}

pub async fn spawn_echo_server() -> EchoServer {
    spawn_slow_echo_server(Duration::ZERO).await
}

/// An echo server that waits `handshake_delay` after accepting a TCP
/// connection before completing the WebSocket handshake.
pub async fn spawn_slow_echo_server(handshake_delay: Duration) -> EchoServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let close_frames = Arc::new(AtomicUsize::new(0));

    let server_accepted = accepted.clone();
    let server_closes = close_frames.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            server_accepted.fetch_add(1, Ordering::SeqCst);
            let closes = server_closes.clone();
            tokio::spawn(async move {
                tokio::time::sleep(handshake_delay).await;
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(text) if text == PLEASE_CLOSE => {
                            let frame = CloseFrame {
                                code: CloseCode::from(SERVER_CLOSE_CODE),
                                reason: SERVER_CLOSE_REASON.into(),
                            };
                            let _ = ws.close(Some(frame)).await;
                        }
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(message).await.is_err() {
                                break;
                            }
                        }
                        // Keep reading so the close reply gets flushed.
                        Message::Close(_) => {
                            closes.fetch_add(1, Ordering::SeqCst);
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    EchoServer {
        url: format!("ws://{}/api/kernels/k1/channels", addr),
        accepted,
        close_frames,
    }
}

/// Receive the next event or panic after five seconds.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<ProxyEvent>) -> ProxyEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for proxy event")
        .expect("event channel closed")
}

/// Receive events until `pred` matches one, returning it.
pub async fn wait_for_event<F>(
    events: &mut mpsc::UnboundedReceiver<ProxyEvent>,
    mut pred: F,
) -> ProxyEvent
where
    F: FnMut(&ProxyEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
