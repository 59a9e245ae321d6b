//! Local WebSocket server standing in for the cloud.
//!
//! Records the handshake `authorization` header and path of every connection
//! attempt and every JSON frame received; can push frames to, or drop, all
//! live connections.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
enum ServerAction {
    Send(String),
    DropAll,
}

#[derive(Debug)]
struct Shared {
    handshakes: Mutex<Vec<(String, Option<String>)>>,
    received: Mutex<Vec<Value>>,
    accepted: AtomicUsize,
    open: AtomicUsize,
    reject: AtomicBool,
    actions: broadcast::Sender<ServerAction>,
}

pub struct TestCloudServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl TestCloudServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let (actions, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            handshakes: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
            actions,
        });

        let accept_shared = shared.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, accept_shared.clone()));
            }
        });

        Self { addr, shared, task }
    }

    /// Base URL for the configuration (`http://127.0.0.1:<port>`).
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/ws/printer/", self.addr)
    }

    /// Refuse every handshake with 401 from now on.
    pub fn reject_handshakes(&self, reject: bool) {
        self.shared.reject.store(reject, Ordering::SeqCst);
    }

    /// `(path, authorization header)` of every handshake seen.
    pub fn handshakes(&self) -> Vec<(String, Option<String>)> {
        self.shared.handshakes.lock().clone()
    }

    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Value> {
        self.shared.received.lock().clone()
    }

    pub fn received_count(&self) -> usize {
        self.shared.received.lock().len()
    }

    /// Push a text frame to every open connection.
    pub fn send(&self, text: &str) {
        let _ = self.shared.actions.send(ServerAction::Send(text.to_string()));
    }

    pub fn send_json(&self, value: Value) {
        self.send(&value.to_string());
    }

    /// Drop every open connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.shared.actions.send(ServerAction::DropAll);
    }

    pub fn shutdown(self) {
        self.drop_connections();
        self.task.abort();
    }
}

async fn serve_connection(stream: TcpStream, shared: Arc<Shared>) {
    let mut actions = shared.actions.subscribe();

    let handshake_shared = shared.clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let auth = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        handshake_shared
            .handshakes
            .lock()
            .push((request.uri().path().to_string(), auth));

        if handshake_shared.reject.load(Ordering::SeqCst) {
            let mut error = ErrorResponse::new(Some("unauthorized".to_string()));
            *error.status_mut() = StatusCode::UNAUTHORIZED;
            return Err(error);
        }
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(_) => return,
    };
    shared.accepted.fetch_add(1, Ordering::SeqCst);
    shared.open.fetch_add(1, Ordering::SeqCst);

    let (mut sender, mut receiver) = ws_stream.split();
    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                        shared.received.lock().push(value);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            action = actions.recv() => match action {
                Ok(ServerAction::Send(text)) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(ServerAction::DropAll) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }

    shared.open.fetch_sub(1, Ordering::SeqCst);
}
