//! Common utilities for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use server::{build_router, AppState, ServeMode, ServerConfig};
use stream_core::{ControlMessage, SessionState};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};

pub type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Provider behaviour after `Speak` + `Flush`.
#[derive(Clone, Debug)]
pub enum Script {
    /// Send the frames, then `Flushed`
    Speak(Vec<&'static [u8]>),
    /// Send the frames, then drop the socket
    DropAfter(Vec<&'static [u8]>),
    /// Never answer
    Silent,
}

#[derive(Default)]
pub struct ProviderLog {
    pub close_commands: AtomicUsize,
    pub texts: Mutex<Vec<String>>,
    pub auth_headers: Mutex<Vec<Option<String>>>,
}

/// Fake speak endpoint; every connection plays the same script.
pub struct FakeProvider {
    pub url: String,
    pub log: Arc<ProviderLog>,
}

impl FakeProvider {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/v1/speak", listener.local_addr().unwrap());
        let log = Arc::new(ProviderLog::default());

        let accept_log = log.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_provider(stream, script.clone(), accept_log.clone()));
            }
        });

        Self { url, log }
    }

    pub fn config(&self) -> provider_core::UpstreamConfig {
        provider_core::UpstreamConfig {
            url: self.url.clone(),
            connect_timeout: Duration::from_secs(2),
            frame_timeout: Duration::from_secs(2),
            close_grace: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(50),
        }
    }
}

async fn serve_provider(stream: TcpStream, script: Script, log: Arc<ProviderLog>) {
    let handshake_log = log.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        handshake_log.auth_headers.lock().unwrap().push(
            req.headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );
        Ok(resp)
    };
    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
        return;
    };

    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            let command: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            match command["type"].as_str() {
                Some("Speak") => log
                    .texts
                    .lock()
                    .unwrap()
                    .push(command["text"].as_str().unwrap_or_default().to_string()),
                Some("Flush") => break,
                _ => {}
            }
        }
    }

    match script {
        Script::Speak(frames) => {
            for frame in frames {
                let _ = ws.send(Message::binary(frame.to_vec())).await;
            }
            let _ = ws.send(Message::text(r#"{"type":"Flushed","sequence_id":0}"#)).await;
        }
        Script::DropAfter(frames) => {
            for frame in frames {
                let _ = ws.send(Message::binary(frame.to_vec())).await;
            }
            return;
        }
        Script::Silent => {}
    }

    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            if text.as_str().contains(r#""Close""#) {
                log.close_commands.fetch_add(1, Ordering::SeqCst);
                break;
            }
        }
    }
}

/// Configuration pointing at `upstream_url` with short test timeouts.
pub fn test_config(upstream_url: &str) -> ServerConfig {
    ServerConfig {
        port: 0,
        mode: ServeMode::Both,
        api_key: "test-key".to_string(),
        upstream_url: upstream_url.to_string(),
        upstream_connect_timeout_secs: 2,
        upstream_frame_timeout_secs: 2,
        session_timeout_secs: 5,
        close_grace_ms: 500,
        send_timeout_secs: 2,
        ..ServerConfig::default()
    }
}

pub struct TestApp {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestApp {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn token_url(&self) -> String {
        format!("http://{}/api/token", self.addr)
    }
}

/// Serve the full application on an ephemeral port.
pub async fn spawn_app(config: ServerConfig) -> TestApp {
    let state = AppState::new(config);
    let app = build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestApp { addr, state }
}

pub async fn connect(app: &TestApp) -> ClientSocket {
    let (ws, _) = connect_async(app.ws_url()).await.unwrap();
    ws
}

/// Everything the relay sent for one request.
#[derive(Debug)]
pub struct RelayedSession {
    pub started: bool,
    pub frames: Vec<Bytes>,
    pub terminal: ControlMessage,
}

/// Read messages until `end_of_stream` or `error`.
pub async fn read_session(ws: &mut ClientSocket) -> RelayedSession {
    let mut started = false;
    let mut frames = Vec::new();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("relay stalled")
            .expect("relay closed the connection")
            .unwrap();
        match msg {
            Message::Binary(data) => frames.push(data),
            Message::Text(text) => match ControlMessage::from_json(text.as_str()).unwrap() {
                ControlMessage::SessionStarted { .. } => started = true,
                terminal => {
                    return RelayedSession {
                        started,
                        frames,
                        terminal,
                    }
                }
            },
            _ => {}
        }
    }
}

pub fn error_code(message: &ControlMessage) -> Option<&str> {
    match message {
        ControlMessage::Error { code, .. } => Some(code.as_str()),
        _ => None,
    }
}

/// Wait for the single active session to reach `Streaming`.
pub async fn wait_for_streaming(app: &TestApp) -> uuid::Uuid {
    for _ in 0..200 {
        let sessions = app.state.registry.snapshot().await;
        if let [session] = sessions.as_slice() {
            if session.state == SessionState::Streaming {
                return session.id;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no session reached the streaming state");
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
