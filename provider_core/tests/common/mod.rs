//! In-process stand-in for the provider's speak WebSocket.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use provider_core::{Credential, UpstreamConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{http, Message};

/// What the fake provider does once it has received `Speak` + `Flush`.
#[derive(Clone, Debug)]
pub enum Script {
    /// Send the frames, then `Flushed`
    Speak(Vec<&'static [u8]>),
    /// Send the frames, then drop the socket without a close handshake
    DropAfter(Vec<&'static [u8]>),
    /// Send the frames, then a provider `Error` event
    ErrorAfter(Vec<&'static [u8]>),
    /// Never answer
    Silent,
}

#[derive(Default)]
pub struct ProviderLog {
    pub handshakes: AtomicUsize,
    pub close_commands: AtomicUsize,
    pub texts: Mutex<Vec<String>>,
    pub auth_headers: Mutex<Vec<Option<String>>>,
    pub queries: Mutex<Vec<String>>,
}

pub struct FakeProvider {
    pub url: String,
    pub log: Arc<ProviderLog>,
}

impl FakeProvider {
    pub async fn start(script: Script) -> Self {
        Self::start_rejecting(script, 0).await
    }

    /// Fail the first `reject_first` handshakes with a 503.
    pub async fn start_rejecting(script: Script, reject_first: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/v1/speak", listener.local_addr().unwrap());
        let log = Arc::new(ProviderLog::default());

        let accept_log = log.clone();
        tokio::spawn(async move {
            let mut attempts = 0usize;
            while let Ok((stream, _)) = listener.accept().await {
                attempts += 1;
                let reject = attempts <= reject_first;
                tokio::spawn(serve(stream, script.clone(), accept_log.clone(), reject));
            }
        });

        Self { url, log }
    }

    pub fn config(&self) -> UpstreamConfig {
        UpstreamConfig {
            url: self.url.clone(),
            connect_timeout: Duration::from_secs(2),
            frame_timeout: Duration::from_secs(2),
            close_grace: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(50),
        }
    }
}

pub fn test_credential() -> Credential {
    Credential::new("test-key", chrono::Utc::now() + chrono::Duration::minutes(5))
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

async fn serve(stream: TcpStream, script: Script, log: Arc<ProviderLog>, reject: bool) {
    let handshake_log = log.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        handshake_log.handshakes.fetch_add(1, Ordering::SeqCst);
        if reject {
            return Err(http::Response::builder()
                .status(503)
                .body(Some("busy".to_string()))
                .unwrap());
        }
        handshake_log
            .queries
            .lock()
            .unwrap()
            .push(req.uri().query().unwrap_or_default().to_string());
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
                Some("Close") => {
                    log.close_commands.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                _ => {}
            }
        }
    }

    match script {
        Script::Speak(frames) => {
            for frame in frames {
                let _ = ws.send(Message::binary(frame.to_vec())).await;
            }
            let _ = ws
                .send(Message::text(r#"{"type":"Flushed","sequence_id":0}"#))
                .await;
        }
        Script::DropAfter(frames) => {
            for frame in frames {
                let _ = ws.send(Message::binary(frame.to_vec())).await;
            }
            return;
        }
        Script::ErrorAfter(frames) => {
            for frame in frames {
                let _ = ws.send(Message::binary(frame.to_vec())).await;
            }
            let _ = ws
                .send(Message::text(
                    r#"{"type":"Error","err_code":"SYNTHESIS_FAILED","err_msg":"voice crashed"}"#,
                ))
                .await;
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
