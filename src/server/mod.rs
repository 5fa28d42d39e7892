//! JSON-over-TCP front end
//!
//! Speaks newline-delimited JSON: one request object in, one response
//! object out, per line. Request envelopes carry an `op` tag naming the
//! operation; images travel base64-encoded inside the envelope. Every
//! connection gets its own task, and the accept loop stops as soon as the
//! shutdown signal flips.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, RecognizeParams, SelectiveParams};
use crate::error::BrokerError;
use crate::geometry::Quad;
use crate::protocol::{ModelDescriptor, RecognitionResponse};
use crate::vision::decode_payload;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Recognize {
        id: Option<String>,
        image: String,
        engine: Option<String>,
        language: Option<String>,
        #[serde(default)]
        regions: Vec<Quad>,
    },
    StageDetection {
        session_id: String,
        image: String,
        engine: Option<String>,
    },
    RecognizeSelective {
        session_id: String,
        image: Option<String>,
        #[serde(default)]
        result_ids: Vec<u32>,
        engine: Option<String>,
        language: Option<String>,
    },
    ListSupportedLanguages {
        engine: Option<String>,
    },
    ListSupportedModels {
        engine: Option<String>,
    },
    InstallModel {
        engine: Option<String>,
        model_name: String,
    },
    KeepAlive {
        keep_alive: bool,
        #[serde(default)]
        timeout_seconds: u64,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Reply {
    Recognition(RecognitionResponse),
    Languages { languages: Vec<String> },
    Models { models: Vec<ModelDescriptor> },
    Install { success: bool },
    Ack { ok: bool },
    Error { error: ErrorBody },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl Reply {
    fn error(kind: &'static str, message: impl Into<String>) -> Self {
        Self::Error {
            error: ErrorBody {
                kind,
                message: message.into(),
            },
        }
    }
}

fn error_kind(err: &BrokerError) -> &'static str {
    match err {
        BrokerError::SessionNotFound(_) => "session_not_found",
        BrokerError::RunLoopTimeout { .. } => "run_loop_timeout",
        BrokerError::InvalidImage(_) => "invalid_image",
    }
}

async fn dispatch_request(dispatcher: &Dispatcher, request: Request) -> Result<Reply, BrokerError> {
    match request {
        Request::Recognize {
            id,
            image,
            engine,
            language,
            regions,
        } => {
            let image = decode_payload(&image)?;
            let response = dispatcher
                .recognize(RecognizeParams {
                    id,
                    image,
                    engine,
                    language,
                    regions,
                })
                .await?;
            Ok(Reply::Recognition(response))
        }
        Request::StageDetection {
            session_id,
            image,
            engine,
        } => {
            let image = decode_payload(&image)?;
            let response = dispatcher
                .stage_detection(&session_id, image, engine.as_deref())
                .await?;
            Ok(Reply::Recognition(response))
        }
        Request::RecognizeSelective {
            session_id,
            image,
            result_ids,
            engine,
            language,
        } => {
            let image = match image {
                Some(payload) => Some(decode_payload(&payload)?),
                None => None,
            };
            let response = dispatcher
                .recognize_selective(SelectiveParams {
                    session_id,
                    image,
                    result_ids,
                    engine,
                    language,
                })
                .await?;
            Ok(Reply::Recognition(response))
        }
        Request::ListSupportedLanguages { engine } => {
            let languages = dispatcher.supported_languages(engine.as_deref()).await?;
            Ok(Reply::Languages { languages })
        }
        Request::ListSupportedModels { engine } => {
            let models = dispatcher.supported_models(engine.as_deref()).await?;
            Ok(Reply::Models { models })
        }
        Request::InstallModel { engine, model_name } => {
            let success = dispatcher.install_model(engine.as_deref(), &model_name).await?;
            Ok(Reply::Install { success })
        }
        Request::KeepAlive {
            keep_alive,
            timeout_seconds,
        } => {
            dispatcher.keep_alive(keep_alive, timeout_seconds);
            Ok(Reply::Ack { ok: true })
        }
    }
}

async fn handle_line(dispatcher: &Dispatcher, line: &str) -> Reply {
    let request = match serde_json::from_str::<Request>(line) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "unparseable request line");
            return Reply::error("bad_request", err.to_string());
        }
    };
    match dispatch_request(dispatcher, request).await {
        Ok(reply) => reply,
        Err(err) => Reply::error(error_kind(&err), err.to_string()),
    }
}

async fn serve_connection(dispatcher: Arc<Dispatcher>, stream: TcpStream) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut writer = BufWriter::new(write_half);

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&dispatcher, &line).await;
        let mut payload = serde_json::to_vec(&reply).context("failed to serialize reply")?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
        writer.flush().await?;
    }
    debug!(?peer, "connection closed");
    Ok(())
}

pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    pub async fn bind(host: &str, port: u16, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("failed to bind {host}:{port}"))?;
        Ok(Self {
            listener,
            dispatcher,
        })
    }

    /// The address actually bound; with port 0 this is where the ephemeral
    /// port shows up.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    /// Accept connections until the shutdown signal flips.
    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.dispatcher.monitor().shutdown_signal();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.context("accept failed")?;
                    debug!(%peer, "client connected");
                    let dispatcher = Arc::clone(&self.dispatcher);
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(dispatcher, stream).await {
                            warn!(error = %err, "connection errored");
                        }
                    });
                }
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("shutdown signaled, closing listener");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stub::StubBackend;
    use crate::backend::BackendRegistry;
    use crate::session::SessionCache;
    use crate::watchdog::ActivityMonitor;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use std::time::Duration;
    use tokio::io::AsyncBufReadExt;

    fn test_dispatcher() -> Arc<Dispatcher> {
        let stub = Arc::new(
            StubBackend::new("stub")
                .with_blocks(vec![StubBackend::block(0, 5, 5, 20, 10)])
                .with_text("wire"),
        );
        Arc::new(Dispatcher::new(
            BackendRegistry::new(stub),
            SessionCache::new(SessionCache::DEFAULT_CAPACITY),
            ActivityMonitor::new(Duration::from_secs(60)),
            Duration::from_secs(5),
        ))
    }

    async fn start() -> (SocketAddr, Arc<Dispatcher>) {
        let dispatcher = test_dispatcher();
        let server = Server::bind("127.0.0.1", 0, Arc::clone(&dispatcher))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, dispatcher)
    }

    fn png_base64(width: u32, height: u32) -> String {
        let img = image::DynamicImage::ImageRgba8(image::RgbaImage::new(width, height));
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        BASE64.encode(&buf)
    }

    async fn exchange(addr: SocketAddr, requests: &[serde_json::Value]) -> Vec<serde_json::Value> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        for request in requests {
            let mut line = serde_json::to_vec(request).unwrap();
            line.push(b'\n');
            stream.write_all(&line).await.unwrap();
        }
        let mut reader = BufReader::new(stream);
        let mut replies = Vec::with_capacity(requests.len());
        for _ in requests {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            replies.push(serde_json::from_str(&line).unwrap());
        }
        replies
    }

    #[tokio::test]
    async fn recognize_round_trips_over_the_wire() {
        let (addr, _) = start().await;
        let replies = exchange(
            addr,
            &[serde_json::json!({
                "op": "recognize",
                "id": "wire-1",
                "image": png_base64(64, 64),
            })],
        )
        .await;

        assert_eq!(replies[0]["id"], "wire-1");
        assert_eq!(replies[0]["context_resolution"]["width"], 64);
        assert_eq!(replies[0]["results"][0]["lines"][0]["content"], "wire");
        assert_eq!(replies[0]["results"][0]["state"], "recognized");
    }

    #[tokio::test]
    async fn staging_and_selective_share_a_connection() {
        let (addr, _) = start().await;
        let replies = exchange(
            addr,
            &[
                serde_json::json!({
                    "op": "stage_detection",
                    "session_id": "ctx-1",
                    "image": png_base64(64, 64),
                }),
                serde_json::json!({
                    "op": "recognize_selective",
                    "session_id": "ctx-1",
                    "result_ids": [0],
                }),
            ],
        )
        .await;

        assert_eq!(replies[0]["results"][0]["state"], "detected");
        assert_eq!(replies[0]["results"][0]["lines"][0]["content"], "");
        assert_eq!(replies[1]["results"][0]["state"], "recognized");
        assert_eq!(replies[1]["results"][0]["lines"][0]["content"], "wire");
    }

    #[tokio::test]
    async fn unknown_session_reports_its_kind() {
        let (addr, _) = start().await;
        let replies = exchange(
            addr,
            &[serde_json::json!({
                "op": "recognize_selective",
                "session_id": "ghost",
                "result_ids": [0],
            })],
        )
        .await;
        assert_eq!(replies[0]["error"]["kind"], "session_not_found");
    }

    #[tokio::test]
    async fn malformed_and_undecodable_payloads_answer_errors() {
        let (addr, _) = start().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"this is not json\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["error"]["kind"], "bad_request");

        let replies = exchange(
            addr,
            &[serde_json::json!({
                "op": "recognize",
                "image": BASE64.encode(b"not an image"),
            })],
        )
        .await;
        assert_eq!(replies[0]["error"]["kind"], "invalid_image");
    }

    #[tokio::test]
    async fn keep_alive_and_listings_answer_directly() {
        let (addr, _) = start().await;
        let replies = exchange(
            addr,
            &[
                serde_json::json!({
                    "op": "keep_alive",
                    "keep_alive": true,
                    "timeout_seconds": 120,
                }),
                serde_json::json!({"op": "list_supported_languages"}),
                serde_json::json!({"op": "list_supported_models"}),
                serde_json::json!({"op": "install_model", "model_name": "anything"}),
            ],
        )
        .await;

        assert_eq!(replies[0]["ok"], true);
        assert_eq!(replies[1]["languages"][0], "en");
        assert!(replies[2]["models"].as_array().unwrap().is_empty());
        assert_eq!(replies[3]["success"], false);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_accept_loop() {
        let dispatcher = test_dispatcher();
        let server = Server::bind("127.0.0.1", 0, Arc::clone(&dispatcher))
            .await
            .unwrap();
        let handle = tokio::spawn(server.run());

        dispatcher.monitor().request_shutdown();
        handle.await.unwrap().unwrap();
    }
}
