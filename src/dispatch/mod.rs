//! Request dispatch
//!
//! The broker's center: resolves the engine for each request, marks
//! activity for the watchdog, schedules the backend call according to its
//! class, and shapes errors the way callers expect. A failing backend
//! never fails an RPC; the caller gets an empty well-formed response and
//! the failure goes to the log.

pub mod confined;

use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendRegistry, RecognitionBackend, Scheduling};
use crate::error::{BackendError, BrokerError};
use crate::geometry::Quad;
use crate::protocol::{ModelDescriptor, RecognitionResponse, RecognitionState, TextBlock};
use crate::session::{Session, SessionCache, SharedSession};
use crate::vision::crop::crop_quad;
use crate::vision::resolution_of;
use crate::watchdog::ActivityMonitor;
use confined::ConfinedWorker;

/// Parameters of a one-shot recognition.
pub struct RecognizeParams {
    /// Echoed in the response; a fresh UUID when absent.
    pub id: Option<String>,
    pub image: DynamicImage,
    pub engine: Option<String>,
    pub language: Option<String>,
    /// Regions to recognize; empty lets the engine segment the image.
    pub regions: Vec<Quad>,
}

/// Parameters of a selective recognition against a staged session.
pub struct SelectiveParams {
    pub session_id: String,
    /// A fresh image re-stages the session before recognizing.
    pub image: Option<DynamicImage>,
    pub result_ids: Vec<u32>,
    pub engine: Option<String>,
    pub language: Option<String>,
}

pub struct Dispatcher {
    registry: BackendRegistry,
    sessions: SessionCache,
    monitor: Arc<ActivityMonitor>,
    confined: ConfinedWorker,
}

impl Dispatcher {
    pub fn new(
        registry: BackendRegistry,
        sessions: SessionCache,
        monitor: Arc<ActivityMonitor>,
        confined_wait: Duration,
    ) -> Self {
        Self {
            registry,
            sessions,
            monitor,
            confined: ConfinedWorker::new(confined_wait),
        }
    }

    pub fn monitor(&self) -> &Arc<ActivityMonitor> {
        &self.monitor
    }

    /// Run a backend call where its scheduling class allows. Pool-safe
    /// engines share the blocking pool; confined engines take their turn
    /// on the dedicated worker under a bounded wait.
    async fn call_backend<T, F>(
        &self,
        engine: &Arc<dyn RecognitionBackend>,
        op: F,
    ) -> Result<Result<T, BackendError>, BrokerError>
    where
        F: FnOnce(&dyn RecognitionBackend) -> Result<T, BackendError> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(engine);
        match engine.scheduling() {
            Scheduling::PoolSafe => {
                match tokio::task::spawn_blocking(move || op(engine.as_ref())).await {
                    Ok(result) => Ok(result),
                    Err(join_err) => Ok(Err(BackendError::Inference(format!(
                        "backend task failed: {join_err}"
                    )))),
                }
            }
            Scheduling::Confined => {
                let name = engine.name();
                self.confined.run(name, move || op(engine.as_ref())).await
            }
        }
    }

    /// One-shot full recognition. Does not touch the session cache.
    pub async fn recognize(
        &self,
        params: RecognizeParams,
    ) -> Result<RecognitionResponse, BrokerError> {
        let _busy = self.monitor.begin_request();
        let engine = self.registry.resolve(params.engine.as_deref());
        let id = params.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let resolution = resolution_of(&params.image);

        let image = Arc::new(params.image);
        let regions = params.regions;
        let language = params.language;
        let result = self
            .call_backend(&engine, move |backend| {
                backend.recognize(&image, &regions, language.as_deref())
            })
            .await?;

        match result {
            Ok(blocks) => Ok(RecognitionResponse {
                id,
                context_resolution: resolution,
                results: renumber(blocks),
            }),
            Err(err) => {
                warn!(engine = engine.name(), error = %err, "recognition failed, answering empty");
                Ok(RecognitionResponse::empty(id, resolution))
            }
        }
    }

    /// Detection only; the result is staged for later selective
    /// recognition under `session_id`.
    pub async fn stage_detection(
        &self,
        session_id: &str,
        image: DynamicImage,
        engine: Option<&str>,
    ) -> Result<RecognitionResponse, BrokerError> {
        let _busy = self.monitor.begin_request();
        let engine = self.registry.resolve(engine);
        let handle = self.stage(&engine, session_id, Arc::new(image)).await?;
        let snapshot = handle.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Recognize the named blocks of a staged session, reusing its stored
    /// image. Already-recognized blocks are skipped; recognition runs at
    /// most once per block.
    pub async fn recognize_selective(
        &self,
        params: SelectiveParams,
    ) -> Result<RecognitionResponse, BrokerError> {
        let _busy = self.monitor.begin_request();
        let engine = self.registry.resolve(params.engine.as_deref());

        let handle = match params.image {
            Some(image) => {
                self.stage(&engine, &params.session_id, Arc::new(image))
                    .await?
            }
            None => self
                .sessions
                .get(&params.session_id)
                .ok_or_else(|| BrokerError::SessionNotFound(params.session_id.clone()))?,
        };

        let mut session = handle.lock().await;
        let mut backend_failed = false;

        'blocks: for block_idx in 0..session.response.results.len() {
            {
                let block = &session.response.results[block_idx];
                if block.state == RecognitionState::Recognized
                    || !params.result_ids.contains(&block.id)
                {
                    continue;
                }
            }
            let line_count = session.response.results[block_idx].lines.len();
            for line_idx in 0..line_count {
                let quad = session.response.results[block_idx].lines[line_idx].quad;
                let content = match crop_quad(&session.image, &quad) {
                    None => {
                        debug!(line = line_idx, "degenerate line quad, leaving content empty");
                        String::new()
                    }
                    Some(cropped) => {
                        let language = params.language.clone();
                        let result = self
                            .call_backend(&engine, move |backend| {
                                backend.recognize(&cropped, &[], language.as_deref())
                            })
                            .await?;
                        match result {
                            Ok(blocks) => joined_text(&blocks),
                            Err(err) => {
                                warn!(
                                    engine = engine.name(),
                                    error = %err,
                                    "selective recognition failed, answering empty"
                                );
                                backend_failed = true;
                                break 'blocks;
                            }
                        }
                    }
                };
                session.response.results[block_idx].lines[line_idx].content = content;
            }
            // Every line of the block has been assigned; the transition
            // happens exactly once.
            session.response.results[block_idx].state = RecognitionState::Recognized;
        }

        if backend_failed {
            return Ok(RecognitionResponse::empty(
                params.session_id,
                session.response.context_resolution,
            ));
        }
        Ok(session.snapshot())
    }

    pub async fn supported_languages(
        &self,
        engine: Option<&str>,
    ) -> Result<Vec<String>, BrokerError> {
        let _busy = self.monitor.begin_request();
        let engine = self.registry.resolve(engine);
        let result = self
            .call_backend(&engine, |backend| backend.supported_languages())
            .await?;
        match result {
            Ok(languages) => Ok(languages),
            Err(err) => {
                warn!(engine = engine.name(), error = %err, "language listing failed");
                Ok(Vec::new())
            }
        }
    }

    pub async fn supported_models(
        &self,
        engine: Option<&str>,
    ) -> Result<Vec<ModelDescriptor>, BrokerError> {
        let _busy = self.monitor.begin_request();
        let engine = self.registry.resolve(engine);
        let result = self
            .call_backend(&engine, |backend| Ok(backend.supported_models()))
            .await?;
        Ok(result.unwrap_or_default())
    }

    pub async fn install_model(
        &self,
        engine: Option<&str>,
        model_name: &str,
    ) -> Result<bool, BrokerError> {
        let _busy = self.monitor.begin_request();
        let engine = self.registry.resolve(engine);
        let name = model_name.to_string();
        let result = self
            .call_backend(&engine, move |backend| backend.install_model(&name))
            .await?;
        match result {
            Ok(installed) => Ok(installed),
            Err(err) => {
                warn!(engine = engine.name(), model = model_name, error = %err, "model install failed");
                Ok(false)
            }
        }
    }

    /// Keep-alive signal; see [`ActivityMonitor::keep_alive`].
    pub fn keep_alive(&self, stay: bool, timeout_seconds: u64) {
        self.monitor.keep_alive(stay, timeout_seconds);
    }

    /// Pre-initialize an engine. Failure is logged, never fatal.
    pub async fn warm_up(&self, engine: Option<&str>) -> Result<(), BrokerError> {
        let engine = self.registry.resolve(engine);
        let result = self.call_backend(&engine, |backend| backend.warm_up()).await?;
        if let Err(err) = result {
            warn!(engine = engine.name(), error = %err, "warm-up failed");
        }
        Ok(())
    }

    async fn stage(
        &self,
        engine: &Arc<dyn RecognitionBackend>,
        session_id: &str,
        image: Arc<DynamicImage>,
    ) -> Result<SharedSession, BrokerError> {
        let resolution = resolution_of(&image);
        let detect_image = Arc::clone(&image);
        let result = self
            .call_backend(engine, move |backend| backend.detect(&detect_image))
            .await?;

        let results = match result {
            Ok(blocks) => renumber(blocks),
            Err(err) => {
                warn!(engine = engine.name(), error = %err, "detection failed, staging empty response");
                Vec::new()
            }
        };
        let response = RecognitionResponse {
            id: session_id.to_string(),
            context_resolution: resolution,
            results,
        };
        Ok(self.sessions.insert(session_id, Session::new(image, response)))
    }
}

/// Block ids are assigned here, sequentially in detection order, whatever
/// the adapter put in them.
fn renumber(mut blocks: Vec<TextBlock>) -> Vec<TextBlock> {
    for (i, block) in blocks.iter_mut().enumerate() {
        block.id = i as u32;
    }
    blocks
}

fn joined_text(blocks: &[TextBlock]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for block in blocks {
        for line in &block.lines {
            if !line.content.is_empty() {
                parts.push(&line.content);
            }
        }
    }
    parts.join(" ")
}
