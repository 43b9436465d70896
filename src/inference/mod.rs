//! Vision service: runs blocking model calls off the async runtime
//!
//! Non-streaming requests run on tokio's blocking pool. Streaming requests
//! get a dedicated worker thread that feeds a bounded channel (see
//! [`ChunkStream`]).

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engines::{ImageEmbedding, VisionModel};
use crate::error::ServerError;

mod stream;
mod thread;

pub use stream::{ndjson_line, ChunkStream, NDJSON_CONTENT_TYPE};

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Upper bound for one generation, streaming or not
    pub generation_timeout: Duration,
    /// Capacity of the chunk channel between worker and response
    pub stream_buffer: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(300),
            stream_buffer: 64,
        }
    }
}

impl From<&Config> for ServiceOptions {
    fn from(config: &Config) -> Self {
        Self {
            generation_timeout: config.generation_timeout,
            stream_buffer: config.stream_buffer,
        }
    }
}

/// Owns the loaded model for the lifetime of the server
pub struct VisionService {
    model: Arc<dyn VisionModel>,
    options: ServiceOptions,
    shutdown: CancellationToken,
}

impl VisionService {
    pub fn new(model: Arc<dyn VisionModel>, options: ServiceOptions) -> Self {
        Self {
            model,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Stop accepting work and cancel every in-flight generation.
    pub fn shutdown(&self) {
        tracing::info!("Vision service shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> Result<(), ServerError> {
        if self.is_shutting_down() {
            Err(ServerError::Unavailable)
        } else {
            Ok(())
        }
    }

    pub async fn encode(&self, image: DynamicImage) -> Result<ImageEmbedding, ServerError> {
        self.ensure_running()?;
        let model = self.model.clone();
        tokio::task::spawn_blocking(move || model.encode_image(&image))
            .await
            .map_err(ServerError::inference)?
            .map_err(|e| {
                tracing::error!("Image encoding failed: {:#}", e);
                ServerError::inference(format!("{:#}", e))
            })
    }

    /// Generate the full answer in one piece.
    ///
    /// Dropping the returned future, hitting the timeout or shutting the
    /// service down stops the generation at the next chunk.
    pub async fn answer(
        &self,
        embedding: ImageEmbedding,
        prompt: String,
    ) -> Result<String, ServerError> {
        self.ensure_running()?;
        let model = self.model.clone();
        let cancel = self.shutdown.child_token();
        let worker_cancel = cancel.clone();
        let _cancel_on_drop = cancel.drop_guard();

        let task = tokio::task::spawn_blocking(move || {
            let mut answer = String::new();
            model
                .generate(embedding, &prompt, &mut |text| {
                    if worker_cancel.is_cancelled() {
                        return ControlFlow::Break(());
                    }
                    answer.push_str(text);
                    ControlFlow::Continue(())
                })
                .map_err(|e| ServerError::inference(format!("{:#}", e)))?;
            if worker_cancel.is_cancelled() {
                return Err(ServerError::Unavailable);
            }
            Ok(answer)
        });

        match tokio::time::timeout(self.options.generation_timeout, task).await {
            Ok(joined) => joined.map_err(ServerError::inference)?,
            Err(_) => {
                tracing::warn!(
                    "Generation timed out after {:?}",
                    self.options.generation_timeout
                );
                Err(ServerError::Timeout(self.options.generation_timeout))
            }
        }
    }

    /// Start a streaming generation on its own worker thread.
    pub fn stream(
        &self,
        embedding: ImageEmbedding,
        prompt: String,
        request_id: &str,
    ) -> Result<ChunkStream, ServerError> {
        self.ensure_running()?;
        let runtime = Handle::try_current()
            .map_err(|e| ServerError::inference(format!("streaming needs a tokio runtime: {}", e)))?;
        let (tx, rx) = mpsc::channel(self.options.stream_buffer.max(1));
        let cancel = self.shutdown.child_token();

        thread::spawn_stream_worker(thread::StreamJob {
            model: self.model.clone(),
            embedding,
            prompt,
            tx,
            cancel: cancel.clone(),
            timeout: self.options.generation_timeout,
            request_id: request_id.to_string(),
            runtime,
        })
        .map_err(|e| ServerError::inference(format!("failed to spawn generation worker: {}", e)))?;

        Ok(ChunkStream::new(rx, cancel))
    }
}
