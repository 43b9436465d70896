//! Vision-language model engines
//!
//! Handlers never talk to candle directly. They go through [`VisionModel`],
//! which lets tests swap in a scripted model.

use std::ops::ControlFlow;

use candle_core::Tensor;
use eyre::Result;
use image::DynamicImage;

pub mod moondream;
pub mod token_stream;

pub use self::moondream::MoondreamEngine;

/// Encoded image, consumed by exactly one generation call
#[derive(Debug)]
pub struct ImageEmbedding(Tensor);

impl ImageEmbedding {
    pub fn new(tensor: Tensor) -> Self {
        Self(tensor)
    }

    pub fn into_tensor(self) -> Tensor {
        self.0
    }
}

/// Receives generated text fragments in order. Returning
/// `ControlFlow::Break` stops generation.
pub type ChunkSink<'a> = dyn FnMut(&str) -> ControlFlow<()> + 'a;

pub trait VisionModel: Send + Sync {
    /// Display name reported by the health endpoint
    fn name(&self) -> &str;

    fn encode_image(&self, image: &DynamicImage) -> Result<ImageEmbedding>;

    /// Generate an answer to `prompt`, pushing every non-empty fragment into
    /// `sink` as soon as it is decoded.
    fn generate(&self, embedding: ImageEmbedding, prompt: &str, sink: &mut ChunkSink<'_>)
        -> Result<()>;

    /// Non-streaming convenience over [`VisionModel::generate`].
    fn answer(&self, embedding: ImageEmbedding, prompt: &str) -> Result<String> {
        let mut answer = String::new();
        self.generate(embedding, prompt, &mut |text| {
            answer.push_str(text);
            ControlFlow::Continue(())
        })?;
        Ok(answer)
    }
}
