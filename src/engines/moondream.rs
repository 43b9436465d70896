//! Moondream inference engine
//!
//! Wraps candle's moondream2 models (quantized GGUF or full safetensors).

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Mutex;

use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{moondream, quantized_moondream};
use eyre::{Result, WrapErr};
use image::imageops::FilterType;
use image::DynamicImage;
use tokenizers::Tokenizer;

use super::token_stream::{AnswerFilter, TokenOutputStream};
use super::{ChunkSink, ImageEmbedding, VisionModel};
use crate::config::GenerationOptions;
use crate::model_config::{ModelFiles, WeightsFormat};

/// Side length the vision encoder expects
const IMAGE_SIZE: usize = 378;

/// BOS and EOS share this token in the moondream tokenizer.
const SPECIAL_TOKEN: &str = "<|endoftext|>";

enum Weights {
    Full(moondream::Model),
    Quantized(quantized_moondream::Model),
}

impl Weights {
    fn encode_image(&self, image: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Full(m) => image.apply(m.vision_encoder()),
            Self::Quantized(m) => image.apply(m.vision_encoder()),
        }
    }

    fn clear_kv_cache(&mut self) {
        match self {
            Self::Full(m) => m.text_model.clear_kv_cache(),
            Self::Quantized(m) => m.text_model.clear_kv_cache(),
        }
    }

    fn forward(&mut self, input: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Full(m) => m.text_model.forward(input),
            Self::Quantized(m) => m.text_model.forward(input),
        }
    }

    fn forward_with_img(
        &mut self,
        bos: &Tensor,
        input: &Tensor,
        image_embeds: &Tensor,
    ) -> candle_core::Result<Tensor> {
        match self {
            Self::Full(m) => m.text_model.forward_with_img(bos, input, image_embeds),
            Self::Quantized(m) => m.text_model.forward_with_img(bos, input, image_embeds),
        }
    }
}

/// Moondream2 engine.
///
/// The text model keeps a KV cache and needs `&mut` access, so every encode
/// and generate call takes the model lock. Concurrent requests run one at a
/// time.
pub struct MoondreamEngine {
    name: String,
    model: Mutex<Weights>,
    tokenizer: Tokenizer,
    device: Device,
    special_token: u32,
    options: GenerationOptions,
}

impl MoondreamEngine {
    pub fn load(files: &ModelFiles, options: GenerationOptions) -> Result<Self> {
        tracing::info!("Loading moondream weights from {:?}", files.weights);

        let device = Device::Cpu;
        let config = moondream::Config::v2();
        let model = match files.format {
            WeightsFormat::Gguf => {
                let vb = candle_transformers::quantized_var_builder::VarBuilder::from_gguf(
                    &files.weights,
                    &device,
                )
                .wrap_err("Failed to read GGUF weights")?;
                Weights::Quantized(
                    quantized_moondream::Model::new(&config, vb)
                        .wrap_err("Failed to build quantized moondream model")?,
                )
            }
            WeightsFormat::Safetensors => {
                // SAFETY: the weight file is not expected to change while mapped.
                let vb = unsafe {
                    candle_nn::VarBuilder::from_mmaped_safetensors(
                        &[&files.weights],
                        DType::F32,
                        &device,
                    )
                }
                .wrap_err("Failed to map safetensors weights")?;
                Weights::Full(
                    moondream::Model::new(&config, vb)
                        .wrap_err("Failed to build moondream model")?,
                )
            }
        };

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| eyre::eyre!("Failed to load tokenizer: {}", e))?;
        let special_token = tokenizer
            .get_vocab(true)
            .get(SPECIAL_TOKEN)
            .copied()
            .ok_or_else(|| eyre::eyre!("Tokenizer has no {} token", SPECIAL_TOKEN))?;

        tracing::info!(
            "Moondream model loaded ({}, max_tokens={})",
            if files.format.is_quantized() { "quantized" } else { "full precision" },
            options.max_tokens
        );

        Ok(Self {
            name: model_name(&files.weights),
            model: Mutex::new(model),
            tokenizer,
            device,
            special_token,
            options,
        })
    }

    fn lock_model(&self) -> Result<std::sync::MutexGuard<'_, Weights>> {
        self.model
            .lock()
            .map_err(|_| eyre::eyre!("Model lock poisoned by a previous panic"))
    }

    /// Resize, normalize and lay out an image as a (3, 378, 378) tensor.
    fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
        let img = image
            .resize_to_fill(IMAGE_SIZE as u32, IMAGE_SIZE as u32, FilterType::Triangle)
            .to_rgb8();
        let data = img.into_raw();
        let data = Tensor::from_vec(data, (IMAGE_SIZE, IMAGE_SIZE, 3), &self.device)?
            .permute((2, 0, 1))?;
        let mean = Tensor::new(&[0.5f32, 0.5, 0.5], &self.device)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&[0.5f32, 0.5, 0.5], &self.device)?.reshape((3, 1, 1))?;
        let tensor = (data.to_dtype(DType::F32)? / 255.)?
            .broadcast_sub(&mean)?
            .broadcast_div(&std)?;
        Ok(tensor)
    }
}

impl VisionModel for MoondreamEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode_image(&self, image: &DynamicImage) -> Result<ImageEmbedding> {
        let pixels = self.preprocess(image)?.unsqueeze(0)?;
        let model = self.lock_model()?;
        let embeds = model
            .encode_image(&pixels)
            .wrap_err("Vision encoder failed")?;
        Ok(ImageEmbedding::new(embeds))
    }

    fn generate(
        &self,
        embedding: ImageEmbedding,
        prompt: &str,
        sink: &mut ChunkSink<'_>,
    ) -> Result<()> {
        let prompt = format!("\n\nQuestion: {}\n\nAnswer:", prompt);
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| eyre::eyre!("Tokenization failed: {}", e))?;
        let mut tokens = encoding.get_ids().to_vec();
        if tokens.is_empty() {
            eyre::bail!("Empty prompts are not supported");
        }

        let opts = &self.options;
        let mut logits_processor = LogitsProcessor::new(opts.seed, opts.temperature, opts.top_p);
        let mut output = TokenOutputStream::new(self.tokenizer.clone());
        let mut filter = AnswerFilter::new();
        let image_embeds = embedding.into_tensor();

        let mut model = self.lock_model()?;
        model.clear_kv_cache();

        for index in 0..opts.max_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let ctxt = &tokens[tokens.len().saturating_sub(context_size)..];
            let input = Tensor::new(ctxt, &self.device)?.unsqueeze(0)?;
            let logits = if index > 0 {
                model.forward(&input)?
            } else {
                let bos = Tensor::new(&[self.special_token], &self.device)?.unsqueeze(0)?;
                model.forward_with_img(&bos, &input, &image_embeds)?
            };

            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
            let logits = if opts.repeat_penalty == 1. {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(opts.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    opts.repeat_penalty,
                    &tokens[start_at..],
                )?
            };

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            if next_token == self.special_token {
                break;
            }

            if let Some(text) = output.next_token(next_token)? {
                if let Some(chunk) = filter.push(&text) {
                    if sink(&chunk).is_break() {
                        tracing::debug!("Generation stopped by consumer after {} tokens", index + 1);
                        return Ok(());
                    }
                }
                if filter.is_finished() {
                    break;
                }
            }
        }

        let tail = output.decode_rest()?.and_then(|rest| filter.push(&rest));
        for chunk in tail.into_iter().chain(filter.finish()) {
            if sink(&chunk).is_break() {
                break;
            }
        }
        Ok(())
    }
}

fn model_name(weights: &Path) -> String {
    weights
        .file_stem()
        .map(|s| format!("moondream2/{}", s.to_string_lossy()))
        .unwrap_or_else(|| "moondream2".to_string())
}
