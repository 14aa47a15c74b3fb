use std::sync::Mutex;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp};
use candle_nn::Module;
use candle_transformers::models::clip::text_model::{self, ClipTextTransformer};
use candle_transformers::models::flux::{
    autoencoder::{self, AutoEncoder},
    model::{self, Flux},
    sampling,
};
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;

use crate::{
    lock_unpoisoned, seed_device, select_best_device, tensor_to_image, DeviceMap,
    GenerationRequest, Loader, ModelVariant, Pipeline,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    pub fn repo_id(&self) -> &'static str {
        match self {
            FluxVariant::Schnell => "black-forest-labs/FLUX.1-schnell",
            FluxVariant::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    fn weight_file(&self) -> &'static str {
        match self {
            FluxVariant::Schnell => "flux1-schnell.safetensors",
            FluxVariant::Dev => "flux1-dev.safetensors",
        }
    }

    fn model_config(&self) -> model::Config {
        match self {
            FluxVariant::Schnell => model::Config::schnell(),
            FluxVariant::Dev => model::Config::dev(),
        }
    }

    fn autoencoder_config(&self) -> autoencoder::Config {
        match self {
            FluxVariant::Schnell => autoencoder::Config::schnell(),
            FluxVariant::Dev => autoencoder::Config::dev(),
        }
    }
}

pub struct FluxPipeline {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    // Seed-then-draw must not interleave across requests.
    rng_lock: Mutex<()>,
    // T5 caches key/value state during forward, hence the lock.
    t5_model: Mutex<T5EncoderModel>,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl Pipeline for FluxPipeline {
    fn generate(&self, request: &GenerationRequest) -> Result<DynamicImage> {
        let width = request.width;
        let height = request.height;

        // --- Generate noise image ---
        // Seed the device RNG so identical requests reproduce identical images,
        // holding the lock so a concurrent request cannot reseed between the
        // seed and the draw.
        let noise_img = {
            let _rng = lock_unpoisoned(&self.rng_lock);
            seed_device(&self.device, request.seed)?;
            sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?
        };

        // --- Compute T5 embedding using the preloaded T5 model and tokenizer ---
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(request.max_sequence_length, 0);
        let input_token_ids = candle_core::Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = lock_unpoisoned(&self.t5_model).forward(&input_token_ids)?;

        // --- Compute CLIP embedding using the preloaded CLIP model and tokenizer ---
        let clip_tokens = self
            .clip_tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip =
            candle_core::Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;

        // --- Create sampling state and schedule ---
        let sampling_state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = match self.variant {
            // Dev uses a shifted schedule scaled by the latent sequence length.
            FluxVariant::Dev => sampling::get_schedule(
                request.num_inference_steps,
                Some((sampling_state.img.dim(1)?, 0.5, 1.15)),
            ),
            FluxVariant::Schnell => sampling::get_schedule(request.num_inference_steps, None),
        };

        // --- Run denoising via the preloaded Flux model ---
        let latent_img = sampling::denoise(
            &self.flux_model,
            &sampling_state.img,
            &sampling_state.img_ids,
            &sampling_state.txt,
            &sampling_state.txt_ids,
            &sampling_state.vec,
            &timesteps,
            request.guidance_scale,
        )?;

        let unpacked = sampling::unpack(&latent_img, height, width)?;
        tracing::debug!("Generated latent image");

        // --- Decode the latent image using the preloaded autoencoder ---
        let decoded = self.autoencoder.decode(&unpacked)?;
        tracing::debug!("Decoded image");

        // --- Postprocessing: clamp, scale, convert type, and convert to an image ---
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let img_tensor = img.i(0)?;

        tensor_to_image(&img_tensor)
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Pipeline = FluxPipeline;

    async fn load(
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
    ) -> Result<Self::Pipeline> {
        let ModelVariant::Flux(variant) = variant;

        // Configure device.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        tracing::info!("Using device: {:?}", device);

        // --- Load T5 Model and Tokenizer ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[t5_model_file], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_filename = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;
        tracing::info!("Loaded T5 encoder");

        // --- Load CLIP Model and Tokenizer ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = text_model::ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        tracing::info!("Loaded CLIP text encoder");

        // --- Load Autoencoder ---
        let bf_repo = api.repo(hf_hub::Repo::model(variant.repo_id().to_string()));
        let autoencoder_model_file = bf_repo
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[autoencoder_model_file],
                dtype,
                &device,
            )
            .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&variant.autoencoder_config(), autoencoder_vb)
            .context("failed to load autoencoder")?;
        tracing::info!("Loaded autoencoder");

        // --- Load Flux transformer ---
        let flux_model_file = bf_repo
            .get(variant.weight_file())
            .await
            .context("failed to get flux model file")?;
        let flux_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[flux_model_file], dtype, &device)
                .context("failed to build flux var builder")?
        };
        let flux_model = Flux::new(&variant.model_config(), flux_vb)
            .context("failed to load flux model")?;
        tracing::info!("Loaded flux transformer");

        Ok(FluxPipeline {
            variant,
            device,
            dtype,
            rng_lock: Mutex::new(()),
            t5_model: Mutex::new(t5_model),
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model,
        })
    }
}
