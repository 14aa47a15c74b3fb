pub mod device_map;
pub mod loader;
mod pipeline_factory;
mod util;

mod flux;

pub use device_map::*;
pub use flux::{FluxLoader, FluxPipeline, FluxVariant};
use image::DynamicImage;
pub use loader::*;
pub use pipeline_factory::*;
use serde::{Deserialize, Serialize};
pub use util::encode_png;
pub(crate) use util::{lock_unpoisoned, seed_device, select_best_device, tensor_to_image};

/// Upper bound on accepted prompt length, in characters.
pub const MAX_PROMPT_CHARS: usize = 1024;

// Define the request type shared by the HTTP layer and the pipelines.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub guidance_scale: f64,
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_dimension")]
    pub width: usize,
    #[serde(default = "default_dimension")]
    pub height: usize,
}

fn default_num_inference_steps() -> usize {
    4
}

fn default_max_sequence_length() -> usize {
    256
}

fn default_dimension() -> usize {
    1024
}

impl GenerationRequest {
    /// Checks the request against the documented contract. Numeric fields
    /// accept any value; only the prompt is bounded.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let chars = self.prompt.chars().count();
        if chars == 0 {
            return Err(ValidationError::EmptyPrompt);
        }
        if chars > MAX_PROMPT_CHARS {
            return Err(ValidationError::PromptTooLong { chars });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("prompt must be at most {MAX_PROMPT_CHARS} characters, got {chars}")]
    PromptTooLong { chars: usize },
}

/// A loaded text-to-image pipeline, safe to share across concurrent requests.
pub trait Pipeline: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage>;
}
