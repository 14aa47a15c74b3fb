use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, FluxLoader, Loader, Pipeline};
use std::sync::Arc;

use crate::flux;

/// Enum of supported model families
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelFamily {
    Flux,
    // Add more families as they become available
}

impl ModelFamily {
    /// Detect model family from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelFamily::Flux)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub enum ModelVariant {
    Flux(flux::FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelVariant::Flux(if name_upper.contains("DEV") {
                flux::FluxVariant::Dev
            } else {
                // Default to Schnell if no specific variant is found
                flux::FluxVariant::Schnell
            }))
        } else {
            None
        }
    }
}

/// Load a pipeline based on its model name, automatically detecting the
/// appropriate loader
pub async fn load_pipeline(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn Pipeline>> {
    // Get model family and variant or return error if unsupported
    let family = ModelFamily::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model family: {}", model_name))?;
    let variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;

    tracing::info!(
        "Loading model: {} (detected family: {:?}/variant: {:?})",
        model_name,
        family,
        variant
    );

    match family {
        ModelFamily::Flux => {
            let pipeline = FluxLoader::load(variant, api, device_map).await?;
            Ok(Arc::new(pipeline))
        }
    }
}
