use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;
use pipeline_factory::ModelVariant;

use crate::{pipeline_factory, DeviceMap, Pipeline};

pub trait Loader {
    type Pipeline: Pipeline;

    fn load(
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Pipeline>>
    where
        Self: Sized;
}
