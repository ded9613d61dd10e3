//! Wires the core together from a [`VigilConfig`].

use std::sync::Arc;

use crate::config::VigilConfig;
use crate::detection::{DetectionError, DeterministicDetector, SemanticDetector};
use crate::generation::GenerationClient;
use crate::lifecycle::AnomalyLifecycle;
use crate::notify::Notifier;
use crate::pipeline::ModerationPipeline;
use crate::provider::{ClientFactory, KeyPool, KeyPoolError, OpenRouterFactory};
use crate::store::{ModerationStore, SledModerationStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("provider keys: {0}")]
    KeyPool(#[from] KeyPoolError),
    #[error("detector: {0}")]
    Detection(#[from] DetectionError),
}

pub struct VigilRuntime {
    pub config: VigilConfig,
    pub notifier: Arc<Notifier>,
    pub lifecycle: Arc<AnomalyLifecycle>,
    pub pipeline: Arc<ModerationPipeline>,
}

impl VigilRuntime {
    /// Opens the sled store at `storage_path` and talks to the configured OpenAI-compatible endpoint.
    pub fn from_config(config: VigilConfig) -> Result<Self, BootstrapError> {
        let store: Arc<dyn ModerationStore> = Arc::new(SledModerationStore::open(&config.storage_path)?);
        let factory: Arc<dyn ClientFactory> = Arc::new(OpenRouterFactory::new(
            config.provider.api_url.clone(),
            config.provider.request_timeout(),
        ));
        Self::assemble(config, store, factory)
    }

    /// Same wiring with caller-supplied storage and provider.
    pub fn assemble(
        config: VigilConfig,
        store: Arc<dyn ModerationStore>,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self, BootstrapError> {
        let keys = config.provider.resolved_keys();
        let key_count = keys.len();
        let pool = Arc::new(KeyPool::new(keys, factory)?);
        let generation = GenerationClient::new(pool, config.retry.policy(), config.provider.model.clone())
            .with_title_model(config.provider.title_model.clone())
            .with_title_fallback(config.title_fallback.clone());

        let detector =
            DeterministicDetector::new(config.detection.safety_threshold, config.detection.max_scan_bytes)?;
        let semantic = config.detection.semantic_review.then(|| SemanticDetector::new(generation.clone()));

        let notifier = Arc::new(Notifier::new(config.gateway.webhook_url.clone()));
        let lifecycle = Arc::new(AnomalyLifecycle::new(store, notifier.clone()));
        let pipeline = Arc::new(ModerationPipeline::new(detector, semantic, lifecycle.clone(), generation));

        tracing::info!(
            target: "vigil::keys",
            keys = key_count,
            model = %config.provider.model,
            semantic_review = config.detection.semantic_review,
            "Vigil runtime assembled"
        );
        Ok(Self { config, notifier, lifecycle, pipeline })
    }
}
