//! SonicGen core: landmark audio fingerprinting and matching against a
//! persistent index of previously ingested sources.

pub mod audio;
pub mod config;
pub mod error;
pub mod index;
pub mod landmarks;
pub mod sampler;
pub mod search;
pub mod spectral;
pub mod types;
pub mod worker;

use std::sync::Arc;

use config::Config;
use error::SonicGenError;
use index::{IndexStore, PgIndex};

/// Top-level handle wiring configuration, the persistent index, and the
/// worker pool together. Mirrors the teacher's `AudioEngine::new` wiring
/// pattern, minus the recognition-service surface that lives outside this
/// crate's scope.
pub struct Engine {
    pub config: Arc<Config>,
    pub index: Arc<dyn IndexStore>,
}

impl Engine {
    pub async fn connect(config: Config) -> Result<Self, SonicGenError> {
        tracing::info!("connecting to index");
        let index = PgIndex::connect(&config).await?;
        index.migrate().await?;
        tracing::info!("index ready");
        Ok(Self { config: Arc::new(config), index: Arc::new(index) })
    }

    /// Run the worker pool against the given audio source until the process
    /// is terminated externally. There is no built-in shutdown signal here —
    /// callers that need graceful drain should wrap this in their own
    /// cancellation, per the design note that the worker registry is
    /// process-wide with the drain policy left to the caller.
    pub async fn run(&self, audio_source: Arc<dyn worker::AudioSource>) {
        worker::run_pool(self.index.clone(), audio_source, self.config.clone()).await;
    }
}
