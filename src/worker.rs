//! Dispatcher loop: claim a source, fingerprint it, and route it to either a
//! direct ingest (new original) or a match attempt against the existing
//! index, per the length rule in the system overview.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::audio;
use crate::config::Config;
use crate::index::IndexStore;
use crate::landmarks;
use crate::sampler;
use crate::search;
use crate::spectral;
use crate::types::{Occurrence, SourceStatus};

/// Where to read PCM from for a claimed source. Fetching/caching the bytes
/// from a remote store is an external collaborator's job; this crate only
/// consumes what's already local.
#[derive(Debug, Clone)]
pub enum AudioInput {
    Path(PathBuf),
    Pcm(Vec<f32>),
}

/// Supplies PCM for a claimed source id. The production implementation
/// resolves this against whatever external store placed the source's bytes
/// on disk; tests can supply a fixed map.
#[async_trait::async_trait]
pub trait AudioSource: Send + Sync {
    async fn fetch(&self, source_id: Uuid) -> anyhow::Result<AudioInput>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Fingerprinted,
    Matched { original_id: Uuid },
    TooShort,
    Flagged { reason: String },
}

/// Run the claim→fetch→SFE→LE→route pipeline for a single source. Never
/// returns `Err` for a failure local to this source — those become a
/// `Flagged` outcome so one bad source can't kill the worker loop. Only
/// index-transient errors (the index itself being unreachable) propagate,
/// since those call for the caller's retry/backoff policy rather than a
/// per-source disposition.
pub async fn run_one(
    index: &dyn IndexStore,
    audio_source: &dyn AudioSource,
    config: &Config,
    source_id: Uuid,
) -> Result<Outcome, crate::error::SonicGenError> {
    let timeout = Duration::from_secs(config.worker.per_source_timeout_secs);
    match tokio::time::timeout(timeout, run_one_inner(index, audio_source, config, source_id)).await {
        Ok(result) => result,
        Err(_elapsed) => {
            tracing::warn!(source_id = %source_id, "source timed out, flagging");
            index.set_status(source_id, SourceStatus::Flagged, None).await?;
            Ok(Outcome::Flagged { reason: "timeout".to_string() })
        }
    }
}

async fn run_one_inner(
    index: &dyn IndexStore,
    audio_source: &dyn AudioSource,
    config: &Config,
    source_id: Uuid,
) -> Result<Outcome, crate::error::SonicGenError> {
    tracing::info!(source_id = %source_id, "claimed source");

    let input = match audio_source.fetch(source_id).await {
        Ok(input) => input,
        Err(e) => {
            tracing::warn!(source_id = %source_id, error = %e, "decode failure");
            index.set_status(source_id, SourceStatus::Flagged, None).await?;
            return Ok(Outcome::Flagged { reason: format!("decode failure: {e}") });
        }
    };

    let spectral_cfg = config.spectral;
    let pcm = match input {
        AudioInput::Pcm(samples) => samples,
        AudioInput::Path(path) => {
            let rate = spectral_cfg.sample_rate;
            let decoded = tokio::task::spawn_blocking(move || audio::decode_to_mono_pcm(&path, rate)).await;
            match decoded {
                Ok(Ok(samples)) => samples,
                Ok(Err(e)) => {
                    let reason = format!("decode failure for {source_id}: {e}");
                    tracing::warn!(source_id = %source_id, "{}", reason);
                    index.set_status(source_id, SourceStatus::Flagged, None).await?;
                    return Ok(Outcome::Flagged { reason });
                }
                Err(join_err) => {
                    let reason = format!("decode task panicked for {source_id}: {join_err}");
                    tracing::warn!(source_id = %source_id, "{}", reason);
                    index.set_status(source_id, SourceStatus::Flagged, None).await?;
                    return Ok(Outcome::Flagged { reason });
                }
            }
        }
    };

    let landmark_cfg = config.landmark;
    let occurrences: Vec<Occurrence> = tokio::task::spawn_blocking(move || {
        let spec = spectral::spectrogram(&pcm, spectral_cfg);
        let peaks = landmarks::find_peaks(&spec, landmark_cfg);
        landmarks::pair_and_hash(&peaks, source_id, landmark_cfg)
    })
    .await
    .map_err(|e| crate::error::SonicGenError::Internal(format!("fingerprinting task panicked: {e}")))?;

    if occurrences.len() < config.landmark.min_fingerprint_count {
        tracing::info!(source_id = %source_id, count = occurrences.len(), "too short to fingerprint");
        index.set_status(source_id, SourceStatus::TooShort, None).await?;
        return Ok(Outcome::TooShort);
    }

    let hash_count = occurrences.len();
    if sampler::is_matchable(hash_count, config.sampler) {
        let query: Vec<(crate::types::HashToken, u32)> = sampler::segments(hash_count)
            .into_iter()
            .flat_map(|segment| occurrences[segment.start..segment.end].iter())
            .map(|o| (o.hash, o.t_ref))
            .collect();
        let ranked = index.find_candidates(&query, config.search).await?;
        let decision = search::decide(
            ranked.into_iter().next(),
            query.len(),
            config.search,
            config.spectral.hop,
            config.spectral.sample_rate,
        );

        if decision.matched {
            let original_id = decision.source_id.expect("matched decision carries a source id");
            tracing::info!(source_id = %source_id, %original_id, score = decision.score, "matched existing source");
            index.set_status(source_id, SourceStatus::Matched, Some(original_id)).await?;
            return Ok(Outcome::Matched { original_id });
        }
    }

    index
        .insert_occurrences(source_id, &occurrences, config.ingest.insert_chunk)
        .await?;
    index.set_status(source_id, SourceStatus::Fingerprinted, None).await?;
    tracing::info!(source_id = %source_id, count = occurrences.len(), "stored as new original");
    Ok(Outcome::Fingerprinted)
}

/// Runs `worker_count` independent claim loops against the same index. Each
/// loop claims one source at a time; an empty claim result backs off briefly
/// before retrying rather than busy-polling.
pub async fn run_pool(
    index: Arc<dyn IndexStore>,
    audio_source: Arc<dyn AudioSource>,
    config: Arc<Config>,
) {
    let mut handles = Vec::new();
    for worker_id in 0..config.worker.worker_count {
        let index = index.clone();
        let audio_source = audio_source.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            claim_loop(worker_id, index, audio_source, config).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn claim_loop(worker_id: usize, index: Arc<dyn IndexStore>, audio_source: Arc<dyn AudioSource>, config: Arc<Config>) {
    loop {
        let claimed = match index.claim_next(1, None).await {
            Ok(sources) => sources,
            Err(e) if e.is_retryable() => {
                tracing::warn!(worker_id, error = %e, "index transient error, backing off");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "unrecoverable index error, stopping worker");
                return;
            }
        };

        if claimed.is_empty() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            continue;
        }

        for source in claimed {
            let outcome = run_one(index.as_ref(), audio_source.as_ref(), &config, source.id).await;
            if let Err(e) = outcome {
                tracing::error!(worker_id, source_id = %source.id, error = %e, "worker error escaped run_one");
            }
        }
    }
}
