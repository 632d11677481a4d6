//! Candidate search: the pure, backend-independent half of the 8-step
//! algorithm (steps 4-8). Steps 1-3 (stop-word filter, probe, per-hash cap)
//! need a live index and live in `index::IndexStore::find_candidates`; this
//! module is what it calls into, and what the worker calls for the final
//! threshold decision.

use std::collections::HashMap;
use uuid::Uuid;

use crate::config::SearchConfig;
use crate::types::{CandidateBucket, HashToken, HashStat, MatchDecision};

/// The `total_count` value at the `(1 - ignore_fraction)` percentile of
/// `totals` — the whole index's distribution, not just the query's hashes.
/// Any hash at or above this value is a stop-word.
pub fn global_cutoff(totals: impl ExactSizeIterator<Item = i64>, ignore_fraction: f64) -> Option<i64> {
    let mut totals: Vec<i64> = totals.collect();
    if totals.is_empty() {
        return None;
    }
    totals.sort_unstable();
    let idx = ((1.0 - ignore_fraction) * (totals.len() - 1) as f64).round() as usize;
    Some(totals[idx.min(totals.len() - 1)])
}

/// Step 1: drop hashes whose global `total_count` is at or above `cutoff`
/// (the top `ignore_fraction` of the *whole index's* hash distribution, per
/// `global_cutoff`) — they carry no discriminating power and would dominate
/// the bucket counts. `stats` need only cover the query's own hashes; a hash
/// absent from `stats` (never indexed) is never a stop-word.
pub fn stop_word_filter(
    query: &[(HashToken, u32)],
    stats: &HashMap<HashToken, HashStat>,
    cutoff: Option<i64>,
) -> Vec<(HashToken, u32)> {
    let Some(cutoff) = cutoff else {
        return query.to_vec();
    };

    query
        .iter()
        .filter(|(hash, _)| stats.get(hash).map(|s| s.total_count < cutoff).unwrap_or(true))
        .copied()
        .collect()
}

/// Step 3: keep at most `max_hits_per_hash` hits for a single query hash,
/// taken in a stable, deterministic order so the cap doesn't introduce
/// nondeterminism across identical runs.
pub fn cap_hits(mut hits: Vec<(Uuid, u32)>, max_hits_per_hash: usize) -> Vec<(Uuid, u32)> {
    hits.sort_unstable_by_key(|(source_id, t_ref)| (*source_id, *t_ref));
    hits.truncate(max_hits_per_hash);
    hits
}

/// Steps 4-7: given, for each surviving query hash, the `(source_id, delta)`
/// pairs produced by its hits (delta = hit's `t_ref` minus the query hash's
/// own offset in the query), bucket by `(source_id, delta)` counting each
/// query hash at most once per bucket, pre-filter by `min_matches`, merge
/// deltas within `delta_tolerance` of a bucket's delta into that bucket, and
/// rank the top `limit_candidates` by merged count.
pub fn bucket_and_rank(per_hash_deltas: &[Vec<(Uuid, i64)>], cfg: SearchConfig) -> Vec<CandidateBucket> {
    let mut buckets: HashMap<(Uuid, i64), usize> = HashMap::new();
    for hits in per_hash_deltas {
        let mut seen_this_hash: std::collections::HashSet<(Uuid, i64)> = std::collections::HashSet::new();
        for &(source_id, delta) in hits {
            if seen_this_hash.insert((source_id, delta)) {
                *buckets.entry((source_id, delta)).or_insert(0) += 1;
            }
        }
    }

    let prefiltered: Vec<((Uuid, i64), usize)> = buckets
        .into_iter()
        .filter(|(_, count)| *count >= cfg.min_matches)
        .collect();

    // Group by source, then merge nearby deltas into the top bucket for that
    // source.
    let mut by_source: HashMap<Uuid, Vec<(i64, usize)>> = HashMap::new();
    for ((source_id, delta), count) in prefiltered {
        by_source.entry(source_id).or_default().push((delta, count));
    }

    let mut merged = Vec::new();
    for (source_id, mut deltas) in by_source {
        deltas.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let (top_delta, top_count) = deltas[0];
        let mut total = top_count;
        for &(delta, count) in &deltas[1..] {
            if (delta - top_delta).abs() <= cfg.delta_tolerance {
                total += count;
            }
        }
        merged.push(CandidateBucket { source_id, delta_frames: top_delta, count: total });
    }

    merged.sort_unstable_by(|a, b| b.count.cmp(&a.count).then(a.source_id.cmp(&b.source_id)));
    merged.truncate(cfg.limit_candidates);
    merged
}

/// Step 8: decide whether the top-ranked candidate clears the
/// length-normalized match threshold. Offset is reported in milliseconds.
pub fn decide(
    best: Option<CandidateBucket>,
    query_hash_count: usize,
    cfg: SearchConfig,
    hop: usize,
    sample_rate: u32,
) -> MatchDecision {
    let Some(best) = best else {
        return MatchDecision::no_match();
    };
    if query_hash_count == 0 {
        return MatchDecision::no_match();
    }

    let score = best.count as f64 / query_hash_count as f64;
    if score < cfg.match_threshold {
        return MatchDecision::no_match();
    }

    let offset_ms = (best.delta_frames * hop as i64 * 1000) / sample_rate as i64;
    MatchDecision {
        matched: true,
        source_id: Some(best.source_id),
        offset_ms: Some(offset_ms),
        score: score as f32,
    }
}
