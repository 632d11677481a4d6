//! Persistent index: the one real backing store (`PgIndex`), behind the
//! `IndexStore` trait boundary that §6 frames as an RPC surface. A second,
//! in-memory implementation (`MemIndex`) backs the algorithm tests so the
//! core's invariants can be exercised without a live Postgres instance.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::config::{Config, SearchConfig};
use crate::error::SonicGenError;
use crate::search;
use crate::types::{CandidateBucket, ClaimCursor, HashStat, HashToken, Occurrence, Source, SourceStatus};

#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn claim_next(&self, limit: i64, cursor: Option<ClaimCursor>) -> Result<Vec<Source>, SonicGenError>;
    async fn get_source(&self, id: Uuid) -> Result<Option<Source>, SonicGenError>;
    async fn set_status(
        &self,
        id: Uuid,
        status: SourceStatus,
        original_ref: Option<Uuid>,
    ) -> Result<(), SonicGenError>;
    async fn insert_occurrences(
        &self,
        source_id: Uuid,
        rows: &[Occurrence],
        chunk_size: usize,
    ) -> Result<(), SonicGenError>;
    /// Steps 1-7 of candidate search: stop-word filter, probe, cap, bucket,
    /// pre-filter, Δ-smooth, rank. `query` is `(hash, query_offset)` pairs;
    /// the caller (search::decide) applies step 8.
    async fn find_candidates(
        &self,
        query: &[(HashToken, u32)],
        cfg: SearchConfig,
    ) -> Result<Vec<CandidateBucket>, SonicGenError>;
    async fn delete_source(&self, id: Uuid) -> Result<(), SonicGenError>;
}

pub struct PgIndex {
    pool: PgPool,
}

impl PgIndex {
    pub async fn connect(config: &Config) -> Result<Self, SonicGenError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.database.connection_timeout_secs))
            .connect(&config.database.url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), SonicGenError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SonicGenError::Internal(e.to_string()))
    }
}

#[async_trait]
impl IndexStore for PgIndex {
    async fn claim_next(&self, limit: i64, cursor: Option<ClaimCursor>) -> Result<Vec<Source>, SonicGenError> {
        let mut tx = self.pool.begin().await?;

        let rows = if let Some(c) = cursor {
            sqlx::query(
                r#"
                SELECT id, external_id, title, duration_ms, original_ref, status, created_at, updated_at
                FROM sources
                WHERE status = 'unclaimed'
                  AND (duration_ms, id) < ($1, $2)
                ORDER BY duration_ms DESC, id DESC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(c.last_duration_ms)
            .bind(c.last_id)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT id, external_id, title, duration_ms, original_ref, status, created_at, updated_at
                FROM sources
                WHERE status = 'unclaimed'
                ORDER BY duration_ms DESC, id DESC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?
        };

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            sqlx::query("UPDATE sources SET status = 'pending', updated_at = now() WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            claimed.push(Source {
                id,
                external_id: row.try_get("external_id")?,
                title: row.try_get("title")?,
                duration_ms: row.try_get("duration_ms")?,
                original_ref: row.try_get("original_ref")?,
                status: SourceStatus::Pending,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        tx.commit().await?;
        Ok(claimed)
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>, SonicGenError> {
        let row = sqlx::query(
            "SELECT id, external_id, title, duration_ms, original_ref, status, created_at, updated_at FROM sources WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => None,
            Some(row) => {
                let status_str: String = row.try_get("status")?;
                Some(Source {
                    id: row.try_get("id")?,
                    external_id: row.try_get("external_id")?,
                    title: row.try_get("title")?,
                    duration_ms: row.try_get("duration_ms")?,
                    original_ref: row.try_get("original_ref")?,
                    status: SourceStatus::from_db_str(&status_str)
                        .ok_or_else(|| SonicGenError::Internal(format!("unknown status {status_str}")))?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            }
        })
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: SourceStatus,
        original_ref: Option<Uuid>,
    ) -> Result<(), SonicGenError> {
        sqlx::query(
            "UPDATE sources SET status = $1, original_ref = $2, updated_at = now() WHERE id = $3",
        )
        .bind(status.as_db_str())
        .bind(original_ref)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_occurrences(
        &self,
        source_id: Uuid,
        rows: &[Occurrence],
        chunk_size: usize,
    ) -> Result<(), SonicGenError> {
        let mut seen_for_source: std::collections::HashSet<HashToken> =
            sqlx::query("SELECT DISTINCT hash FROM occurrences WHERE source_id = $1")
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| row.try_get::<String, _>("hash").ok())
                .filter_map(|hex| hex.and_then(|h| HashToken::from_hex(&h).ok()))
                .collect();

        for chunk in rows.chunks(chunk_size.max(1)) {
            let mut tx = self.pool.begin().await?;
            let mut inserted_per_hash: HashMap<HashToken, i64> = HashMap::new();
            let mut first_for_source: Vec<HashToken> = Vec::new();

            for occ in chunk {
                let result = sqlx::query(
                    "INSERT INTO occurrences (hash, source_id, t_ref) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                )
                .bind(occ.hash.to_hex())
                .bind(occ.source_id)
                .bind(occ.t_ref as i64)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() > 0 {
                    *inserted_per_hash.entry(occ.hash).or_insert(0) += 1;
                    if seen_for_source.insert(occ.hash) {
                        first_for_source.push(occ.hash);
                    }
                }
            }

            for (hash, count) in &inserted_per_hash {
                let source_delta: i64 = if first_for_source.contains(hash) { 1 } else { 0 };
                sqlx::query(
                    r#"
                    INSERT INTO hash_stats (hash, total_count, source_count)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (hash) DO UPDATE
                    SET total_count = hash_stats.total_count + EXCLUDED.total_count,
                        source_count = hash_stats.source_count + EXCLUDED.source_count
                    "#,
                )
                .bind(hash.to_hex())
                .bind(count)
                .bind(source_delta)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
        }
        Ok(())
    }

    async fn find_candidates(
        &self,
        query: &[(HashToken, u32)],
        cfg: SearchConfig,
    ) -> Result<Vec<CandidateBucket>, SonicGenError> {
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let hashes: Vec<String> = query.iter().map(|(h, _)| h.to_hex()).collect();
        let stat_rows = sqlx::query("SELECT hash, total_count, source_count FROM hash_stats WHERE hash = ANY($1)")
            .bind(&hashes)
            .fetch_all(&self.pool)
            .await?;

        let mut stats = HashMap::new();
        for row in stat_rows {
            let hex: String = row.try_get("hash")?;
            if let Ok(token) = HashToken::from_hex(&hex) {
                stats.insert(
                    token,
                    HashStat {
                        total_count: row.try_get("total_count")?,
                        source_count: row.try_get("source_count")?,
                    },
                );
            }
        }

        // The stop-word cutoff ranks against the *entire* index, not just the
        // hashes this query happens to touch — a single scalar query against
        // the whole `hash_stats` table instead of pulling every row into Rust.
        let cutoff_row = sqlx::query(
            "SELECT percentile_disc($1) WITHIN GROUP (ORDER BY total_count) AS cutoff FROM hash_stats",
        )
        .bind(1.0 - cfg.ignore_fraction)
        .fetch_one(&self.pool)
        .await?;
        let cutoff: Option<i64> = cutoff_row.try_get("cutoff")?;

        let filtered = search::stop_word_filter(query, &stats, cutoff);
        if filtered.is_empty() {
            return Ok(Vec::new());
        }

        let mut per_hash_deltas = Vec::with_capacity(filtered.len());
        for (hash, query_offset) in &filtered {
            let rows = sqlx::query("SELECT source_id, t_ref FROM occurrences WHERE hash = $1")
                .bind(hash.to_hex())
                .fetch_all(&self.pool)
                .await?;

            let hits: Vec<(Uuid, u32)> = rows
                .into_iter()
                .map(|row| Ok::<_, sqlx::Error>((row.try_get("source_id")?, row.try_get::<i64, _>("t_ref")? as u32)))
                .collect::<Result<_, _>>()?;
            let capped = search::cap_hits(hits, cfg.max_hits_per_hash);

            let deltas: Vec<(Uuid, i64)> = capped
                .into_iter()
                .map(|(source_id, t_ref)| (source_id, t_ref as i64 - *query_offset as i64))
                .collect();
            per_hash_deltas.push(deltas);
        }

        Ok(search::bucket_and_rank(&per_hash_deltas, cfg))
    }

    async fn delete_source(&self, id: Uuid) -> Result<(), SonicGenError> {
        let mut tx = self.pool.begin().await?;

        let per_hash_counts = sqlx::query("SELECT hash, COUNT(*) as cnt FROM occurrences WHERE source_id = $1 GROUP BY hash")
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM sources WHERE id = $1").bind(id).execute(&mut *tx).await?;

        for row in per_hash_counts {
            let hash: String = row.try_get("hash")?;
            let cnt: i64 = row.try_get("cnt")?;
            sqlx::query(
                r#"
                UPDATE hash_stats
                SET total_count = total_count - $2, source_count = source_count - 1
                WHERE hash = $1
                "#,
            )
            .bind(&hash)
            .bind(cnt)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM hash_stats WHERE hash = $1 AND (total_count <= 0 OR source_count <= 0)")
                .bind(&hash)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// In-memory `IndexStore` used by algorithm-level tests. Mirrors `PgIndex`'s
/// semantics closely enough (keyset claim order, idempotent insert,
/// symmetric deletion) to exercise the invariants in §8 without a database.
#[derive(Default)]
pub struct MemIndex {
    inner: Mutex<MemIndexInner>,
}

#[derive(Default)]
struct MemIndexInner {
    sources: HashMap<Uuid, Source>,
    occurrences: Vec<Occurrence>,
    stats: HashMap<HashToken, HashStat>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_unclaimed_source(&self, source: Source) {
        self.inner.lock().unwrap().sources.insert(source.id, source);
    }
}

#[async_trait]
impl IndexStore for MemIndex {
    async fn claim_next(&self, limit: i64, cursor: Option<ClaimCursor>) -> Result<Vec<Source>, SonicGenError> {
        let mut inner = self.inner.lock().unwrap();
        let mut candidates: Vec<Source> = inner
            .sources
            .values()
            .filter(|s| s.status == SourceStatus::Unclaimed)
            .cloned()
            .collect();
        candidates.sort_unstable_by(|a, b| (b.duration_ms, b.id).cmp(&(a.duration_ms, a.id)));

        if let Some(c) = cursor {
            candidates.retain(|s| (s.duration_ms, s.id) < (c.last_duration_ms, c.last_id));
        }
        candidates.truncate(limit.max(0) as usize);

        for s in &candidates {
            if let Some(row) = inner.sources.get_mut(&s.id) {
                row.status = SourceStatus::Pending;
            }
        }
        Ok(candidates
            .into_iter()
            .map(|mut s| {
                s.status = SourceStatus::Pending;
                s
            })
            .collect())
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>, SonicGenError> {
        Ok(self.inner.lock().unwrap().sources.get(&id).cloned())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: SourceStatus,
        original_ref: Option<Uuid>,
    ) -> Result<(), SonicGenError> {
        let mut inner = self.inner.lock().unwrap();
        let source = inner.sources.get_mut(&id).ok_or(SonicGenError::SourceNotFound(id))?;
        source.status = status;
        source.original_ref = original_ref;
        Ok(())
    }

    async fn insert_occurrences(
        &self,
        source_id: Uuid,
        rows: &[Occurrence],
        chunk_size: usize,
    ) -> Result<(), SonicGenError> {
        let mut inner = self.inner.lock().unwrap();
        let mut seen_for_source: std::collections::HashSet<HashToken> = inner
            .occurrences
            .iter()
            .filter(|o| o.source_id == source_id)
            .map(|o| o.hash)
            .collect();
        let existing: std::collections::HashSet<(HashToken, Uuid, u32)> =
            inner.occurrences.iter().map(|o| (o.hash, o.source_id, o.t_ref)).collect();

        for chunk in rows.chunks(chunk_size.max(1)) {
            for occ in chunk {
                let key = (occ.hash, occ.source_id, occ.t_ref);
                if existing.contains(&key) {
                    continue;
                }
                inner.occurrences.push(*occ);
                let stat = inner.stats.entry(occ.hash).or_default();
                stat.total_count += 1;
                if seen_for_source.insert(occ.hash) {
                    stat.source_count += 1;
                }
            }
        }
        Ok(())
    }

    async fn find_candidates(
        &self,
        query: &[(HashToken, u32)],
        cfg: SearchConfig,
    ) -> Result<Vec<CandidateBucket>, SonicGenError> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock().unwrap();
        let cutoff = search::global_cutoff(inner.stats.values().map(|s| s.total_count), cfg.ignore_fraction);
        let filtered = search::stop_word_filter(query, &inner.stats, cutoff);
        if filtered.is_empty() {
            return Ok(Vec::new());
        }

        let mut per_hash_deltas = Vec::with_capacity(filtered.len());
        for (hash, query_offset) in &filtered {
            let hits: Vec<(Uuid, u32)> = inner
                .occurrences
                .iter()
                .filter(|o| o.hash == *hash)
                .map(|o| (o.source_id, o.t_ref))
                .collect();
            let capped = search::cap_hits(hits, cfg.max_hits_per_hash);
            let deltas: Vec<(Uuid, i64)> = capped
                .into_iter()
                .map(|(source_id, t_ref)| (source_id, t_ref as i64 - *query_offset as i64))
                .collect();
            per_hash_deltas.push(deltas);
        }

        Ok(search::bucket_and_rank(&per_hash_deltas, cfg))
    }

    async fn delete_source(&self, id: Uuid) -> Result<(), SonicGenError> {
        let mut inner = self.inner.lock().unwrap();
        let (keep, removed): (Vec<_>, Vec<_>) = inner.occurrences.drain(..).partition(|o| o.source_id != id);
        inner.occurrences = keep;

        let mut per_hash_counts: HashMap<HashToken, i64> = HashMap::new();
        for occ in &removed {
            *per_hash_counts.entry(occ.hash).or_insert(0) += 1;
        }
        for (hash, count) in per_hash_counts {
            if let Some(stat) = inner.stats.get_mut(&hash) {
                stat.total_count -= count;
                stat.source_count -= 1;
                if stat.total_count <= 0 || stat.source_count <= 0 {
                    inner.stats.remove(&hash);
                }
            }
        }
        inner.sources.remove(&id);
        Ok(())
    }
}
