//! Similarity retrieval.
//!
//! The query text is embedded with the same provider that built the index,
//! the candidate set is narrowed by the filter in SQL, and every remaining
//! chunk is scored by cosine similarity. Results are ordered by score
//! descending, then by document timestamp (newest first), then by chunk id,
//! so the same query against the same snapshot always returns the same list.
//!
//! Candidate selection and scoring run inside one read transaction, which in
//! WAL mode pins the snapshot committed when it started.

use sqlx::Row;

use crate::config::{Config, EmbeddingConfig, RetrievalConfig};
use crate::embedding::{blob_to_vec, cosine_similarity, EmbeddingProvider};
use crate::error::{KbError, Result};
use crate::kb::KnowledgeBase;
use crate::models::{format_ts_iso, Provenance, Query, QueryFilter, QueryHit, SourceKind};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::KnowledgeStore;

/// A scored chunk before ordering.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub hit: QueryHit,
    /// Unix seconds; the tie-breaker.
    pub timestamp: i64,
}

/// Result count after applying the default and the upper bound.
pub fn effective_k(requested: Option<usize>, retrieval: &RetrievalConfig) -> usize {
    requested
        .unwrap_or(retrieval.default_k)
        .clamp(1, retrieval.max_k.max(1))
}

/// Order candidates and keep the best `k`.
pub fn rank_candidates(mut candidates: Vec<Candidate>, k: usize) -> Vec<QueryHit> {
    candidates.sort_by(|a, b| {
        rank_score(b.hit.score)
            .total_cmp(&rank_score(a.hit.score))
            .then(b.timestamp.cmp(&a.timestamp))
            .then(a.hit.chunk_id.cmp(&b.hit.chunk_id))
    });
    candidates.truncate(k);
    candidates.into_iter().map(|c| c.hit).collect()
}

// NaN sorts below every real score.
fn rank_score(score: f64) -> f64 {
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        score
    }
}

/// Answer `query` from `store`.
///
/// A blank query or a filter with no matching chunks yields an empty list.
pub async fn query(
    store: &KnowledgeStore,
    embedder: &dyn EmbeddingProvider,
    retrieval: &RetrievalConfig,
    embedding: &EmbeddingConfig,
    query: &Query,
) -> Result<Vec<QueryHit>> {
    if query.text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let k = effective_k(query.k, retrieval);

    let policy = RetryPolicy::new(embedding.max_retries, embedding.retry_base_ms);
    let query_vec = with_retry(policy, "embed query", || embedder.embed(&query.text)).await?;

    let mut tx = store.pool().begin().await?;
    let (sql, binds) = candidate_sql(&query.filter);
    let mut q = sqlx::query(&sql);
    for value in &binds {
        q = q.bind(value);
    }
    let rows = q.fetch_all(&mut *tx).await?;
    tx.commit().await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in rows {
        let blob: Vec<u8> = row.get("embedding");
        let vector = blob_to_vec(&blob);
        if vector.len() != query_vec.len() {
            return Err(KbError::IndexUnavailable(format!(
                "stored vectors have {} dimensions but the query has {}; rebuild the index",
                vector.len(),
                query_vec.len()
            )));
        }

        let kind: String = row.get("kind");
        let timestamp: i64 = row.get("timestamp");
        candidates.push(Candidate {
            hit: QueryHit {
                chunk_id: row.get("chunk_id"),
                text: row.get("text"),
                score: cosine_similarity(&query_vec, &vector) as f64,
                provenance: Provenance {
                    kind: SourceKind::parse(&kind).unwrap_or(SourceKind::Documentation),
                    source: row.get("source"),
                    origin: row.get("origin"),
                    document_id: row.get("document_id"),
                    seq: row.get("seq"),
                    title: row.get("title"),
                    author: row.get("author"),
                    timestamp: format_ts_iso(timestamp),
                },
            },
            timestamp,
        });
    }

    Ok(rank_candidates(candidates, k))
}

/// Candidate query for `filter`. An origin matches itself and every
/// `origin > ...` path below it.
fn candidate_sql(filter: &QueryFilter) -> (String, Vec<String>) {
    let mut sql = String::from(
        r#"
        SELECT v.chunk_id, v.embedding, v.timestamp, v.kind, v.origin, v.document_id,
               c.text, c.seq, d.source, d.title, d.author
        FROM chunk_vectors v
        JOIN chunks c ON c.id = v.chunk_id
        JOIN documents d ON d.id = v.document_id
        WHERE 1 = 1
        "#,
    );
    let mut binds = Vec::new();

    if let Some(kind) = filter.kind {
        sql.push_str(" AND v.kind = ?");
        binds.push(kind.as_str().to_string());
    }
    if let Some(origin) = &filter.origin {
        sql.push_str(" AND (v.origin = ? OR substr(v.origin, 1, length(?) + 3) = ? || ' > ')");
        binds.extend([origin.clone(), origin.clone(), origin.clone()]);
    }
    (sql, binds)
}

/// CLI entry point for `kedro-rag search`.
pub async fn run_search(
    config: &Config,
    text: &str,
    kind: Option<String>,
    origin: Option<String>,
    k: Option<usize>,
) -> anyhow::Result<()> {
    let mut q = Query::new(text);
    if let Some(kind) = kind {
        let parsed = SourceKind::parse(&kind).ok_or_else(|| {
            KbError::InvalidRequest(format!(
                "unknown kind '{}' (expected documentation or chat)",
                kind
            ))
        })?;
        q = q.with_kind(parsed);
    }
    if let Some(origin) = origin {
        q = q.with_origin(origin);
    }
    q.k = k;

    let kb = KnowledgeBase::new(config.clone())?;
    let hits = kb.query(&q).await?;
    kb.shutdown().await;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let p = &hit.provenance;
        println!(
            "{}. [{:.3}] {} / {}",
            i + 1,
            hit.score,
            p.kind,
            p.title.as_deref().unwrap_or(&p.origin)
        );
        println!("    origin: {}", p.origin);
        if let Some(author) = &p.author {
            println!("    author: {}", author);
        }
        println!("    timestamp: {}", p.timestamp);
        let excerpt: String = hit.text.replace('\n', " ").chars().take(240).collect();
        println!("    excerpt: \"{}\"", excerpt.trim());
        println!("    id: {}", hit.chunk_id);
        println!();
    }
    Ok(())
}
