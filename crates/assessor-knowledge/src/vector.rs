//! Q&A knowledge base with embedding similarity search
//!
//! Documents are question/answer pairs. Embeddings are normalized to unit
//! length on the way in, so the dot product of two stored vectors is their
//! cosine similarity.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::sqlite::{DbError, KnowledgeDb};

/// Number of snippets returned when the caller does not ask for a count
pub const DEFAULT_TOP_K: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("embedding has zero length")]
    ZeroVector,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Storage(#[from] DbError),
}

impl From<rusqlite::Error> for RetrievalError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(DbError::Sqlite(e))
    }
}

/// A question/answer pair to be indexed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

/// A scored search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaHit {
    pub question: String,
    pub answer: String,
    pub score: f32,
}

/// Turns text into dense vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Scale a vector to unit length
pub fn normalize(mut v: Vec<f32>) -> Result<Vec<f32>, RetrievalError> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(RetrievalError::ZeroVector);
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Ok(v)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Embedding-backed retriever over the `qa_documents` table
#[derive(Clone)]
pub struct KnowledgeRetriever {
    db: KnowledgeDb,
    embedder: Arc<dyn Embedder>,
}

impl std::fmt::Debug for KnowledgeRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeRetriever").finish_non_exhaustive()
    }
}

impl KnowledgeRetriever {
    pub fn new(db: KnowledgeDb, embedder: Arc<dyn Embedder>) -> Self {
        Self { db, embedder }
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut vectors = self
            .embedder
            .embed(&[text.to_string()])
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;
        let vector = vectors
            .pop()
            .ok_or_else(|| RetrievalError::Embedding("embedder returned no vectors".to_string()))?;
        normalize(vector)
    }

    /// Embed and store Q&A pairs. The question is the embedded text.
    pub async fn ingest(&self, pairs: Vec<QaPair>) -> Result<usize, RetrievalError> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let questions: Vec<String> = pairs.iter().map(|p| p.question.clone()).collect();
        let vectors = self
            .embedder
            .embed(&questions)
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;
        if vectors.len() != pairs.len() {
            return Err(RetrievalError::Embedding(format!(
                "expected {} embeddings, got {}",
                pairs.len(),
                vectors.len()
            )));
        }

        let mut rows = Vec::with_capacity(pairs.len());
        for (pair, vector) in pairs.into_iter().zip(vectors) {
            let vector = normalize(vector)?;
            let encoded = serde_json::to_string(&vector).map_err(DbError::from)?;
            rows.push((pair, encoded));
        }

        self.db
            .call(move |conn| {
                let now = Utc::now().to_rfc3339();
                let mut stmt = conn.prepare(
                    "INSERT INTO qa_documents (question, answer, embedding, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (pair, encoded) in &rows {
                    stmt.execute(params![&pair.question, &pair.answer, encoded, &now])?;
                }
                info!("Indexed {} Q&A documents", rows.len());
                Ok(rows.len())
            })
            .await
    }

    /// Top-`k` documents by cosine similarity, best first. Ties keep
    /// insertion order so results are stable for a fixed corpus.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<QaHit>, RetrievalError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embed_one(query).await?;

        let hits = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, question, answer, embedding FROM qa_documents ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut scored = Vec::with_capacity(rows.len());
                for (id, question, answer, encoded) in rows {
                    let vector: Vec<f32> = serde_json::from_str(&encoded).map_err(DbError::from)?;
                    if vector.len() != query_vector.len() {
                        return Err(RetrievalError::DimensionMismatch {
                            expected: query_vector.len(),
                            actual: vector.len(),
                        });
                    }
                    let score = dot(&query_vector, &vector);
                    scored.push((id, QaHit { question, answer, score }));
                }

                scored.sort_by(|(id_a, a), (id_b, b)| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(Ordering::Equal)
                        .then(id_a.cmp(id_b))
                });
                scored.truncate(k);
                Ok(scored.into_iter().map(|(_, hit)| hit).collect::<Vec<_>>())
            })
            .await?;

        debug!("Knowledge search returned {} hit(s)", hits.len());
        Ok(hits)
    }

    /// Number of indexed documents
    pub async fn count(&self) -> Result<usize, RetrievalError> {
        self.db
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM qa_documents", [], |r| r.get(0))?;
                Ok(n as usize)
            })
            .await
    }
}

/// Format hits the way the knowledge generator expects them
pub fn format_hits(hits: &[QaHit]) -> String {
    if hits.is_empty() {
        return "Nenhum documento encontrado.".to_string();
    }
    hits.iter()
        .enumerate()
        .map(|(i, h)| {
            format!(
                "{}. question: {}\n   answer: {}\n   score: {:.4}",
                i + 1,
                h.question,
                h.answer,
                h.score
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Gemini embedding client
pub struct GoogleEmbedder {
    client: Client,
    api_key: String,
    model: String,
    dimensions: u32,
}

impl std::fmt::Debug for GoogleEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleEmbedder")
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl GoogleEmbedder {
    pub fn new(api_key: String, model: String, dimensions: u32) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key,
            model,
            dimensions,
        })
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    requests: Vec<EmbedContentRequest<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest<'a> {
    model: String,
    content: EmbedContent<'a>,
    output_dimensionality: u32,
}

#[derive(Debug, Serialize)]
struct EmbedContent<'a> {
    parts: Vec<EmbedPart<'a>>,
}

#[derive(Debug, Serialize)]
struct EmbedPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[async_trait]
impl Embedder for GoogleEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:batchEmbedContents?key={}",
            self.model, self.api_key
        );
        let body = EmbedRequest {
            requests: texts
                .iter()
                .map(|t| EmbedContentRequest {
                    model: format!("models/{}", self.model),
                    content: EmbedContent {
                        parts: vec![EmbedPart { text: t }],
                    },
                    output_dimensionality: self.dimensions,
                })
                .collect(),
        };

        debug!("Embedding {} text(s) with {}", texts.len(), self.model);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to send request to Gemini embedding API")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Gemini embedding request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .context("Failed to parse Gemini embedding response")?;
        Ok(parsed.embeddings.into_iter().map(|e| e.values).collect())
    }
}
