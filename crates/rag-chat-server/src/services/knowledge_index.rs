use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::services::embedding_service::EmbeddingProvider;
use crate::utils::error::{ChatError, RetrievalError};
use crate::utils::similarity::cosine_similarity;

/// A stored question/answer pair plus its embedding vector.
#[derive(Debug, Clone)]
pub struct KnowledgeEntry {
    pub question: String,
    pub answer: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub question: String,
    pub answer: String,
    pub similarity: f32,
}

/// Read-only vector index over question/answer pairs. A reload builds a
/// complete replacement set and swaps it in atomically: in-flight
/// searches keep the snapshot they loaded, never a partial mix.
pub struct KnowledgeIndex {
    entries: ArcSwap<Vec<KnowledgeEntry>>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl KnowledgeIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            embedder,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Rebuild the whole index from a CSV document with `Question` and
    /// `Answer` columns. All-or-nothing: any embedding failure leaves
    /// the previous index in effect.
    pub async fn load_from_csv(&self, data: &[u8]) -> Result<usize, ChatError> {
        let rows = parse_question_answer_csv(data)?;

        if rows.is_empty() {
            return Err(ChatError::IndexLoadFailure(
                "no usable Question/Answer rows in upload".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(rows.len());
        let mut dimension: Option<usize> = None;

        for (question, answer) in rows {
            let embedding = self
                .embedder
                .embed(&question)
                .await
                .map_err(|e| ChatError::IndexLoadFailure(e.to_string()))?;

            match dimension {
                None => dimension = Some(embedding.len()),
                Some(d) if d != embedding.len() => {
                    return Err(ChatError::IndexLoadFailure(format!(
                        "inconsistent embedding dimensions: {} != {}",
                        d,
                        embedding.len()
                    )));
                }
                Some(_) => {}
            }

            entries.push(KnowledgeEntry {
                question,
                answer,
                embedding,
            });
        }

        let total = entries.len();
        self.entries.store(Arc::new(entries));
        info!("Knowledge index loaded: {} entries", total);

        Ok(total)
    }

    /// Similarity search over the current snapshot. Entries below
    /// `threshold` are filtered out; results are sorted by similarity
    /// descending with load order breaking ties; at most `limit` are
    /// returned. An empty result is a valid outcome, distinct from the
    /// integrity error raised for malformed stored vectors.
    pub async fn search(
        &self,
        query: &str,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        let query_embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(RetrievalError::Embedding)?;

        let snapshot = self.entries.load_full();
        let mut hits = Vec::new();

        for (i, entry) in snapshot.iter().enumerate() {
            let similarity = cosine_similarity(&query_embedding, &entry.embedding)
                .map_err(|e| RetrievalError::Integrity(format!("entry {}: {}", i, e)))?;

            if similarity >= threshold {
                hits.push(SearchHit {
                    question: entry.question.clone(),
                    answer: entry.answer.clone(),
                    similarity,
                });
            }
        }

        // Stable sort keeps load order for equal scores.
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);

        debug!("Search returned {} hits (threshold {})", hits.len(), threshold);
        Ok(hits)
    }

    #[cfg(test)]
    pub(crate) fn install(&self, entries: Vec<KnowledgeEntry>) {
        self.entries.store(Arc::new(entries));
    }
}

fn parse_question_answer_csv(data: &[u8]) -> Result<Vec<(String, String)>, ChatError> {
    let mut reader = csv::Reader::from_reader(data);

    let headers = reader
        .headers()
        .map_err(|e| ChatError::IndexLoadFailure(format!("unreadable CSV header: {}", e)))?
        .clone();

    let question_col = headers.iter().position(|h| h.trim() == "Question");
    let answer_col = headers.iter().position(|h| h.trim() == "Answer");

    let (question_col, answer_col) = match (question_col, answer_col) {
        (Some(q), Some(a)) => (q, a),
        _ => {
            return Err(ChatError::IndexLoadFailure(
                "CSV must have Question and Answer columns".to_string(),
            ))
        }
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| ChatError::IndexLoadFailure(format!("bad CSV record: {}", e)))?;

        let question = record.get(question_col).unwrap_or("").trim();
        let answer = record.get(answer_col).unwrap_or("").trim();

        // Rows missing either column are skipped, matching the
        // ingestion contract: only complete pairs become entries.
        if !question.is_empty() && !answer.is_empty() {
            rows.push((question.to_string(), answer.to_string()));
        }
    }

    Ok(rows)
}
