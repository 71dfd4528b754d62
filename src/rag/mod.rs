pub mod completion;
pub mod embeddings;
pub mod prompt;
pub mod retry;
pub mod vector_store;

use std::sync::Arc;

use crate::error::{RagError, Result};
use crate::indexer::Segment;
use crate::models::Turn;
use self::completion::CompletionProvider;
use self::embeddings::EmbeddingProvider;
use self::vector_store::{HnswIndex, IndexEntry, ScoredSegment, VectorIndex};

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub condense_question: bool,
    pub max_history_tokens: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 3,
            condense_question: true,
            max_history_tokens: 3000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    /// Segments handed to the model as context, best first.
    pub context: Vec<ScoredSegment>,
}

/// Embedding, retrieval and answering over whichever index the caller holds.
pub struct RagEngine {
    embeddings: Arc<dyn EmbeddingProvider>,
    completion: Arc<dyn CompletionProvider>,
    options: RetrievalOptions,
}

impl RagEngine {
    pub fn new(
        embeddings: Arc<dyn EmbeddingProvider>,
        completion: Arc<dyn CompletionProvider>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            embeddings,
            completion,
            options,
        }
    }

    pub fn model_id(&self) -> &str {
        self.embeddings.model_id()
    }

    pub fn empty_index(&self) -> Box<dyn VectorIndex> {
        Box::new(HnswIndex::new())
    }

    /// Embeds `segments` into a new index.
    pub async fn create_index(&self, segments: Vec<Segment>) -> Result<Box<dyn VectorIndex>> {
        let mut index = self.empty_index();
        self.add_segments(index.as_mut(), segments).await?;
        Ok(index)
    }

    /// Embeds `segments` and appends them. On failure `index` is unchanged.
    pub async fn add_segments(
        &self,
        index: &mut dyn VectorIndex,
        segments: Vec<Segment>,
    ) -> Result<()> {
        embed_segments(self.embeddings.as_ref(), index, segments).await
    }

    /// Top-k segments for `query`; an empty index yields no results and no
    /// provider call.
    pub async fn retrieve(
        &self,
        index: &dyn VectorIndex,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredSegment>> {
        if index.is_empty() {
            return Ok(Vec::new());
        }
        let query_embedding = self.embeddings.embed_query(query).await?;
        index.search(&query_embedding, k)
    }

    /// Rewrites a follow-up into a self-contained question using `history`.
    pub async fn condense_question(&self, history: &[Turn], question: &str) -> Result<String> {
        if history.is_empty() || !self.options.condense_question {
            return Ok(question.to_string());
        }
        let history = prompt::trim_history(history, self.options.max_history_tokens);
        let standalone = self
            .completion
            .complete(prompt::condense_messages(history, question))
            .await?;
        let standalone = standalone.trim();
        if standalone.is_empty() {
            Ok(question.to_string())
        } else {
            Ok(standalone.to_string())
        }
    }

    /// Retrieves context for `question` and asks the model, conditioned on
    /// the prior `history`.
    pub async fn answer(
        &self,
        index: &dyn VectorIndex,
        history: &[Turn],
        question: &str,
    ) -> Result<Answer> {
        let search_query = self.condense_question(history, question).await?;
        let context = self.retrieve(index, &search_query, self.options.top_k).await?;
        tracing::debug!(
            query = %search_query,
            hits = context.len(),
            "retrieved context"
        );

        let history = prompt::trim_history(history, self.options.max_history_tokens);
        let text = self
            .completion
            .complete(prompt::answer_messages(&context, history, question))
            .await?;

        Ok(Answer { text, context })
    }
}

/// Embeds `segments` with `provider` and appends them to `index`. On failure
/// `index` is unchanged.
pub async fn embed_segments(
    provider: &dyn EmbeddingProvider,
    index: &mut dyn VectorIndex,
    segments: Vec<Segment>,
) -> Result<()> {
    if segments.is_empty() {
        return Ok(());
    }
    let texts: Vec<String> = segments.iter().map(|s| s.text.clone()).collect();
    let vectors = provider.embed_documents(texts).await?;
    if vectors.len() != segments.len() {
        return Err(RagError::embedding(
            format!("expected {} vectors, got {}", segments.len(), vectors.len()),
            false,
        ));
    }

    let entries: Vec<IndexEntry> = segments
        .into_iter()
        .zip(vectors)
        .map(|(segment, embedding)| IndexEntry { segment, embedding })
        .collect();
    index.insert(provider.model_id(), entries)
}
