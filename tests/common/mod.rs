#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;

use rag_chatbot::api::create_router;
use rag_chatbot::error::{RagError, Result};
use rag_chatbot::models::Message;
use rag_chatbot::pipeline::{ChatService, ServiceOptions};
use rag_chatbot::rag::completion::CompletionProvider;
use rag_chatbot::rag::embeddings::EmbeddingProvider;
use rag_chatbot::rag::{RagEngine, RetrievalOptions};
use rag_chatbot::session::SessionStore;

pub const FAKE_DIMENSION: usize = 64;
pub const BOUNDARY: &str = "rag-chatbot-test-boundary";

/// Bag-of-words vectors: texts sharing words land close together.
#[derive(Default)]
pub struct FakeEmbeddings {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeEmbeddings {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; FAKE_DIMENSION];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            vector[(hasher.finish() as usize) % FAKE_DIMENSION] += 1.0;
        }
        // Keep blank texts off the zero vector.
        vector[0] += 0.01;
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbeddings {
    fn model_id(&self) -> &str {
        "fake-embeddings"
    }

    fn dimension(&self) -> Option<usize> {
        Some(FAKE_DIMENSION)
    }

    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RagError::embedding("quota exceeded", false));
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Records every prompt. Condense requests get the follow-up back unchanged;
/// answer requests get a reply naming the question.
#[derive(Default)]
pub struct FakeCompletion {
    pub fail: AtomicBool,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl FakeCompletion {
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts.lock().unwrap().clone()
    }

    /// System messages of answer requests, in call order.
    pub fn answer_contexts(&self) -> Vec<String> {
        self.prompts()
            .into_iter()
            .filter(|p| !is_condense(p))
            .map(|p| p[0].content.clone())
            .collect()
    }

    pub fn condense_calls(&self) -> usize {
        self.prompts().iter().filter(|p| is_condense(p)).count()
    }
}

fn is_condense(prompt: &[Message]) -> bool {
    prompt
        .last()
        .is_some_and(|m| m.content.ends_with("Standalone question:"))
}

#[async_trait]
impl CompletionProvider for FakeCompletion {
    async fn complete(&self, messages: Vec<Message>) -> Result<String> {
        self.prompts.lock().unwrap().push(messages.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(RagError::llm("401 invalid api key", false));
        }

        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        if is_condense(&messages) {
            let follow_up = last
                .split("Follow Up Input: ")
                .nth(1)
                .and_then(|rest| rest.strip_suffix("\nStandalone question:"))
                .unwrap_or_default();
            return Ok(follow_up.to_string());
        }
        Ok(format!("Answer to: {}", last))
    }
}

pub struct TestApp {
    pub dir: TempDir,
    pub service: Arc<ChatService>,
    pub embeddings: Arc<FakeEmbeddings>,
    pub completion: Arc<FakeCompletion>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(3600))
    }

    pub fn with_ttl(idle_ttl: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let embeddings = Arc::new(FakeEmbeddings::default());
        let completion = Arc::new(FakeCompletion::default());
        let engine = RagEngine::new(
            embeddings.clone(),
            completion.clone(),
            RetrievalOptions::default(),
        );
        let options = ServiceOptions {
            index_path: dir.path().join("faiss_index"),
            upload_dir: dir.path().join("uploads"),
            chunk_size: 200,
            chunk_overlap: 40,
        };
        let sessions = Arc::new(SessionStore::new(idle_ttl, 100));
        let service = Arc::new(ChatService::new(engine, sessions, None, options));

        Self {
            dir,
            service,
            embeddings,
            completion,
        }
    }

    pub fn router(&self) -> Router {
        self.router_with_limit(1024 * 1024)
    }

    pub fn router_with_limit(&self, max_upload_bytes: usize) -> Router {
        create_router(self.service.clone(), max_upload_bytes)
    }

    pub fn index_path(&self) -> std::path::PathBuf {
        self.dir.path().join("faiss_index")
    }
}

/// A `multipart/form-data` body; `file` is `(filename, contents)`.
pub fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    if let Some((filename, contents)) = file {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(contents);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub const MANUAL: &str = "The warranty covers the compressor for five years. \
Filters must be replaced every three months. \
The service hotline is open on weekdays from nine to five.";

pub const RECIPES: &str = "Bread needs flour, water, salt and yeast. \
Let the dough rise for two hours before baking at two hundred degrees.";

/// A PDF with one page per entry of `pages`, each a single line of
/// Helvetica text. Text must not contain parentheses or backslashes.
pub fn pdf_document(pages: &[&str]) -> Vec<u8> {
    let font_id = 3;
    let page_ids: Vec<usize> = (0..pages.len()).map(|i| 4 + 2 * i).collect();
    let kids = page_ids
        .iter()
        .map(|id| format!("{} 0 R", id))
        .collect::<Vec<_>>()
        .join(" ");

    let mut objects = vec![
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids, pages.len()),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>"
            .to_string(),
    ];
    for (text, page_id) in pages.iter().zip(&page_ids) {
        let content = format!("BT /F1 12 Tf 72 720 Td ({}) Tj ET", text);
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
             /Resources << /Font << /F1 {} 0 R >> >> /Contents {} 0 R >>",
            font_id,
            page_id + 1
        ));
        objects.push(format!(
            "<< /Length {} >>\nstream\n{}\nendstream",
            content.len(),
            content
        ));
    }

    let mut pdf = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, object) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, object).as_bytes());
    }

    let xref_at = pdf.len();
    pdf.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    pdf.extend_from_slice(b"0000000000 65535 f \n");
    for offset in offsets {
        pdf.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    pdf.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_at
        )
        .as_bytes(),
    );
    pdf
}
