use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::indexer::{load_segments, walker::SupportedFormat};
use crate::models::Turn;
use crate::rag::vector_store::{HnswIndex, VectorIndex};
use crate::rag::RagEngine;
use crate::session::{session_id_or_new, SessionState, SessionStore};

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._ -]").expect("valid regex"));

const STAGING_DIR: &str = ".staging";
pub const MISSING_INPUT_MESSAGE: &str = "Please provide a question or upload a file.";

/// A file received from a client, not yet written anywhere.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }

    /// Final path component with anything unusual replaced.
    pub fn display_name(&self) -> String {
        let base = self
            .filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();
        let cleaned = UNSAFE_FILENAME_CHARS.replace_all(base, "_").to_string();
        if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
            "upload".to_string()
        } else {
            cleaned
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub index_path: PathBuf,
    pub upload_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AskOutcome {
    pub session_id: String,
    pub answer: String,
}

/// A file turned into an index, ready to be merged. The upload itself sits
/// at `staged` until the caller keeps or discards it.
struct Ingested {
    name: String,
    index: Box<dyn VectorIndex>,
    staged: PathBuf,
}

/// Application context behind the HTTP handlers: sessions, the shared
/// default index and the engine that embeds and answers.
pub struct ChatService {
    engine: RagEngine,
    sessions: Arc<SessionStore>,
    /// Read by sessions without their own index. Replaced whole by `upload`;
    /// readers keep the version they cloned.
    default_index: RwLock<Option<Arc<dyn VectorIndex>>>,
    /// Serializes default-index writers so no upload is lost.
    upload_lock: Mutex<()>,
    options: ServiceOptions,
}

impl ChatService {
    pub fn new(
        engine: RagEngine,
        sessions: Arc<SessionStore>,
        default_index: Option<Box<dyn VectorIndex>>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            engine,
            sessions,
            default_index: RwLock::new(default_index.map(Arc::from)),
            upload_lock: Mutex::new(()),
            options,
        }
    }

    /// Loads the persisted default index. A missing index is not an error;
    /// an unreadable one, or one built with another embedding model, is.
    pub fn load_default_index(
        path: &Path,
        model_id: &str,
    ) -> Result<Option<Box<dyn VectorIndex>>> {
        if !HnswIndex::exists(path) {
            tracing::info!(
                path = %path.display(),
                "no persisted index, starting without default documents"
            );
            return Ok(None);
        }
        let index = HnswIndex::load(path)?;
        if let Some(found) = index.model_id() {
            if found != model_id {
                return Err(RagError::SchemaMismatch {
                    expected: format!("model {}", model_id),
                    found: format!("model {}", found),
                });
            }
        }
        Ok(Some(Box::new(index)))
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    async fn current_default(&self) -> Option<Arc<dyn VectorIndex>> {
        self.default_index.read().await.clone()
    }

    pub async fn default_index_len(&self) -> usize {
        self.current_default().await.map_or(0, |index| index.len())
    }

    /// Adds a file to the shared default index and persists it. Always
    /// returns a status line; failures are described, never raised.
    pub async fn upload(&self, file: UploadedFile) -> String {
        match self.upload_default(&file).await {
            Ok(chunks) => format!(
                "{} uploaded and indexed ({} chunks).",
                file.display_name(),
                chunks
            ),
            Err(e) => {
                tracing::warn!(file = %file.display_name(), error = %e, "upload failed");
                e.user_message()
            }
        }
    }

    async fn upload_default(&self, file: &UploadedFile) -> Result<usize> {
        let Ingested {
            name,
            index: addition,
            staged,
        } = self.ingest(file).await?;
        let chunks = addition.len();

        let _writer = self.upload_lock.lock().await;
        let current = self.current_default().await;
        let index_path = self.options.index_path.clone();
        let merged = tokio::task::spawn_blocking(move || -> Result<Box<dyn VectorIndex>> {
            let mut candidate: Box<dyn VectorIndex> = match current {
                Some(current) => current.snapshot(),
                None => Box::new(HnswIndex::new()),
            };
            candidate.merge(addition.as_ref())?;
            candidate.persist(&index_path)?;
            Ok(candidate)
        })
        .await
        .map_err(|e| RagError::IndexPersist {
            path: self.options.index_path.display().to_string(),
            message: e.to_string(),
        })
        .and_then(|merged| merged);

        let merged = match merged {
            Ok(merged) => merged,
            Err(e) => {
                discard(&staged).await;
                return Err(e);
            }
        };
        *self.default_index.write().await = Some(Arc::from(merged));

        let destination = self.options.upload_dir.join(&name);
        if let Err(e) = tokio::fs::rename(&staged, &destination).await {
            tracing::warn!(file = %name, error = %e, "could not keep uploaded file");
            discard(&staged).await;
        }

        tracing::info!(file = %name, chunks, "default index updated");
        Ok(chunks)
    }

    /// Handles one `/ask` request: optional ingestion into the session, then
    /// an answer when a question is present.
    pub async fn ask(
        &self,
        session_id: Option<&str>,
        question: Option<&str>,
        file: Option<UploadedFile>,
    ) -> AskOutcome {
        let question = question.map(str::trim).filter(|q| !q.is_empty());

        if question.is_none() && file.is_none() {
            return AskOutcome {
                session_id: session_id_or_new(session_id),
                answer: MISSING_INPUT_MESSAGE.to_string(),
            };
        }

        let lease = self.sessions.get_or_create(session_id);
        let session_id = lease.id().to_string();
        if lease.is_new() {
            tracing::debug!(
                %session_id,
                created_at = %lease.session().created_at(),
                "starting conversation"
            );
        }
        let mut state = lease.lock().await;

        let mut ingested_status = None;
        if let Some(file) = file {
            match self.ingest_into_session(&mut state, &file).await {
                Ok(status) => ingested_status = Some(status),
                Err(e) => {
                    tracing::warn!(
                        %session_id,
                        file = %file.display_name(),
                        error = %e,
                        "session ingestion failed"
                    );
                    return AskOutcome {
                        session_id,
                        answer: e.user_message(),
                    };
                }
            }
        }

        let answer = match question {
            Some(question) => match self.answer_in_session(&mut state, question).await {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!(%session_id, error = %e, "answering failed");
                    e.user_message()
                }
            },
            None => ingested_status.unwrap_or_default(),
        };

        AskOutcome { session_id, answer }
    }

    async fn ingest_into_session(
        &self,
        state: &mut SessionState,
        file: &UploadedFile,
    ) -> Result<String> {
        let Ingested {
            name,
            index: addition,
            staged,
        } = self.ingest(file).await?;
        discard(&staged).await;
        let chunks = addition.len();

        let had_index = state.index.is_some();
        // Without its own index, start from a private copy of the shared documents.
        let default = if had_index {
            None
        } else {
            self.current_default().await
        };
        let base = state.index.take();
        let (target, merged) = tokio::task::spawn_blocking(move || {
            let mut target: Box<dyn VectorIndex> = match (base, default) {
                (Some(own), _) => own,
                (None, Some(default)) => default.snapshot(),
                (None, None) => Box::new(HnswIndex::new()),
            };
            let merged = target.merge(addition.as_ref());
            (target, merged)
        })
        .await
        .map_err(|e| RagError::Extraction {
            file: name.clone(),
            message: e.to_string(),
        })?;

        // A failed merge leaves `target` as it was.
        if merged.is_ok() || had_index {
            state.index = Some(target);
        }
        merged?;

        tracing::info!(file = %name, chunks, "session index updated");
        Ok(format!(
            "{} uploaded and indexed ({} chunks). You can now ask questions about it.",
            name, chunks
        ))
    }

    async fn answer_in_session(&self, state: &mut SessionState, question: &str) -> Result<String> {
        let answer = match state.index.as_deref() {
            Some(index) => self.engine.answer(index, &state.turns, question).await?,
            None => {
                let default = self.current_default().await;
                let index = default.as_deref().ok_or(RagError::NoDocuments)?;
                self.engine.answer(index, &state.turns, question).await?
            }
        };

        state.turns.push(Turn {
            question: question.to_string(),
            answer: answer.text.clone(),
        });
        Ok(answer.text)
    }

    /// Stages `file` on disk, extracts and embeds it. Nothing shared is
    /// modified. On success the staged copy is left for the caller.
    async fn ingest(&self, file: &UploadedFile) -> Result<Ingested> {
        let name = file.display_name();
        SupportedFormat::from_path(Path::new(&name))?;

        let staging_dir = self.options.upload_dir.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging_dir).await?;
        let staged = staging_dir.join(format!("{}_{}", Uuid::new_v4(), name));
        tokio::fs::write(&staged, &file.bytes).await?;

        match self.embed_staged(&staged, &name).await {
            Ok(index) => Ok(Ingested {
                name,
                index,
                staged,
            }),
            Err(e) => {
                discard(&staged).await;
                Err(e)
            }
        }
    }

    async fn embed_staged(&self, staged: &Path, name: &str) -> Result<Box<dyn VectorIndex>> {
        let (path, source) = (staged.to_path_buf(), name.to_string());
        let (size, overlap) = (self.options.chunk_size, self.options.chunk_overlap);
        let segments =
            tokio::task::spawn_blocking(move || load_segments(&path, &source, size, overlap))
                .await
                .map_err(|e| RagError::Extraction {
                    file: name.to_string(),
                    message: e.to_string(),
                })??;

        self.engine.create_index(segments).await
    }
}

async fn discard(staged: &Path) {
    if let Err(e) = tokio::fs::remove_file(staged).await {
        tracing::debug!(path = %staged.display(), error = %e, "could not remove staged file");
    }
}
