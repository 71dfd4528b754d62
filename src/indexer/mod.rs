pub mod chunker;
pub mod extractor;
pub mod walker;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use self::chunker::chunk_text;
use self::extractor::extract_text;
use self::walker::SupportedFormat;

/// One retrievable slice of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    pub metadata: SegmentMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    /// Original filename as supplied by the uploader.
    pub source: String,
    pub chunk_index: usize,
    pub format: SupportedFormat,
}

/// Reads `path`, chunks its text and tags every chunk with `source`.
///
/// `source` is kept separate from `path` because uploads are stored under a
/// generated name while citations should show what the user uploaded.
pub fn load_segments(
    path: &Path,
    source: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Segment>> {
    let format = SupportedFormat::from_path(path)?;
    let text = extract_text(path, format).map_err(|e| RagError::Extraction {
        file: source.to_string(),
        message: format!("{:#}", e),
    })?;

    let segments: Vec<Segment> = chunk_text(&text, chunk_size, overlap)
        .into_iter()
        .map(|chunk| Segment {
            text: chunk.text,
            metadata: SegmentMetadata {
                source: source.to_string(),
                chunk_index: chunk.chunk_index,
                format,
            },
        })
        .collect();

    if segments.is_empty() {
        return Err(RagError::EmptyDocument {
            file: source.to_string(),
        });
    }

    tracing::debug!(source, chunks = segments.len(), ?format, "document chunked");
    Ok(segments)
}
