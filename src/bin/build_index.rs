use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use rag_chatbot::config::{Settings, DEFAULT_LOG_FILTER};
use rag_chatbot::error::RagError;
use rag_chatbot::indexer::load_segments;
use rag_chatbot::indexer::walker::{walk_directory, SupportedFormat};
use rag_chatbot::pipeline::ChatService;
use rag_chatbot::rag::embed_segments;
use rag_chatbot::rag::embeddings::{provider_from_settings, EmbeddingProvider};
use rag_chatbot::rag::vector_store::{HnswIndex, VectorIndex};

#[derive(Parser, Debug)]
#[command(name = "build-index")]
#[command(about = "Build the default document index served by the chatbot")]
struct Args {
    /// Files or directories to index; directories are walked recursively
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Index directory (defaults to `index.path` from the configuration)
    #[arg(long)]
    index_path: Option<PathBuf>,

    /// Maximum chunk size in characters
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Overlap between chunks in characters
    #[arg(long)]
    chunk_overlap: Option<usize>,

    /// Merge into the existing index instead of replacing it
    #[arg(long)]
    append: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    let mut settings = Settings::load()?;
    if let Some(size) = args.chunk_size {
        settings.chunking.chunk_size = size;
    }
    if let Some(overlap) = args.chunk_overlap {
        settings.chunking.chunk_overlap = overlap;
    }
    settings.validate()?;
    let index_path = args.index_path.clone().unwrap_or_else(|| settings.index.path.clone());

    let files = collect_inputs(&args.inputs)?;
    println!("Found {} supported files", files.len());
    if files.is_empty() {
        println!("No supported files found. Exiting.");
        return Ok(());
    }

    println!("Initializing embedding provider...");
    let embeddings = provider_from_settings(&settings)?;

    let mut index: Box<dyn VectorIndex> = if args.append {
        match ChatService::load_default_index(&index_path, embeddings.model_id())? {
            Some(existing) => {
                println!("Appending to {} existing chunks", existing.len());
                existing
            }
            None => Box::new(HnswIndex::new()),
        }
    } else {
        Box::new(HnswIndex::new())
    };

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut total_chunks = 0usize;
    let mut failed_files: Vec<(PathBuf, String)> = Vec::new();

    for path in &files {
        pb.set_message(format!("{}", path.file_name().unwrap_or_default().to_string_lossy()));

        match process_file(path, embeddings.as_ref(), index.as_mut(), &settings).await {
            Ok(chunk_count) => total_chunks += chunk_count,
            Err(e) => {
                tracing::warn!("Failed to process {}: {}", path.display(), e);
                failed_files.push((path.clone(), e.user_message()));
            }
        }

        pb.inc(1);
    }

    pb.finish_with_message("done");

    if index.is_empty() {
        anyhow::bail!("Nothing was indexed; {} files failed", failed_files.len());
    }
    index.persist(&index_path)?;

    println!("\nIndexing complete!");
    println!("  Files processed: {}/{}", files.len() - failed_files.len(), files.len());
    println!("  Files failed:    {}", failed_files.len());
    println!("  New chunks:      {}", total_chunks);
    println!("  Index size:      {}", index.len());
    println!("  Index path:      {}", index_path.display());

    if !failed_files.is_empty() {
        println!("\nFailed files:");
        for (path, err) in &failed_files {
            println!("  {}: {}", path.display(), err);
        }
    }

    Ok(())
}

/// Expands directories and rejects unsupported files named explicitly.
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            files.extend(walk_directory(input).into_iter().map(|(path, _)| path));
        } else if input.is_file() {
            SupportedFormat::from_path(input)?;
            files.push(input.clone());
        } else {
            anyhow::bail!("Input does not exist: {}", input.display());
        }
    }
    Ok(files)
}

async fn process_file(
    path: &Path,
    embeddings: &dyn EmbeddingProvider,
    index: &mut dyn VectorIndex,
    settings: &Settings,
) -> Result<usize, RagError> {
    let source = source_name(path);
    let (size, overlap) = (settings.chunking.chunk_size, settings.chunking.chunk_overlap);
    let owned = path.to_path_buf();
    let segments =
        tokio::task::spawn_blocking(move || load_segments(&owned, &source, size, overlap))
            .await
            .map_err(|e| RagError::Extraction {
                file: path.display().to_string(),
                message: e.to_string(),
            })??;

    let count = segments.len();
    embed_segments(embeddings, index, segments).await?;
    Ok(count)
}

/// Name recorded on each chunk; matches what an upload of the same file shows.
fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_name_is_file_name() {
        assert_eq!(source_name(Path::new("/srv/docs/manual.pdf")), "manual.pdf");
        assert_eq!(source_name(Path::new("notes.txt")), "notes.txt");
    }

    #[test]
    fn test_collect_inputs_rejects_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_inputs(&[dir.path().join("absent.txt")]).is_err());
    }
}
