use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use super::walker::SupportedFormat;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
/// Shortest run of printable characters kept from a binary `.doc`.
const MIN_DOC_RUN: usize = 4;

pub fn extract_text(path: &Path, format: SupportedFormat) -> Result<String> {
    match format {
        SupportedFormat::PlainText => extract_plain_text(path),
        SupportedFormat::Pdf => extract_pdf(path),
        SupportedFormat::Docx => extract_docx(path),
        SupportedFormat::Doc => extract_doc(path),
    }
}

fn extract_plain_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read text file: {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn extract_pdf(path: &Path) -> Result<String> {
    // pdf-extract panics on some malformed inputs
    let result = std::panic::catch_unwind(|| pdf_extract::extract_text(path));
    match result {
        Ok(text) => {
            text.with_context(|| format!("Failed to extract PDF text: {}", path.display()))
        }
        Err(_) => anyhow::bail!("PDF parser crashed on {}", path.display()),
    }
}

fn extract_docx(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open DOCX: {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read DOCX as ZIP: {}", path.display()))?;

    let mut xml_content = String::new();
    if let Ok(mut entry) = archive.by_name("word/document.xml") {
        entry.read_to_string(&mut xml_content)?;
    } else {
        anyhow::bail!("No word/document.xml found in DOCX");
    }

    Ok(extract_paragraphs(&xml_content))
}

/// Word 97-2003 files. Text runs are recovered from the raw bytes; zip
/// containers saved with a `.doc` name are handed to the DOCX reader.
fn extract_doc(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read DOC: {}", path.display()))?;

    if bytes.starts_with(ZIP_MAGIC) {
        return extract_docx(path);
    }
    if !bytes.starts_with(OLE_MAGIC) {
        anyhow::bail!("{} is not a Word document", path.display());
    }

    let wide = utf16_runs(&bytes);
    if wide.chars().filter(|c| c.is_alphanumeric()).count() >= 20 {
        return Ok(wide);
    }
    Ok(ascii_runs(&bytes))
}

fn is_text_char(c: char) -> bool {
    !c.is_control() || c == '\r' || c == '\n' || c == '\t'
}

fn utf16_runs(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));

    let mut runs = Vec::new();
    let mut current = String::new();
    for decoded in char::decode_utf16(units) {
        match decoded {
            Ok(c) if is_text_char(c) && (c as u32) < 0xE000 => current.push(c),
            _ => flush_run(&mut current, &mut runs),
        }
    }
    flush_run(&mut current, &mut runs);
    runs.join("\n")
}

fn ascii_runs(bytes: &[u8]) -> String {
    let mut runs = Vec::new();
    let mut current = String::new();
    for &b in bytes {
        let c = b as char;
        if b.is_ascii() && is_text_char(c) {
            current.push(c);
        } else {
            flush_run(&mut current, &mut runs);
        }
    }
    flush_run(&mut current, &mut runs);
    runs.join("\n")
}

fn flush_run(current: &mut String, runs: &mut Vec<String>) {
    let run = current.trim();
    if run.chars().count() >= MIN_DOC_RUN && run.chars().any(|c| c.is_alphabetic()) {
        runs.push(run.replace('\r', "\n"));
    }
    current.clear();
}

/// Joins `<w:t>` runs, one output line per `<w:p>` paragraph.
fn extract_paragraphs(xml: &str) -> String {
    xml.split("</w:p>")
        .map(|paragraph| extract_text_from_xml(paragraph, "w:t"))
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_text_from_xml(xml: &str, tag: &str) -> String {
    let open_tag = format!("<{}", tag);
    let close_tag = format!("</{}>", tag);
    let mut text = String::new();
    let mut search_from = 0;

    while let Some(open_pos) = xml[search_from..].find(&open_tag) {
        let abs_open = search_from + open_pos;
        let after_name = abs_open + open_tag.len();
        // `<w:t` is also a prefix of `<w:tab/>`, `<w:tbl>` and friends
        match xml[after_name..].chars().next() {
            Some('>') | Some(' ') => {}
            _ => {
                search_from = after_name;
                continue;
            }
        }
        let Some(tag_end) = xml[abs_open..].find('>') else {
            break;
        };
        if xml[..abs_open + tag_end].ends_with('/') {
            search_from = abs_open + tag_end + 1;
            continue;
        }
        let content_start = abs_open + tag_end + 1;
        let Some(close_pos) = xml[content_start..].find(&close_tag) else {
            break;
        };
        text.push_str(&decode_entities(&xml[content_start..content_start + close_pos]));
        search_from = content_start + close_pos + close_tag.len();
    }

    text
}

fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_docx(path: &Path, document_xml: &str) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("word/document.xml", options).unwrap();
        zip.write_all(document_xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn test_docx_paragraphs_and_entities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fdd.docx");
        write_docx(
            &path,
            r#"<w:document><w:body><w:p><w:r><w:t>Fees &amp; </w:t></w:r><w:r><w:t xml:space="preserve">royalties</w:t></w:r></w:p><w:tbl><w:tr><w:tc><w:p><w:r><w:tab/><w:t>Term</w:t></w:r></w:p></w:tc></w:tr></w:tbl></w:body></w:document>"#,
        );

        let text = extract_text(&path, SupportedFormat::Docx).unwrap();
        assert_eq!(text, "Fees & royalties\nTerm");
    }

    #[test]
    fn test_doc_named_zip_reads_as_docx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.doc");
        write_docx(&path, "<w:p><w:r><w:t>Hello</w:t></w:r></w:p>");

        let text = extract_text(&path, SupportedFormat::Doc).unwrap();
        assert_eq!(text, "Hello");
    }

    #[test]
    fn test_binary_doc_utf16_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.doc");
        let mut bytes = OLE_MAGIC.to_vec();
        bytes.extend_from_slice(&[0u8; 24]);
        for unit in "The franchise term is ten years.".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&[0u8; 8]);
        std::fs::write(&path, bytes).unwrap();

        let text = extract_text(&path, SupportedFormat::Doc).unwrap();
        assert!(text.contains("The franchise term is ten years."));
    }

    #[test]
    fn test_doc_rejects_non_word_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.doc");
        std::fs::write(&path, "just text").unwrap();
        assert!(extract_text(&path, SupportedFormat::Doc).is_err());
    }

    #[test]
    fn test_plain_text_tolerates_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"caf\xe9 menu").unwrap();
        let text = extract_text(&path, SupportedFormat::PlainText).unwrap();
        assert!(text.ends_with(" menu"));
    }
}
