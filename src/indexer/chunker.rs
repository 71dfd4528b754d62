#[derive(Debug, Clone)]
pub struct TextChunk {
    pub text: String,
    pub chunk_index: usize,
}

/// Splits `text` into windows of at most `max_chunk_size` characters, each
/// starting `max_chunk_size - overlap` characters after the previous one.
///
/// Lengths are counted in chars so multi-byte text never splits inside a
/// code point. Adjacent chunks share exactly `overlap` characters, except
/// where the final window is shorter than the overlap would require.
pub fn chunk_text(text: &str, max_chunk_size: usize, overlap: usize) -> Vec<TextChunk> {
    if text.trim().is_empty() || max_chunk_size == 0 {
        return Vec::new();
    }
    let overlap = overlap.min(max_chunk_size - 1);
    let step = max_chunk_size - overlap;

    // Byte offset of every char, plus the end of the string.
    let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let total_chars = offsets.len();
    offsets.push(text.len());

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut chunk_index = 0;

    loop {
        let end = (start + max_chunk_size).min(total_chars);
        let chunk = &text[offsets[start]..offsets[end]];
        if !chunk.trim().is_empty() {
            chunks.push(TextChunk {
                text: chunk.to_string(),
                chunk_index,
            });
            chunk_index += 1;
        }
        if end == total_chars {
            break;
        }
        start += step;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_text(len: usize) -> String {
        (0..len)
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect()
    }

    #[test]
    fn test_consecutive_chunks_share_overlap() {
        let text = numbered_text(3700);
        let chunks = chunk_text(&text, 1000, 200);
        assert_eq!(chunks.len(), 5);

        for pair in chunks.windows(2) {
            let prev: Vec<char> = pair[0].text.chars().collect();
            let next: Vec<char> = pair[1].text.chars().collect();
            assert_eq!(prev.len(), 1000);
            assert_eq!(&prev[prev.len() - 200..], &next[..200]);
        }
        assert_eq!(chunks[4].text.chars().count(), 500);
    }

    #[test]
    fn test_chunks_cover_whole_text() {
        let text = numbered_text(2345);
        let chunks = chunk_text(&text, 1000, 200);
        let mut rebuilt: String = chunks[0].text.clone();
        for chunk in &chunks[1..] {
            rebuilt.extend(chunk.text.chars().skip(200));
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_japanese_text_chunking() {
        let text = "これはテスト文章です。日本語のマルチバイト文字を含むテキストを正しくチャンクに分割できるかテストします。句読点で分割されることを確認します。";
        let chunks = chunk_text(text, 30, 10);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 30);
        }
        let first: Vec<char> = chunks[0].text.chars().collect();
        let second: Vec<char> = chunks[1].text.chars().collect();
        assert_eq!(&first[20..], &second[..10]);
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("short", 100, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short");
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn test_exact_multiple_has_no_redundant_tail() {
        // 1800 chars: windows [0,1000) and [800,1800); a third window would
        // be contained in the second.
        let chunks = chunk_text(&numbered_text(1800), 1000, 200);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", 100, 10).is_empty());
        assert!(chunk_text(" \n\t ", 100, 10).is_empty());
    }
}
