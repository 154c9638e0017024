use crate::config::Settings;

/// Splits text into overlapping windows of at most `size` characters.
///
/// A window prefers to end just after a paragraph break, then after a
/// sentence break, as long as that keeps it longer than half the size.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(size: usize, overlap: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            overlap: overlap.min(size - 1),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.chunk_size, settings.chunk_overlap)
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut start = 0;

        loop {
            let mut end = (start + self.size).min(len);
            if end < len {
                end = self.boundary(&chars, start, end).unwrap_or(end);
            }

            chunks.push(chars[start..end].iter().collect::<String>());

            if end >= len {
                break;
            }
            start = end.saturating_sub(self.overlap).max(start + 1);
        }

        log::debug!("Created {} chunks from {} characters", chunks.len(), len);
        chunks
    }

    // End index just past the last paragraph or sentence break in chars[start..end]
    fn boundary(&self, chars: &[char], start: usize, end: usize) -> Option<usize> {
        let min_end = start + self.size / 2;
        let window = &chars[start..end];

        let paragraph = window.windows(2).rposition(|w| w[0] == '\n' && w[1] == '\n');
        let sentence = window
            .windows(2)
            .rposition(|w| matches!(w[0], '.' | '!' | '?') && w[1] == ' ');

        [paragraph, sentence]
            .into_iter()
            .flatten()
            .map(|i| start + i)
            .find(|&pos| pos > min_end)
            .map(|pos| pos + 2)
    }
}
