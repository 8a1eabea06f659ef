/// Append-only text for one chat turn.
///
/// Line start offsets are recorded as fragments arrive, so a line lookup never rescans the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBuffer {
    text: String,
    /// Byte offset of each line's first byte. Never empty.
    line_starts: Vec<usize>,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            line_starts: vec![0],
        }
    }

    /// Appends a fragment and returns the accumulated text.
    pub fn append(&mut self, fragment: &str) -> &str {
        let base = self.text.len();
        self.text.push_str(fragment);
        self.line_starts.extend(
            fragment
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| base + i + 1),
        );
        &self.text
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Line at `index` without its newline, or `None` past the end.
    pub fn line(&self, index: usize) -> Option<&str> {
        let start = *self.line_starts.get(index)?;
        let end = match self.line_starts.get(index + 1) {
            Some(next) => next - 1,
            None => self.text.len(),
        };
        Some(&self.text[start..end])
    }

    /// Byte offset where line `index` starts, or `None` past the end.
    pub fn line_start(&self, index: usize) -> Option<usize> {
        self.line_starts.get(index).copied()
    }

    /// Index of the last (possibly still growing) line.
    pub fn last_line_index(&self) -> usize {
        self.line_starts.len() - 1
    }

    /// Byte offset of the last line.
    pub fn last_line_start(&self) -> usize {
        self.line_starts.last().copied().unwrap_or(0)
    }
}

/// Splits on `\n`. Always yields at least one (possibly empty) line.
pub fn lines_of(text: &str) -> Vec<&str> {
    text.split('\n').collect()
}

pub fn newline_count(s: &str) -> usize {
    s.bytes().filter(|b| *b == b'\n').count()
}
