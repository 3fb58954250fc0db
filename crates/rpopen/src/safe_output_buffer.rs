use rpopen_core::{PopenError, ProcessStatus, Target};

const ELLIPSIS: &str = "...";

/// Line buffer with bounded memory for child output.
///
/// Keeps the most recent `max_line_count` lines. Once lines have been
/// dropped the first kept line is replaced by `...`, and lines longer than
/// `max_line_length` characters keep their start followed by `...`.
#[derive(Debug, Clone)]
pub struct SafeOutputBuffer {
    lines: Vec<String>,
    /// Text after the last newline seen by `push_bytes`
    partial: String,
    max_line_count: usize,
    max_line_length: usize,
}

impl SafeOutputBuffer {
    pub const DEFAULT_MAX_LINE_COUNT: usize = 64;
    pub const DEFAULT_MAX_LINE_LENGTH: usize = 256;

    pub fn new(max_line_count: usize, max_line_length: usize) -> Result<Self, PopenError> {
        if max_line_count < 2 {
            return Err(PopenError::Configuration(format!(
                "max_line_count must be at least 2, got {max_line_count}"
            )));
        }
        if max_line_length <= ELLIPSIS.len() {
            return Err(PopenError::Configuration(format!(
                "max_line_length must exceed {}, got {max_line_length}",
                ELLIPSIS.len()
            )));
        }
        Ok(Self {
            lines: Vec::new(),
            partial: String::new(),
            max_line_count,
            max_line_length,
        })
    }

    /// Appends one line. A single trailing newline is ignored.
    pub fn push(&mut self, line: &str) {
        let line = line
            .strip_suffix('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .unwrap_or(line);

        if self.lines.len() >= self.max_line_count {
            self.lines.remove(0);
            if let Some(first) = self.lines.first_mut() {
                *first = ELLIPSIS.to_string();
            }
        }

        let line = if line.chars().count() > self.max_line_length {
            let keep = self.max_line_length - ELLIPSIS.len();
            let mut truncated: String = line.chars().take(keep).collect();
            truncated.push_str(ELLIPSIS);
            truncated
        } else {
            line.to_string()
        };
        self.lines.push(line);
    }

    /// Appends every complete line in `data`. A trailing unterminated line
    /// is held back and joined with the next chunk.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.partial.push_str(&String::from_utf8_lossy(data));
        let Some(end) = self.partial.rfind('\n') else {
            return;
        };
        let rest = self.partial.split_off(end + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        for line in complete.lines() {
            self.push(line);
        }
    }

    /// Appends the held-back unterminated line, if any
    pub fn flush(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.push(&line);
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    /// Kept lines joined by newlines, followed by any unterminated line
    pub fn display_text(&self) -> String {
        let mut buffer = self.clone();
        buffer.flush();
        buffer.lines.join("\n")
    }
}

impl Default for SafeOutputBuffer {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            partial: String::new(),
            max_line_count: Self::DEFAULT_MAX_LINE_COUNT,
            max_line_length: Self::DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl Target for SafeOutputBuffer {
    fn on_stdout(&mut self, data: &[u8]) {
        self.push_bytes(data);
    }

    fn on_stderr(&mut self, data: &[u8]) {
        self.push_bytes(data);
    }

    fn on_exit(&mut self, _status: &ProcessStatus) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_newest_lines_behind_ellipsis() {
        let mut buffer = SafeOutputBuffer::new(4, 80).unwrap();
        for i in 1..=6 {
            buffer.push(&format!("line {i}\n"));
        }
        assert_eq!(buffer.lines(), &["...", "line 4", "line 5", "line 6"]);
    }

    #[test]
    fn test_long_lines_are_truncated() {
        let mut buffer = SafeOutputBuffer::new(4, 10).unwrap();
        buffer.push("abcdefghijklmnop");
        buffer.push("short");
        assert_eq!(buffer.lines(), &["abcdefg...", "short"]);
        assert_eq!(buffer.lines()[0].len(), 10);
    }

    #[test]
    fn test_truncation_counts_characters() {
        let mut buffer = SafeOutputBuffer::new(2, 5).unwrap();
        buffer.push("ééééééé");
        assert_eq!(buffer.display_text(), "éé...");
    }

    #[test]
    fn test_chunks_are_split_into_lines() {
        let mut buffer = SafeOutputBuffer::default();
        buffer.on_stdout(b"one\r\ntwo\n");
        buffer.on_stderr(b"three");
        assert_eq!(buffer.display_text(), "one\ntwo\nthree");
    }

    #[test]
    fn test_line_split_across_chunks_is_joined() {
        let mut buffer = SafeOutputBuffer::default();
        buffer.on_stdout(b"hel");
        buffer.on_stdout(b"lo\nwor");
        assert_eq!(buffer.lines(), &["hello"]);
        buffer.on_stdout(b"ld\n");
        assert_eq!(buffer.lines(), &["hello", "world"]);
    }

    #[test]
    fn test_unterminated_line_is_flushed_on_exit() {
        let mut buffer = SafeOutputBuffer::default();
        buffer.on_stdout(b"done\nno newline");
        assert_eq!(buffer.lines(), &["done"]);
        assert_eq!(buffer.display_text(), "done\nno newline");

        buffer.on_exit(&ProcessStatus::exited(1, 0));
        assert_eq!(buffer.lines(), &["done", "no newline"]);
        assert_eq!(buffer.display_text(), "done\nno newline");
    }

    #[test]
    fn test_default_limits() {
        let mut buffer = SafeOutputBuffer::default();
        assert!(buffer.is_empty());
        for i in 0..100 {
            buffer.push(&"x".repeat(i * 10));
        }
        assert_eq!(buffer.lines().len(), SafeOutputBuffer::DEFAULT_MAX_LINE_COUNT);
        assert_eq!(buffer.lines()[0], "...");
        assert!(
            buffer
                .lines()
                .iter()
                .all(|l| l.len() <= SafeOutputBuffer::DEFAULT_MAX_LINE_LENGTH)
        );
    }

    #[test]
    fn test_invalid_limits_are_rejected() {
        assert!(SafeOutputBuffer::new(1, 80).is_err());
        assert!(SafeOutputBuffer::new(4, 3).is_err());
    }
}
