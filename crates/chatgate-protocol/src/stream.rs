//! Incremental decoder for the upstream's streamed response framing: a
//! single JSON array of objects, `[ obj , obj , obj ]`, whose chunk
//! boundaries fall anywhere, including mid-string.

/// State machine over the byte stream. Feed chunks with `push`, collect
/// complete objects as raw JSON strings. The caller parses and dispatches
/// each object; an object that fails to parse must not abort the stream.
#[derive(Debug, Default)]
pub struct JsonArrayStream {
    current: String,
    depth: usize,
    in_string: bool,
    escape: bool,
    seen_array: bool,
    finished: bool,
}

impl JsonArrayStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the top-level `]` has been consumed. Later input is
    /// ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True once the opening `[` has been seen.
    pub fn has_started(&self) -> bool {
        self.seen_array
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for ch in text.chars() {
            if self.finished {
                break;
            }

            if !self.seen_array {
                if ch == '[' {
                    self.seen_array = true;
                }
                continue;
            }

            if self.depth == 0 {
                // Between objects: commas, CR/LF and spaces are separators.
                match ch {
                    ',' | '\r' | '\n' | ' ' | '\t' => continue,
                    '{' => {
                        self.depth = 1;
                        self.current.push(ch);
                    }
                    ']' => self.finished = true,
                    _ => continue,
                }
                continue;
            }

            self.current.push(ch);
            if self.in_string {
                if self.escape {
                    // The escaped byte is copied unconditionally.
                    self.escape = false;
                } else if ch == '\\' {
                    self.escape = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match ch {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        out.push(std::mem::take(&mut self.current));
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Flush a trailing object left open by a truncated stream.
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if self.depth == 0 && !self.current.trim().is_empty() {
            out.push(std::mem::take(&mut self.current));
        }
        out
    }
}
