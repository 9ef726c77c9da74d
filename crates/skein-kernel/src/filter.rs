//! Streaming text filters for chat output.
//!
//! [`OutputFilter`] extracts the text between a `start_str`/`stop_str`
//! marker pair from a stream of chunks, collecting one output per pair (the
//! markers themselves are swallowed). [`InvertedFilter`] does the opposite:
//! it hides the text between its markers and passes everything else.
//!
//! Both are incremental: a marker may arrive split across chunk boundaries,
//! so each filter holds back the longest buffer suffix that could still be
//! the beginning of its next marker.

/// Extracts marker-delimited outputs from streamed text.
pub struct OutputFilter {
    start_str: String,
    stop_str: String,
    enumerate_outputs: bool,
    buffer: String,
    shown: bool,
    outputs: Vec<String>,
}

impl OutputFilter {
    /// With empty markers the filter is transparent: everything is one
    /// output and chunks pass through unchanged.
    pub fn new(start_str: &str, stop_str: &str, enumerate_outputs: bool) -> Self {
        Self {
            start_str: start_str.to_string(),
            stop_str: stop_str.to_string(),
            enumerate_outputs,
            buffer: String::new(),
            shown: false,
            outputs: Vec::new(),
        }
    }

    /// Feed a chunk; returns the text to show (with `N. ` enumeration
    /// headers when enabled).
    pub fn update(&mut self, chunk: &str) -> String {
        if self.start_str.is_empty() || self.stop_str.is_empty() {
            if self.outputs.is_empty() {
                self.outputs.push(String::new());
            }
            self.outputs.last_mut().unwrap().push_str(chunk);
            return chunk.to_string();
        }

        self.buffer.push_str(chunk);
        let next_str = if self.shown {
            self.stop_str.clone()
        } else {
            self.start_str.clone()
        };
        let mut enumeration = String::new();
        if self.buffer.starts_with(&next_str) {
            self.buffer = self.buffer[next_str.len()..].to_string();
            self.shown = !self.shown;
            if self.shown {
                self.outputs.push(String::new());
                if self.enumerate_outputs {
                    if self.outputs.len() > 1 {
                        enumeration.push_str("\n\n");
                    }
                    enumeration.push_str(&format!("{}. ", self.outputs.len()));
                }
            }
        }

        let next_str = if self.shown {
            self.stop_str.clone()
        } else {
            self.start_str.clone()
        };
        let safe = safe_index(&self.buffer, &next_str);
        let delta = if self.shown {
            self.buffer[..safe].to_string()
        } else {
            String::new()
        };
        self.buffer = self.buffer[safe..].to_string();
        if self.shown {
            if let Some(last) = self.outputs.last_mut() {
                last.push_str(&delta);
            }
        }
        format!("{enumeration}{delta}")
    }

    /// The outputs collected so far.
    pub fn outputs(&self) -> Vec<String> {
        self.outputs.clone()
    }

    /// Run a complete text through the filter in one pass.
    pub fn extract(start_str: &str, stop_str: &str, text: &str) -> Vec<String> {
        let mut filter = Self::new(start_str, stop_str, false);
        // Chunk char-by-char so marker handling sees every boundary.
        for ch in text.chars() {
            filter.update(&ch.to_string());
        }
        filter.outputs()
    }
}

/// Hides marker-delimited spans from streamed text.
pub struct InvertedFilter {
    start_str: String,
    stop_str: String,
    buffer: String,
    shown: bool,
}

impl InvertedFilter {
    pub fn new(start_str: &str, stop_str: &str) -> Self {
        Self {
            start_str: start_str.to_string(),
            stop_str: stop_str.to_string(),
            buffer: String::new(),
            shown: true,
        }
    }

    /// Feed a chunk; returns the visible text.
    pub fn update(&mut self, chunk: &str) -> String {
        self.buffer.push_str(chunk);
        let next_str = if self.shown {
            self.start_str.clone()
        } else {
            self.stop_str.clone()
        };

        if !next_str.is_empty() && self.buffer.starts_with(&next_str) {
            self.buffer = self.buffer[next_str.len()..].to_string();
            self.shown = !self.shown;
        }

        let next_str = if self.shown {
            self.start_str.clone()
        } else {
            self.stop_str.clone()
        };
        let safe = safe_index(&self.buffer, &next_str);
        let delta = if self.shown {
            self.buffer[..safe].to_string()
        } else {
            String::new()
        };
        self.buffer = self.buffer[safe..].to_string();
        delta
    }
}

/// The longest prefix of `buffer` that cannot be the start of `next_str`.
///
/// Everything before this index is safe to release; the rest must wait for
/// more chunks in case the marker is arriving split.
fn safe_index(buffer: &str, next_str: &str) -> usize {
    if next_str.is_empty() {
        return buffer.len();
    }
    let mut safe = buffer.len();
    for (i, _) in buffer.char_indices() {
        if next_str.starts_with(&buffer[i..]) {
            safe = i;
            break;
        }
    }
    safe
}
