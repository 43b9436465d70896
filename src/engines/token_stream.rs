//! Incremental detokenization

use eyre::Result;
use tokenizers::Tokenizer;

/// Marker some moondream checkpoints emit instead of the EOS token.
pub const END_MARKER: &str = "<END>";

/// Turns a stream of token ids into text fragments.
///
/// Decoding tokens one at a time breaks multi-byte characters and merges, so
/// text is only released once the decoded suffix ends on an alphanumeric
/// character.
pub struct TokenOutputStream {
    tokenizer: Tokenizer,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl TokenOutputStream {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| eyre::eyre!("Decoding failed: {}", e))
    }

    pub fn next_token(&mut self, token: u32) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;

        let ends_on_word = text.chars().last().is_some_and(char::is_alphanumeric);
        if text.len() > prev_text.len() && ends_on_word {
            let fresh = text.get(prev_text.len()..).unwrap_or_default().to_string();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(fresh))
        } else {
            Ok(None)
        }
    }

    /// Flush whatever is still buffered once generation stops.
    pub fn decode_rest(&self) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() {
            Ok(text.get(prev_text.len()..).map(str::to_string))
        } else {
            Ok(None)
        }
    }
}

/// Shapes decoded fragments into the answer text: leading whitespace is
/// dropped and everything from [`END_MARKER`] on is cut, even when the marker
/// is split across fragments.
#[derive(Debug, Default)]
pub struct AnswerFilter {
    pending: String,
    started: bool,
    finished: bool,
}

impl AnswerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one fragment. Returns the text that is safe to emit now.
    pub fn push(&mut self, text: &str) -> Option<String> {
        if self.finished {
            return None;
        }

        let text = if self.started {
            text
        } else {
            let trimmed = text.trim_start();
            if trimmed.is_empty() {
                return None;
            }
            self.started = true;
            trimmed
        };
        self.pending.push_str(text);

        if let Some(pos) = self.pending.find(END_MARKER) {
            self.finished = true;
            self.pending.truncate(pos);
            return non_empty(std::mem::take(&mut self.pending));
        }

        // Hold back a suffix that could be the start of the marker.
        let held = (1..END_MARKER.len())
            .rev()
            .find(|&n| self.pending.ends_with(&END_MARKER[..n]))
            .unwrap_or(0);
        let ready = self.pending.len() - held;
        let rest = self.pending.split_off(ready);
        let out = std::mem::replace(&mut self.pending, rest);
        non_empty(out)
    }

    /// Release the held-back suffix at the end of generation.
    pub fn finish(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        self.finished = true;
        non_empty(std::mem::take(&mut self.pending))
    }
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(fragments: &[&str]) -> Vec<String> {
        let mut filter = AnswerFilter::new();
        let mut out: Vec<String> = fragments.iter().filter_map(|f| filter.push(f)).collect();
        out.extend(filter.finish());
        out
    }

    #[test]
    fn passes_plain_text_through() {
        assert_eq!(run(&["A", " cat", " sits."]), vec!["A", " cat", " sits."]);
    }

    #[test]
    fn strips_leading_whitespace() {
        assert_eq!(run(&[" ", "\n A", " dog"]), vec!["A", " dog"]);
    }

    #[test]
    fn cuts_at_marker_inside_fragment() {
        assert_eq!(run(&["A cat.<END>ignored"]), vec!["A cat."]);
    }

    #[test]
    fn cuts_at_marker_split_across_fragments() {
        let out = run(&["A cat.", "<E", "ND", "> tail"]);
        assert_eq!(out.concat(), "A cat.");
    }

    #[test]
    fn releases_false_marker_prefix() {
        let out = run(&["x <", "b>"]);
        assert_eq!(out.concat(), "x <b>");
    }

    #[test]
    fn nothing_after_finish() {
        let mut filter = AnswerFilter::new();
        assert_eq!(filter.push("done<END>").as_deref(), Some("done"));
        assert!(filter.is_finished());
        assert_eq!(filter.push("more"), None);
        assert_eq!(filter.finish(), None);
    }
}
