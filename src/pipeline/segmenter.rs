//! # Sentence Segmentation
//!
//! LLM output arrives as small deltas; speech synthesis wants whole sentences.
//! [`SentenceSegmenter`] buffers deltas and cuts a sentence every time a
//! terminator character arrives.
//!
//! ## Chunking independence:
//! The buffer is scanned character by character, so the emitted sentences
//! depend only on the concatenated text and never on how it was split into
//! deltas.

/// Characters that end a sentence: CJK full-width 。？！, ASCII . ? ! and newline.
pub const SENTENCE_TERMINATORS: [char; 7] = ['。', '？', '！', '.', '?', '!', '\n'];

/// Shortest text, in characters, that counts as a sentence.
pub const MIN_SENTENCE_CHARS: usize = 2;

pub fn is_terminator(c: char) -> bool {
    SENTENCE_TERMINATORS.contains(&c)
}

/// A sentence is complete when it has at least two characters and its last
/// character is a terminator.
pub fn is_sentence_complete(text: &str) -> bool {
    text.chars().count() >= MIN_SENTENCE_CHARS && text.chars().last().is_some_and(is_terminator)
}

#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return every sentence it completed, in order.
    ///
    /// A terminator that would leave a fragment shorter than two characters
    /// (a lone "." or "!") stays buffered and joins the next sentence.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        for c in delta.chars() {
            self.buffer.push(c);
            if is_terminator(c) && is_sentence_complete(&self.buffer) {
                let sentence = std::mem::take(&mut self.buffer);
                if !sentence.trim().is_empty() {
                    sentences.push(sentence);
                }
            }
        }
        sentences
    }

    /// Flush whatever is left at the end of the stream.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}
