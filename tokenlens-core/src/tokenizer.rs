// Copyright 2025 Tokenlens (https://github.com/sochdb/tokenlens)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Token counting.
//!
//! Wraps the cl100k_base byte-pair encoder so every component of a
//! conversation is costed with the same vocabulary the target model
//! family uses.

use tiktoken_rs::cl100k_base;

/// Formatting/role overhead added to every nonzero message count.
pub const DEFAULT_MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// BPE token counter shared by all accounting call sites.
pub struct Tokenizer {
    bpe: tiktoken_rs::CoreBPE,
    message_overhead: usize,
}

impl Tokenizer {
    /// Create a tokenizer with the default per-message overhead.
    pub fn new() -> Self {
        Self::with_message_overhead(DEFAULT_MESSAGE_OVERHEAD_TOKENS)
    }

    /// Create a tokenizer with a custom per-message overhead.
    pub fn with_message_overhead(message_overhead: usize) -> Self {
        // The vocabulary is embedded in the crate; loading it only fails
        // on a corrupted build.
        let bpe = cl100k_base().expect("failed to load cl100k_base vocabulary");
        Self {
            bpe,
            message_overhead,
        }
    }

    /// Count the tokens in a raw text fragment.
    ///
    /// Whitespace-only text is 0 and never reaches the encoder.
    pub fn count(&self, text: &str) -> usize {
        if text.trim().is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Count a chat message: raw tokens plus the per-message overhead.
    ///
    /// Empty messages stay at 0 so they contribute nothing downstream.
    pub fn count_message(&self, text: &str) -> usize {
        let raw = self.count(text);
        if raw == 0 {
            0
        } else {
            raw + self.message_overhead
        }
    }

    /// The configured per-message overhead.
    pub fn message_overhead(&self) -> usize {
        self.message_overhead
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_is_zero() {
        let tok = Tokenizer::new();
        assert_eq!(tok.count(""), 0);
        assert_eq!(tok.count("   \n\t  "), 0);
        assert_eq!(tok.count_message(""), 0);
    }

    #[test]
    fn test_count_is_positive_for_text() {
        let tok = Tokenizer::new();
        assert!(tok.count("Hello, world") > 0);
    }

    #[test]
    fn test_message_overhead_applied_once() {
        let tok = Tokenizer::new();
        let raw = tok.count("hi");
        assert_eq!(tok.count_message("hi"), raw + DEFAULT_MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn test_custom_overhead() {
        let tok = Tokenizer::with_message_overhead(7);
        let raw = tok.count("hi");
        assert_eq!(tok.count_message("hi"), raw + 7);
    }

    #[test]
    fn test_deterministic() {
        let tok = Tokenizer::new();
        let text = "The quick brown fox jumps over the lazy dog.";
        assert_eq!(tok.count(text), tok.count(text));
    }

    #[test]
    fn test_short_word_is_one_token() {
        let tok = Tokenizer::new();
        assert_eq!(tok.count("hi"), 1);
        assert_eq!(tok.count_message("hi"), 1 + DEFAULT_MESSAGE_OVERHEAD_TOKENS);
    }
}
