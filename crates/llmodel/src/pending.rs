//! Implements [`PendingResponse`], the accumulation buffer of an in-flight generation.

use std::mem;

/// Accumulates the byte pieces of generated tokens into text.
///
/// Tokens do not necessarily end on a character boundary: a multi-byte UTF-8 sequence may be
/// split across two or more pieces. The trailing incomplete sequence is held back until a later
/// piece completes it, so [`PendingResponse::text`] never ends in a truncated character.
/// Bytes that can never form valid UTF-8 are replaced with [`char::REPLACEMENT_CHARACTER`].
#[derive(Debug, Default, Clone)]
pub struct PendingResponse {
    text: String,
    partial: Vec<u8>,
    prev_len: usize,
}

impl PendingResponse {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the bytes of one token, returning the text that became decodable.
    ///
    /// The returned delta is empty if `piece` only extended a held-back sequence.
    pub fn push(&mut self, piece: &[u8]) -> &str {
        self.prev_len = self.text.len();

        let mut bytes = mem::take(&mut self.partial);
        bytes.extend_from_slice(piece);
        let mut rest = bytes.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    self.text.push_str(s);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    self.text.push_str(unsafe {
                        // SAFETY: `valid_up_to` is the length of the valid UTF-8 prefix.
                        std::str::from_utf8_unchecked(valid)
                    });

                    if let Some(len) = err.error_len() {
                        self.text.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    } else {
                        self.partial.extend_from_slice(after);
                        break;
                    }
                }
            }
        }

        self.delta()
    }

    /// The text decoded so far, excluding any held-back bytes.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The text added by the most recent [`PendingResponse::push`] or
    /// [`PendingResponse::finish`].
    pub fn delta(&self) -> &str {
        &self.text[self.prev_len..]
    }

    /// Returns `true` if an incomplete multi-byte sequence is being held back.
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    /// Flushes held-back bytes, replacing them with [`char::REPLACEMENT_CHARACTER`], and
    /// returns the text this added.
    pub fn finish(&mut self) -> &str {
        self.prev_len = self.text.len();

        if !self.partial.is_empty() {
            let partial = mem::take(&mut self.partial);
            self.text.push_str(&String::from_utf8_lossy(&partial));
        }

        self.delta()
    }

    /// Flushes held-back bytes and returns the full text.
    pub fn into_string(mut self) -> String {
        self.finish();
        self.text
    }
}
