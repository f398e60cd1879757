//! Incremental UTF-8 decoding for streamed bodies.
//!
//! Network chunks split the byte stream at arbitrary offsets, so a single
//! character may arrive in two or three pieces. The decoder keeps the
//! incomplete tail of each chunk and prepends it to the next one; decoding
//! chunks independently would turn every split character into two
//! replacement characters.
//!
//! Invalid sequences decode to U+FFFD and decoding continues, matching a
//! non-fatal streaming text decoder.

/// Replacement character emitted for invalid or truncated input.
pub const REPLACEMENT: char = '\u{FFFD}';

/// Stateful UTF-8 decoder for one stream.
#[derive(Debug, Default, Clone)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    /// Create a decoder with no buffered bytes.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Number of bytes held back waiting for the rest of a character.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Decode the next chunk, holding back an incomplete trailing character.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    // valid_up_to marks a checked UTF-8 prefix.
                    out.push_str(&String::from_utf8_lossy(valid));
                    if let Some(len) = err.error_len() {
                        out.push(REPLACEMENT);
                        rest = &after[len..];
                    } else {
                        self.pending = after.to_vec();
                        break;
                    }
                }
            }
        }
        out
    }

    /// Flush the decoder at end of stream.
    ///
    /// A character left incomplete by the final chunk becomes one U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            REPLACEMENT.to_string()
        }
    }
}
