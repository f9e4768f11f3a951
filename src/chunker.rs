//! # Transcript Chunking
//!
//! Splits long transcripts into pieces that fit the delivery size limit of the
//! transport (4000 characters by default) without breaking words apart.
//!
//! ## Splitting Rules:
//! - Cut at the last whitespace at or before `max_len` characters
//! - No whitespace in range: hard cut at exactly `max_len` characters
//! - Every chunk is trimmed; empty input produces no chunks
//!
//! Lengths are counted in `char`s (Unicode scalar values), so a cut never lands
//! inside a multi-byte UTF-8 sequence.

/// Split `text` into ordered chunks of at most `max_len` characters.
///
/// ## Examples:
/// ```
/// use voice_transcriber::chunker::chunk;
///
/// assert_eq!(chunk("hello brave new world", 11), vec!["hello brave", "new world"]);
/// assert!(chunk("   ", 10).is_empty());
/// ```
///
/// No piece can fit in a `max_len` of zero, so that yields no chunks at all.
/// Callers are expected to pass a positive limit; `AppConfig::validate`
/// rejects a zero chunk size at startup.
pub fn chunk(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    if max_len == 0 {
        return chunks;
    }

    while !rest.is_empty() {
        // Byte offset of the first character past the limit. `None` means the
        // remainder already fits.
        let limit = match rest.char_indices().nth(max_len) {
            Some((offset, _)) => offset,
            None => {
                chunks.push(rest.to_string());
                break;
            }
        };

        let cut = if rest[limit..].starts_with(char::is_whitespace) {
            limit
        } else {
            rest[..limit].rfind(char::is_whitespace).unwrap_or(limit)
        };

        chunks.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }

    chunks
}
