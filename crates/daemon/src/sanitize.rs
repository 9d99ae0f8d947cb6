//! Terminal output sanitization.
//!
//! The agent runs on a pseudo-terminal, so its output is full of cursor
//! movement, colour, keypad mode and window-title sequences. Observers only
//! want the text, so every chunk is passed through
//! [`strip_control_sequences`] before it is broadcast. What survives is
//! printable text plus `\n`, `\r` and `\t`.
//!
//! PTY reads return arbitrary byte boundaries: a multi-byte UTF-8 character
//! or an escape sequence can be split across two reads. [`OutputDecoder`]
//! carries those partial tails over to the next chunk.

use std::sync::LazyLock;

use regex::Regex;

/// Matches a single escape sequence or a stray control byte.
///
/// Alternatives are tried in order, so the string sequences come before the
/// two-byte form that would otherwise swallow their introducer:
/// - OSC, DCS, SOS, PM and APC strings terminated by BEL or `ESC \`
/// - CSI sequences (`ESC [ params intermediates final`)
/// - nF sequences (`ESC ( B` and friends)
/// - two-byte Fp/Fe/Fs sequences (`ESC =`, `ESC >`, `ESC M`, `ESC 7`, ...)
/// - any other C0 control byte except `\t`, `\n` and `\r`, plus DEL
static ESCAPE_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1B(?:",
        r"[\]PX^_][^\x07\x1B]*(?:\x07|\x1B\\)",
        r"|\[[0-?]*[ -/]*[@-~]",
        r"|[ -/]+[0-~]",
        r"|[0-~]",
        r")",
        r"|[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]",
    ))
    .expect("Invalid escape sequence regex")
});

/// Longest partial escape sequence held back between chunks.
const MAX_PENDING_SEQUENCE: usize = 256;

/// Removes terminal control sequences and stray control bytes from `input`.
///
/// Plain text, tabs, newlines and carriage returns are left untouched.
pub fn strip_control_sequences(input: &str) -> String {
    if !input.bytes().any(is_stripped_byte) {
        return input.to_string();
    }
    ESCAPE_SEQUENCE.replace_all(input, "").into_owned()
}

fn is_stripped_byte(b: u8) -> bool {
    (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r')) || b == 0x7F
}

/// Incremental decoder from raw PTY bytes to sanitized text.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the sanitized text that is complete so far.
    ///
    /// A trailing incomplete UTF-8 character or escape sequence is kept for
    /// the next call. Invalid UTF-8 in the middle of a chunk is replaced
    /// with U+FFFD.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.pending);

        let (mut text, tail) = decode_utf8_prefix(&bytes);
        self.pending.extend_from_slice(tail);

        if let Some(start) = incomplete_sequence_start(&text) {
            if text.len() - start <= MAX_PENDING_SEQUENCE {
                let held = text.split_off(start);
                let mut pending = held.into_bytes();
                pending.extend_from_slice(&self.pending);
                self.pending = pending;
            }
        }

        strip_control_sequences(&text)
    }

    /// Flushes whatever is still pending, lossily. An escape sequence that
    /// was never terminated is dropped.
    pub fn finish(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if let Some(start) = incomplete_sequence_start(&text) {
            text.truncate(start);
        }
        strip_control_sequences(&text)
    }

    /// Returns whether bytes are being held back.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Decodes as much of `bytes` as possible, returning the text and the
/// trailing bytes of an incomplete character.
fn decode_utf8_prefix(bytes: &[u8]) -> (String, &[u8]) {
    let mut text = String::with_capacity(bytes.len());
    let mut rest = bytes;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                return (text, &[]);
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));
                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &rest[valid_up_to + len..];
                    }
                    None => return (text, &rest[valid_up_to..]),
                }
            }
        }
    }
}

/// Returns the byte offset of the first escape sequence in `text` that
/// has not been terminated yet.
fn incomplete_sequence_start(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != 0x1B {
            i += 1;
            continue;
        }
        match sequence_len(&bytes[i..]) {
            Some(len) => i += len,
            None => return Some(i),
        }
    }
    None
}

/// Length of the escape sequence at the start of `bytes`, or `None` when it
/// is cut off. Mirrors the alternatives of [`ESCAPE_SEQUENCE`].
fn sequence_len(bytes: &[u8]) -> Option<usize> {
    match *bytes.get(1)? {
        b']' | b'P' | b'X' | b'^' | b'_' => {
            let body = &bytes[2..];
            let end = body.iter().position(|&b| b == 0x07 || b == 0x1B)?;
            if body[end] == 0x07 {
                Some(2 + end + 1)
            } else {
                body.get(end + 1)?;
                Some(2 + end + 2)
            }
        }
        b'[' => {
            let end = bytes[2..].iter().position(|b| !(0x20..=0x3F).contains(b))?;
            Some(2 + end + 1)
        }
        0x20..=0x2F => {
            let end = bytes[2..].iter().position(|b| !(0x20..=0x2F).contains(b))?;
            Some(2 + end + 1)
        }
        _ => Some(2),
    }
}
