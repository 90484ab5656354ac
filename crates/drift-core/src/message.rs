//! Application messages exchanged inside a secure stream.
//!
//! Every message is one line of text terminated by `\n`, with fields
//! separated by `|`:
//!
//!   OFFER|<filename>|<mime>|<size>
//!   BATCH_OFFER|<count>|<filename>|<mime>|<size>|...
//!   ANSWER|ACCEPT
//!   ANSWER|DECLINE
//!
//! Filenames are checked on both encode and decode: a name that could break
//! the framing or escape the download directory never reaches the wire and
//! is never accepted from it.

use std::fmt;
use std::path::Path;

use thiserror::Error;

pub const SEPARATOR: char = '|';
pub const END_OF_MESSAGE: u8 = b'\n';

/// MIME type sent with every offer. Receivers do not interpret it.
pub const DEFAULT_MIME: &str = "application/octet-stream";

const KIND_OFFER: &str = "OFFER";
const KIND_BATCH_OFFER: &str = "BATCH_OFFER";
const KIND_ANSWER: &str = "ANSWER";
const ACCEPT: &str = "ACCEPT";
const DECLINE: &str = "DECLINE";

// ── Types ─────────────────────────────────────────────────────────────────────

/// A single file offered by the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub filename: String,
    pub mime: String,
    pub size: u64,
}

impl Offer {
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        Self {
            filename: filename.into(),
            mime: DEFAULT_MIME.to_string(),
            size,
        }
    }
}

/// The receiver's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Accept,
    Decline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Offer(Offer),
    /// Never empty.
    BatchOffer(Vec<Offer>),
    Answer(Answer),
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Answer::Accept => ACCEPT,
            Answer::Decline => DECLINE,
        })
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

impl Message {
    /// Serialize to a single `\n`-terminated line.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let mut line = String::new();
        match self {
            Message::Offer(offer) => {
                line.push_str(KIND_OFFER);
                push_offer(&mut line, offer)?;
            }
            Message::BatchOffer(files) => {
                if files.is_empty() {
                    return Err(MessageError::EmptyBatch);
                }
                line.push_str(KIND_BATCH_OFFER);
                line.push(SEPARATOR);
                line.push_str(&files.len().to_string());
                for offer in files {
                    push_offer(&mut line, offer)?;
                }
            }
            Message::Answer(answer) => {
                line.push_str(KIND_ANSWER);
                line.push(SEPARATOR);
                line.push_str(&answer.to_string());
            }
        }
        let mut bytes = line.into_bytes();
        bytes.push(END_OF_MESSAGE);
        Ok(bytes)
    }

    /// Parse one line. A single trailing `\n` is accepted and ignored.
    pub fn decode(line: &[u8]) -> Result<Self, MessageError> {
        let line = line.strip_suffix(&[END_OF_MESSAGE]).unwrap_or(line);
        let text = std::str::from_utf8(line).map_err(|_| MessageError::NotUtf8)?;
        let fields: Vec<&str> = text.split(SEPARATOR).collect();

        match fields[0] {
            KIND_OFFER => {
                if fields.len() != 4 {
                    return Err(MessageError::FieldCount {
                        kind: KIND_OFFER,
                        expected: 4,
                        got: fields.len(),
                    });
                }
                Ok(Message::Offer(parse_offer(&fields[1..4])?))
            }
            KIND_BATCH_OFFER => {
                if fields.len() < 2 {
                    return Err(MessageError::FieldCount {
                        kind: KIND_BATCH_OFFER,
                        expected: 2,
                        got: fields.len(),
                    });
                }
                let count: usize = fields[1]
                    .parse()
                    .map_err(|_| MessageError::InvalidCount(fields[1].to_string()))?;
                if count == 0 {
                    return Err(MessageError::EmptyBatch);
                }
                let expected = count
                    .checked_mul(3)
                    .and_then(|n| n.checked_add(2))
                    .ok_or_else(|| MessageError::InvalidCount(fields[1].to_string()))?;
                if fields.len() != expected {
                    return Err(MessageError::FieldCount {
                        kind: KIND_BATCH_OFFER,
                        expected,
                        got: fields.len(),
                    });
                }
                let files = fields[2..]
                    .chunks_exact(3)
                    .map(parse_offer)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Message::BatchOffer(files))
            }
            KIND_ANSWER => {
                if fields.len() != 2 {
                    return Err(MessageError::FieldCount {
                        kind: KIND_ANSWER,
                        expected: 2,
                        got: fields.len(),
                    });
                }
                match fields[1] {
                    ACCEPT => Ok(Message::Answer(Answer::Accept)),
                    DECLINE => Ok(Message::Answer(Answer::Decline)),
                    other => Err(MessageError::UnknownAnswer(other.to_string())),
                }
            }
            other => Err(MessageError::UnknownKind(other.to_string())),
        }
    }
}

fn push_offer(line: &mut String, offer: &Offer) -> Result<(), MessageError> {
    validate_filename(&offer.filename)?;
    validate_field(&offer.mime)?;
    line.push(SEPARATOR);
    line.push_str(&offer.filename);
    line.push(SEPARATOR);
    line.push_str(&offer.mime);
    line.push(SEPARATOR);
    line.push_str(&offer.size.to_string());
    Ok(())
}

fn parse_offer(fields: &[&str]) -> Result<Offer, MessageError> {
    let filename = fields[0];
    validate_filename(filename)?;
    // Sizes are signed 64-bit on the wire.
    let size: i64 = fields[2]
        .parse()
        .map_err(|_| MessageError::InvalidSize(fields[2].to_string()))?;
    if size < 0 {
        return Err(MessageError::InvalidSize(fields[2].to_string()));
    }
    Ok(Offer {
        filename: filename.to_string(),
        mime: fields[1].to_string(),
        size: size as u64,
    })
}

// ── Filename hygiene ──────────────────────────────────────────────────────────

/// Reject names that are empty, contain a delimiter, or are not a bare
/// final path component.
pub fn validate_filename(name: &str) -> Result<(), MessageError> {
    if name.is_empty() {
        return Err(MessageError::InvalidFilename(name.to_string()));
    }
    if name.contains(['|', '\n', '\0', '/', '\\']) {
        return Err(MessageError::InvalidFilename(name.to_string()));
    }
    if Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name) {
        return Err(MessageError::InvalidFilename(name.to_string()));
    }
    Ok(())
}

fn validate_field(value: &str) -> Result<(), MessageError> {
    if value.contains(['|', '\n']) {
        return Err(MessageError::InvalidField(value.to_string()));
    }
    Ok(())
}

// ── Sizes ─────────────────────────────────────────────────────────────────────

/// Render a byte count for prompts: `12 Bytes`, `1.50 KiB`, `3.00 GiB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} Bytes");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown message kind: {0:?}")]
    UnknownKind(String),
    #[error("{kind}: expected {expected} fields, got {got}")]
    FieldCount {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),
    #[error("field contains a delimiter: {0:?}")]
    InvalidField(String),
    #[error("invalid size: {0:?}")]
    InvalidSize(String),
    #[error("invalid batch count: {0:?}")]
    InvalidCount(String),
    #[error("batch offer must contain at least one file")]
    EmptyBatch,
    #[error("unknown answer: {0:?}")]
    UnknownAnswer(String),
    #[error("message is not valid UTF-8")]
    NotUtf8,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
