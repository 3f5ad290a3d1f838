use std::{borrow::Cow, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const PREFIX: &str = "conv_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidFormatReason {
    Empty,
    BadPercentEncoding,
    MissingPrefix,
    WrongSegmentCount(usize),
    EmptyPhone,
    NonDigitPhone,
}

impl fmt::Display for InvalidFormatReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "identifier is empty"),
            Self::BadPercentEncoding => write!(f, "percent-encoding is not valid utf-8"),
            Self::MissingPrefix => write!(f, "missing `{PREFIX}` prefix"),
            Self::WrongSegmentCount(count) => {
                write!(f, "expected 2 phone segments, found {count}")
            }
            Self::EmptyPhone => write!(f, "phone segment has no digits"),
            Self::NonDigitPhone => write!(f, "phone segment contains non-digit characters"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid conversation id {raw:?}: {reason}")]
pub struct InvalidFormat {
    pub raw: String,
    pub reason: InvalidFormatReason,
}

impl InvalidFormat {
    fn new(raw: &str, reason: InvalidFormatReason) -> Self {
        Self {
            raw: raw.to_string(),
            reason,
        }
    }
}

/// Both phones are stored with their leading `+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId {
    first: String,
    second: String,
}

impl ConversationId {
    pub fn participants(&self) -> (&str, &str) {
        (&self.first, &self.second)
    }

    /// Falls back to the first participant when `own_phone` matches neither.
    pub fn counterpart(&self, own_phone: Option<&str>) -> &str {
        match own_phone.and_then(|own| normalize_phone(own).ok()) {
            Some(own) if own == self.first => &self.second,
            _ => &self.first,
        }
    }

    pub fn involves(&self, phone: &str) -> bool {
        normalize_phone(phone)
            .map(|phone| phone == self.first || phone == self.second)
            .unwrap_or(false)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}_{}", self.first, self.second)
    }
}

impl FromStr for ConversationId {
    type Err = InvalidFormat;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        canonicalize(raw)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = InvalidFormat;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        canonicalize(&value)
    }
}

impl From<ConversationId> for String {
    fn from(value: ConversationId) -> Self {
        value.to_string()
    }
}

pub fn canonicalize(raw: &str) -> Result<ConversationId, InvalidFormat> {
    let decoded = percent_decode(raw)?;
    parse_decoded(raw, &decoded)
}

/// Safe for URL path segments and query values.
pub fn encode_for_transport(id: &ConversationId) -> String {
    urlencoding::encode(&id.to_string()).into_owned()
}

/// Also repairs `+` that form decoding turned into spaces.
pub fn decode_from_transport(raw: &str) -> Result<ConversationId, InvalidFormat> {
    let decoded = percent_decode(raw)?;
    let repaired = decoded.replace(' ', "+");
    parse_decoded(raw, &repaired)
}

pub fn extract_participants(raw: &str) -> Result<(String, String), InvalidFormat> {
    let id = canonicalize(raw)?;
    Ok((id.first, id.second))
}

fn percent_decode(raw: &str) -> Result<Cow<'_, str>, InvalidFormat> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InvalidFormat::new(raw, InvalidFormatReason::Empty));
    }
    if !trimmed.contains('%') {
        return Ok(Cow::Borrowed(trimmed));
    }
    urlencoding::decode(trimmed)
        .map_err(|_| InvalidFormat::new(raw, InvalidFormatReason::BadPercentEncoding))
}

fn parse_decoded(raw: &str, decoded: &str) -> Result<ConversationId, InvalidFormat> {
    let body = decoded
        .trim()
        .strip_prefix(PREFIX)
        .ok_or_else(|| InvalidFormat::new(raw, InvalidFormatReason::MissingPrefix))?;

    let segments: Vec<&str> = body.split('_').collect();
    if segments.len() != 2 {
        return Err(InvalidFormat::new(
            raw,
            InvalidFormatReason::WrongSegmentCount(segments.len()),
        ));
    }

    let first = normalize_phone(segments[0]).map_err(|reason| InvalidFormat::new(raw, reason))?;
    let second = normalize_phone(segments[1]).map_err(|reason| InvalidFormat::new(raw, reason))?;
    Ok(ConversationId { first, second })
}

fn normalize_phone(segment: &str) -> Result<String, InvalidFormatReason> {
    let digits = segment.strip_prefix('+').unwrap_or(segment);
    if digits.is_empty() {
        return Err(InvalidFormatReason::EmptyPhone);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InvalidFormatReason::NonDigitPhone);
    }
    Ok(format!("+{digits}"))
}

#[cfg(test)]
#[path = "tests/conversation_id_tests.rs"]
mod tests;
