//! Core data structures for the aggregation pipeline
//!
//! The canonical [`Event`] record is what provider adapters produce, cache
//! files persist, and the feed builder consumes. All instants are UTC; the
//! cache format tolerates `Z` suffixes and compact `+HHMM` offsets on read.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::ParseError;

/// Provider tags as they appear in the `source` field.
pub const SOURCE_WIENER_LINIEN: &str = "Wiener Linien";
pub const SOURCE_OEBB: &str = "ÖBB";
pub const SOURCE_VOR: &str = "VOR/VAO";

/// Canonical message record.
///
/// Invariants: `pub_date` is always present and UTC; when both ends of the
/// interval are present, `ends_at >= starts_at`; `title` and `description`
/// carry no raw HTML tags, control characters (beyond `\n`/`\t`) or ANSI
/// sequences; `description` has at most two logical lines (summary, time
/// phrase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub source: String,
    pub category: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub link: String,
    pub guid: String,
    #[serde(
        rename = "pubDate",
        serialize_with = "serialize_instant",
        deserialize_with = "deserialize_instant"
    )]
    pub pub_date: DateTime<Utc>,
    #[serde(
        default,
        serialize_with = "serialize_opt_instant",
        deserialize_with = "deserialize_opt_instant"
    )]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        serialize_with = "serialize_opt_instant",
        deserialize_with = "deserialize_opt_instant"
    )]
    pub ends_at: Option<DateTime<Utc>>,
    /// Provider-supplied dedup key, opaque. Preferred over `guid` when
    /// deriving the event identity.
    #[serde(rename = "_identity", default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl Event {
    /// Stable identity used for dedup and first-seen tracking: `_identity`
    /// when the provider supplied one, else the guid, else a content hash.
    pub fn identity(&self) -> String {
        if let Some(id) = &self.identity {
            if !id.is_empty() {
                return id.clone();
            }
        }
        if !self.guid.is_empty() {
            return self.guid.clone();
        }
        content_key(&self.source, &self.title, &self.description)
    }

    /// Rank of the source for dedup tie-breaking: the regional authority
    /// wins over the national railway, which wins over the municipal feed.
    pub fn source_precedence(&self) -> u8 {
        if self.source.starts_with("VOR") {
            3
        } else if self.source.contains("ÖBB") || self.source.contains("OEBB") {
            2
        } else if self.source.contains("Wiener Linien") {
            1
        } else {
            0
        }
    }
}

/// Hash fallback key over `source|title|description`.
pub fn content_key(source: &str, title: &str, description: &str) -> String {
    make_guid(&[source, title, description])
}

/// Stable SHA-256 GUID over the given parts.
///
/// Pipes and backslashes are escaped so that part boundaries cannot collide.
pub fn make_guid(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.replace('\\', "\\\\").replace('|', "\\|"))
        .collect::<Vec<_>>()
        .join("|");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Instant parsing
// ============================================================================

/// Parse an ISO-8601 instant, tolerating `Z`, `+HH:MM` and compact `+HHMM`
/// offsets as well as missing offsets (assumed UTC).
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    let candidate = raw.trim();
    if candidate.is_empty() {
        return Err(ParseError::Timestamp(raw.to_string()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(candidate) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Compact offset: 2025-06-01T07:00:00+0200
    if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(candidate, "%Y-%m-%dT%H:%M:%S%z") {
        return Ok(dt.with_timezone(&Utc));
    }
    // No offset: assume UTC
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(candidate, "%Y-%m-%dT%H:%M:%S") {
        return Ok(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    Err(ParseError::Timestamp(raw.to_string()))
}

fn serialize_instant<S: Serializer>(dt: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_str(&dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

fn deserialize_instant<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(de)?;
    parse_instant(&raw).map_err(serde::de::Error::custom)
}

fn serialize_opt_instant<S: Serializer>(
    dt: &Option<DateTime<Utc>>,
    ser: S,
) -> Result<S::Ok, S::Error> {
    match dt {
        Some(dt) => serialize_instant(dt, ser),
        None => ser.serialize_none(),
    }
}

fn deserialize_opt_instant<'de, D: Deserializer<'de>>(
    de: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let raw: Option<String> = Option::deserialize(de)?;
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_instant(&s).map(Some).map_err(serde::de::Error::custom),
    }
}
