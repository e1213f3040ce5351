//! OAI-PMH datestamps
//!
//! OAI-PMH exchanges UTC datestamps in one of two granularities:
//! `YYYY-MM-DD` and `YYYY-MM-DDThh:mm:ssZ`. Everything the harvester
//! writes (request parameters, checkpoint documents) uses the seconds
//! granularity; parsing accepts both, plus full RFC 3339 with an offset.
//! Fractional seconds are truncated on parse, so every parsed datestamp
//! survives a format/parse round trip.

use crate::error::{OaiError, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};

/// Format a timestamp with seconds granularity, e.g. `2020-01-02T00:00:00Z`.
pub fn format(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a datestamp in either OAI granularity.
///
/// Day granularity resolves to midnight UTC.
pub fn parse(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc).trunc_subsecs(0));
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| OaiError::invalid_datestamp(raw))
}

/// Serde adapter for optional datestamps stored as strings.
///
/// Use with `#[serde(default, with = "oai_common::datestamp::option")]`
/// together with `skip_serializing_if = "Option::is_none"`.
pub mod option {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&super::format(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => super::parse(s).map(Some).map_err(serde::de::Error::custom),
        }
    }
}
