use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Plain SQL identifier: a letter or underscore followed by alphanumerics/underscores.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

const TIMESTAMP_LEN: usize = 14;
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Identifier of a migration: `YYYYMMDDHHMMSS_Descriptive_Name`.
///
/// The fixed-width timestamp prefix makes lexicographic order identical to
/// chronological order, so ids are compared as plain strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationId(String);

impl MigrationId {
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.len() <= TIMESTAMP_LEN + 1 || !s.is_char_boundary(TIMESTAMP_LEN) {
            return Err(Error::Config(format!(
                "migration id `{s}` must look like YYYYMMDDHHMMSS_Name"
            )));
        }

        let (stamp, rest) = s.split_at(TIMESTAMP_LEN);
        if !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Config(format!(
                "migration id `{s}` must start with a 14-digit timestamp"
            )));
        }
        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).map_err(|e| {
            Error::Config(format!("migration id `{s}` has an invalid timestamp: {e}"))
        })?;

        let Some(name) = rest.strip_prefix('_') else {
            return Err(Error::Config(format!(
                "migration id `{s}` must separate timestamp and name with `_`"
            )));
        };
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::Config(format!(
                "migration id `{s}` has an invalid name part"
            )));
        }

        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The descriptive part after the timestamp.
    pub fn suffix(&self) -> &str {
        &self.0[TIMESTAMP_LEN + 1..]
    }

    /// The moment encoded in the id prefix, interpreted as UTC.
    pub fn timestamp(&self) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(&self.0[..TIMESTAMP_LEN], TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MigrationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MigrationId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<MigrationId> for String {
    fn from(id: MigrationId) -> Self {
        id.0
    }
}

impl AsRef<str> for MigrationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
