use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use std::fmt;

/// Fingerprint of a ranged request for one subject (usually a device).
///
/// Timestamps are truncated to whole seconds, so two keys built from instants
/// inside the same second compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    subject_id: i64,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
}

impl CacheKey {
    #[must_use]
    pub fn new(subject_id: i64, range_start: DateTime<Utc>, range_end: DateTime<Utc>) -> Self {
        Self {
            subject_id,
            range_start: range_start.trunc_subsecs(0),
            range_end: range_end.trunc_subsecs(0),
        }
    }

    #[must_use]
    pub const fn subject_id(&self) -> i64 {
        self.subject_id
    }

    #[must_use]
    pub const fn range_start(&self) -> DateTime<Utc> {
        self.range_start
    }

    #[must_use]
    pub const fn range_end(&self) -> DateTime<Utc> {
        self.range_end
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.subject_id,
            self.range_start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.range_end.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}
