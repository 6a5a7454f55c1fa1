use chrono::{DateTime, Utc};
use tracing::debug;

use crate::container::Container;

pub(crate) const CACHE_BURSTER_ENV: &str = "CACHE_BURSTER";

/// How often a cache-busted step is allowed to hit the platform cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum CacheBusterLevel {
    None,
    Daily,
    Hour,
    Minute,
    #[default]
    Second,
}

impl From<&str> for CacheBusterLevel {
    /// Unknown levels, including the empty string, bust every second.
    fn from(level: &str) -> Self {
        match level {
            "none" => Self::None,
            "daily" => Self::Daily,
            "hour" => Self::Hour,
            "minute" => Self::Minute,
            _ => Self::Second,
        }
    }
}

pub(crate) trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub(crate) fn cache_buster_key(now: DateTime<Utc>, level: CacheBusterLevel) -> Option<String> {
    let format = match level {
        CacheBusterLevel::None => return None,
        CacheBusterLevel::Daily => "%Y%m%d",
        CacheBusterLevel::Hour => "%Y%m%d%H",
        CacheBusterLevel::Minute => "%Y%m%d%H%M",
        CacheBusterLevel::Second => "%Y%m%d%H%M%S",
    };
    Some(now.format(format).to_string())
}

/// Stamp `ctr` with a time-bucketed key so the steps that follow are
/// re-executed instead of served from cache.
pub(crate) fn with_cache_buster(
    ctr: Container,
    level: CacheBusterLevel,
    clock: &dyn Clock,
) -> Container {
    match cache_buster_key(clock.now(), level) {
        Some(key) => {
            debug!(%key, ?level, "Busting cache");
            ctr.with_env_variable(CACHE_BURSTER_ENV, key)
        }
        None => ctr,
    }
}

#[cfg(test)]
pub(crate) struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
