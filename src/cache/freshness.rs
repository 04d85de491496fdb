//! Freshness policy: server retention and client-facing cache directives.

use std::fmt;
use std::time::Duration;

use time::{OffsetDateTime, PrimitiveDateTime};

/// Configured lifetimes for one cached resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreshnessSpec {
    /// How long the server keeps the response.
    pub server_retention: Duration,
    /// `max-age` sent to clients.
    pub client_max_age: Duration,
    /// `s-maxage` sent to shared caches.
    pub shared_max_age: Option<Duration>,
    pub must_revalidate: bool,
    pub no_cache: bool,
}

impl FreshnessSpec {
    pub fn new(server_retention: Duration, client_max_age: Duration) -> Self {
        Self {
            server_retention,
            client_max_age,
            ..Default::default()
        }
    }

    /// Convenience constructor taking whole seconds.
    pub fn from_secs(server_secs: u64, client_secs: u64) -> Self {
        Self::new(
            Duration::from_secs(server_secs),
            Duration::from_secs(client_secs),
        )
    }

    pub fn with_shared_max_age(mut self, shared_max_age: Duration) -> Self {
        self.shared_max_age = Some(shared_max_age);
        self
    }

    pub fn with_must_revalidate(mut self, must_revalidate: bool) -> Self {
        self.must_revalidate = must_revalidate;
        self
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    /// Resolve this spec against `now`.
    pub fn evaluate(&self, now: OffsetDateTime) -> Freshness {
        let absolute_expiration = time::Duration::try_from(self.server_retention)
            .ok()
            .and_then(|retention| now.checked_add(retention))
            .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc());

        let directive = if !self.client_max_age.is_zero() || self.must_revalidate {
            CacheDirective::Revalidate {
                max_age: self.client_max_age,
                shared_max_age: self.shared_max_age,
                must_revalidate: self.must_revalidate,
            }
        } else if self.no_cache {
            CacheDirective::NoCache
        } else {
            CacheDirective::Omit
        };

        Freshness {
            absolute_expiration,
            client_max_age: self.client_max_age,
            shared_max_age: self.shared_max_age,
            must_revalidate: self.must_revalidate,
            no_cache: self.no_cache,
            directive,
        }
    }
}

/// A [`FreshnessSpec`] evaluated at a specific instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Freshness {
    pub absolute_expiration: OffsetDateTime,
    pub client_max_age: Duration,
    pub shared_max_age: Option<Duration>,
    pub must_revalidate: bool,
    pub no_cache: bool,
    pub directive: CacheDirective,
}

/// Client-facing caching instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDirective {
    /// Cacheable with a max-age; clients may revalidate.
    Revalidate {
        max_age: Duration,
        shared_max_age: Option<Duration>,
        must_revalidate: bool,
    },
    /// Clients must not reuse the response without revalidation.
    NoCache,
    /// No caching header is emitted.
    Omit,
}

impl CacheDirective {
    /// `Cache-Control` header value, if any.
    pub fn cache_control(&self) -> Option<String> {
        match self {
            Self::Omit => None,
            _ => Some(self.to_string()),
        }
    }

    /// `Pragma` header value, if any.
    pub fn pragma(&self) -> Option<&'static str> {
        matches!(self, Self::NoCache).then_some("no-cache")
    }
}

impl fmt::Display for CacheDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Revalidate {
                max_age,
                shared_max_age,
                must_revalidate,
            } => {
                write!(f, "max-age={}", max_age.as_secs())?;
                if let Some(shared) = shared_max_age {
                    write!(f, ", s-maxage={}", shared.as_secs())?;
                }
                if *must_revalidate {
                    f.write_str(", must-revalidate")?;
                }
                Ok(())
            }
            Self::NoCache => f.write_str("no-cache"),
            Self::Omit => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    #[test]
    fn expiration_is_now_plus_server_retention() {
        let freshness = FreshnessSpec::from_secs(600, 60).evaluate(NOW);
        assert_eq!(freshness.absolute_expiration, datetime!(2024-05-01 12:10 UTC));
    }

    #[test]
    fn zero_retention_expires_immediately() {
        let freshness = FreshnessSpec::from_secs(0, 0).evaluate(NOW);
        assert_eq!(freshness.absolute_expiration, NOW);
    }

    #[test]
    fn oversized_retention_saturates() {
        let spec = FreshnessSpec::new(Duration::MAX, Duration::ZERO);
        let freshness = spec.evaluate(NOW);
        assert!(freshness.absolute_expiration > NOW);
    }

    #[test]
    fn client_max_age_emits_revalidate_directive() {
        let spec = FreshnessSpec::from_secs(600, 60).with_shared_max_age(Duration::from_secs(30));
        let directive = spec.evaluate(NOW).directive;

        insta::assert_snapshot!(directive.cache_control().unwrap(), @"max-age=60, s-maxage=30");
        assert_eq!(directive.pragma(), None);
    }

    #[test]
    fn must_revalidate_without_max_age() {
        let spec = FreshnessSpec::from_secs(600, 0).with_must_revalidate(true);
        let directive = spec.evaluate(NOW).directive;

        insta::assert_snapshot!(directive.cache_control().unwrap(), @"max-age=0, must-revalidate");
    }

    #[test]
    fn no_cache_when_no_client_lifetime() {
        let spec = FreshnessSpec::from_secs(600, 0).with_no_cache(true);
        let directive = spec.evaluate(NOW).directive;

        assert_eq!(directive, CacheDirective::NoCache);
        assert_eq!(directive.cache_control().as_deref(), Some("no-cache"));
        assert_eq!(directive.pragma(), Some("no-cache"));
    }

    #[test]
    fn max_age_takes_precedence_over_no_cache() {
        let spec = FreshnessSpec::from_secs(600, 60).with_no_cache(true);
        assert!(matches!(
            spec.evaluate(NOW).directive,
            CacheDirective::Revalidate { .. }
        ));
    }

    #[test]
    fn nothing_configured_omits_directive() {
        let directive = FreshnessSpec::from_secs(600, 0).evaluate(NOW).directive;
        assert_eq!(directive, CacheDirective::Omit);
        assert_eq!(directive.cache_control(), None);
    }

    #[test]
    fn evaluation_is_repeatable() {
        let spec = FreshnessSpec::from_secs(600, 60);
        let later = datetime!(2024-05-01 12:05 UTC);
        assert_eq!(spec.evaluate(NOW), spec.evaluate(NOW));
        assert_eq!(
            spec.evaluate(later).absolute_expiration,
            datetime!(2024-05-01 12:15 UTC)
        );
    }
}
