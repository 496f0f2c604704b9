use std::num::NonZeroU32;
use std::time::Duration;

use thiserror::Error;

/// How a tier derives the subject it counts requests against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubjectSource {
    /// The caller's network address.
    #[default]
    Address,
    /// The authenticated caller id, falling back to the address for anonymous
    /// callers.
    Identity,
}

impl SubjectSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectSource::Address => "address",
            SubjectSource::Identity => "identity",
        }
    }

    /// Resolve the subject key for one request.
    pub fn subject(self, address: &str, identity: Option<&str>) -> String {
        match (self, identity) {
            (SubjectSource::Identity, Some(identity)) => format!("user:{identity}"),
            _ => format!("addr:{address}"),
        }
    }
}

impl std::str::FromStr for SubjectSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "address" | "ip" => Ok(SubjectSource::Address),
            "identity" | "user" => Ok(SubjectSource::Identity),
            other => Err(format!("unknown subject source `{other}`")),
        }
    }
}

/// One independently configured rate-limiting policy.
#[derive(Debug, Clone)]
pub struct TierConfig {
    pub name: String,
    pub window: Duration,
    pub max_requests: NonZeroU32,
    /// Message returned to throttled callers.
    pub message: String,
    pub subject: SubjectSource,
}

impl TierConfig {
    pub fn new(name: impl Into<String>, window: Duration, max_requests: NonZeroU32) -> Self {
        Self {
            name: name.into(),
            window,
            max_requests,
            message: "Too many requests, please try again later.".to_string(),
            subject: SubjectSource::Address,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_subject(mut self, subject: SubjectSource) -> Self {
        self.subject = subject;
        self
    }

    pub(crate) fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }
}

impl From<&crate::config::TierSettings> for TierConfig {
    fn from(settings: &crate::config::TierSettings) -> Self {
        TierConfig::new(
            settings.name.clone(),
            Duration::from_millis(settings.window_ms.get()),
            settings.max_requests,
        )
        .with_message(settings.message.clone())
        .with_subject(settings.subject)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TierConfigError {
    #[error("rate limit tier name must not be empty")]
    EmptyName,
    #[error("rate limit tier `{0}` is defined more than once")]
    Duplicate(String),
    #[error("rate limit tier `{0}` must have a window of at least 1ms")]
    ZeroWindow(String),
    #[error("route `{route}` references unknown rate limit tier `{tier}`")]
    UnknownTier { route: String, tier: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_subject_falls_back_to_address() {
        let source = SubjectSource::Identity;
        assert_eq!(source.subject("10.0.0.1", Some("alice")), "user:alice");
        assert_eq!(source.subject("10.0.0.1", None), "addr:10.0.0.1");
        assert_eq!(
            SubjectSource::Address.subject("10.0.0.1", Some("alice")),
            "addr:10.0.0.1"
        );
    }

    #[test]
    fn parses_subject_source() {
        assert_eq!("Address".parse(), Ok(SubjectSource::Address));
        assert_eq!("identity".parse(), Ok(SubjectSource::Identity));
        assert!("cookie".parse::<SubjectSource>().is_err());
    }
}
