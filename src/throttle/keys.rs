//! Throttle levels and counter key formats.
//!
//! Key strings are shared with peer replicas, so their layout is part of the
//! wire contract of throttle events.

use std::fmt;

use crate::subscription::AppId;

/// Scope a throttle key belongs to, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ThrottleLevel {
    Custom,
    Api,
    Resource,
    Application,
    Subscription,
}

impl ThrottleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Custom => "custom",
            Self::Api => "api",
            Self::Resource => "resource",
            Self::Application => "application",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A counter key with the level it was derived for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    pub level: ThrottleLevel,
    pub key: String,
}

impl ThrottleKey {
    /// `context:version`
    pub fn api(context: &str, version: &str) -> Self {
        Self {
            level: ThrottleLevel::Api,
            key: format!("{context}:{version}"),
        }
    }

    /// `context/version<pattern>:<METHOD>`
    pub fn resource(context: &str, version: &str, pattern: &str, method: &str) -> Self {
        Self {
            level: ThrottleLevel::Resource,
            key: format!("{context}/{version}{pattern}:{}", method.to_ascii_uppercase()),
        }
    }

    /// `appId:user`
    pub fn application(application_id: AppId, user: &str) -> Self {
        Self {
            level: ThrottleLevel::Application,
            key: format!("{application_id}:{user}"),
        }
    }

    /// `appId:context:version`
    pub fn subscription(application_id: AppId, context: &str, version: &str) -> Self {
        Self {
            level: ThrottleLevel::Subscription,
            key: format!("{application_id}:{context}:{version}"),
        }
    }

    /// Spike arrest counter of a subscription key.
    pub fn burst(&self) -> Self {
        Self {
            level: self.level,
            key: format!("{}:burst", self.key),
        }
    }

    pub fn custom(key: String) -> Self {
        Self {
            level: ThrottleLevel::Custom,
            key,
        }
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}
