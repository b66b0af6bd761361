//! Audit module
//!
//! Turns security events raised by the authentication endpoints into
//! durable broker messages. Request handlers hand events to the
//! [`AuditDispatcher`]; the [`EventPublisher`] does the broker work.

mod dispatcher;
mod publisher;
mod retry;
mod topology;

use serde::Serialize;
use std::fmt;

pub use dispatcher::{AuditDispatcher, AuditStats, DispatchOutcome};
pub use publisher::{EventPublisher, PublishState};
pub use retry::RetryPolicy;
pub use topology::{Topology, TopologyEnsurer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    RateLimit,
    LoginAttempt,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::RateLimit, Category::LoginAttempt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::RateLimit => "rate_limit",
            Category::LoginAttempt => "login_attempt",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub category: Category,
    pub payload: String,
}

impl AuditEvent {
    /// `"{client_ip},{path}"`
    pub fn rate_limit(client_ip: &str, path: &str) -> Self {
        Self {
            category: Category::RateLimit,
            payload: format!("{},{}", client_ip, path),
        }
    }

    pub fn login_attempt(user_id: impl Into<String>) -> Self {
        Self {
            category: Category::LoginAttempt,
            payload: user_id.into(),
        }
    }
}
