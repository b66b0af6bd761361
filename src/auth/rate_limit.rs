use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::RateLimitSettings;

/// Identifying information about an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub client_ip: String,
    pub path: String,
}

impl RequestContext {
    pub fn new(client_ip: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny { retry_after: std::time::Duration },
}

/// Decides whether a request may proceed. The policy lives behind this
/// trait; callers only act on the decision.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateLimitGate: Send + Sync {
    async fn check(&self, ctx: &RequestContext) -> GateDecision;
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_size: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::minutes(1),
            max_requests: 100, // 100 requests per window
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            window_size: Duration::seconds(settings.window_secs as i64),
            max_requests: settings.max_requests,
        }
    }
}

#[derive(Debug)]
struct RequestWindow {
    timestamps: Vec<DateTime<Utc>>,
}

impl RequestWindow {
    fn new() -> Self {
        Self {
            timestamps: Vec::new(),
        }
    }

    fn cleanup_old_requests(&mut self, window_size: Duration) {
        let cutoff = Utc::now() - window_size;
        self.timestamps.retain(|ts| *ts > cutoff);
    }

    fn add_request(&mut self) {
        self.timestamps.push(Utc::now());
    }

    fn request_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Time until the oldest request leaves the window.
    fn retry_after(&self, window_size: Duration) -> std::time::Duration {
        self.timestamps
            .first()
            .map(|oldest| *oldest + window_size - Utc::now())
            .and_then(|remaining| remaining.to_std().ok())
            .unwrap_or_default()
    }
}

/// Sliding-window limiter keyed by client address.
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, RequestWindow>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub async fn check_rate_limit(&self, client: &str) -> GateDecision {
        let mut windows = self.windows.write().await;

        let window = windows
            .entry(client.to_string())
            .or_insert_with(RequestWindow::new);

        window.cleanup_old_requests(self.config.window_size);

        if window.request_count() < self.config.max_requests as usize {
            window.add_request();
            GateDecision::Allow
        } else {
            GateDecision::Deny {
                retry_after: window.retry_after(self.config.window_size),
            }
        }
    }

    pub async fn cleanup(&self) {
        let mut windows = self.windows.write().await;

        // Remove windows with no recent requests
        windows.retain(|_, window| {
            window.cleanup_old_requests(self.config.window_size);
            !window.timestamps.is_empty()
        });
    }

    pub async fn tracked_clients(&self) -> usize {
        self.windows.read().await.len()
    }
}

/// Periodically evicts idle clients from the limiter.
pub fn spawn_cleanup(limiter: Arc<RateLimiter>, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            limiter.cleanup().await;
        }
    })
}

#[async_trait]
impl RateLimitGate for RateLimiter {
    async fn check(&self, ctx: &RequestContext) -> GateDecision {
        let decision = self.check_rate_limit(&ctx.client_ip).await;
        if let GateDecision::Deny { .. } = decision {
            warn!(client = %ctx.client_ip, path = %ctx.path, "Rate limit exceeded");
        }
        decision
    }
}
