//! Authentication module
//!
//! HTTP endpoints for login, registration, token issuance and the
//! catch-all authenticated route, plus the rate-limit gate and the
//! interceptor that audits every request before it reaches the
//! authentication service.

pub mod handlers;
mod interceptor;
pub mod models;
mod rate_limit;
mod service;

pub use interceptor::RequestInterceptor;
pub use models::{AccessToken, RegisterRequest, Session, User};
pub use rate_limit::{
    spawn_cleanup, GateDecision, RateLimitConfig, RateLimitGate, RateLimiter, RequestContext,
};
pub use service::{AuthService, Claims, LocalAuthService};
