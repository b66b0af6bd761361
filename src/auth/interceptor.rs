use std::sync::Arc;
use tracing::debug;

use super::rate_limit::{GateDecision, RateLimitGate, RequestContext};
use crate::audit::{AuditDispatcher, AuditEvent, DispatchOutcome};
use crate::error::AppError;

/// Runs in front of every authentication endpoint: rate-limit gate
/// first, then the audit event, then the caller delegates to the
/// authentication service.
pub struct RequestInterceptor {
    gate: Arc<dyn RateLimitGate>,
    dispatcher: Arc<AuditDispatcher>,
}

impl RequestInterceptor {
    pub fn new(gate: Arc<dyn RateLimitGate>, dispatcher: Arc<AuditDispatcher>) -> Self {
        Self { gate, dispatcher }
    }

    /// Rejects the request before any side effect when the gate denies it.
    pub async fn admit(&self, ctx: &RequestContext) -> Result<(), AppError> {
        match self.gate.check(ctx).await {
            GateDecision::Allow => Ok(()),
            GateDecision::Deny { retry_after } => Err(AppError::GateRejected {
                // Round up so clients never retry early.
                retry_after_secs: retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0),
            }),
        }
    }

    /// Hands an event to the dispatcher. Errors only in fail-closed mode.
    pub async fn record(&self, event: AuditEvent) -> Result<DispatchOutcome, AppError> {
        let outcome = self.dispatcher.submit(event).await?;
        debug!(?outcome, "Audit event dispatched");
        Ok(outcome)
    }

    /// Gate plus `rate_limit` event, used by login, register and token.
    pub async fn intercept(&self, ctx: &RequestContext) -> Result<(), AppError> {
        self.admit(ctx).await?;
        self.record(AuditEvent::rate_limit(&ctx.client_ip, &ctx.path))
            .await?;
        Ok(())
    }
}
