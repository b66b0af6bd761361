pub mod audit;
pub mod auth;
pub mod broker;
pub mod config;
pub mod error;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use actix_web::{web, HttpResponse};
use tokio::task::JoinHandle;

pub use error::{AppError, BrokerError};
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use audit::{AuditDispatcher, AuditEvent, Category, EventPublisher};
pub use auth::{AuthService, LocalAuthService, RateLimitGate, RateLimiter, RequestInterceptor};

/// Health check endpoint handler
/// Returns server status, timestamp and audit pipeline counters
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "audit": state.dispatcher.stats(),
    }))
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub auth_service: Arc<dyn AuthService>,
    pub interceptor: Arc<RequestInterceptor>,
    pub dispatcher: Arc<AuditDispatcher>,
    /// Housekeeping tasks stopped by `shutdown`.
    maintenance: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AppState {
    pub async fn new(config: Settings) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new((&config.rate_limit).into()));
        let cleanup = auth::spawn_cleanup(
            limiter.clone(),
            Duration::from_secs(config.rate_limit.window_secs.max(1)),
        );

        let auth_service = Arc::new(LocalAuthService::new(
            config.auth.jwt_secret.clone(),
            config.auth.token_expiry_hours,
        ));
        let connector = broker::connector_from_config(&config.broker)?;

        let state = Self::with_components(config, limiter, auth_service, connector);
        state.lock_maintenance().push(cleanup);
        Ok(state)
    }

    /// Wires the audit pipeline around injected collaborators.
    pub fn with_components(
        config: Settings,
        gate: Arc<dyn RateLimitGate>,
        auth_service: Arc<dyn AuthService>,
        connector: Arc<dyn broker::BrokerConnector>,
    ) -> Self {
        let provider = broker::ConnectionProvider::new(connector, config.broker.connection_timeout());
        let dispatcher = AuditDispatcher::start(EventPublisher::new(provider), &config.audit);
        let interceptor = Arc::new(RequestInterceptor::new(gate, dispatcher.clone()));

        Self {
            config: Arc::new(config),
            auth_service,
            interceptor,
            dispatcher,
            maintenance: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock_maintenance(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.maintenance.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn shutdown(&self) -> Result<()> {
        // Drain pending audit events
        self.dispatcher.shutdown().await;

        let tasks = std::mem::take(&mut *self.lock_maintenance());
        for task in &tasks {
            task.abort();
        }
        futures::future::join_all(tasks).await;
        Ok(())
    }
}
