use actix_web::{web, HttpRequest, HttpResponse};
use tracing::{error, info};

use super::models::{LoginRequest, RegisterRequest, TokenForm};
use super::rate_limit::RequestContext;
use crate::audit::AuditEvent;
use crate::error::{AppError, AuthError};
use crate::AppState;

/// Registers the `/auth` routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/auth")
            .route("/login", web::post().to(login))
            .route("/register", web::post().to(register))
            .route("/token", web::post().to(token))
            .route("/others", web::post().to(others)),
    );
}

fn request_context(req: &HttpRequest) -> RequestContext {
    let client_ip = req
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .or_else(|| req.connection_info().realip_remote_addr().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    RequestContext::new(client_ip, req.path())
}

fn bearer_token(req: &HttpRequest) -> Result<&str, AppError> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| AuthError::InvalidToken.into())
}

pub async fn login(
    req: HttpRequest,
    body: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state.interceptor.intercept(&request_context(&req)).await?;

    info!("Received login request for user: {}", body.username);
    match state.auth_service.login(&body.username, &body.password).await {
        Ok(session) => Ok(HttpResponse::Ok().json(session)),
        Err(e) => {
            error!("Login failed for user: {}: {}", body.username, e);
            Err(e)
        }
    }
}

pub async fn register(
    req: HttpRequest,
    body: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state.interceptor.intercept(&request_context(&req)).await?;

    let request = body.into_inner();
    let username = request.username.clone();
    info!("Received registration request for user: {}", username);
    match state.auth_service.register(request).await {
        Ok(user) => Ok(HttpResponse::Ok().json(user)),
        Err(e) => {
            error!("Registration failed for user: {}: {}", username, e);
            Err(e)
        }
    }
}

pub async fn token(
    req: HttpRequest,
    form: web::Form<TokenForm>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state.interceptor.intercept(&request_context(&req)).await?;

    let token = state
        .auth_service
        .issue_token(&form.username, &form.password)
        .await?;
    Ok(HttpResponse::Ok().json(token))
}

/// Catch-all authenticated route. The audit event carries the
/// authenticated user id, so it is recorded after authentication.
pub async fn others(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state.interceptor.admit(&request_context(&req)).await?;

    let user = state.auth_service.current_user(bearer_token(&req)?).await?;
    state
        .interceptor
        .record(AuditEvent::login_attempt(user.id.to_string()))
        .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "others route attempt recorded"
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::User;
    use crate::auth::rate_limit::{GateDecision, MockRateLimitGate};
    use crate::auth::service::MockAuthService;
    use crate::broker::InMemoryBroker;
    use crate::config::{FailureMode, Settings};
    use actix_web::{test, App};
    use std::sync::Arc;
    use std::time::Duration;

    fn state(gate: MockRateLimitGate, auth: MockAuthService, broker: &InMemoryBroker) -> AppState {
        let mut config = Settings::new_for_test().expect("Failed to load test config");
        config.audit.failure_mode = FailureMode::FailClosed;
        AppState::with_components(config, Arc::new(gate), Arc::new(auth), Arc::new(broker.clone()))
    }

    #[actix_web::test]
    async fn test_denied_request_never_reaches_auth_service() {
        let mut gate = MockRateLimitGate::new();
        gate.expect_check().returning(|_| GateDecision::Deny {
            retry_after: Duration::from_millis(1500),
        });
        let mut auth = MockAuthService::new();
        auth.expect_login().never();
        let broker = InMemoryBroker::new();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(gate, auth, &broker)))
                .configure(configure),
        )
        .await;

        let resp = test::TestRequest::post()
            .uri("/auth/login")
            .peer_addr("10.0.0.5:40000".parse().unwrap())
            .set_json(serde_json::json!({ "username": "alice", "password": "pw" }))
            .send_request(&app)
            .await;

        assert_eq!(resp.status(), 429);
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "2");
        assert!(broker.published().is_empty());
        assert_eq!(broker.total_connections(), 0);
    }

    #[actix_web::test]
    async fn test_register_publishes_before_delegating() {
        let mut gate = MockRateLimitGate::new();
        gate.expect_check()
            .withf(|ctx| ctx.client_ip == "10.0.0.5" && ctx.path == "/auth/register")
            .returning(|_| GateDecision::Allow);
        let broker = InMemoryBroker::new();
        let observer = broker.clone();
        let mut auth = MockAuthService::new();
        auth.expect_register().times(1).returning(move |req| {
            // The audit event is already on the broker when the service runs
            assert_eq!(observer.published().len(), 1);
            Ok(User::new(req.username, req.email))
        });

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(gate, auth, &broker)))
                .configure(configure),
        )
        .await;

        let resp = test::TestRequest::post()
            .uri("/auth/register")
            .peer_addr("10.0.0.5:40000".parse().unwrap())
            .set_json(serde_json::json!({ "username": "alice", "password": "pw" }))
            .send_request(&app)
            .await;

        assert_eq!(resp.status(), 200);
        let published = broker.published();
        assert_eq!(published[0].message.body_str(), Some("10.0.0.5,/auth/register"));
    }

    #[actix_web::test]
    async fn test_others_rejects_bad_token_without_login_attempt() {
        let mut gate = MockRateLimitGate::new();
        gate.expect_check().returning(|_| GateDecision::Allow);
        let mut auth = MockAuthService::new();
        auth.expect_current_user()
            .withf(|token| token == "bogus")
            .returning(|_| Err(AuthError::InvalidToken.into()));
        let broker = InMemoryBroker::new();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(gate, auth, &broker)))
                .configure(configure),
        )
        .await;

        let resp = test::TestRequest::post()
            .uri("/auth/others")
            .insert_header(("Authorization", "Bearer bogus"))
            .send_request(&app)
            .await;

        assert_eq!(resp.status(), 401);
        assert!(broker.published().is_empty());
    }
}
