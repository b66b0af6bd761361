use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::models::{AccessToken, RegisterRequest, Session, User};
use crate::error::{AppError, AuthError};

const SALT_SIZE: usize = 16;
const TOKEN_TYPE: &str = "bearer";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,  // User ID
    pub exp: i64,     // Expiration time
    pub iat: i64,     // Issued at
}

/// Credential verification and token minting, invoked after the audit
/// step of each endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<Session, AppError>;

    async fn register(&self, request: RegisterRequest) -> Result<User, AppError>;

    async fn issue_token(&self, username: &str, password: &str) -> Result<AccessToken, AppError>;

    async fn current_user(&self, token: &str) -> Result<User, AppError>;
}

struct StoredUser {
    user: User,
    salt: String,
    password_hash: String,
}

/// In-process user table with salted SHA-256 passwords and HS256 JWTs.
pub struct LocalAuthService {
    users: RwLock<HashMap<String, StoredUser>>,
    jwt_secret: String,
    token_expiry_hours: i64,
}

impl LocalAuthService {
    pub fn new(jwt_secret: String, token_expiry_hours: i64) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            jwt_secret,
            token_expiry_hours,
        }
    }

    fn hash_password(salt: &str, password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(password.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn new_salt() -> String {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        BASE64.encode(salt)
    }

    /// Checks credentials and stamps `last_login`.
    async fn verify(&self, username: &str, password: &str) -> Result<User, AppError> {
        let mut users = self.users.write().await;
        let stored = users
            .get_mut(username)
            .ok_or(AuthError::InvalidCredentials)?;

        if Self::hash_password(&stored.salt, password) != stored.password_hash {
            return Err(AuthError::InvalidCredentials.into());
        }
        if !stored.user.is_active {
            return Err(AuthError::Unauthorized.into());
        }

        let now = Utc::now();
        stored.user.last_login = Some(now);
        stored.user.updated_at = now;
        Ok(stored.user.clone())
    }

    fn generate_token(&self, user_id: &Uuid) -> Result<(String, chrono::DateTime<Utc>), AppError> {
        let now = Utc::now();
        let expires_at = now + Duration::hours(self.token_expiry_hours);
        let claims = Claims {
            sub: user_id.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?;

        Ok((token, expires_at))
    }

    fn decode_token(&self, token: &str) -> Result<Claims, AppError> {
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )?;

        Ok(claims.claims)
    }
}

#[async_trait]
impl AuthService for LocalAuthService {
    async fn login(&self, username: &str, password: &str) -> Result<Session, AppError> {
        let user = self.verify(username, password).await?;
        let (access_token, expires_at) = self.generate_token(&user.id)?;
        info!("Login successful for user {}", user.id);

        Ok(Session {
            user_id: user.id,
            access_token,
            token_type: TOKEN_TYPE.to_string(),
            expires_at,
        })
    }

    async fn register(&self, request: RegisterRequest) -> Result<User, AppError> {
        if request.username.trim().is_empty() {
            return Err(AppError::ValidationError("username must not be empty".into()));
        }
        if request.password.is_empty() {
            return Err(AppError::ValidationError("password must not be empty".into()));
        }

        let mut users = self.users.write().await;
        if users.contains_key(&request.username) {
            return Err(AuthError::UserExists.into());
        }

        let salt = Self::new_salt();
        let password_hash = Self::hash_password(&salt, &request.password);
        let user = User::new(request.username.clone(), request.email);
        users.insert(
            request.username,
            StoredUser {
                user: user.clone(),
                salt,
                password_hash,
            },
        );
        info!("Registered user {}", user.id);

        Ok(user)
    }

    async fn issue_token(&self, username: &str, password: &str) -> Result<AccessToken, AppError> {
        let user = self.verify(username, password).await?;
        let (access_token, _) = self.generate_token(&user.id)?;

        Ok(AccessToken {
            access_token,
            token_type: TOKEN_TYPE.to_string(),
        })
    }

    async fn current_user(&self, token: &str) -> Result<User, AppError> {
        let claims = self.decode_token(token)?;
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidToken)?;

        let users = self.users.read().await;
        let stored = users
            .values()
            .find(|stored| stored.user.id == user_id)
            .ok_or(AuthError::InvalidToken)?;

        if !stored.user.is_active {
            return Err(AuthError::Unauthorized.into());
        }
        Ok(stored.user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> LocalAuthService {
        LocalAuthService::new("test_secret".to_string(), 1)
    }

    fn register_request(username: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.to_string(),
            email: Some(format!("{}@example.com", username)),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_login_and_resolve_user() {
        let service = service();
        let user = service.register(register_request("alice", "password123")).await.unwrap();

        let session = service.login("alice", "password123").await.unwrap();
        assert_eq!(session.user_id, user.id);
        assert_eq!(session.token_type, "bearer");

        let current = service.current_user(&session.access_token).await.unwrap();
        assert_eq!(current.id, user.id);
        assert!(current.last_login.is_some());
    }

    #[tokio::test]
    async fn test_wrong_password_is_invalid_credentials() {
        let service = service();
        service.register(register_request("bob", "right")).await.unwrap();

        let result = service.login("bob", "wrong").await;
        assert!(matches!(result, Err(AppError::AuthError(AuthError::InvalidCredentials))));

        let result = service.issue_token("nobody", "right").await;
        assert!(matches!(result, Err(AppError::AuthError(AuthError::InvalidCredentials))));
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let service = service();
        service.register(register_request("carol", "pw")).await.unwrap();
        let result = service.register(register_request("carol", "pw")).await;
        assert!(matches!(result, Err(AppError::AuthError(AuthError::UserExists))));
    }

    #[tokio::test]
    async fn test_empty_password_rejected() {
        let result = service().register(register_request("dave", "")).await;
        assert!(matches!(result, Err(AppError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_token_from_other_secret_is_invalid() {
        let issuer = LocalAuthService::new("other_secret".to_string(), 1);
        issuer.register(register_request("erin", "pw")).await.unwrap();
        let token = issuer.issue_token("erin", "pw").await.unwrap();

        let result = service().current_user(&token.access_token).await;
        assert!(matches!(result, Err(AppError::AuthError(AuthError::InvalidToken))));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let service = LocalAuthService::new("test_secret".to_string(), -2);
        service.register(register_request("frank", "pw")).await.unwrap();
        let token = service.issue_token("frank", "pw").await.unwrap();

        let result = service.current_user(&token.access_token).await;
        assert!(matches!(result, Err(AppError::AuthError(AuthError::TokenExpired))));
    }

    #[test]
    fn test_hash_depends_on_salt() {
        let a = LocalAuthService::hash_password("salt-a", "pw");
        let b = LocalAuthService::hash_password("salt-b", "pw");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
