//! Identity & credential store (§4.A). Generalizes the teacher's
//! `Authenticator` trait (JWT decode/validate, cookie-or-header
//! extraction in `check_authorization`) from Google-OAuth-only identities
//! to local username/password accounts, while keeping the same
//! bearer-token machinery and the same `async_trait`-based trait seam so
//! alternate identity backends (tests, future federated login) can slot
//! in the way `MockAuthenticator` does for the teacher.
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bcrypt::{hash, verify, DEFAULT_COST};
use headers::{Cookie, HeaderMapExt};
use hyper::body::Incoming;
use hyper::Request;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::{debug, info, warn};

pub const TOKEN_COOKIE: &str = "token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
  pub user_id: Uuid,
  pub username: String,
  pub email: Option<String>,
  pub password_hash: Option<String>,
  pub is_verified: bool,
  pub disabled: bool,
  pub session_version: i64,
}

/// JWT claims. `session_version` must match the user's stored value at
/// verification time; a mismatch means the credential was invalidated by
/// a password/email change and is rejected uniformly as "unauthenticated"
/// to avoid an authentication oracle (§4.A).
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
  sub: String,
  user_id: Uuid,
  session_version: i64,
  iat: i64,
  exp: i64,
}

pub struct IdentityStore {
  pool: SqlitePool,
  secret: String,
  jwt_expiry_secs: i64,
}

impl IdentityStore {
  #[must_use]
  pub fn new(pool: SqlitePool, secret: String, jwt_expiry_secs: i64) -> Self {
    IdentityStore { pool, secret, jwt_expiry_secs }
  }

  /// §4.A: username 4-50 chars `[A-Za-z0-9_]`; password (if given) >= 8
  /// chars with upper, lower, and digit. Spec's rule wins over the
  /// original Python source's looser 4-char minimum (see DESIGN.md).
  pub fn validate_username(username: &str) -> AppResult<()> {
    if username.len() < 4 || username.len() > 50 {
      return Err(AppError::validation("username must be 4-50 characters"));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
      return Err(AppError::validation("username may only contain letters, digits, and underscore"));
    }
    Ok(())
  }

  pub fn validate_password(password: &str) -> AppResult<()> {
    if password.len() < 8 {
      return Err(AppError::validation("WEAK_PASSWORD: password must be at least 8 characters"));
    }
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(char::is_numeric);
    if !(has_upper && has_lower && has_digit) {
      return Err(AppError::validation(
        "WEAK_PASSWORD: password must include an uppercase letter, a lowercase letter, and a digit",
      ));
    }
    Ok(())
  }

  pub async fn register(&self, username: &str, password: Option<&str>, email: Option<&str>) -> AppResult<User> {
    Self::validate_username(username)?;
    if let Some(password) = password {
      Self::validate_password(password)?;
    }

    if sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE username = ?1")
      .bind(username)
      .fetch_one(&self.pool)
      .await?
      > 0
    {
      return Err(AppError::conflict("USERNAME_TAKEN"));
    }
    if let Some(email) = email {
      if !email.is_empty()
        && sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE email = ?1")
          .bind(email)
          .fetch_one(&self.pool)
          .await?
          > 0
      {
        return Err(AppError::conflict("EMAIL_TAKEN"));
      }
    }

    let password_hash = match password {
      Some(p) => Some(hash(p, DEFAULT_COST)?),
      None => None,
    };
    let user = User {
      user_id: Uuid::new_v4(),
      username: username.to_string(),
      email: email.filter(|e| !e.is_empty()).map(ToString::to_string),
      password_hash,
      is_verified: false,
      disabled: false,
      session_version: 0,
    };

    sqlx::query(
      "INSERT INTO users (user_id, username, email, password_hash, is_verified, disabled, session_version) \
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(user.user_id.to_string())
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.is_verified)
    .bind(user.disabled)
    .bind(user.session_version)
    .execute(&self.pool)
    .await?;

    info!("(identity) registered user {}", user.username);
    Ok(user)
  }

  pub async fn authenticate(&self, username: &str, password: &str) -> AppResult<User> {
    let user = self.find_by_username(username).await?.ok_or(AppError::Authentication)?;
    if user.disabled {
      return Err(AppError::Authentication);
    }
    let Some(stored_hash) = &user.password_hash else {
      return Err(AppError::Authentication);
    };
    if !verify(password, stored_hash).unwrap_or(false) {
      warn!("(identity) failed login attempt for {username}");
      return Err(AppError::Authentication);
    }
    Ok(user)
  }

  pub async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
    let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = ?1")
      .bind(username)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(UserRow::into_user))
  }

  pub async fn find_by_id(&self, user_id: Uuid) -> AppResult<User> {
    let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE user_id = ?1")
      .bind(user_id.to_string())
      .fetch_optional(&self.pool)
      .await?;
    row.map(UserRow::into_user).ok_or_else(|| AppError::not_found("user"))
  }

  /// Issue a signed bearer credential carrying the user's current
  /// `session_version` (§6).
  pub fn issue_credential(&self, user: &User) -> AppResult<String> {
    let now = now_secs();
    let claims = Claims {
      sub: user.username.clone(),
      user_id: user.user_id,
      session_version: user.session_version,
      iat: now,
      exp: now + self.jwt_expiry_secs,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(self.secret.as_bytes()))
      .map_err(|_| AppError::Fatal("failed to sign credential".to_string()))
  }

  /// Verify a bearer token: decode, look up the user, and require the
  /// claim's `session_version` to match the stored value (§4.A).
  pub async fn verify_credential(&self, token: &str) -> AppResult<User> {
    let data = decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &Validation::default())
      .map_err(|_| AppError::Authentication)?;
    let user = self.find_by_id(data.claims.user_id).await.map_err(|_| AppError::Authentication)?;
    if user.disabled || user.session_version != data.claims.session_version {
      debug!("(identity) stale or disabled credential for {}", user.username);
      return Err(AppError::Authentication);
    }
    Ok(user)
  }

  /// Bump `session_version`, invalidating every other outstanding
  /// credential (§4.A). Called after `set_password`/`reset_password`/
  /// `change_email`.
  pub async fn bump_session_version(&self, user_id: Uuid) -> AppResult<()> {
    sqlx::query("UPDATE users SET session_version = session_version + 1 WHERE user_id = ?1")
      .bind(user_id.to_string())
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  pub async fn set_password(&self, user_id: Uuid, new_password: &str) -> AppResult<()> {
    Self::validate_password(new_password)?;
    let password_hash = hash(new_password, DEFAULT_COST)?;
    sqlx::query("UPDATE users SET password_hash = ?1 WHERE user_id = ?2")
      .bind(password_hash)
      .bind(user_id.to_string())
      .execute(&self.pool)
      .await?;
    self.bump_session_version(user_id).await
  }

  pub async fn change_email(&self, user_id: Uuid, new_email: &str) -> AppResult<()> {
    if sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE email = ?1 AND user_id != ?2")
      .bind(new_email)
      .bind(user_id.to_string())
      .fetch_one(&self.pool)
      .await?
      > 0
    {
      return Err(AppError::conflict("EMAIL_TAKEN"));
    }
    sqlx::query("UPDATE users SET email = ?1 WHERE user_id = ?2")
      .bind(new_email)
      .bind(user_id.to_string())
      .execute(&self.pool)
      .await?;
    self.bump_session_version(user_id).await
  }
}

#[derive(sqlx::FromRow)]
struct UserRow {
  user_id: String,
  username: String,
  email: Option<String>,
  password_hash: Option<String>,
  is_verified: bool,
  disabled: bool,
  session_version: i64,
}

impl UserRow {
  fn into_user(self) -> User {
    User {
      user_id: Uuid::parse_str(&self.user_id).unwrap_or_else(|_| Uuid::nil()),
      username: self.username,
      email: self.email,
      password_hash: self.password_hash,
      is_verified: self.is_verified,
      disabled: self.disabled,
      session_version: self.session_version,
    }
  }
}

fn now_secs() -> i64 {
  SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() as i64
}

/// Single-use, hashed (SHA-256) token used for email verification,
/// password reset, and pending email changes; never stored raw,
/// matching `models.py`'s verification-token tables.
#[must_use]
pub fn hash_token(raw: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(raw.as_bytes());
  format!("{:x}", hasher.finalize())
}

#[must_use]
pub fn generate_raw_token() -> String {
  use base64::{engine::general_purpose, Engine as _};
  general_purpose::URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
}

/// Extract the bearer credential from a request: the `token` cookie or
/// an `Authorization: Bearer` header, per §6. Grounded on the teacher's
/// `Authenticator::check_authorization` cookie-extraction idiom,
/// generalized to also accept the header form.
pub fn extract_bearer_token(req: &Request<Incoming>) -> Option<String> {
  if let Some(auth) = req.headers().get(http::header::AUTHORIZATION) {
    if let Ok(value) = auth.to_str() {
      if let Some(token) = value.strip_prefix("Bearer ") {
        return Some(token.to_string());
      }
    }
  }
  if let Some(cookies) = req.headers().typed_get::<Cookie>() {
    if let Some(token) = cookies.get(TOKEN_COOKIE) {
      return Some(token.to_string());
    }
  }
  None
}

/// Test/mock seam mirroring the teacher's `MockAuthenticator`, usable
/// wherever a full sqlite-backed `IdentityStore` would be overkill.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
  async fn verify(&self, token: &str) -> AppResult<User>;
}

#[async_trait]
impl CredentialVerifier for IdentityStore {
  async fn verify(&self, token: &str) -> AppResult<User> {
    self.verify_credential(token).await
  }
}

#[allow(dead_code)]
pub struct MockCredentialVerifier {
  pub users: HashMap<String, User>,
}

#[async_trait]
impl CredentialVerifier for MockCredentialVerifier {
  async fn verify(&self, token: &str) -> AppResult<User> {
    self.users.get(token).cloned().ok_or(AppError::Authentication)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn password_policy_rejects_weak_passwords() {
    assert!(IdentityStore::validate_password("short1A").is_err());
    assert!(IdentityStore::validate_password("alllowercase1").is_err());
    assert!(IdentityStore::validate_password("ALLUPPERCASE1").is_err());
    assert!(IdentityStore::validate_password("NoDigitsHere").is_err());
    assert!(IdentityStore::validate_password("GoodPass1").is_ok());
  }

  #[test]
  fn username_policy_matches_spec() {
    assert!(IdentityStore::validate_username("abc").is_err());
    assert!(IdentityStore::validate_username("has space").is_err());
    assert!(IdentityStore::validate_username("valid_user_1").is_ok());
  }

  #[test]
  fn token_hash_is_deterministic_and_never_equals_raw() {
    let raw = generate_raw_token();
    let hashed = hash_token(&raw);
    assert_ne!(raw, hashed);
    assert_eq!(hashed, hash_token(&raw));
  }
}
