use std::ops::Add;
use std::sync::Arc;

use axum::extract::{FromRequest, Path, RequestParts};
use axum::headers::authorization::Bearer;
use axum::headers::Authorization;
use axum::{Extension, Json, TypedHeader};
use chrono::{DateTime, Duration, Utc};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::{thread_rng, Rng};
use rand_core::OsRng;
use serde::{Deserialize, Serialize, Serializer};
use serde_with::skip_serializing_none;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::feed::{ChangeKind, Table};
use crate::models::{AdminAccount, AdminSession};
use crate::state::AppState;
use crate::store::Backend;
use crate::{breaks, proceeds, Error, Payload};

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Eq, Ord, PartialOrd, PartialEq)]
pub enum AuthResult {
    Success,
    SessionExpired,
    InvalidSession,
}

impl Serialize for AuthResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:?}", self))
    }
}

#[derive(Debug, Clone)]
pub enum Authentication {
    Granted {
        admin: AdminAccount,
        session: AdminSession,
    },
    Denied(AuthResult),
}

pub fn hash_password(password: &str) -> Result<String, Error> {
    Ok(Pbkdf2
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))?
        .to_string())
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(hash) => Pbkdf2.verify_password(password.as_bytes(), &hash).is_ok(),
        Err(err) => {
            log::error!("Stored password hash is malformed: {}", err);
            false
        }
    }
}

pub fn new_session_token() -> String {
    let token_bytes: [u8; 32] = thread_rng().gen();

    let mut hasher: Sha256 = Digest::new();
    hasher.update(&token_bytes);
    hex::encode(hasher.finalize())
}

/// Resolves a presented token into the admin it belongs to. Expired sessions
/// are deleted on sight.
pub async fn ensure_authenticated(
    session_token: Option<String>,
    store: &dyn Backend,
    now: DateTime<Utc>,
) -> Result<Authentication, Error> {
    let token = match session_token {
        Some(token) if !token.is_empty() => token,
        _ => return Ok(Authentication::Denied(AuthResult::InvalidSession)),
    };

    let session = match store.session_by_token(&token).await? {
        Some(session) => session,
        None => return Ok(Authentication::Denied(AuthResult::InvalidSession)),
    };

    if session.is_expired(now) {
        store.delete_session(&token).await?;
        return Ok(Authentication::Denied(AuthResult::SessionExpired));
    }

    match store.admin_by_id(session.admin_id).await? {
        Some(admin) => Ok(Authentication::Granted { admin, session }),
        None => {
            store.delete_session(&token).await?;
            Ok(Authentication::Denied(AuthResult::InvalidSession))
        }
    }
}

/// Extractor for routes that require a logged-in admin.
pub struct AdminAuth {
    pub admin: AdminAccount,
    pub session: AdminSession,
}

#[axum::async_trait]
impl<B> FromRequest<B> for AdminAuth
where
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let Extension(state) = Extension::<Arc<AppState>>::from_request(req)
            .await
            .map_err(|err| Error::InternalError {
                kind: "StateMissing",
                message: err.to_string(),
            })?;
        let token = TypedHeader::<Authorization<Bearer>>::from_request(req)
            .await
            .ok()
            .map(|TypedHeader(Authorization(bearer))| bearer.token().to_string());

        match ensure_authenticated(token, state.store.as_ref(), Utc::now()).await? {
            Authentication::Granted { admin, session } => Ok(AdminAuth { admin, session }),
            Authentication::Denied(auth_result) => Err(Error::Unauthorized {
                message: match auth_result {
                    AuthResult::SessionExpired => "Session expired, please log in again",
                    _ => "Missing or invalid session token",
                }
                .to_string(),
                auth_result,
            }),
        }
    }
}

pub async fn login_admin(
    Json(login): Json<LoginAdmin>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<LoggedInAdmin> {
    if login.username.is_empty() || login.password.is_empty() {
        return breaks(Error::InvalidPayload {
            message: "`username` and `password` are required".to_string(),
        });
    }

    let admin = match state.store.admin_by_username(&login.username).await? {
        Some(admin) if verify_password(&login.password, &admin.password_hash) => admin,
        _ => {
            log::info!("Rejected login for `{}`", login.username);
            return breaks(Error::AuthenticationFailure {
                message: "Invalid credentials. Please check your username and password."
                    .to_string(),
            });
        }
    };

    let now = Utc::now();
    state.store.touch_last_login(admin.id, now).await?;

    let session = AdminSession {
        session_token: new_session_token(),
        admin_id: admin.id,
        expires_at: now.add(Duration::hours(state.config.session_ttl_hours)),
    };
    state.store.insert_session(&session).await?;
    log::info!("Admin `{}` logged in", admin.username);

    proceeds(LoggedInAdmin {
        session_token: session.session_token,
        expires_at: session.expires_at,
        admin: AdminAccount {
            last_login: Some(now),
            ..admin
        },
    })
}

pub async fn logout_admin(
    auth: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<SessionBasedResponse<SessionDropped>> {
    let dropped = state.store.delete_session(&auth.session.session_token).await?;
    state.scanners.close_owned_by(auth.admin.id).await;
    proceeds(SessionBasedResponse {
        auth_result: AuthResult::Success,
        value: Some(SessionDropped {
            admin_id: auth.admin.id,
            drop_success: dropped,
        }),
    })
}

pub async fn current_admin(auth: AdminAuth) -> Payload<LoggedInAdmin> {
    proceeds(LoggedInAdmin {
        session_token: auth.session.session_token,
        expires_at: auth.session.expires_at,
        admin: auth.admin,
    })
}

pub async fn list_admins(
    _auth: AdminAuth,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<AdminList> {
    proceeds(AdminList {
        admins: state.store.list_admins().await?,
    })
}

fn check_new_password(password: &str, confirm: &str) -> Result<(), Error> {
    if password != confirm {
        return Err(Error::invalid("Passwords do not match"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::invalid(format!(
            "Password must be at least {} characters long",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

pub async fn create_admin_account(
    store: &dyn Backend,
    username: &str,
    password: &str,
) -> Result<AdminAccount, Error> {
    let admin = AdminAccount {
        id: Uuid::new_v4(),
        username: username.to_string(),
        password_hash: hash_password(password)?,
        created_at: Utc::now(),
        last_login: None,
    };
    store.insert_admin(&admin).await?;
    Ok(admin)
}

pub async fn create_admin(
    _auth: AdminAuth,
    Json(body): Json<CreateAdmin>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<CreatedAdmin> {
    let username = body.username.trim();
    if username.is_empty() {
        return breaks(Error::invalid("`username` parameter was empty"));
    }
    if let Err(err) = check_new_password(&body.password, &body.confirm_password) {
        return breaks(err);
    }
    if state.store.admin_by_username(username).await?.is_some() {
        return breaks(Error::Conflict {
            field: "username",
            message: "Username already exists".to_string(),
        });
    }

    let admin = create_admin_account(state.store.as_ref(), username, &body.password).await?;
    state.feed.publish(Table::AdminAccounts, ChangeKind::Insert);
    log::info!("Admin account `{}` created", admin.username);
    proceeds(CreatedAdmin { admin_id: admin.id })
}

pub async fn delete_admin(
    auth: AdminAuth,
    Path(admin_id): Path<Uuid>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<AdminDeleted> {
    if admin_id == auth.admin.id {
        return breaks(Error::invalid("You cannot delete your own account"));
    }
    if !state.store.delete_admin(admin_id).await? {
        return breaks(Error::not_found(format!(
            "Admin with id `{}` does not exist!",
            admin_id
        )));
    }
    state.feed.publish(Table::AdminAccounts, ChangeKind::Delete);
    proceeds(AdminDeleted { admin_id })
}

pub async fn change_password(
    auth: AdminAuth,
    Json(body): Json<ChangePassword>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<PasswordChanged> {
    if !verify_password(&body.current_password, &auth.admin.password_hash) {
        return breaks(Error::AuthenticationFailure {
            message: "Current password is incorrect".to_string(),
        });
    }
    if let Err(err) = check_new_password(&body.new_password, &body.confirm_password) {
        return breaks(err);
    }

    let hash = hash_password(&body.new_password)?;
    let changed = state.store.update_admin_password(auth.admin.id, &hash).await?;
    if changed {
        state.feed.publish(Table::AdminAccounts, ChangeKind::Update);
    }
    proceeds(PasswordChanged {
        admin_id: auth.admin.id,
        changed,
    })
}

/// Seeds the first admin when the account table is empty.
pub async fn bootstrap_admin(
    store: &dyn Backend,
    username: &str,
    password: &str,
) -> Result<bool, Error> {
    if !store.list_admins().await?.is_empty() {
        return Ok(false);
    }
    create_admin_account(store, username, password).await?;
    log::info!("Seeded initial admin account `{}`", username);
    Ok(true)
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDropped {
    pub admin_id: Uuid,
    pub drop_success: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct SessionBasedResponse<V> {
    pub auth_result: AuthResult,
    #[serde(flatten)]
    pub value: Option<V>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedInAdmin {
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub admin: AdminAccount,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminList {
    pub admins: Vec<AdminAccount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedAdmin {
    pub admin_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminDeleted {
    pub admin_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordChanged {
    pub admin_id: Uuid,
    pub changed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginAdmin {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAdmin {
    pub username: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePassword {
    pub current_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    async fn store_with_session(expires_in: Duration) -> (MemoryBackend, AdminSession) {
        let store = MemoryBackend::new();
        let admin = create_admin_account(&store, "admin", "password").await.unwrap();
        let session = AdminSession {
            session_token: new_session_token(),
            admin_id: admin.id,
            expires_at: Utc::now() + expires_in,
        };
        store.insert_session(&session).await.unwrap();
        (store, session)
    }

    #[test]
    fn hashes_verify_and_never_store_plaintext() {
        let hash = hash_password("hunter22").unwrap();
        assert!(!hash.contains("hunter22"));
        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("hunter23", &hash));
        assert!(!verify_password("hunter22", "not-a-phc-string"));
    }

    #[test]
    fn tokens_are_unique_hex() {
        let a = new_session_token();
        let b = new_session_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn new_passwords_are_checked() {
        assert!(check_new_password("secret1", "secret1").is_ok());
        assert!(check_new_password("secret1", "secret2").is_err());
        assert!(check_new_password("short", "short").is_err());
    }

    #[tokio::test]
    async fn live_session_is_granted() {
        let (store, session) = store_with_session(Duration::hours(8)).await;
        let auth = ensure_authenticated(Some(session.session_token), &store, Utc::now())
            .await
            .unwrap();
        assert!(matches!(auth, Authentication::Granted { .. }));
    }

    #[tokio::test]
    async fn expired_session_is_rejected_and_removed() {
        let (store, session) = store_with_session(Duration::hours(8)).await;
        let auth = ensure_authenticated(
            Some(session.session_token.clone()),
            &store,
            session.expires_at,
        )
        .await
        .unwrap();
        assert!(matches!(
            auth,
            Authentication::Denied(AuthResult::SessionExpired)
        ));
        assert!(store
            .session_by_token(&session.session_token)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn missing_or_unknown_tokens_are_invalid() {
        let (store, _) = store_with_session(Duration::hours(8)).await;
        for token in [None, Some(String::new()), Some("nope".to_string())] {
            let auth = ensure_authenticated(token, &store, Utc::now()).await.unwrap();
            assert!(matches!(
                auth,
                Authentication::Denied(AuthResult::InvalidSession)
            ));
        }
    }

    #[tokio::test]
    async fn bootstrap_only_seeds_empty_table() {
        let store = MemoryBackend::new();
        assert!(bootstrap_admin(&store, "admin", "password").await.unwrap());
        assert!(!bootstrap_admin(&store, "other", "password").await.unwrap());
        assert_eq!(store.list_admins().await.unwrap().len(), 1);
    }
}
