use super::{
    db_ops::{self, DbModel, Document, GetUserQuery, Result},
    errors::ApiError,
    models::{ObjectId, PublicUser, Role, User},
    session,
    store::DocumentStore,
};
use anyhow::anyhow;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, SaltString},
    Argon2, PasswordHasher, PasswordVerifier,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use validator::Validate;

const INVALID_CREDENTIALS: &str = "Invalid email or password";

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterForm {
    #[validate(length(min = 1, message = "Path `name` is required."))]
    pub name: String,
    #[validate(email(message = "Please provide a valid email address."))]
    pub email: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters."))]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

/// The profile plus a bearer token, as returned by register and login.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(flatten)]
    pub user: PublicUser,
    pub token: String,
}

pub fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

pub fn issue_token(user_id: ObjectId, secret: &[u8]) -> Result<String> {
    let session = session::Session::new(user_id, now_secs());
    Ok(session::serialize_session(&session, secret)?)
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal(anyhow!("failed to hash password: {e}")))
}

fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "stored password hash is unreadable");
            false
        }
    }
}

fn avatar_url(name: &str) -> Option<String> {
    reqwest::Url::parse_with_params(
        "https://ui-avatars.com/api/",
        &[
            ("name", name),
            ("background", "random"),
            ("color", "fff"),
            ("size", "128"),
        ],
    )
    .ok()
    .map(String::from)
}

pub async fn register(
    db: &dyn DocumentStore,
    secret: &[u8],
    form: RegisterForm,
) -> Result<AuthResponse> {
    form.validate()?;
    let email = db_ops::normalize_email(&form.email);
    match User::get(db, &GetUserQuery::Email(&email)).await {
        Ok(_) => {
            return Err(ApiError::validation("email", "User already exists"))
        }
        Err(ApiError::NotFound(_)) => (),
        Err(e) => return Err(e),
    }

    let now = Utc::now();
    let name = form.name.trim().to_owned();
    let user = User {
        id: ObjectId::new(),
        avatar: avatar_url(&name),
        name,
        email,
        password: hash_password(&form.password)?,
        role: Role::User,
        note_count: 0,
        saved_notes: Vec::new(),
        created_at: now,
        updated_at: now,
    };
    user.create(db).await?;
    tracing::info!(user = %user.id, "registered user");

    Ok(AuthResponse {
        token: issue_token(user.id, secret)?,
        user: PublicUser::from(&user),
    })
}

pub async fn authenticate(
    db: &dyn DocumentStore,
    secret: &[u8],
    form: LoginForm,
) -> Result<AuthResponse> {
    let user = match User::get(db, &GetUserQuery::Email(&form.email)).await {
        Ok(user) => user,
        Err(ApiError::NotFound(_)) => {
            return Err(ApiError::Unauthorized(INVALID_CREDENTIALS.into()))
        }
        Err(e) => return Err(e),
    };
    if !verify_password(&form.password, &user.password) {
        return Err(ApiError::Unauthorized(INVALID_CREDENTIALS.into()));
    }

    Ok(AuthResponse {
        token: issue_token(user.id, secret)?,
        user: PublicUser::from(&user),
    })
}
