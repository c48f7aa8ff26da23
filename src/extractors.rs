use super::{
    auth::now_secs,
    db_ops::{DbModel, GetUserQuery},
    errors::ApiError,
    models::{AppState, User},
    session,
};
use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use axum_macros::{FromRequest, FromRequestParts};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// `axum::Json` whose rejections use the API's JSON error body. Also
/// usable as a response.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct Query<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct Path<T>(pub T);

/// The caller, resolved from an `Authorization: Bearer <token>` header.
pub struct AuthenticatedUser(pub User);

fn bearer_token(header: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^Bearer\s+(\S+)\s*$").expect("bearer regex is valid")
    });
    re.captures(header)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        req: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = req
            .headers
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("no token"))?;
        let token = bearer_token(header)
            .ok_or_else(|| ApiError::unauthorized("no token"))?;

        let session = session::deserialize_session(
            token,
            &state.config.session_secret,
            now_secs(),
        )
        .map_err(|reason| {
            tracing::debug!(reason, "bearer token rejected");
            ApiError::unauthorized("token failed")
        })?;

        match User::get(&*state.db, &GetUserQuery::Id(session.user_id)).await {
            Ok(user) => Ok(AuthenticatedUser(user)),
            Err(ApiError::NotFound(_)) => {
                Err(ApiError::unauthorized("user not found"))
            }
            Err(e) => Err(e),
        }
    }
}

/// An [`AuthenticatedUser`] whose role is `admin`.
pub struct AdminUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        req: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthenticatedUser(user) =
            AuthenticatedUser::from_request_parts(req, state).await?;
        if user.is_admin() {
            Ok(AdminUser(user))
        } else {
            Err(ApiError::unauthorized("admin access required"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc:def"), Some("abc:def"));
        assert_eq!(bearer_token("Bearer   abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer"), None);
        assert_eq!(bearer_token("Bearer a b"), None);
    }
}
