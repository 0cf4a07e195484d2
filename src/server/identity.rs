//! Caller identity.
//!
//! Sessions and login live in the upstream web tier. It forwards the
//! authenticated user id in the `X-Depot-User` header; a request without the
//! header is anonymous.

use axum::extract::FromRequestParts;
use http::request::Parts;
use http::HeaderName;

/// Header carrying the authenticated user id.
pub const CALLER_HEADER: HeaderName = HeaderName::from_static("x-depot-user");

/// The user making a request, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller(pub Option<String>);

impl Caller {
    pub fn user_id(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(&CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        Ok(Caller(user))
    }
}
