//! Session token validation.
//!
//! A session presents an HS256 JWT either in the auth cookie or in the
//! `Authorization` header. The token's claims name the group the socket
//! joins.

use crate::error::{GatewayError, Result};
use crate::header::{GroupId, RoutingMode};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Numeric user id.
    #[serde(default)]
    pub id: Option<u64>,
    /// Group name, used in `group_name` routing mode.
    #[serde(default)]
    pub group: Option<String>,
    /// Expiration (Unix timestamp), checked when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

/// Validates session tokens and resolves them to a group.
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
    mode: RoutingMode,
}

impl TokenValidator {
    pub fn new(secret: &str, mode: RoutingMode) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            mode,
        }
    }

    /// Decode and verify `token`.
    pub fn claims(&self, token: &str) -> Result<SessionClaims> {
        decode::<SessionClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| GatewayError::Unauthorized(e.to_string()))
    }

    /// Group the bearer of `token` belongs to.
    pub fn group_for(&self, token: &str) -> Result<GroupId> {
        let claims = self.claims(token)?;
        match (self.mode, claims) {
            (RoutingMode::UserIds, SessionClaims { id: Some(id), .. }) => Ok(GroupId::Id(id)),
            (RoutingMode::GroupName, SessionClaims { group: Some(group), .. })
                if !group.is_empty() =>
            {
                Ok(GroupId::Name(group))
            }
            (RoutingMode::GroupName, SessionClaims { id: Some(id), .. }) => {
                Ok(GroupId::Name(id.to_string()))
            }
            _ => Err(GatewayError::Unauthorized(
                "token carries no group claim".to_string(),
            )),
        }
    }
}

/// Find the session token in the request headers.
///
/// `Authorization` wins over the cookie; a `Bearer ` prefix is optional.
pub fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "secret";

    fn token(claims: &SessionClaims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(id: Option<u64>, group: Option<&str>, exp: Option<u64>) -> SessionClaims {
        SessionClaims {
            id,
            group: group.map(str::to_string),
            exp,
        }
    }

    #[test]
    fn test_user_id_claim() {
        let validator = TokenValidator::new(SECRET, RoutingMode::UserIds);
        let t = token(&claims(Some(42), None, None), SECRET);
        assert_eq!(validator.group_for(&t).unwrap(), GroupId::Id(42));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let validator = TokenValidator::new(SECRET, RoutingMode::UserIds);
        let t = token(&claims(Some(42), None, None), "other");
        assert!(matches!(
            validator.group_for(&t),
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let validator = TokenValidator::new(SECRET, RoutingMode::UserIds);
        let past = (chrono::Utc::now().timestamp() - 3600) as u64;
        let t = token(&claims(Some(1), None, Some(past)), SECRET);
        assert!(validator.group_for(&t).is_err());

        let future = (chrono::Utc::now().timestamp() + 3600) as u64;
        let t = token(&claims(Some(1), None, Some(future)), SECRET);
        assert_eq!(validator.group_for(&t).unwrap(), GroupId::Id(1));
    }

    #[test]
    fn test_group_name_mode() {
        let validator = TokenValidator::new(SECRET, RoutingMode::GroupName);
        let t = token(&claims(Some(7), Some("room"), None), SECRET);
        assert_eq!(validator.group_for(&t).unwrap(), GroupId::from("room"));

        let t = token(&claims(Some(7), None, None), SECRET);
        assert_eq!(validator.group_for(&t).unwrap(), GroupId::from("7"));
    }

    #[test]
    fn test_missing_group_claim() {
        let validator = TokenValidator::new(SECRET, RoutingMode::UserIds);
        let t = token(&claims(None, Some("room"), None), SECRET);
        assert!(validator.group_for(&t).is_err());
    }

    #[test]
    fn test_extract_from_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; auth=abc.def.ghi"));
        assert_eq!(extract_token(&headers, "auth").as_deref(), Some("abc.def.ghi"));
        assert_eq!(extract_token(&headers, "session"), None);
    }

    #[test]
    fn test_authorization_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("auth=from-cookie"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(extract_token(&headers, "auth").as_deref(), Some("from-header"));
    }
}
