//! JWT claims structure for idgate session tokens.

use serde::{Deserialize, Serialize};

/// What a signed token may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    /// Pre-authentication token issued while a second factor is outstanding.
    #[serde(rename = "pending_2fa")]
    PendingTwoFactor,
}

impl TokenType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::PendingTwoFactor => "pending_2fa",
        }
    }
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claims embedded in every idgate token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    /// Tenant the token was issued under.
    pub app_id: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    /// Session identity; present on refresh and pending tokens only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiration (unix timestamp).
    pub exp: i64,
}

impl Claims {
    pub const fn is_expired(&self, now: i64) -> bool {
        self.exp <= now
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn access_claims_omit_token_id() {
        let claims = Claims {
            user_id: "u1".into(),
            app_id: "app-a".into(),
            token_type: TokenType::Access,
            token_id: None,
            iat: 10,
            exp: 20,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["type"], "access");
        assert!(json.get("token_id").is_none());
    }

    #[test]
    fn pending_type_uses_wire_name() {
        let json = serde_json::to_string(&TokenType::PendingTwoFactor).unwrap();
        assert_eq!(json, "\"pending_2fa\"");
        assert!(serde_json::from_str::<TokenType>("\"admin\"").is_err());
    }

    #[test]
    fn expiry_is_inclusive() {
        let claims = Claims {
            user_id: "u1".into(),
            app_id: "a".into(),
            token_type: TokenType::Refresh,
            token_id: Some("t1".into()),
            iat: 0,
            exp: 100,
        };
        assert!(claims.is_expired(100));
        assert!(!claims.is_expired(99));
    }
}
