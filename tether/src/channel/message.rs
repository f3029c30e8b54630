use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clock::DurationSecs;
use crate::AccessToken;

/// The single message a bounce context sends back to its opener
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BounceMessage {
    /// The handshake completed and produced a token
    #[serde(rename = "AUTH_SUCCESS")]
    Success(IssuedToken),
    /// The handshake failed
    #[serde(rename = "AUTH_ERROR")]
    Error(BounceFailure),
}

/// A token delivered by a successful bounce
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    /// The access token
    pub token: AccessToken,
    /// The token lifetime reported by the identity provider, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<DurationSecs>,
}

/// The reason a bounce failed
///
/// `error` is either an OAuth2 error code passed through from the identity
/// provider, such as `login_required`, or one of the codes raised by the
/// bounce itself, such as [`TOKEN_EXCHANGE_FAILED`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceFailure {
    /// A short error code
    pub error: String,
    /// A human-readable description, if available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// Raised when redeeming the authorization code failed
pub const TOKEN_EXCHANGE_FAILED: &str = "token_exchange_failed";

/// Raised when a callback does not correlate with a pending authorization request
pub const INVALID_STATE: &str = "invalid_state";

/// Raised when a bounce context is loaded without anything to do
pub const INVALID_REQUEST: &str = "invalid_request";

impl BounceFailure {
    /// Constructs a failure with only an error code
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_description: None,
        }
    }

    /// Attaches a description to the failure
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.error_description = Some(description.into());
        self
    }
}

impl fmt::Display for BounceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error)?;
        if let Some(description) = &self.error_description {
            f.write_str(": ")?;
            f.write_str(description)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_matches_wire_contract() {
        let message = BounceMessage::Success(IssuedToken {
            token: AccessToken::from_static("tok123"),
            expires_in: None,
        });

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({ "type": "AUTH_SUCCESS", "token": "tok123" })
        );
    }

    #[test]
    fn error_matches_wire_contract() {
        let message = BounceMessage::Error(BounceFailure::new("login_required"));

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({ "type": "AUTH_ERROR", "error": "login_required" })
        );
    }

    #[test]
    fn success_with_lifetime_is_accepted() {
        let message: BounceMessage = serde_json::from_value(json!({
            "type": "AUTH_SUCCESS",
            "token": "tok123",
            "expires_in": 3600,
        }))
        .unwrap();

        assert_eq!(
            message,
            BounceMessage::Success(IssuedToken {
                token: AccessToken::from_static("tok123"),
                expires_in: Some(DurationSecs(3600)),
            })
        );
    }

    #[test]
    fn unrelated_messages_do_not_parse() {
        assert!(serde_json::from_value::<BounceMessage>(json!({ "type": "AUTH_TOKEN" })).is_err());
        assert!(serde_json::from_value::<BounceMessage>(json!("hello")).is_err());
    }
}
