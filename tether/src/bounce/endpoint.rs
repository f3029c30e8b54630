//! The identity provider's token endpoint

use std::error;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use url::Url;

use crate::clock::DurationSecs;
use crate::{AccessToken, AuthorizationCodeRef, ClientIdRef, CodeVerifierRef};

/// A request to redeem an authorization code
#[derive(Debug)]
pub struct CodeExchange<'a> {
    /// The code returned to the redirect URI
    pub code: &'a AuthorizationCodeRef,
    /// The verifier whose challenge accompanied the authorization request
    pub verifier: &'a CodeVerifierRef,
    /// The redirect URI used in the authorization request
    pub redirect_uri: &'a Url,
    /// The client redeeming the code
    pub client_id: &'a ClientIdRef,
}

impl Serialize for CodeExchange<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("CodeExchange", 5)?;
        ser.serialize_field("grant_type", "authorization_code")?;
        ser.serialize_field("code", self.code)?;
        ser.serialize_field("redirect_uri", self.redirect_uri.as_str())?;
        ser.serialize_field("code_verifier", self.verifier)?;
        ser.serialize_field("client_id", self.client_id)?;
        ser.end()
    }
}

/// A successful token response
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    /// The issued access token
    pub access_token: AccessToken,
    /// The token type, normally `Bearer`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// The token lifetime, if the provider reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<DurationSecs>,
}

/// An OAuth2 error body as returned by the token endpoint
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// The error code
    pub error: String,
    /// A human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// An error while redeeming an authorization code
#[derive(Debug, Error)]
pub enum TokenExchangeError {
    /// The provider refused the exchange with an OAuth2 error
    #[error("token endpoint rejected the exchange: {}", .0.error)]
    Rejected(ErrorResponse),
    /// The provider failed without a recognizable error body
    #[error("error requesting token from authority ({status}): {body}")]
    ErrorWithBody {
        /// The HTTP status code
        status: u16,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] Box<dyn error::Error + Send + Sync + 'static>),
}

/// Redeems authorization codes for access tokens
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchanges an authorization code and its verifier for a token
    async fn exchange_code(
        &self,
        request: &CodeExchange<'_>,
    ) -> Result<TokenResponse, TokenExchangeError>;
}

#[async_trait]
impl<E: TokenEndpoint + ?Sized> TokenEndpoint for std::sync::Arc<E> {
    async fn exchange_code(
        &self,
        request: &CodeExchange<'_>,
    ) -> Result<TokenResponse, TokenExchangeError> {
        (**self).exchange_code(request).await
    }
}
