use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::bounce::{CodeExchange, ErrorResponse, TokenEndpoint, TokenExchangeError, TokenResponse};
use crate::clock::DurationSecs;
use crate::pkce::{self, PkceChallenge};
use crate::{AccessToken, ClientId, CodeChallenge, CodeVerifierRef, Origin};

/// An authorization request the mock authority cannot answer with a redirect
#[derive(Debug, Error)]
pub enum MockAuthorityError {
    /// The request has no `redirect_uri`
    #[error("authorization request is missing a redirect URI")]
    MissingRedirectUri,
    /// The `redirect_uri` is not a valid URL
    #[error("authorization request has an invalid redirect URI")]
    InvalidRedirectUri(#[from] url::ParseError),
}

/// A token request as received by the token endpoint
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TokenRequest {
    /// Must be `authorization_code`
    pub grant_type: Option<String>,
    /// The authorization code being redeemed
    pub code: Option<String>,
    /// The redirect URI the code was issued to
    pub redirect_uri: Option<String>,
    /// The verifier matching the challenge of the authorization request
    pub code_verifier: Option<String>,
    /// The client redeeming the code
    pub client_id: Option<String>,
}

impl From<&CodeExchange<'_>> for TokenRequest {
    fn from(exchange: &CodeExchange<'_>) -> Self {
        Self {
            grant_type: Some(String::from("authorization_code")),
            code: Some(exchange.code.as_str().to_owned()),
            redirect_uri: Some(exchange.redirect_uri.as_str().to_owned()),
            code_verifier: Some(exchange.verifier.as_str().to_owned()),
            client_id: Some(exchange.client_id.as_str().to_owned()),
        }
    }
}

#[derive(Debug)]
struct IssuedCode {
    redirect_uri: String,
    challenge: CodeChallenge,
}

#[derive(Debug)]
struct AuthorityState {
    signed_in: bool,
    interactive_error: Option<String>,
    issued_token: Option<AccessToken>,
    expires_in: Option<DurationSecs>,
    codes: HashMap<String, IssuedCode>,
    authorizations: usize,
    exchanges: usize,
}

/// An in-memory OAuth2 authorization server supporting PKCE
///
/// Clones share the same sessions and outstanding codes.
#[derive(Clone, Debug)]
pub struct MockAuthority {
    issuer: Url,
    client_id: ClientId,
    state: Arc<Mutex<AuthorityState>>,
}

impl MockAuthority {
    /// Constructs a new authority at `issuer` serving a single client
    ///
    /// Initially nobody is signed in, and tokens are issued with a lifetime of
    /// one hour.
    pub fn new(issuer: Url, client_id: ClientId) -> Self {
        Self {
            issuer,
            client_id,
            state: Arc::new(Mutex::new(AuthorityState {
                signed_in: false,
                interactive_error: None,
                issued_token: None,
                expires_in: Some(DurationSecs(3600)),
                codes: HashMap::new(),
                authorizations: 0,
                exchanges: 0,
            })),
        }
    }

    /// Issues `token` on every exchange instead of a random one
    ///
    /// An `expires_in` of `None` leaves the lifetime out of token responses.
    pub fn with_issued_token(self, token: AccessToken, expires_in: Option<DurationSecs>) -> Self {
        {
            let mut state = self.lock();
            state.issued_token = Some(token);
            state.expires_in = expires_in;
        }
        self
    }

    /// Sets the lifetime reported with issued tokens
    pub fn with_expires_in(self, expires_in: Option<DurationSecs>) -> Self {
        self.lock().expires_in = expires_in;
        self
    }

    /// The authorization endpoint
    pub fn authorize_url(&self) -> Url {
        let mut url = self.issuer.clone();
        url.set_path("/authorize");
        url
    }

    /// The token endpoint
    pub fn token_url(&self) -> Url {
        let mut url = self.issuer.clone();
        url.set_path("/token");
        url
    }

    /// The origin of the authority's pages
    pub fn origin(&self) -> Origin {
        Origin::of(&self.issuer)
    }

    /// The only client ID accepted
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Sets whether the user has a session with the authority
    pub fn set_signed_in(&self, signed_in: bool) {
        self.lock().signed_in = signed_in;
    }

    /// Whether the user has a session with the authority
    pub fn is_signed_in(&self) -> bool {
        self.lock().signed_in
    }

    /// Makes interactive logins fail with `error`, as if the user declined
    pub fn set_interactive_error(&self, error: Option<&str>) {
        self.lock().interactive_error = error.map(String::from);
    }

    /// The number of authorization requests received
    pub fn authorization_count(&self) -> usize {
        self.lock().authorizations
    }

    /// The number of successful code exchanges
    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges
    }

    /// Answers an authorization request with the URL to redirect the user agent to
    pub fn authorize(&self, request: &Url) -> Result<Url, MockAuthorityError> {
        let params: HashMap<String, String> = request.query_pairs().into_owned().collect();

        let redirect_uri = params
            .get("redirect_uri")
            .ok_or(MockAuthorityError::MissingRedirectUri)?;
        let mut redirect = Url::parse(redirect_uri)?;

        let outcome = self.decide(&params, redirect_uri);

        {
            let mut query = redirect.query_pairs_mut();
            match &outcome {
                Ok(code) => {
                    query.append_pair("code", code);
                }
                Err(error) => {
                    query.append_pair("error", &error.error);
                    if let Some(description) = &error.error_description {
                        query.append_pair("error_description", description);
                    }
                }
            }
            if let Some(state) = params.get("state") {
                query.append_pair("state", state);
            }
        }

        match &outcome {
            Ok(_) => tracing::debug!("mock authority issued an authorization code"),
            Err(error) => tracing::debug!(error = %error.error, "mock authority refused authorization"),
        }

        Ok(redirect)
    }

    fn decide(
        &self,
        params: &HashMap<String, String>,
        redirect_uri: &str,
    ) -> Result<String, ErrorResponse> {
        let param = |name: &str| params.get(name).map(String::as_str);
        let mut state = self.lock();
        state.authorizations += 1;

        if param("response_type") != Some("code") {
            return Err(oauth_error("unsupported_response_type", None));
        }
        if param("client_id") != Some(self.client_id.as_str()) {
            return Err(oauth_error("unauthorized_client", None));
        }
        let challenge = match (param("code_challenge"), param("code_challenge_method")) {
            (Some(challenge), Some("S256")) => CodeChallenge::new(challenge.to_owned()),
            _ => {
                return Err(oauth_error(
                    "invalid_request",
                    Some("an S256 code challenge is required"),
                ))
            }
        };

        if param("prompt") == Some("none") {
            if !state.signed_in {
                return Err(oauth_error("login_required", Some("the user is not signed in")));
            }
        } else {
            if let Some(error) = &state.interactive_error {
                return Err(oauth_error(error, None));
            }
            state.signed_in = true;
        }

        let code = pkce::generate_state().as_str().to_owned();
        state.codes.insert(
            code.clone(),
            IssuedCode {
                redirect_uri: redirect_uri.to_owned(),
                challenge,
            },
        );
        Ok(code)
    }

    /// Redeems an authorization code
    pub fn exchange(&self, request: &TokenRequest) -> Result<TokenResponse, ErrorResponse> {
        if request.grant_type.as_deref() != Some("authorization_code") {
            return Err(oauth_error("unsupported_grant_type", None));
        }

        let (code, verifier, redirect_uri) = match (
            request.code.as_deref(),
            request.code_verifier.as_deref(),
            request.redirect_uri.as_deref(),
        ) {
            (Some(code), Some(verifier), Some(redirect_uri)) => (code, verifier, redirect_uri),
            _ => {
                return Err(oauth_error(
                    "invalid_request",
                    Some("code, code_verifier, and redirect_uri are required"),
                ))
            }
        };

        if request.client_id.as_deref() != Some(self.client_id.as_str()) {
            return Err(oauth_error("invalid_client", None));
        }

        let mut state = self.lock();
        let issued = state
            .codes
            .remove(code)
            .ok_or_else(|| oauth_error("invalid_grant", Some("unknown or already redeemed code")))?;

        if issued.redirect_uri != redirect_uri {
            return Err(oauth_error("invalid_grant", Some("redirect URI mismatch")));
        }

        if !PkceChallenge::verify(CodeVerifierRef::from_str(verifier), &issued.challenge) {
            tracing::warn!("mock authority rejected a code verifier");
            return Err(oauth_error("invalid_grant", Some("code verifier mismatch")));
        }

        state.exchanges += 1;
        let access_token = match &state.issued_token {
            Some(token) => token.clone(),
            None => AccessToken::new(pkce::generate_state().as_str().to_owned()),
        };

        Ok(TokenResponse {
            access_token,
            token_type: Some(String::from("Bearer")),
            expires_in: state.expires_in,
        })
    }

    fn lock(&self) -> MutexGuard<'_, AuthorityState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn oauth_error(error: &str, description: Option<&str>) -> ErrorResponse {
    ErrorResponse {
        error: error.to_owned(),
        error_description: description.map(String::from),
    }
}

#[async_trait]
impl TokenEndpoint for MockAuthority {
    async fn exchange_code(
        &self,
        request: &CodeExchange<'_>,
    ) -> Result<TokenResponse, TokenExchangeError> {
        self.exchange(&TokenRequest::from(request))
            .map_err(TokenExchangeError::Rejected)
    }
}
