//! The controller hosted by a bounce context
//!
//! A bounce context is a popup, a hidden frame, or (for navigation-based
//! logins) the top-level window itself, loaded at the application's redirect
//! URI. Each page load runs a [`BounceController`] once:
//!
//! 1. Loaded with `?mode=silent` or `?mode=login`, it generates a fresh proof
//!    key, remembers the verifier in storage under a random state, and
//!    navigates to the provider's authorization endpoint. It stops in
//!    [`BounceState::AwaitCallback`].
//! 2. Loaded with `?code=…&state=…`, it redeems the code together with the
//!    remembered verifier, persists the resulting credential, and reports back
//!    to the opener.
//! 3. Loaded with `?error=…&state=…`, it either escalates a silent attempt to an
//!    interactive one, or reports the error back to the opener.
//!
//! The controller never retries on its own.

use std::{collections::HashMap, error, fmt};

use url::Url;

use crate::channel::{
    BounceFailure, BounceMessage, IssuedToken, INVALID_REQUEST, INVALID_STATE,
    TOKEN_EXCHANGE_FAILED,
};
use crate::clock::{Clock, System};
use crate::pkce::{self, PkceChallenge};
use crate::store::CredentialStore;
use crate::{
    AuthorizationCode, ClientId, ClientIdRef, CredentialLifetimeConfig, Origin, OriginRef, State,
};

mod endpoint;
#[cfg(feature = "oauth2")]
mod http;
mod pending;

pub use endpoint::{
    CodeExchange, ErrorResponse, TokenEndpoint, TokenExchangeError, TokenResponse,
};
#[cfg(feature = "oauth2")]
pub use http::{FormBody, HttpTokenEndpoint, JsonBody, RequestType};
pub use pending::{BounceMode, UnknownMode};

use pending::PendingAuthorization;

/// Raised when the verifier cannot be remembered across the provider round trip
pub const STORAGE_UNAVAILABLE: &str = "storage_unavailable";

/// Provider errors that mean a silent attempt needs the user
const INTERACTION_REQUIRED: &[&str] = &["login_required", "interaction_required", "consent_required"];

/// The kind of browsing context hosting the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKind {
    /// A popup window opened by the application
    Popup,
    /// A hidden frame embedded by the application
    Frame,
    /// The top-level window, reached by navigating away from the application
    TopLevel,
}

/// The environment of the browsing context running the controller
pub trait BounceHost: Send + Sync {
    /// The URL this context is currently showing
    fn location(&self) -> Url;

    /// The kind of context this is
    fn kind(&self) -> HostKind;

    /// Navigates this context to `url`
    fn navigate(&self, url: &Url);

    /// Posts `message` to the opening context, provided it has `target_origin`
    fn post_to_opener(&self, message: &BounceMessage, target_origin: &OriginRef);

    /// Closes this context
    fn close(&self);
}

/// The steps of a bounce
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BounceState {
    /// Inspecting the current location
    Start,
    /// Navigated to the provider; a later page load handles the callback
    AwaitCallback,
    /// Redeeming an authorization code
    ExchangingCode,
    /// A token was obtained and reported
    DoneSuccess,
    /// The bounce failed and the failure was reported
    DoneError,
}

impl BounceState {
    /// Whether the bounce has finished
    pub fn is_terminal(self) -> bool {
        matches!(self, BounceState::DoneSuccess | BounceState::DoneError)
    }
}

/// Identity provider settings used by bounce contexts
#[derive(Clone, Debug)]
pub struct BounceConfig {
    client_id: ClientId,
    authorize_url: Url,
    redirect_uri: Url,
    scope: String,
    opener_origin: Origin,
}

impl BounceConfig {
    /// Constructs a new configuration
    ///
    /// `redirect_uri` is the URL of the bounce page itself. Replies are
    /// addressed to the origin of the redirect URI unless overridden with
    /// [`with_opener_origin()`][Self::with_opener_origin()]. The scope defaults
    /// to `openid profile`.
    pub fn new(client_id: ClientId, authorize_url: Url, redirect_uri: Url) -> Self {
        let opener_origin = Origin::of(&redirect_uri);
        Self {
            client_id,
            authorize_url,
            redirect_uri,
            scope: String::from("openid profile"),
            opener_origin,
        }
    }

    /// Sets the scope requested from the provider
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets the origin replies are addressed to
    pub fn with_opener_origin(mut self, opener_origin: Origin) -> Self {
        self.opener_origin = opener_origin;
        self
    }

    /// The client ID
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The redirect URI, which is also the bounce page
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Builds the authorization request URL for `mode`
    pub fn authorization_url(&self, mode: BounceMode, pkce: &PkceChallenge, state: &State) -> Url {
        let mut url = self.authorize_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", self.client_id.as_str())
                .append_pair("redirect_uri", self.redirect_uri.as_str())
                .append_pair("scope", &self.scope)
                .append_pair("state", state.as_str())
                .append_pair("code_challenge", pkce.challenge().as_str())
                .append_pair("code_challenge_method", pkce.method().as_str());
            if mode == BounceMode::Silent {
                query.append_pair("prompt", "none");
            }
        }
        url
    }
}

/// Drives one page load of a bounce context
pub struct BounceController<H, E, C = System> {
    host: H,
    endpoint: E,
    config: BounceConfig,
    store: CredentialStore,
    lifetime: CredentialLifetimeConfig<C>,
    state: BounceState,
}

impl<H, E> BounceController<H, E, System>
where
    H: BounceHost,
    E: endpoint::TokenEndpoint,
{
    /// Constructs a new controller for the context described by `host`
    pub fn new(host: H, endpoint: E, config: BounceConfig, store: CredentialStore) -> Self {
        Self {
            host,
            endpoint,
            config,
            store,
            lifetime: CredentialLifetimeConfig::default(),
            state: BounceState::Start,
        }
    }
}

impl<H, E, C> BounceController<H, E, C>
where
    H: BounceHost,
    E: endpoint::TokenEndpoint,
    C: Clock + Send + Sync,
{
    /// Sets the lifetime configuration used for stored credentials
    pub fn with_lifetime_config<D>(
        self,
        lifetime: CredentialLifetimeConfig<D>,
    ) -> BounceController<H, E, D> {
        BounceController {
            host: self.host,
            endpoint: self.endpoint,
            config: self.config,
            store: self.store,
            lifetime,
            state: self.state,
        }
    }

    /// The state the controller is in
    pub fn state(&self) -> BounceState {
        self.state
    }

    /// Handles the current page load
    ///
    /// Returns [`BounceState::AwaitCallback`] if the context was sent to the
    /// provider, or a terminal state once the bounce has been reported.
    pub async fn run(&mut self) -> BounceState {
        self.transition(BounceState::Start);

        let location = self.host.location();
        let params: HashMap<String, String> = location.query_pairs().into_owned().collect();
        let state = params.get("state").map(|s| State::new(s.clone()));

        if let Some(error) = params.get("error") {
            let failure = BounceFailure {
                error: error.clone(),
                error_description: params.get("error_description").cloned(),
            };
            return self.handle_error_callback(failure, state).await;
        }

        if let Some(code) = params.get("code") {
            let code = AuthorizationCode::new(code.clone());
            return self.handle_code_callback(code, state).await;
        }

        match params.get("mode").map(|m| m.parse::<BounceMode>()) {
            Some(Ok(mode)) => self.start_authorization(mode).await,
            Some(Err(_)) | None => {
                self.finish(Err(BounceFailure::new(INVALID_REQUEST)
                    .with_description("expected an authorization code, an error, or a mode")))
                    .await
            }
        }
    }

    async fn start_authorization(&mut self, mode: BounceMode) -> BounceState {
        let pkce = PkceChallenge::generate();
        let state = pkce::generate_state();
        let url = self.config.authorization_url(mode, &pkce, &state);

        let pending = PendingAuthorization {
            verifier: pkce.into_verifier(),
            mode,
        };

        if let Err(error) = pending::save(self.store.storage().as_ref(), &state, &pending).await {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to remember verifier, cannot start authorization"
            );
            return self
                .finish(Err(BounceFailure::new(STORAGE_UNAVAILABLE)))
                .await;
        }

        tracing::debug!(%mode, "sending bounce context to the identity provider");
        self.host.navigate(&url);
        self.transition(BounceState::AwaitCallback)
    }

    async fn handle_error_callback(
        &mut self,
        failure: BounceFailure,
        state: Option<State>,
    ) -> BounceState {
        let pending = match &state {
            Some(state) => pending::take(self.store.storage().as_ref(), state).await,
            None => None,
        };

        let can_escalate = self.host.kind() != HostKind::Frame
            && matches!(&pending, Some(p) if p.mode == BounceMode::Silent)
            && INTERACTION_REQUIRED.contains(&failure.error.as_str());

        if can_escalate {
            tracing::debug!(
                error = %failure.error,
                "silent authorization needs the user, escalating to interactive login"
            );
            return self.start_authorization(BounceMode::Login).await;
        }

        tracing::debug!(error = %failure.error, "identity provider returned an error");
        self.finish(Err(failure)).await
    }

    async fn handle_code_callback(
        &mut self,
        code: AuthorizationCode,
        state: Option<State>,
    ) -> BounceState {
        let pending = match &state {
            Some(state) => pending::take(self.store.storage().as_ref(), state).await,
            None => None,
        };

        let pending = match pending {
            Some(pending) => pending,
            None => {
                tracing::warn!("callback does not match any pending authorization request");
                return self
                    .finish(Err(BounceFailure::new(INVALID_STATE)
                        .with_description("no pending authorization request for this state")))
                    .await;
            }
        };

        self.transition(BounceState::ExchangingCode);

        let exchange = endpoint::CodeExchange {
            code: &code,
            verifier: &pending.verifier,
            redirect_uri: self.config.redirect_uri(),
            client_id: self.config.client_id(),
        };

        match self.endpoint.exchange_code(&exchange).await {
            Ok(response) => {
                let credential = self
                    .lifetime
                    .create_credential(&response.access_token, response.expires_in);
                self.store.write(&credential).await;

                tracing::info!(
                    lifetime = credential.lifetime().0,
                    expiry = credential.expiry().0,
                    "stored new credential"
                );

                self.finish(Ok(IssuedToken {
                    token: response.access_token,
                    expires_in: Some(credential.lifetime()),
                }))
                .await
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to redeem authorization code"
                );
                self.finish(Err(
                    BounceFailure::new(TOKEN_EXCHANGE_FAILED).with_description(error.to_string())
                ))
                .await
            }
        }
    }

    async fn finish(&mut self, result: Result<IssuedToken, BounceFailure>) -> BounceState {
        let terminal = if result.is_ok() {
            BounceState::DoneSuccess
        } else {
            BounceState::DoneError
        };

        match self.host.kind() {
            HostKind::Popup | HostKind::Frame => {
                let message = match result {
                    Ok(issued) => BounceMessage::Success(issued),
                    Err(failure) => BounceMessage::Error(failure),
                };
                self.host
                    .post_to_opener(&message, &self.config.opener_origin);

                if self.host.kind() == HostKind::Popup {
                    self.host.close();
                }
            }
            HostKind::TopLevel => match result {
                Ok(_) => match self.store.take_return_url().await {
                    Some(url) => {
                        tracing::debug!(return_url = %url, "returning to the application");
                        self.host.navigate(&url);
                    }
                    None => tracing::warn!("login complete, but no return URL was remembered"),
                },
                Err(failure) => {
                    tracing::warn!(%failure, "navigation-based login failed");
                }
            },
        }

        self.transition(terminal)
    }

    fn transition(&mut self, next: BounceState) -> BounceState {
        if self.state != next {
            tracing::trace!(from = ?self.state, to = ?next, "bounce state transition");
        }
        self.state = next;
        next
    }
}

impl<H, E, C> fmt::Debug for BounceController<H, E, C>
where
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BounceController")
            .field("config", &self.config)
            .field("lifetime", &self.lifetime)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
