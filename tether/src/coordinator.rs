//! The application-facing session façade
//!
//! [`SessionRefreshCoordinator`] hands out the cached credential while it is
//! usable. Otherwise it runs a refresh: a silent bounce in a hidden frame,
//! then an interactive login in a popup (or by navigating the main window).
//! Concurrent callers share a single in-flight refresh and all observe its
//! outcome.

use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

use crate::bounce::BounceMode;
use crate::channel::{
    BounceFailure, ChannelError, ContextKind, ContextOpener, CrossContextChannel, IssuedToken,
    MessageBus, DEFAULT_POLL_INTERVAL, TOKEN_EXCHANGE_FAILED,
};
use crate::clock::{Clock, System};
use crate::store::CredentialStore;
use crate::{AccessToken, CredentialLifetimeConfig, Origin};

/// Navigates the main application window
pub trait Navigator: Send + Sync {
    /// The URL the main window is showing
    fn current_url(&self) -> Url;

    /// Navigates the main window away to `url`
    fn navigate(&self, url: &Url);
}

/// How to obtain a token when the silent bounce fails
#[derive(Clone, Default)]
pub enum InteractiveMode {
    /// Open a popup and wait for it to report back
    #[default]
    Popup,
    /// Navigate the main window to the bounce page
    ///
    /// The application is unloaded; the bounce returns to the remembered URL
    /// once the credential is stored.
    Redirect(Arc<dyn Navigator>),
}

impl fmt::Debug for InteractiveMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InteractiveMode::Popup => f.write_str("Popup"),
            InteractiveMode::Redirect(_) => f.write_str("Redirect"),
        }
    }
}

/// Configuration for a [`SessionRefreshCoordinator`]
#[derive(Clone, Debug)]
pub struct SessionConfig<C = System> {
    bounce_url: Url,
    bounce_origin: Origin,
    silent_timeout: Duration,
    interactive_timeout: Duration,
    poll_interval: Duration,
    interactive_mode: InteractiveMode,
    lifetime: CredentialLifetimeConfig<C>,
}

impl SessionConfig {
    /// Constructs a configuration for the bounce page at `bounce_url`
    ///
    /// By default, silent bounces time out after 10 seconds, interactive
    /// popups after 120 seconds, and a popup is checked for having been closed
    /// by the user every second. Replies are expected from the origin of
    /// `bounce_url`.
    pub fn new(bounce_url: Url) -> Self {
        let bounce_origin = Origin::of(&bounce_url);
        Self {
            bounce_url,
            bounce_origin,
            silent_timeout: Duration::from_secs(10),
            interactive_timeout: Duration::from_secs(120),
            poll_interval: DEFAULT_POLL_INTERVAL,
            interactive_mode: InteractiveMode::Popup,
            lifetime: CredentialLifetimeConfig::default(),
        }
    }
}

impl<C> SessionConfig<C> {
    /// Sets how long to wait on the hidden frame
    pub fn with_silent_timeout(mut self, timeout: Duration) -> Self {
        self.silent_timeout = timeout;
        self
    }

    /// Sets how long to wait on the interactive popup
    pub fn with_interactive_timeout(mut self, timeout: Duration) -> Self {
        self.interactive_timeout = timeout;
        self
    }

    /// Sets how often to check whether the user closed a popup
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets how interactive logins are performed
    pub fn with_interactive_mode(mut self, mode: InteractiveMode) -> Self {
        self.interactive_mode = mode;
        self
    }

    /// Overrides the origin replies are expected from
    pub fn with_bounce_origin(mut self, origin: Origin) -> Self {
        self.bounce_origin = origin;
        self
    }

    /// Sets the lifetime configuration used to judge and stamp credentials
    pub fn with_lifetime_config<D>(self, lifetime: CredentialLifetimeConfig<D>) -> SessionConfig<D> {
        SessionConfig {
            bounce_url: self.bounce_url,
            bounce_origin: self.bounce_origin,
            silent_timeout: self.silent_timeout,
            interactive_timeout: self.interactive_timeout,
            poll_interval: self.poll_interval,
            interactive_mode: self.interactive_mode,
            lifetime,
        }
    }

    /// The bounce page
    pub fn bounce_url(&self) -> &Url {
        &self.bounce_url
    }

    /// The URL loading the bounce page in `mode`
    pub fn bounce_url_for(&self, mode: BounceMode) -> Url {
        let mut url = self.bounce_url.clone();
        url.query_pairs_mut().append_pair("mode", mode.as_str());
        url
    }
}

/// Why a refresh failed
///
/// Every caller waiting on the same refresh receives a clone of the same error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The login popup could not be opened
    #[error("the login popup was blocked; allow popups for this site and try again")]
    PopupBlocked,
    /// The bounce context did not reply in time
    #[error("timed out waiting for the identity provider")]
    Timeout,
    /// The user closed the login popup
    #[error("login was cancelled")]
    UserCancelled,
    /// The identity provider reported an error
    #[error("identity provider error: {error}")]
    IdentityProvider {
        /// The OAuth2 error code
        error: String,
        /// The provider's description, if any
        description: Option<String>,
    },
    /// The authorization code could not be redeemed
    #[error("unable to redeem authorization code: {0}")]
    TokenExchange(String),
    /// The main window was navigated to the identity provider
    ///
    /// The application will be reloaded at the remembered return URL once
    /// login completes; no token will be delivered to this caller.
    #[error("navigated away to complete login")]
    NavigatedAway,
    /// The refresh ended without producing an outcome
    #[error("the refresh was abandoned before completing")]
    RefreshAbandoned,
}

impl From<ChannelError> for AuthError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::Blocked(_) => AuthError::PopupBlocked,
            ChannelError::Timeout(_) => AuthError::Timeout,
            ChannelError::UserCancelled(_) => AuthError::UserCancelled,
            ChannelError::Bounce(failure) => failure.into(),
            ChannelError::Disconnected => AuthError::RefreshAbandoned,
        }
    }
}

impl From<BounceFailure> for AuthError {
    fn from(failure: BounceFailure) -> Self {
        if failure.error == TOKEN_EXCHANGE_FAILED {
            AuthError::TokenExchange(failure.error_description.unwrap_or(failure.error))
        } else {
            AuthError::IdentityProvider {
                error: failure.error,
                description: failure.error_description,
            }
        }
    }
}

/// A source of bearer tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A token that is currently usable, refreshing if necessary
    async fn valid_token(&self) -> Result<AccessToken, AuthError>;

    /// A freshly obtained token, ignoring any cached one
    async fn refresh(&self) -> Result<AccessToken, AuthError>;
}

#[async_trait]
impl<T: TokenProvider + ?Sized> TokenProvider for Arc<T> {
    async fn valid_token(&self) -> Result<AccessToken, AuthError> {
        (**self).valid_token().await
    }

    async fn refresh(&self) -> Result<AccessToken, AuthError> {
        (**self).refresh().await
    }
}

type RefreshOutcome = Option<Result<AccessToken, AuthError>>;

/// Keeps the application supplied with a usable access token
///
/// Clones share the same in-flight refresh. Independently constructed
/// coordinators do not.
pub struct SessionRefreshCoordinator<C = System> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for SessionRefreshCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C> {
    config: SessionConfig<C>,
    store: CredentialStore,
    channel: CrossContextChannel,
    in_flight: Mutex<Option<watch::Receiver<RefreshOutcome>>>,
}

impl<C> SessionRefreshCoordinator<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a new coordinator
    ///
    /// Bounce contexts are opened with `opener` and reply on `bus`, the
    /// message bus of the application window.
    pub fn new(
        config: SessionConfig<C>,
        store: CredentialStore,
        bus: MessageBus,
        opener: Arc<dyn ContextOpener>,
    ) -> Self {
        let channel = CrossContextChannel::new(bus, opener).with_poll_interval(config.poll_interval);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                channel,
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// The credential store backing this coordinator
    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    /// Whether a refresh is currently running
    pub fn has_refresh_in_flight(&self) -> bool {
        lock(&self.inner.in_flight).is_some()
    }

    /// Returns the cached token if it is usable, refreshing the session otherwise
    pub async fn get_valid_token(&self) -> Result<AccessToken, AuthError> {
        if let Some(credential) = self.inner.store.read().await {
            let status = self.inner.config.lifetime.status_of(&credential);
            if status.is_usable() {
                tracing::trace!(expiry = credential.expiry().0, "using cached credential");
                return Ok(credential.access_token().to_owned());
            }
            tracing::debug!(?status, "cached credential is no longer usable");
        }

        self.refresh_session().await
    }

    /// Obtains a new token
    ///
    /// If a refresh is already running, waits for its outcome instead of
    /// starting another. The refresh itself runs on its own task, so it is
    /// not abandoned if the caller that started it goes away.
    pub async fn refresh_session(&self) -> Result<AccessToken, AuthError> {
        let mut outcome = self.join_or_start();

        let settled = match outcome.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            Err(_) => None,
        };
        settled.unwrap_or(Err(AuthError::RefreshAbandoned))
    }

    fn join_or_start(&self) -> watch::Receiver<RefreshOutcome> {
        let mut slot = lock(&self.inner.in_flight);

        if let Some(existing) = &*slot {
            if existing.has_changed().is_ok() {
                tracing::trace!("joining in-flight refresh");
                return existing.clone();
            }
            tracing::debug!("discarding refresh that ended without an outcome");
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());
        drop(slot);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.run_refresh().await;
            lock(&inner.in_flight).take();
            let _ = tx.send(Some(result));
        });

        rx
    }
}

impl<C> Inner<C>
where
    C: Clock + Send + Sync,
{
    async fn run_refresh(&self) -> Result<AccessToken, AuthError> {
        tracing::debug!("starting session refresh");

        let issued = match self
            .bounce(BounceMode::Silent, ContextKind::Frame, self.config.silent_timeout)
            .await
        {
            Ok(issued) => issued,
            Err(error) => {
                tracing::debug!(%error, "silent refresh failed, escalating to interactive login");
                let interactive = match &self.config.interactive_mode {
                    InteractiveMode::Popup => {
                        self.bounce(
                            BounceMode::Login,
                            ContextKind::Popup,
                            self.config.interactive_timeout,
                        )
                        .await
                    }
                    InteractiveMode::Redirect(navigator) => {
                        self.navigate_away(navigator.as_ref()).await
                    }
                };

                match interactive {
                    Ok(issued) => issued,
                    Err(error) => {
                        tracing::warn!(
                            error = (&error as &dyn error::Error),
                            "session refresh failed"
                        );
                        return Err(error);
                    }
                }
            }
        };

        let credential = self
            .config
            .lifetime
            .create_credential(&issued.token, issued.expires_in);
        self.store.write(&credential).await;

        tracing::info!(
            lifetime = credential.lifetime().0,
            expiry = credential.expiry().0,
            "session refreshed"
        );

        Ok(issued.token)
    }

    async fn bounce(
        &self,
        mode: BounceMode,
        kind: ContextKind,
        timeout: Duration,
    ) -> Result<IssuedToken, AuthError> {
        let url = self.config.bounce_url_for(mode);
        let handle = self
            .channel
            .open(&url, self.config.bounce_origin.clone(), kind)?;
        Ok(handle.await_message(timeout).await?)
    }

    async fn navigate_away(&self, navigator: &dyn Navigator) -> Result<IssuedToken, AuthError> {
        let return_url = navigator.current_url();
        self.store.remember_return_url(&return_url).await;

        let url = self.config.bounce_url_for(BounceMode::Login);
        tracing::debug!(%return_url, "navigating main window to interactive login");
        navigator.navigate(&url);

        Err(AuthError::NavigatedAway)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl<C> TokenProvider for SessionRefreshCoordinator<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn valid_token(&self) -> Result<AccessToken, AuthError> {
        self.get_valid_token().await
    }

    async fn refresh(&self) -> Result<AccessToken, AuthError> {
        self.refresh_session().await
    }
}

impl<C: fmt::Debug> fmt::Debug for SessionRefreshCoordinator<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionRefreshCoordinator")
            .field("config", &self.inner.config)
            .field("store", &self.inner.store)
            .field("refresh_in_flight", &lock(&self.inner.in_flight).is_some())
            .finish()
    }
}
