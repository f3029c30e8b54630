//! Middleware to authenticate outgoing requests with a session token
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AuthenticatingMiddleware`] in the middleware stack to attach
//! `Authorization: Bearer <token>` from a [`TokenProvider`], such as a
//! [`SessionRefreshCoordinator`](tether::SessionRefreshCoordinator), to each
//! outbound request.
//!
//! If the backend answers `401 Unauthorized`, the middleware asks the
//! provider for a fresh token once and replays the request once. A second
//! rejection is handed back to the caller as is.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place and the request is never replayed.
//!
//! ```
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use tether_reqwest::{AuthenticatingMiddleware, BackendTargetMiddleware};
//! # use tether::{bounce::BounceConfig, sim, ClientId, SessionConfig};
//! # use url::Url;
//! #
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let client_id = ClientId::from_static("grpc-client");
//! # let authority = sim::MockAuthority::new(Url::parse("https://idp.example.com/").unwrap(), client_id.clone());
//! # let bounce_url = Url::parse("https://app.example.com/static/bounce.html").unwrap();
//! # let browser = sim::SimulatedBrowser::new(
//! #     authority.clone(),
//! #     Url::parse("https://app.example.com/").unwrap(),
//! #     BounceConfig::new(client_id, authority.authorize_url(), bounce_url.clone()),
//! # );
//! # let coordinator = browser.coordinator(SessionConfig::new(bounce_url));
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(BackendTargetMiddleware::from_static("greeter"))
//!     .with(AuthenticatingMiddleware::new(coordinator))
//!     .build();
//!
//! let req = client
//!     .get("https://api.example.com/greeter.Greeter/SayHello");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The middleware can also be configured to authenticate only some requests.
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a token to a request.
//!
//! ```
//! use predicates::prelude::PredicateBooleanExt;
//! use tether_reqwest::{AuthenticatingMiddleware, HttpsOnly, TargetsBackend};
//! # use std::sync::Arc;
//! # use tether::{AccessToken, AuthError, TokenProvider};
//! # struct Const;
//! # #[async_trait::async_trait]
//! # impl TokenProvider for Const {
//! #     async fn valid_token(&self) -> Result<AccessToken, AuthError> { Ok(AccessToken::from_static("t")) }
//! #     async fn refresh(&self) -> Result<AccessToken, AuthError> { Ok(AccessToken::from_static("t")) }
//! # }
//! # let provider = Arc::new(Const);
//!
//! AuthenticatingMiddleware::new(provider)
//!     .with_predicate(HttpsOnly.and(TargetsBackend::new("greeter")));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use bytes::{BufMut, BytesMut};
use predicates::{constant::BooleanPredicate, prelude::*, reflection};
use reqwest::{
    header::{self, HeaderName, HeaderValue, InvalidHeaderValue},
    Request, Response, StatusCode,
};
use reqwest_middleware::{Error, Middleware, Next, Result};
use tether::{AccessTokenRef, TokenProvider};

/// The header identifying the logical backend a request is routed to
pub const BACKEND_TARGET: HeaderName = HeaderName::from_static("x-backend-target");

/// A middleware that authenticates outgoing requests and replays them once
/// after refreshing a rejected token
#[derive(Clone, Debug)]
pub struct AuthenticatingMiddleware<T, P = BooleanPredicate> {
    provider: T,
    predicate: P,
    retry_status: StatusCode,
}

impl<T> AuthenticatingMiddleware<T, BooleanPredicate> {
    /// Construct a new middleware from a token provider
    ///
    /// By default, every request is authenticated and a `401 Unauthorized`
    /// response triggers a refresh. To authenticate only some requests,
    /// provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(provider: T) -> Self {
        Self {
            provider,
            predicate: predicate::always(),
            retry_status: StatusCode::UNAUTHORIZED,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AuthenticatingMiddleware<T, P> {
        AuthenticatingMiddleware {
            provider: self.provider,
            predicate,
            retry_status: self.retry_status,
        }
    }
}

impl<T, P> AuthenticatingMiddleware<T, P> {
    /// Sets the response status indicating that the token was rejected
    pub fn with_retry_status(mut self, status: StatusCode) -> Self {
        self.retry_status = status;
        self
    }
}

fn bearer(token: &AccessTokenRef) -> std::result::Result<HeaderValue, InvalidHeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = HeaderValue::from_maybe_shared(header_value.freeze())?;
    value.set_sensitive(true);
    Ok(value)
}

fn authorize(req: &mut Request, token: &AccessTokenRef) -> Result<()> {
    let value = bearer(token).map_err(Error::middleware)?;
    req.headers_mut().insert(header::AUTHORIZATION, value);
    Ok(())
}

#[async_trait::async_trait]
impl<T, P> Middleware for AuthenticatingMiddleware<T, P>
where
    T: TokenProvider + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        let token = self.provider.valid_token().await.map_err(|error| {
            tracing::warn!(%error, "unable to obtain a token for outbound request");
            Error::middleware(error)
        })?;

        let replay = req.try_clone();
        authorize(&mut req, &token)?;

        let resp = next.clone().run(req, extensions).await?;
        if resp.status() != self.retry_status {
            return Ok(resp);
        }

        let mut replay = match replay {
            Some(replay) => replay,
            None => {
                tracing::debug!(
                    response.status = resp.status().as_u16(),
                    "token rejected, but the request body cannot be replayed"
                );
                return Ok(resp);
            }
        };

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "token rejected, refreshing session and replaying request once"
        );

        let token = self.provider.refresh().await.map_err(|error| {
            tracing::warn!(%error, "unable to refresh session after token was rejected");
            Error::middleware(error)
        })?;

        authorize(&mut replay, &token)?;
        next.run(replay, extensions).await
    }
}

/// A middleware that names the backend each request is routed to
///
/// An existing `x-backend-target` header is left in place.
#[derive(Clone, Debug)]
pub struct BackendTargetMiddleware {
    target: HeaderValue,
}

impl BackendTargetMiddleware {
    /// Construct a new middleware routing to `target`
    pub fn try_new(target: &str) -> std::result::Result<Self, InvalidHeaderValue> {
        Ok(Self {
            target: HeaderValue::from_str(target)?,
        })
    }

    /// Construct a new middleware routing to a target known to be a valid header value
    ///
    /// # Panics
    ///
    /// Panics if `target` contains characters not allowed in a header value.
    pub const fn from_static(target: &'static str) -> Self {
        Self {
            target: HeaderValue::from_static(target),
        }
    }
}

#[async_trait::async_trait]
impl Middleware for BackendTargetMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        req.headers_mut()
            .entry(BACKEND_TARGET)
            .or_insert_with(|| self.target.clone());

        next.run(req, extensions).await
    }
}

/// Only attach a token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                "scheme",
                req.url().scheme().to_owned(),
            ))
        })
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach a token if the request is routed to the named backend
///
/// Place the [`BackendTargetMiddleware`] ahead of the
/// [`AuthenticatingMiddleware`] so the routing header is already present.
#[derive(Clone, Debug)]
pub struct TargetsBackend {
    target: String,
}

impl TargetsBackend {
    /// Construct a new predicate matching the backend named `target`
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    fn target_of(req: &Request) -> Option<&str> {
        req.headers()
            .get(&BACKEND_TARGET)
            .and_then(|v| v.to_str().ok())
    }
}

impl Predicate<Request> for TargetsBackend {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        Self::target_of(req) == Some(self.target.as_str())
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                "target",
                Self::target_of(req).unwrap_or("<none>").to_owned(),
            ))
        })
    }
}

impl reflection::PredicateReflection for TargetsBackend {}
impl fmt::Display for TargetsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("backend target == ")?;
        f.write_str(&self.target)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;
    use tether::{AccessToken, AuthError};

    use super::*;

    const STALE_TOKEN: &str = "stale-token";
    const FRESH_TOKEN: &str = "fresh-token";

    #[derive(Default)]
    struct CountingProvider {
        fail_refresh: bool,
        valid_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TokenProvider for CountingProvider {
        async fn valid_token(&self) -> std::result::Result<AccessToken, AuthError> {
            self.valid_calls.fetch_add(1, Ordering::AcqRel);
            Ok(AccessToken::from_static(STALE_TOKEN))
        }

        async fn refresh(&self) -> std::result::Result<AccessToken, AuthError> {
            self.refresh_calls.fetch_add(1, Ordering::AcqRel);
            if self.fail_refresh {
                Err(AuthError::UserCancelled)
            } else {
                Ok(AccessToken::from_static(FRESH_TOKEN))
            }
        }
    }

    /// Answers each request with the next scripted status, recording headers
    struct ScriptedBackend {
        statuses: Mutex<VecDeque<StatusCode>>,
        seen: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedBackend {
        fn new(statuses: &[StatusCode]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<Option<String>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Middleware for ScriptedBackend {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization = req
                .headers()
                .get(header::AUTHORIZATION)
                .map(|v| v.to_str().expect("authorization header was not valid UTF-8").to_owned());
            self.seen.lock().unwrap().push(authorization);

            let status = self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(StatusCode::OK);

            Ok(http::Response::builder()
                .status(status)
                .body("")
                .unwrap()
                .into())
        }
    }

    fn client<P>(
        middleware: AuthenticatingMiddleware<Arc<CountingProvider>, P>,
        backend: &Arc<ScriptedBackend>,
    ) -> reqwest_middleware::ClientWithMiddleware
    where
        P: Predicate<Request> + Send + Sync + 'static,
    {
        ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(backend.clone())
            .build()
    }

    fn bearer_of(token: &str) -> Option<String> {
        Some(format!("Bearer {}", token))
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_attaches_the_current_token() {
            let provider = Arc::new(CountingProvider::default());
            let backend = Arc::new(ScriptedBackend::new(&[]));
            let client = client(AuthenticatingMiddleware::new(provider.clone()), &backend);

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(backend.seen(), vec![bearer_of(STALE_TOKEN)]);
            assert_eq!(provider.refresh_calls.load(Ordering::Acquire), 0);
        }

        #[tokio::test]
        async fn middleware_marks_the_header_sensitive() {
            let value = bearer(AccessTokenRef::from_static(STALE_TOKEN)).unwrap();

            assert!(value.is_sensitive());
            assert_eq!(value.to_str().unwrap(), "Bearer stale-token");
        }

        mod and_predicate_evaluates_to_ignore {
            use super::*;

            #[tokio::test]
            async fn middleware_does_not_attach_or_fetch_a_token() {
                let provider = Arc::new(CountingProvider::default());
                let backend = Arc::new(ScriptedBackend::new(&[]));
                let client = client(
                    AuthenticatingMiddleware::new(provider.clone())
                        .with_predicate(predicate::never()),
                    &backend,
                );

                let resp = client.get("https://example.com").send().await.unwrap();

                assert_eq!(resp.status(), StatusCode::OK);
                assert_eq!(backend.seen(), vec![None]);
                assert_eq!(provider.valid_calls.load(Ordering::Acquire), 0);
            }
        }
    }

    mod when_the_token_is_rejected {
        use super::*;

        #[tokio::test]
        async fn middleware_refreshes_and_replays_once() {
            let provider = Arc::new(CountingProvider::default());
            let backend = Arc::new(ScriptedBackend::new(&[StatusCode::UNAUTHORIZED]));
            let client = client(AuthenticatingMiddleware::new(provider.clone()), &backend);

            let resp = client
                .post("https://example.com")
                .body("payload")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(
                backend.seen(),
                vec![bearer_of(STALE_TOKEN), bearer_of(FRESH_TOKEN)]
            );
            assert_eq!(provider.refresh_calls.load(Ordering::Acquire), 1);
        }

        #[tokio::test]
        async fn second_rejection_is_returned_without_another_refresh() {
            let provider = Arc::new(CountingProvider::default());
            let backend = Arc::new(ScriptedBackend::new(&[
                StatusCode::UNAUTHORIZED,
                StatusCode::UNAUTHORIZED,
            ]));
            let client = client(AuthenticatingMiddleware::new(provider.clone()), &backend);

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(backend.seen().len(), 2);
            assert_eq!(provider.refresh_calls.load(Ordering::Acquire), 1);
        }

        #[tokio::test]
        async fn refresh_failures_are_propagated() {
            let provider = Arc::new(CountingProvider {
                fail_refresh: true,
                ..CountingProvider::default()
            });
            let backend = Arc::new(ScriptedBackend::new(&[StatusCode::UNAUTHORIZED]));
            let client = client(AuthenticatingMiddleware::new(provider.clone()), &backend);

            let result = client.get("https://example.com").send().await;

            assert!(matches!(result, Err(Error::Middleware(_))));
            assert_eq!(backend.seen().len(), 1);
        }

        #[tokio::test]
        async fn custom_retry_status_is_honored() {
            let provider = Arc::new(CountingProvider::default());
            let backend = Arc::new(ScriptedBackend::new(&[
                StatusCode::UNAUTHORIZED,
                StatusCode::FORBIDDEN,
            ]));
            let client = client(
                AuthenticatingMiddleware::new(provider.clone())
                    .with_retry_status(StatusCode::FORBIDDEN),
                &backend,
            );

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(provider.refresh_calls.load(Ordering::Acquire), 0);
        }
    }

    mod when_request_already_contains_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_leaves_it_alone_and_never_replays() {
            let provider = Arc::new(CountingProvider::default());
            let backend = Arc::new(ScriptedBackend::new(&[StatusCode::UNAUTHORIZED]));
            let client = client(AuthenticatingMiddleware::new(provider.clone()), &backend);

            let resp = client
                .get("https://example.com")
                .bearer_auth("overridden!")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(backend.seen(), vec![bearer_of("overridden!")]);
            assert_eq!(provider.valid_calls.load(Ordering::Acquire), 0);
        }
    }

    mod backend_target {
        use super::*;

        struct TargetChecker;

        #[async_trait::async_trait]
        impl Middleware for TargetChecker {
            async fn handle(
                &self,
                req: Request,
                _: &mut http::Extensions,
                _: Next<'_>,
            ) -> Result<Response> {
                assert_eq!(
                    req.headers().get(&BACKEND_TARGET).map(|v| v.to_str().unwrap()),
                    Some("greeter")
                );
                Ok(http::Response::<&[u8]>::default().into())
            }
        }

        #[tokio::test]
        async fn middleware_names_the_backend() {
            let client = ClientBuilder::new(Client::default())
                .with(BackendTargetMiddleware::from_static("greeter"))
                .with(TargetChecker)
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
        }

        #[tokio::test]
        async fn predicate_selects_requests_for_the_backend() {
            let provider = Arc::new(CountingProvider::default());
            let backend = Arc::new(ScriptedBackend::new(&[]));
            let client = ClientBuilder::new(Client::default())
                .with(BackendTargetMiddleware::from_static("greeter"))
                .with(
                    AuthenticatingMiddleware::new(provider.clone())
                        .with_predicate(TargetsBackend::new("greeter")),
                )
                .with_arc(backend.clone())
                .build();

            client.get("https://example.com").send().await.unwrap();
            client
                .get("https://example.com")
                .header(BACKEND_TARGET, "billing")
                .send()
                .await
                .unwrap();

            assert_eq!(backend.seen(), vec![bearer_of(STALE_TOKEN), None]);
        }

        #[test]
        fn invalid_targets_are_rejected() {
            assert!(BackendTargetMiddleware::try_new("bad\ntarget").is_err());
        }
    }

    mod https_only_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_https_scheme() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            let result = dbg!(HttpsOnly.find_case(true, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_http_scheme() {
            let request = Request::new(reqwest::Method::GET, "http://example.com".parse().unwrap());
            let result = dbg!(HttpsOnly.find_case(false, &request));
            assert!(result.is_none())
        }
    }

    mod with_a_session_coordinator {
        use tether::{
            bounce::BounceConfig,
            clock::DurationSecs,
            sim::{MockAuthority, SimulatedBrowser},
            ClientId, CredentialLifetimeConfig, SessionConfig,
        };
        use url::Url;

        use super::*;

        /// Accepts only `tok123`
        struct Backend {
            calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl Middleware for Backend {
            async fn handle(
                &self,
                req: Request,
                _: &mut http::Extensions,
                _: Next<'_>,
            ) -> Result<Response> {
                self.calls.fetch_add(1, Ordering::AcqRel);
                let status = match req.headers().get(header::AUTHORIZATION) {
                    Some(v) if v == "Bearer tok123" => StatusCode::OK,
                    _ => StatusCode::UNAUTHORIZED,
                };
                Ok(http::Response::builder()
                    .status(status)
                    .body("")
                    .unwrap()
                    .into())
            }
        }

        #[tokio::test]
        async fn a_revoked_cached_token_is_replaced_transparently() {
            let client_id = ClientId::from_static("grpc-client");
            let authority = MockAuthority::new(
                Url::parse("https://idp.example.com/").unwrap(),
                client_id.clone(),
            )
            .with_issued_token(AccessToken::from_static("tok123"), Some(DurationSecs(3600)));
            authority.set_signed_in(true);

            let bounce_url = Url::parse("https://app.example.com/static/bounce.html").unwrap();
            let browser = SimulatedBrowser::new(
                authority.clone(),
                Url::parse("https://app.example.com/").unwrap(),
                BounceConfig::new(client_id, authority.authorize_url(), bounce_url.clone()),
            );
            let coordinator = browser.coordinator(SessionConfig::new(bounce_url));

            let revoked = CredentialLifetimeConfig::default()
                .create_credential(AccessToken::from_static("revoked"), Some(DurationSecs(3600)));
            coordinator.store().write(&revoked).await;

            let backend = Arc::new(Backend {
                calls: AtomicUsize::new(0),
            });
            let client = ClientBuilder::new(Client::default())
                .with(AuthenticatingMiddleware::new(coordinator))
                .with_arc(backend.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(backend.calls.load(Ordering::Acquire), 2);
            assert_eq!(authority.exchange_count(), 1);
            assert_eq!(browser.contexts().len(), 1);
        }
    }
}
