//! Cross-window session refresh for browser applications
//!
//! This library keeps a single-page application supplied with a usable bearer
//! token without reloading the application whenever the token expires.
//!
//! The application window asks a [`SessionRefreshCoordinator`] for a token.
//! A usable cached credential is returned straight from the
//! [`CredentialStore`]. Otherwise the coordinator opens a _bounce context_: a
//! hidden frame first, asking the identity provider for a token without any
//! UI, and a popup if the provider says the user has to sign in. The bounce
//! context runs a [`BounceController`][bounce::BounceController], which
//! performs an authorization code exchange protected by a proof key
//! ([`pkce`]), persists the credential, and reports back to the application
//! window over a [`CrossContextChannel`][channel::CrossContextChannel] that
//! only accepts replies from the expected origin.
//!
//! Any number of concurrent callers share a single refresh. Every one of them
//! observes the same token or the same [`AuthError`].
//!
//! # General Flow
//!
//! The example below runs the whole protocol against the in-process browser
//! and identity provider from the [`sim`] module. A real application supplies
//! its own [`ContextOpener`][channel::ContextOpener], storage, and message bus
//! in their place.
//!
//! ```
//! use tether::{bounce::BounceConfig, sim, AccessToken, ClientId, SessionConfig};
//! use tether::clock::DurationSecs;
//! use url::Url;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client_id = ClientId::from_static("grpc-client");
//! let authority = sim::MockAuthority::new(Url::parse("https://idp.example.com/")?, client_id.clone())
//!     .with_issued_token(AccessToken::from_static("tok123"), Some(DurationSecs(3600)));
//!
//! let bounce_url = Url::parse("https://app.example.com/static/bounce.html")?;
//! let browser = sim::SimulatedBrowser::new(
//!     authority.clone(),
//!     Url::parse("https://app.example.com/")?,
//!     BounceConfig::new(client_id, authority.authorize_url(), bounce_url.clone()),
//! );
//!
//! let coordinator = browser.coordinator(SessionConfig::new(bounce_url));
//!
//! // Nobody is signed in, so the silent frame fails and a popup logs in
//! let token = coordinator.get_valid_token().await?;
//! assert_eq!(token.as_str(), "tok123");
//!
//! // From now on the cached credential is used
//! let again = coordinator.get_valid_token().await?;
//! assert_eq!(again, token);
//! assert_eq!(browser.contexts().len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `oauth2`: Provides an HTTP implementation of the provider's token endpoint
//!   using [reqwest].
//! * `file`: Provides a storage implementation using the local filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod bounce;
mod braids;
pub mod channel;
pub mod clock;
pub mod coordinator;
mod credential;
pub mod pkce;
pub mod sim;
pub mod storage;
pub mod store;

pub use braids::*;
pub use coordinator::{AuthError, SessionConfig, SessionRefreshCoordinator, TokenProvider};
pub use credential::{Credential, CredentialLifetimeConfig, CredentialStatus};
pub use store::CredentialStore;
