use serde::{Deserialize, Serialize};

use crate::clock::{Clock, DurationSecs, System, UnixTime};
use crate::{AccessToken, AccessTokenRef};

/// An access token as issued by the identity provider with its lifetime
///
/// A credential is replaced wholesale by the next successful refresh; it is
/// never merged with an older one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    access_token: AccessToken,
    lifetime: DurationSecs,
    issued: UnixTime,
    expiry: UnixTime,
}

/// A credential's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialStatus {
    /// The credential may be attached to outgoing calls
    Usable,
    /// The credential is still valid, but too close to its expiry to be handed out
    Expiring,
    /// The credential is no longer valid
    Expired,
}

impl CredentialStatus {
    /// Whether a credential in this status may be handed out
    #[inline]
    pub fn is_usable(self) -> bool {
        matches!(self, CredentialStatus::Usable)
    }
}

impl Credential {
    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the credential's lifetime as reported by the identity provider
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.lifetime
    }

    /// Gets the time that the credential was issued
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time that the credential will expire
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Gets the credential's status as of the provided time
    ///
    /// A credential stops being usable `safety_margin` before its expiry so
    /// that a call started with it does not arrive after it has lapsed.
    #[inline]
    pub fn status_at(&self, time: UnixTime, safety_margin: DurationSecs) -> CredentialStatus {
        if time >= self.expiry {
            CredentialStatus::Expired
        } else if time + safety_margin >= self.expiry {
            CredentialStatus::Expiring
        } else {
            CredentialStatus::Usable
        }
    }
}

/// Configuration for stamping lifetimes on newly issued credentials
#[derive(Clone, Debug)]
pub struct CredentialLifetimeConfig<C = System> {
    safety_margin: DurationSecs,
    default_lifetime: DurationSecs,
    clock: C,
}

impl Default for CredentialLifetimeConfig {
    /// Default lifetime configuration
    ///
    /// Credentials stop being usable 30 seconds before they expire. When the
    /// identity provider omits `expires_in`, a lifetime of one hour is assumed.
    /// Uses the system clock.
    fn default() -> Self {
        Self {
            safety_margin: DurationSecs(30),
            default_lifetime: DurationSecs(3600),
            clock: System,
        }
    }
}

impl CredentialLifetimeConfig {
    /// Constructs a new lifetime configuration using the system clock
    pub fn new(safety_margin: DurationSecs, default_lifetime: DurationSecs) -> Self {
        Self {
            safety_margin,
            default_lifetime,
            clock: System,
        }
    }
}

impl<C> CredentialLifetimeConfig<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> CredentialLifetimeConfig<D> {
        CredentialLifetimeConfig {
            safety_margin: self.safety_margin,
            default_lifetime: self.default_lifetime,
            clock,
        }
    }

    /// The margin before expiry during which a credential is no longer handed out
    #[inline]
    pub fn safety_margin(&self) -> DurationSecs {
        self.safety_margin
    }

    /// The clock used to stamp and evaluate credentials
    #[inline]
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl<C: Clock> CredentialLifetimeConfig<C> {
    /// Given an access token and the provider's `expires_in`, constructs a credential
    pub fn create_credential(
        &self,
        access_token: impl AsRef<AccessTokenRef>,
        expires_in: Option<DurationSecs>,
    ) -> Credential {
        let issued = self.clock.now();
        let lifetime = expires_in.unwrap_or(self.default_lifetime);
        Credential {
            access_token: access_token.as_ref().to_owned(),
            lifetime,
            issued,
            expiry: issued + lifetime,
        }
    }

    /// Gets the status of `credential` according to this configuration's clock and margin
    #[inline]
    pub fn status_of(&self, credential: &Credential) -> CredentialStatus {
        credential.status_at(self.clock.now(), self.safety_margin)
    }
}
