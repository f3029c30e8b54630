//! Proof key for code exchange
//!
//! Each authorization request carries only the challenge. The verifier stays
//! in the requesting origin's storage until the authorization code is
//! redeemed, so an intercepted code cannot be exchanged by anyone else.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use ring::digest;
use serde::{Deserialize, Serialize};

use crate::{CodeChallenge, CodeChallengeRef, CodeVerifier, CodeVerifierRef, State};

/// Number of random bytes behind a verifier (43 characters once encoded)
pub const VERIFIER_BYTES: usize = 32;

const STATE_BYTES: usize = 16;

/// The transformation applied to the verifier to produce the challenge
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeMethod {
    /// `BASE64URL(SHA256(verifier))`
    #[default]
    S256,
}

impl ChallengeMethod {
    /// The method's name in authorization requests
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeMethod::S256 => "S256",
        }
    }
}

/// A fresh verifier together with its derived challenge
#[derive(Clone, Debug)]
pub struct PkceChallenge {
    verifier: CodeVerifier,
    challenge: CodeChallenge,
    method: ChallengeMethod,
}

impl PkceChallenge {
    /// Generates a new, unpredictable verifier and its challenge
    pub fn generate() -> Self {
        let verifier = CodeVerifier::new(random_urlsafe(VERIFIER_BYTES));
        let challenge = derive_challenge(&verifier);
        Self {
            verifier,
            challenge,
            method: ChallengeMethod::S256,
        }
    }

    /// The secret verifier, sent only when redeeming the authorization code
    #[inline]
    pub fn verifier(&self) -> &CodeVerifierRef {
        &self.verifier
    }

    /// The challenge, sent with the authorization request
    #[inline]
    pub fn challenge(&self) -> &CodeChallengeRef {
        &self.challenge
    }

    /// The challenge method
    #[inline]
    pub fn method(&self) -> ChallengeMethod {
        self.method
    }

    /// Consumes the pair, keeping only the verifier
    pub fn into_verifier(self) -> CodeVerifier {
        self.verifier
    }

    /// Checks a verifier presented at the token endpoint against the challenge
    /// recorded at the authorization endpoint
    pub fn verify(verifier: &CodeVerifierRef, challenge: &CodeChallengeRef) -> bool {
        derive_challenge(verifier).as_str() == challenge.as_str()
    }
}

/// Generates a random anti-forgery state for an authorization request
pub fn generate_state() -> State {
    State::new(random_urlsafe(STATE_BYTES))
}

fn derive_challenge(verifier: &CodeVerifierRef) -> CodeChallenge {
    let hash = digest::digest(&digest::SHA256, verifier.as_str().as_bytes());
    CodeChallenge::new(URL_SAFE_NO_PAD.encode(hash.as_ref()))
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0_u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_matches_published_example() {
        let verifier = CodeVerifier::from_static("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(
            derive_challenge(&verifier).as_str(),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_is_url_safe_and_long_enough() {
        let pkce = PkceChallenge::generate();
        let verifier = pkce.verifier().as_str();

        assert_eq!(verifier.len(), 43);
        assert!(verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(!pkce.challenge().as_str().contains('='));
    }

    #[test]
    fn every_generation_uses_a_new_verifier() {
        let first = PkceChallenge::generate();
        let second = PkceChallenge::generate();

        assert_ne!(first.verifier(), second.verifier());
        assert_ne!(first.challenge(), second.challenge());
    }

    #[test]
    fn verify_accepts_only_the_matching_verifier() {
        let pkce = PkceChallenge::generate();
        let other = PkceChallenge::generate();

        assert!(PkceChallenge::verify(pkce.verifier(), pkce.challenge()));
        assert!(!PkceChallenge::verify(other.verifier(), pkce.challenge()));
    }

    #[test]
    fn debug_output_hides_the_verifier() {
        let pkce = PkceChallenge::generate();
        let debug = format!("{:?}", pkce);

        assert!(!debug.contains(pkce.verifier().as_str()));
    }
}
