use aliri_braid::braid;
use std::fmt;
use url::Url;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// A client ID registered with the identity provider
#[braid(serde)]
pub struct ClientId;

/// An access token, presented as a bearer credential
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// A short-lived authorization code returned by the identity provider
#[braid(serde, debug = "owned", display = "owned")]
pub struct AuthorizationCode;

limited_reveal!(AuthorizationCodeRef: "AUTHORIZATION CODE", 5);

/// The secret half of a proof key for code exchange
#[braid(serde, debug = "owned", display = "owned")]
pub struct CodeVerifier;

limited_reveal!(CodeVerifierRef: "CODE VERIFIER", 5);

/// The derived, public half of a proof key for code exchange
#[braid(serde)]
pub struct CodeChallenge;

/// An opaque value correlating an authorization request with its callback
#[braid(serde)]
pub struct State;

/// The serialized origin (`scheme://host[:port]`) of a browsing context
#[braid(serde)]
pub struct Origin;

impl Origin {
    /// The origin of the given URL
    ///
    /// Opaque origins serialize as `null`, which never matches a tuple origin.
    pub fn of(url: &Url) -> Self {
        Self::new(url.origin().ascii_serialization())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_is_hidden_by_default() {
        let token = AccessToken::from_static("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
    }

    #[test]
    fn access_token_alternate_debug_reveals_prefix() {
        let token = AccessToken::from_static("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{:#?}", token), "\"abcdefghijklmn…\"");
        assert_eq!(format!("{:#6?}", token), "\"abcde…\"");
    }

    #[test]
    fn origin_ignores_path_and_query() {
        let url = Url::parse("https://app.example.com:8443/static/bounce.html?mode=silent").unwrap();
        assert_eq!(Origin::of(&url).as_str(), "https://app.example.com:8443");
    }

    #[test]
    fn origin_omits_default_port() {
        let url = Url::parse("https://app.example.com:443/").unwrap();
        assert_eq!(Origin::of(&url).as_str(), "https://app.example.com");
    }
}
