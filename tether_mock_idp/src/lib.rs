//! HTTP front for the mock identity provider
//!
//! Serves a [`MockAuthority`] over HTTP so that a real browser or HTTP client
//! can run the authorization code flow with PKCE against it:
//!
//! * `GET /authorize` answers with a `302 Found` back to the redirect URI,
//!   carrying either a `code` or an `error`.
//! * `POST /token` redeems a code, accepting either a JSON or a form body.

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

use std::io;

use axum::{
    extract::{FromRequest, RawQuery, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use tether::sim::{MockAuthority, TokenRequest};
use tokio::net::TcpListener;

pub use tether::sim;

/// Builds the router serving `authority`
pub fn router(authority: MockAuthority) -> Router {
    Router::new()
        .route("/authorize", get(authorize))
        .route("/token", post(token))
        .with_state(authority)
}

/// Serves `authority` on `listener` until the process ends
pub async fn serve(listener: TcpListener, authority: MockAuthority) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "mock identity provider listening");
    }
    axum::serve(listener, router(authority)).await
}

async fn authorize(State(authority): State<MockAuthority>, RawQuery(query): RawQuery) -> Response {
    let mut request = authority.authorize_url();
    request.set_query(query.as_deref());

    match authority.authorize(&request) {
        Ok(redirect) => {
            tracing::debug!(redirect = %redirect, "redirecting back to client");
            (StatusCode::FOUND, [(header::LOCATION, redirect.to_string())]).into_response()
        }
        Err(error) => {
            tracing::warn!(%error, "unable to answer authorization request");
            (StatusCode::BAD_REQUEST, error.to_string()).into_response()
        }
    }
}

async fn token(State(authority): State<MockAuthority>, request: Request) -> Response {
    let request = match parse_token_request(request, &authority).await {
        Ok(request) => request,
        Err(error) => {
            tracing::debug!(%error, "malformed token request");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "error_description": "the request body could not be parsed",
                })),
            )
                .into_response();
        }
    };

    match authority.exchange(&request) {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => {
            let status = if error.error == "invalid_client" {
                StatusCode::UNAUTHORIZED
            } else {
                StatusCode::BAD_REQUEST
            };
            tracing::debug!(error = %error.error, "token request refused");
            (status, Json(error)).into_response()
        }
    }
}

/// Reads a token request from either a JSON or a form body
async fn parse_token_request(
    request: Request,
    authority: &MockAuthority,
) -> Result<TokenRequest, String> {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.starts_with("application/json"));

    if is_json {
        Json::<TokenRequest>::from_request(request, authority)
            .await
            .map(|Json(request)| request)
            .map_err(|rejection| rejection.body_text())
    } else {
        Form::<TokenRequest>::from_request(request, authority)
            .await
            .map(|Form(request)| request)
            .map_err(|rejection| rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, net::SocketAddr};

    use tether::{
        bounce::{CodeExchange, HttpTokenEndpoint, TokenEndpoint, TokenExchangeError},
        clock::DurationSecs,
        pkce::PkceChallenge,
        AccessToken, AuthorizationCode, ClientId,
    };
    use url::Url;

    use super::*;

    const REDIRECT: &str = "https://app.example.com/static/bounce.html";

    async fn start(signed_in: bool) -> (SocketAddr, MockAuthority) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let authority = MockAuthority::new(
            Url::parse(&format!("http://{}/", addr)).unwrap(),
            ClientId::from_static("grpc-client"),
        )
        .with_issued_token(AccessToken::from_static("tok123"), Some(DurationSecs(3600)));
        authority.set_signed_in(signed_in);

        tokio::spawn(serve(listener, authority.clone()));
        (addr, authority)
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    async fn authorize(authority: &MockAuthority, pkce: &PkceChallenge, prompt_none: bool) -> Url {
        let mut url = authority.authorize_url();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", "grpc-client")
                .append_pair("redirect_uri", REDIRECT)
                .append_pair("state", "xyz")
                .append_pair("code_challenge", pkce.challenge().as_str())
                .append_pair("code_challenge_method", "S256");
            if prompt_none {
                query.append_pair("prompt", "none");
            }
        }

        let resp = client().get(url.as_str()).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 302);

        let location = resp
            .headers()
            .get("location")
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        Url::parse(&location).unwrap()
    }

    fn params(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[tokio::test]
    async fn silent_authorization_without_session_redirects_with_an_error() {
        let (_, authority) = start(false).await;
        let pkce = PkceChallenge::generate();

        let redirect = authorize(&authority, &pkce, true).await;

        assert!(redirect.as_str().starts_with(REDIRECT));
        assert_eq!(params(&redirect)["error"], "login_required");
        assert_eq!(params(&redirect)["state"], "xyz");
    }

    #[tokio::test]
    async fn code_is_redeemed_over_json() {
        let (_, authority) = start(true).await;
        let pkce = PkceChallenge::generate();
        let redirect = authorize(&authority, &pkce, true).await;
        let code = AuthorizationCode::new(params(&redirect)["code"].clone());
        let redirect_uri = Url::parse(REDIRECT).unwrap();
        let client_id = ClientId::from_static("grpc-client");

        let endpoint = HttpTokenEndpoint::new(reqwest::Client::new(), authority.token_url());
        let response = endpoint
            .exchange_code(&CodeExchange {
                code: &code,
                verifier: pkce.verifier(),
                redirect_uri: &redirect_uri,
                client_id: &client_id,
            })
            .await
            .unwrap();

        assert_eq!(response.access_token.as_str(), "tok123");
        assert_eq!(response.expires_in, Some(DurationSecs(3600)));
    }

    #[tokio::test]
    async fn code_is_redeemed_over_form_data_only_once() {
        let (_, authority) = start(true).await;
        let pkce = PkceChallenge::generate();
        let redirect = authorize(&authority, &pkce, true).await;
        let code = AuthorizationCode::new(params(&redirect)["code"].clone());
        let redirect_uri = Url::parse(REDIRECT).unwrap();
        let client_id = ClientId::from_static("grpc-client");

        let endpoint = HttpTokenEndpoint::new(reqwest::Client::new(), authority.token_url())
            .using_form_data();
        let exchange = CodeExchange {
            code: &code,
            verifier: pkce.verifier(),
            redirect_uri: &redirect_uri,
            client_id: &client_id,
        };

        assert!(endpoint.exchange_code(&exchange).await.is_ok());

        match endpoint.exchange_code(&exchange).await {
            Err(TokenExchangeError::Rejected(error)) => assert_eq!(error.error, "invalid_grant"),
            other => panic!("expected the second exchange to be rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_verifier_is_rejected() {
        let (_, authority) = start(true).await;
        let pkce = PkceChallenge::generate();
        let other = PkceChallenge::generate();
        let redirect = authorize(&authority, &pkce, true).await;
        let code = AuthorizationCode::new(params(&redirect)["code"].clone());
        let redirect_uri = Url::parse(REDIRECT).unwrap();
        let client_id = ClientId::from_static("grpc-client");

        let endpoint = HttpTokenEndpoint::new(reqwest::Client::new(), authority.token_url());
        let result = endpoint
            .exchange_code(&CodeExchange {
                code: &code,
                verifier: other.verifier(),
                redirect_uri: &redirect_uri,
                client_id: &client_id,
            })
            .await;

        assert!(matches!(
            result,
            Err(TokenExchangeError::Rejected(error)) if error.error == "invalid_grant"
        ));
        assert_eq!(authority.exchange_count(), 0);
    }

    #[tokio::test]
    async fn unparseable_token_body_is_an_invalid_request() {
        let (addr, authority) = start(true).await;

        let resp = client()
            .post(format!("http://{}/token", addr))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status().as_u16(), 400);
        let body = resp.text().await.unwrap();
        assert!(body.contains("invalid_request"));
        assert_eq!(authority.exchange_count(), 0);
    }

    #[tokio::test]
    async fn missing_redirect_uri_is_a_bad_request() {
        let (addr, _) = start(true).await;

        let resp = client()
            .get(format!("http://{}/authorize?response_type=code", addr))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status().as_u16(), 400);
    }
}
