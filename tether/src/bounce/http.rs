//! A token endpoint reached over HTTP

use std::marker::PhantomData;

use async_trait::async_trait;

use super::endpoint::{
    CodeExchange, ErrorResponse, TokenEndpoint, TokenExchangeError, TokenResponse,
};

/// Redeems authorization codes by posting to the provider's token URL
#[derive(Debug)]
pub struct HttpTokenEndpoint<T = JsonBody> {
    client: reqwest::Client,
    token_url: reqwest::Url,
    content_type: PhantomData<fn() -> T>,
}

impl HttpTokenEndpoint<JsonBody> {
    /// Constructs a new token endpoint client
    pub fn new(client: reqwest::Client, token_url: reqwest::Url) -> Self {
        Self {
            client,
            token_url,
            content_type: PhantomData,
        }
    }

    /// Configures the endpoint to send the exchange to
    /// the authority as form data
    pub fn using_form_data(self) -> HttpTokenEndpoint<FormBody> {
        HttpTokenEndpoint {
            client: self.client,
            token_url: self.token_url,
            content_type: PhantomData,
        }
    }
}

#[async_trait]
impl<T: RequestType> TokenEndpoint for HttpTokenEndpoint<T> {
    #[tracing::instrument(
        err,
        skip(self, request),
        fields(
            token_url = %self.token_url,
            client_id = %request.client_id,
        ),
    )]
    async fn exchange_code(
        &self,
        request: &CodeExchange<'_>,
    ) -> Result<TokenResponse, TokenExchangeError> {
        tracing::trace!("redeeming authorization code");

        let req = T::attach_payload(self.client.post(self.token_url.clone()), request);
        let resp = req
            .send()
            .await
            .map_err(|e| TokenExchangeError::RequestSend(e.into()))?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from issuing authority"
        );

        let body = resp
            .bytes()
            .await
            .map_err(|e| TokenExchangeError::BodyReadError(e.into()))?;

        if !status.is_success() {
            return Err(match serde_json::from_slice::<ErrorResponse>(&body) {
                Ok(error) => TokenExchangeError::Rejected(error),
                Err(_) => TokenExchangeError::ErrorWithBody {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&body).into_owned(),
                },
            });
        }

        let resp: TokenResponse = serde_json::from_slice(&body)?;

        tracing::info!(
            expires_in = resp.expires_in.map(|d| d.0),
            "received new access token"
        );

        Ok(resp)
    }
}

/// A manner of attaching a serializable payload to a request
pub trait RequestType: Send + Sync {
    /// Attaches the serializable payload to the request body
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder;
}

/// Attaches the exchange to the request body as JSON
#[derive(Debug)]
pub struct JsonBody;

/// Attaches the exchange to the request body as URL-encoded form data
#[derive(Debug)]
pub struct FormBody;

impl RequestType for JsonBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.json(payload)
    }
}

impl RequestType for FormBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.form(payload)
    }
}
