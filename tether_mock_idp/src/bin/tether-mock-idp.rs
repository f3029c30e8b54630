use std::net::SocketAddr;

use clap::Parser;
use tether::{clock::DurationSecs, sim::MockAuthority, AccessToken, ClientId};
use tokio::net::TcpListener;
use url::Url;

#[derive(Debug, Parser)]
struct Opts {
    /// The address to listen on
    #[clap(short, long, env = "IDP_BIND", default_value = "127.0.0.1:8081")]
    bind: SocketAddr,

    /// The only client ID the provider accepts
    #[clap(short, long, env, default_value = "grpc-client")]
    client_id: ClientId,

    /// Start with the user already signed in, so silent requests succeed
    #[clap(long, env)]
    signed_in: bool,

    /// Lifetime of issued tokens, in seconds
    #[clap(short, long, env, default_value_t = 3600)]
    expires_in: u64,

    /// Issue this token on every exchange instead of a random one
    #[clap(short = 't', long, env, hide_env_values = true)]
    issued_token: Option<AccessToken>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let listener = TcpListener::bind(opts.bind).await?;
    let issuer = Url::parse(&format!("http://{}/", listener.local_addr()?))?;

    let mut authority = MockAuthority::new(issuer, opts.client_id);
    if let Some(token) = opts.issued_token {
        authority = authority.with_issued_token(token, Some(DurationSecs(opts.expires_in)));
    } else {
        authority = authority.with_expires_in(Some(DurationSecs(opts.expires_in)));
    }
    authority.set_signed_in(opts.signed_in);

    tracing::info!(
        authorize_url = %authority.authorize_url(),
        token_url = %authority.token_url(),
        client_id = %authority.client_id(),
        signed_in = opts.signed_in,
        "starting mock identity provider"
    );

    tether_mock_idp::serve(listener, authority).await?;

    Ok(())
}
