use std::time::Duration;

use clap::Parser;
use tether::{
    bounce::BounceConfig,
    clock::DurationSecs,
    coordinator::InteractiveMode,
    sim::{MockAuthority, SimulatedBrowser},
    AccessToken, ClientId, CredentialLifetimeConfig, SessionConfig,
};
use url::Url;

#[derive(Debug, Parser)]
struct Opts {
    /// The identity provider's issuer URL
    #[clap(long, env, default_value = "https://idp.example.com/")]
    issuer: Url,

    /// The client ID registered with the identity provider
    #[clap(short, long, env, default_value = "grpc-client")]
    client_id: ClientId,

    /// The page the application is showing
    #[clap(long, env, default_value = "https://app.example.com/dashboard")]
    app_url: Url,

    /// The bounce page, which is also the redirect URI
    #[clap(long, env, default_value = "https://app.example.com/static/bounce.html")]
    bounce_url: Url,

    /// Start with the user already signed in at the identity provider
    #[clap(long, env)]
    signed_in: bool,

    /// Log in by navigating the application window instead of with a popup
    #[clap(long, env)]
    redirect: bool,

    /// Lifetime of issued tokens, in seconds
    #[clap(short, long, env, default_value_t = 3600)]
    expires_in: u64,

    /// Number of concurrent callers asking for a token
    #[clap(short = 'n', long, env, default_value_t = 5)]
    callers: usize,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let authority = MockAuthority::new(opts.issuer, opts.client_id.clone()).with_issued_token(
        AccessToken::from_static("tok123"),
        Some(DurationSecs(opts.expires_in)),
    );
    authority.set_signed_in(opts.signed_in);

    let browser = SimulatedBrowser::new(
        authority.clone(),
        opts.app_url,
        BounceConfig::new(
            opts.client_id,
            authority.authorize_url(),
            opts.bounce_url.clone(),
        ),
    );

    let mut config = SessionConfig::new(opts.bounce_url);
    if opts.redirect {
        config = config.with_interactive_mode(InteractiveMode::Redirect(browser.navigator()));
    }
    let coordinator = browser.coordinator(config);

    let callers: Vec<_> = (0..opts.callers)
        .map(|caller| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { (caller, coordinator.get_valid_token().await) })
        })
        .collect();

    for caller in callers {
        let (caller, result) = caller.await?;
        match result {
            Ok(token) => tracing::info!(
                caller,
                token = format_args!("{:#?}", token),
                "caller received a token"
            ),
            Err(error) => tracing::warn!(caller, %error, "caller did not receive a token"),
        }
    }

    browser.idle().await;

    for context in browser.contexts() {
        tracing::info!(kind = %context.kind, url = %context.url, closed = context.closed, "opened context");
    }
    for navigation in browser.navigations() {
        tracing::info!(url = %navigation, "application window navigated");
    }

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    for _ in 0..3 {
        interval.tick().await;

        match coordinator.store().read().await {
            Some(credential) => {
                let status = CredentialLifetimeConfig::default().status_of(&credential);
                tracing::info!(?status, expiry = credential.expiry().0, "cached credential");
            }
            None => tracing::warn!("no cached credential"),
        }
    }

    tracing::info!(
        authorizations = authority.authorization_count(),
        exchanges = authority.exchange_count(),
        "identity provider round trips"
    );

    Ok(())
}
