//! A minimal demo binary driving a relay client against the demo server in
//! `relay-server-example`: authenticates, issues one tunneled request, and
//! prints activity events as they arrive.

use clap::Parser;
use relay_client::config::RelayClientConfig;
use relay_client::{ClientIdentity, Connection};

#[derive(Parser)]
struct Args {
    /// Websocket URL of the relay server to connect to.
    #[clap(long, env = "RELAY_DEMO_URL", default_value = "ws://127.0.0.1:8787/relay")]
    url: String,

    /// The identity to authenticate as.
    #[clap(long, env = "RELAY_DEMO_USERNAME", default_value = "demo")]
    username: String,

    /// The identity's password.
    #[clap(long, env = "RELAY_DEMO_PASSWORD", default_value = "demo-password")]
    password: String,

    #[clap(flatten)]
    client: RelayClientConfig,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let identity = ClientIdentity { username: args.username, password: args.password.into_bytes() };
    let connection = Connection::connect(args.url, identity, args.client).await?;

    let response = connection.fetch("GET", "/ping", Default::default(), None).await?;
    tracing::info!(status = response.status, body = ?response.body, "fetch completed");

    let mut activity = connection.subscribe_activity(None).await?;
    tokio::spawn(async move {
        while let Some(event) = activity.next().await {
            tracing::info!(?event, "activity event");
        }
    });

    tokio::signal::ctrl_c().await?;
    connection.close();
    Ok(())
}
