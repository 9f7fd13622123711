//! Server entrypoint.

use clap::Parser;

use agent_remote::common::telemetry;
use agent_remote::server;
use agent_remote::server::ServerConfig;

#[derive(Parser, Debug)]
#[command(
    name = "agent-remote",
    version,
    about = "Drive interactive CLI agent sessions from the browser and run them on a schedule"
)]
struct Cli {
    /// Listen port (overrides the PORT env var).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _telemetry = telemetry::init_tracing("agent_remote=info");

    let cli = Cli::parse();
    let mut config = ServerConfig::from_env();
    if let Some(port) = cli.port {
        config = config.with_port(port);
    }

    server::run(config).await
}
