// micra — configuration-driven microservice runtime.
//
// Boot: configCenter.yaml → application.yaml → loggers → adapters →
// naming → tracer → caller → cluster → web server → services.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use micra_core::plugin::PluginRegistry;
use micra_server::{ServerStarter, StartConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "micra", version, about = "micra — configuration-driven microservice runtime")]
struct Cli {
    /// Application base directory (holds config/, running_data/, logs/)
    #[arg(long, default_value = ".")]
    base_path: PathBuf,

    /// Log directory override (relative to the base path)
    #[arg(long)]
    logs_path: Option<String>,

    /// Web server id to start; pass an empty value for the
    /// no-listener background mode
    #[arg(long)]
    web_server: Option<String>,

    /// Externally visible host (overrides base_config.host)
    #[arg(long)]
    visit_host: Option<String>,

    /// Externally visible port (overrides base_config.port)
    #[arg(long)]
    visit_port: Option<u16>,

    /// Listen host override
    #[arg(long)]
    host: Option<String>,

    /// Listen port override
    #[arg(long)]
    port: Option<u16>,

    /// Server instance id override
    #[arg(long)]
    server_id: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "micra starting");

    let start_config = StartConfig {
        base_path: cli.base_path,
        logs_path: cli.logs_path,
        web_server: cli.web_server,
        visit_host: cli.visit_host,
        visit_port: cli.visit_port,
        host: cli.host,
        port: cli.port,
        server_id: cli.server_id,
    };

    let registry = Arc::new(PluginRegistry::new());
    micra_server::builtin::register_builtin_adapters(&registry);

    let starter = ServerStarter::boot(start_config, registry).await?;
    starter.serve().await?;

    info!("micra stopped");
    Ok(())
}
