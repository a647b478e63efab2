//! Tether node entry point.
//!
//! ```text
//! tether-node                  Run with tether-node.toml
//! tether-node --config <path>  Load a custom config TOML
//! tether-node --gen-config     Write default config to stdout
//! tether-node --init-config    Write default config to the --config path
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_node::config::NodeConfig;
use tether_node::node::Node;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-node", about = "Relay stdin lines to peers over reliable connections")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tether-node.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to the `--config` path and exit.
    #[arg(long)]
    init_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        println!("{}", NodeConfig::default_toml()?);
        return Ok(());
    }

    // --init-config: bootstrap a config file and exit.
    if cli.init_config {
        NodeConfig::write_default(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let config = NodeConfig::load(&cli.config);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tether-node v{}", env!("CARGO_PKG_VERSION"));
    info!("node id: {}", config.node.id);
    info!("peers: {}", config.peers.len());
    info!(
        "retry limit: {}, backoff: {:?}",
        config.connection.retry_limit, config.connection.backoff
    );

    let node = Node::bind(config).await?;
    let stop = node.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.notify_one();
    });

    node.run(BufReader::new(tokio::io::stdin())).await?;

    Ok(())
}
