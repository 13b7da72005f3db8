use rustls::crypto::{CryptoProvider, ring};

use md_ingest::config::Config;
use md_ingest::supervisor::Supervisor;

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// This is the main runtime for the market-data ingestion engine.
//
// Responsibilities:
// - Initialize cryptography backend (rustls)
// - Initialize logging
// - Load configuration
// - Hand control to the Supervisor
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation. This must be executed exactly once and
    // as early as possible in the process lifecycle.
    //
    // Using the `ring` provider for performance and stability.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls CryptoProvider");

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // --------------------------------------------------------
    // Load configuration from disk
    //
    // NOTE:
    // - The config file may contain credentials; it must not be
    //   committed to version control.
    // - A configuration error fails startup here, before any
    //   connection is opened.
    // --------------------------------------------------------
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = Config::load(&path)?;

    log::info!(
        "starting md-ingest: {} exchanges enabled, bus at {}",
        config.enabled_exchanges().len(),
        config.bus.url
    );

    // The supervisor owns every component and only returns after a
    // cooperative shutdown (ctrl-c).
    Supervisor::new(config).run().await
}
