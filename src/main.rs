//!
//! smartmark server binary
//! ------------------------
//! Command-line entry point. Configuration comes from `SMARTMARK_*` environment
//! variables and CLI flags; see `--help`.

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use smartmark::config::{has_flag, ServerConfig, HELP};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        print!("{}", HELP);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let config = ServerConfig::load(&args)?;
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "smartmark starting: RUST_LOG='{}', http_port={}, provider={}",
        rust_log, config.http_port, config.provider.kind()
    );

    smartmark::server::run(config).await
}
