use tracing_subscriber::{EnvFilter, fmt};
use tracing::info;

use docmirror::config::{has_flag, ServerConfig, USAGE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let config = ServerConfig::resolve(&args)?;
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "docmirror starting: RUST_LOG='{}', http_port={}, base_dir='{}', data_dir='{}', domain={}, mail={}",
        rust_log,
        config.http_port,
        config.base_dir.display(),
        config.data_dir.display(),
        config.domain,
        if config.mailgun_api_key.is_empty() { "log-only" } else { "mailgun" }
    );

    docmirror::server::run(config).await
}
