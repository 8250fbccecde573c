//!
//! docmirror indexer
//! -----------------
//! Imports files already present under the base directory as confirmed records, or lists
//! uploads still waiting for confirmation. Reads the same configuration layers as the server.

use anyhow::{Context, Result};
use std::env;
use tracing_subscriber::{EnvFilter, fmt};

use docmirror::config::{arg_value, has_flag, ServerConfig};
use docmirror::indexer::index_tree_excluding;
use docmirror::storage::FileStorage;

const USAGE: &str = "docmirror_indexer\n\nUSAGE:\n  docmirror_indexer [--config PATH] [--base-dir PATH] [--data-dir PATH] [--email ADDR] [--list-pending]\n\nOPTIONS:\n  --email ADDR      Owner recorded on imported files (default admin@<domain>)\n  --list-pending    Print uploads awaiting confirmation instead of indexing\n";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let config = ServerConfig::resolve(&args)?;
    let storage = FileStorage::open(&config.base_dir, config.meta_dir(), config.meta.clone())
        .with_context(|| format!("opening storage (files={}, meta={})", config.base_dir.display(), config.meta_dir().display()))?;

    if has_flag(&args, "--list-pending") {
        for (path, rec) in storage.pending()? {
            println!("{}\t{}\t{}\t{}", path, rec.size_human(), rec.owner_email, rec.token);
        }
        return Ok(());
    }

    let email = arg_value(&args, "--email").unwrap_or_else(|| format!("admin@{}", config.domain));
    let skip: Vec<String> = data_dir_inside_base(&config).into_iter().collect();
    let report = index_tree_excluding(&storage, &email, &skip)?;
    storage.checkpoint()?;
    println!("indexed={} existing={} rejected={}", report.indexed, report.existing, report.rejected);
    Ok(())
}

/// Logical path of the metadata directory when it sits inside the base directory.
fn data_dir_inside_base(config: &ServerConfig) -> Option<String> {
    let base = config.base_dir.canonicalize().ok()?;
    let data = config.meta_dir().canonicalize().ok()?;
    let rel = data.strip_prefix(&base).ok()?;
    let parts: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
    if parts.is_empty() { None } else { Some(parts.join("/")) }
}
