//! Server configuration, resolved in layers: built-in defaults, then an optional JSON file
//! (`--config PATH`), then `DOCMIRROR_*` environment variables, then command-line flags.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::MetaSettings;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub http_port: u16,
    /// Directory holding the mirrored files.
    pub base_dir: PathBuf,
    /// Directory holding the metadata snapshot and log.
    pub data_dir: PathBuf,
    /// Public host name, used in confirmation links and as the mail domain.
    pub domain: String,
    pub mail_sender: String,
    /// Empty disables outbound mail; confirmation links are logged instead.
    pub mailgun_api_key: String,
    /// Accepted uploader address suffixes; empty accepts any address.
    pub allowed_email_domains: Vec<String>,
    /// Largest accepted upload body.
    pub max_upload_bytes: usize,
    pub meta: MetaSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            base_dir: PathBuf::from("."),
            data_dir: PathBuf::from("mirror-data"),
            domain: "socialnotes.eu".to_string(),
            mail_sender: "SocialNotes <files@socialnotes.eu>".to_string(),
            mailgun_api_key: String::new(),
            allowed_email_domains: vec!["unitn.it".to_string(), "unitn.eu".to_string()],
            max_upload_bytes: 64 * 1024 * 1024,
            meta: MetaSettings::default(),
        }
    }
}

pub const USAGE: &str = "docmirror\n\nUSAGE:\n  docmirror [--config PATH] [--http-port N] [--base-dir PATH] [--data-dir PATH] [--domain HOST]\n            [--sender ADDR] [--api-key KEY] [--allowed-domains a,b]\n\nOPTIONS:\n  --config PATH           JSON configuration file\n  --http-port N           HTTP port (env: DOCMIRROR_HTTP_PORT, default 8080)\n  --base-dir PATH         Mirrored files root (env: DOCMIRROR_BASE_DIR, default .)\n  --data-dir PATH         Metadata directory (env: DOCMIRROR_DATA_DIR, default mirror-data)\n  --domain HOST           Public domain (env: DOCMIRROR_DOMAIN)\n  --sender ADDR           Confirmation mail sender (env: DOCMIRROR_MAIL_SENDER)\n  --api-key KEY           Mailgun API key (env: DOCMIRROR_MAILGUN_API_KEY); empty logs links instead\n  --allowed-domains a,b   Accepted email suffixes (env: DOCMIRROR_ALLOWED_EMAIL_DOMAINS)\n";

impl ServerConfig {
    /// Resolve every layer for the process: `args` are the raw command-line arguments.
    pub fn resolve(args: &[String]) -> Result<Self> {
        let mut cfg = match arg_value(args, "--config") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        cfg.apply_env(|name| env::var(name).ok())?;
        cfg.apply_args(args)?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Overlay environment variables, looked up through `get`.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = get("DOCMIRROR_HTTP_PORT") {
            self.http_port = parse_port(&v).context("DOCMIRROR_HTTP_PORT")?;
        }
        if let Some(v) = get("DOCMIRROR_BASE_DIR") { self.base_dir = PathBuf::from(v); }
        if let Some(v) = get("DOCMIRROR_DATA_DIR") { self.data_dir = PathBuf::from(v); }
        if let Some(v) = get("DOCMIRROR_DOMAIN") { self.domain = v; }
        if let Some(v) = get("DOCMIRROR_MAIL_SENDER") { self.mail_sender = v; }
        if let Some(v) = get("DOCMIRROR_MAILGUN_API_KEY") { self.mailgun_api_key = v; }
        if let Some(v) = get("DOCMIRROR_ALLOWED_EMAIL_DOMAINS") { self.allowed_email_domains = split_list(&v); }
        Ok(())
    }

    /// Overlay command-line flags.
    pub fn apply_args(&mut self, args: &[String]) -> Result<()> {
        if let Some(v) = arg_value(args, "--http-port") {
            self.http_port = parse_port(&v).context("--http-port")?;
        }
        if let Some(v) = arg_value(args, "--base-dir") { self.base_dir = PathBuf::from(v); }
        if let Some(v) = arg_value(args, "--data-dir") { self.data_dir = PathBuf::from(v); }
        if let Some(v) = arg_value(args, "--domain") { self.domain = v; }
        if let Some(v) = arg_value(args, "--sender") { self.mail_sender = v; }
        if let Some(v) = arg_value(args, "--api-key") { self.mailgun_api_key = v; }
        if let Some(v) = arg_value(args, "--allowed-domains") { self.allowed_email_domains = split_list(&v); }
        Ok(())
    }

    /// Where the metadata snapshot and log live.
    pub fn meta_dir(&self) -> PathBuf { self.data_dir.join("meta") }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.http_port))
    }
}

fn parse_port(v: &str) -> Result<u16> {
    v.trim().parse::<u16>().with_context(|| format!("invalid port '{}'", v))
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()).map(|s| s.to_string()).collect()
}

/// Value following `flag`, if present.
pub fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
