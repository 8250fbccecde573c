//! Upload confirmation notifications.
//!
//! Uploads never wait for mail delivery: the storage facade drops a `ConfirmationRequest`
//! into an unbounded queue after its transaction commits, and a detached worker hands each
//! request to a `ConfirmationSender`. Delivery failures are logged and otherwise ignored.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One confirmation email to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub to: String,
    /// Logical path of the upload.
    pub path: String,
    pub filename: String,
    pub token: String,
}

/// Outbound transport for confirmation emails.
pub trait ConfirmationSender: Send + Sync {
    fn send_confirmation<'a>(&'a self, req: &'a ConfirmationRequest) -> BoxFuture<'a, anyhow::Result<()>>;
}

#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<ConfirmationRequest>,
}

impl NotificationQueue {
    /// Queue plus its receiving end, for callers that drive delivery themselves.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConfirmationRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue drained by a background task on the current tokio runtime. The worker exits
    /// once every queue clone has been dropped.
    pub fn spawn(sender: Arc<dyn ConfirmationSender>) -> (Self, JoinHandle<()>) {
        let (queue, rx) = Self::channel();
        let handle = tokio::spawn(run_worker(rx, sender));
        (queue, handle)
    }

    pub fn dispatch(&self, req: ConfirmationRequest) {
        debug!(target: "docmirror::notify", "queue confirmation for '{}' to {}", req.path, req.to);
        if let Err(e) = self.tx.send(req) {
            warn!(target: "docmirror::notify", "notification worker gone; dropping confirmation for '{}'", e.0.path);
        }
    }
}

pub async fn run_worker(mut rx: mpsc::UnboundedReceiver<ConfirmationRequest>, sender: Arc<dyn ConfirmationSender>) {
    while let Some(req) = rx.recv().await {
        match sender.send_confirmation(&req).await {
            Ok(()) => info!(target: "docmirror::notify", "confirmation sent for '{}' to {}", req.path, req.to),
            Err(e) => warn!(target: "docmirror::notify", "sending confirmation email for {}: {:#}", req.path, e),
        }
    }
    debug!(target: "docmirror::notify", "notification worker stopped");
}

/// Link the owner follows to confirm an upload.
pub fn confirmation_link(domain: &str, token: &str) -> String {
    format!("https://{}/confirm/{}", domain, token)
}

/// Plain-text body of the confirmation email.
pub fn confirmation_text(domain: &str, req: &ConfirmationRequest) -> String {
    format!(
        "Hi {to},\n\
         You uploaded {file} on {domain}.\n\
         To confirm the upload please visit the following link\n\
         {link}\n\n\
         If you didn't upload files on {domain} please ignore this email.\n\n\
         Best regards,\n\
         The team at {domain}\n",
        to = req.to,
        file = req.filename,
        domain = domain,
        link = confirmation_link(domain, &req.token),
    )
}

/// Sender used when no mail transport is configured: the link only goes to the log.
pub struct LogSender {
    domain: String,
}

impl LogSender {
    pub fn new(domain: impl Into<String>) -> Self { Self { domain: domain.into() } }
}

impl ConfirmationSender for LogSender {
    fn send_confirmation<'a>(&'a self, req: &'a ConfirmationRequest) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            info!(target: "docmirror::notify", "mail transport disabled; confirm '{}' for {} at {}", req.path, req.to, confirmation_link(&self.domain, &req.token));
            Ok(())
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmailError {
    #[error("malformed email address: {0}")]
    Malformed(String),
    #[error("email domain not accepted: {0}")]
    DomainNotAllowed(String),
}

/// Parse `raw` (bare `user@host` or `Name <user@host>`) and check the address ends with one
/// of `allowed_domains`. An empty list accepts any domain. Returns the bare address.
pub fn check_email(raw: &str, allowed_domains: &[String]) -> Result<String, EmailError> {
    let addr = parse_address(raw).ok_or_else(|| EmailError::Malformed(raw.to_string()))?;
    if allowed_domains.is_empty() {
        return Ok(addr);
    }
    let lower = addr.to_ascii_lowercase();
    if allowed_domains.iter().any(|d| !d.is_empty() && lower.ends_with(&d.to_ascii_lowercase())) {
        Ok(addr)
    } else {
        Err(EmailError::DomainNotAllowed(addr))
    }
}

fn parse_address(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let addr = match (raw.find('<'), raw.ends_with('>')) {
        (Some(open), true) => &raw[open + 1..raw.len() - 1],
        (None, false) => raw,
        _ => return None,
    };
    let (local, domain) = addr.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    if addr.chars().any(|c| c.is_whitespace() || c.is_control() || "<>()[],;:\\\"".contains(c)) {
        return None;
    }
    if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
        return None;
    }
    Some(addr.to_string())
}
