//! Confirmation mail over the Mailgun HTTP API.

use futures_util::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use crate::notify::{confirmation_text, ConfirmationRequest, ConfirmationSender};

pub const MAILGUN_ENDPOINT: &str = "https://api.mailgun.net/v3";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("api key is invalid")]
    MissingApiKey,
    #[error("sender address is invalid: {0}")]
    InvalidSender(String),
    #[error("email send failed, server responded [{status}] {body}")]
    Rejected { status: u16, body: String },
    #[error("mail transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

pub struct Mailgun {
    domain: String,
    from: String,
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
}

impl Mailgun {
    pub fn new(domain: &str, sender: &str, api_key: &str) -> Result<Self, MailError> {
        if api_key.trim().is_empty() {
            return Err(MailError::MissingApiKey);
        }
        if crate::notify::check_email(sender, &[]).is_err() {
            return Err(MailError::InvalidSender(sender.to_string()));
        }
        Ok(Self {
            domain: domain.to_string(),
            from: sender.to_string(),
            api_key: api_key.to_string(),
            endpoint: format!("{}/{}/messages", MAILGUN_ENDPOINT, domain),
            client: reqwest::Client::new(),
        })
    }

    /// Point at a different messages URL (a local stand-in during tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }

    pub async fn confirm_upload(&self, req: &ConfirmationRequest) -> Result<(), MailError> {
        let subject = format!("confirm upload of {}", req.filename);
        let text = confirmation_text(&self.domain, req);
        let form = [
            ("from", self.from.as_str()),
            ("to", req.to.as_str()),
            ("subject", subject.as_str()),
            ("text", text.as_str()),
        ];
        let resp = self.client
            .post(&self.endpoint)
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailError::Rejected { status: status.as_u16(), body });
        }
        debug!(target: "docmirror::notify", "mailgun accepted message for {}", req.to);
        Ok(())
    }
}

impl ConfirmationSender for Mailgun {
    fn send_confirmation<'a>(&'a self, req: &'a ConfirmationRequest) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move { Ok(self.confirm_upload(req).await?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[test]
    fn new_validates_key_and_sender() {
        assert!(matches!(Mailgun::new("m.example", "noreply@m.example", ""), Err(MailError::MissingApiKey)));
        assert!(matches!(Mailgun::new("m.example", "not an address", "key-1"), Err(MailError::InvalidSender(_))));
        let m = Mailgun::new("m.example", "Mirror <noreply@m.example>", "key-1").unwrap();
        assert_eq!(m.endpoint(), "https://api.mailgun.net/v3/m.example/messages");
    }

    async fn fake_mailgun(status: StatusCode) -> (String, Arc<Mutex<Vec<(Option<String>, String)>>>) {
        let seen: Arc<Mutex<Vec<(Option<String>, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let app = Router::new().route("/messages", post(move |headers: HeaderMap, body: String| {
            let seen = seen2.clone();
            async move {
                let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).map(|s| s.to_string());
                seen.lock().push((auth, body));
                (status, "queued")
            }
        }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { let _ = axum::serve(listener, app).await; });
        (format!("http://{}/messages", addr), seen)
    }

    fn request() -> ConfirmationRequest {
        ConfirmationRequest { to: "a@unitn.it".into(), path: "d/notes.pdf".into(), filename: "notes.pdf".into(), token: "tok-123".into() }
    }

    #[tokio::test]
    async fn posts_form_with_basic_auth() {
        let (url, seen) = fake_mailgun(StatusCode::OK).await;
        let m = Mailgun::new("m.example", "noreply@m.example", "key-1").unwrap().with_endpoint(url);
        m.confirm_upload(&request()).await.unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        // "api:key-1"
        assert_eq!(seen[0].0.as_deref(), Some("Basic YXBpOmtleS0x"));
        assert!(seen[0].1.contains("to=a%40unitn.it"));
        assert!(seen[0].1.contains("subject=confirm+upload+of+notes.pdf"));
        assert!(seen[0].1.contains("tok-123"));
    }

    #[tokio::test]
    async fn non_ok_status_is_an_error_with_body() {
        let (url, _) = fake_mailgun(StatusCode::UNAUTHORIZED).await;
        let m = Mailgun::new("m.example", "noreply@m.example", "key-1").unwrap().with_endpoint(url);
        match m.confirm_upload(&request()).await {
            Err(MailError::Rejected { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "queued");
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
