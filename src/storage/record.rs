//! File metadata records persisted in the metadata store (JSON values keyed by path).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::FsResult;

/// Name of the placeholder record planted inside otherwise-empty directories.
pub const DIR_PLACEHOLDER: &str = ".dir";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    /// Final path segment, as shown in listings.
    pub name: String,
    /// Content size in bytes.
    pub size: u64,
    /// Last modification of the stored content.
    pub mod_time: DateTime<Utc>,
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
    /// Address that initiated the upload.
    pub owner_email: String,
    /// Confirmation credential; kept after confirmation.
    #[serde(default)]
    pub token: String,
    /// Set once, when the owner confirms (or an admin authorizes).
    pub authorized: bool,
    /// Placeholder keeping an empty directory visible.
    #[serde(default)]
    pub system: bool,
}

impl FileRecord {
    /// Fresh upload awaiting confirmation, carrying a newly generated token.
    pub fn pending(name: impl Into<String>, size: u64, mod_time: DateTime<Utc>, owner_email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mod_time,
            uploaded_at: Some(Utc::now()),
            owner_email: owner_email.into(),
            token: new_token(),
            authorized: false,
            system: false,
        }
    }

    /// Record for content imported by an administrator; no confirmation needed.
    pub fn imported(name: impl Into<String>, size: u64, mod_time: DateTime<Utc>, owner_email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mod_time,
            uploaded_at: Some(Utc::now()),
            owner_email: owner_email.into(),
            token: String::new(),
            authorized: true,
            system: false,
        }
    }

    pub fn placeholder() -> Self {
        Self {
            name: DIR_PLACEHOLDER.to_string(),
            size: 0,
            mod_time: Utc::now(),
            uploaded_at: None,
            owner_email: String::new(),
            token: String::new(),
            authorized: true,
            system: true,
        }
    }

    /// Visible to public listing and download.
    pub fn is_public(&self) -> bool {
        self.authorized && !self.system
    }

    pub fn is_pending(&self) -> bool { !self.authorized }

    /// Flip to authorized. Returns false if it already was.
    pub fn confirm(&mut self) -> bool {
        if self.authorized { return false; }
        self.authorized = true;
        true
    }

    pub fn size_human(&self) -> String { humanize_bytes(self.size) }

    pub fn encode(&self) -> FsResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> FsResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Generate an upload confirmation token (UUID v4, never reused).
pub fn new_token() -> String {
    Uuid::new_v4().to_string()
}

/// Tokens are UUIDs; anything else is rejected before touching the store.
pub fn is_valid_token(token: &str) -> bool {
    Uuid::parse_str(token).is_ok()
}

/// Render a byte count with a binary-scaled unit suffix, truncating (`42MB`, `3B`).
pub fn humanize_bytes(bytes: u64) -> String {
    const SCALE: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];
    let mut rest = bytes;
    let mut n = 0;
    while rest > 1024 && n < SCALE.len() - 1 {
        rest >>= 10;
        n += 1;
    }
    format!("{}{}", rest, SCALE[n])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanize_bytes_scales() {
        assert_eq!(humanize_bytes(42 * (1 << 20)), "42MB");
        assert_eq!(humanize_bytes(3), "3B");
        assert_eq!(humanize_bytes((1 << 62) + (1 << 61)), "6EB");
        assert_eq!(humanize_bytes(1024), "1024B");
    }

    #[test]
    fn pending_record_lifecycle() {
        let mut r = FileRecord::pending("notes.pdf", 10, Utc::now(), "me@unitn.it");
        assert!(r.is_pending());
        assert!(!r.is_public());
        assert!(is_valid_token(&r.token));
        assert!(r.confirm());
        assert!(!r.confirm());
        assert!(r.is_public());
    }

    #[test]
    fn placeholder_is_never_public() {
        let p = FileRecord::placeholder();
        assert!(p.authorized);
        assert!(!p.is_public());
    }

    #[test]
    fn tokens_are_unique_and_validated() {
        let a = new_token();
        let b = new_token();
        assert_ne!(a, b);
        assert!(!is_valid_token("not-a-token"));
        assert!(!is_valid_token(""));
    }

    #[test]
    fn codec_tolerates_missing_optional_fields() {
        let raw = br#"{"name":"x.txt","size":1,"mod_time":"2016-01-02T03:04:05Z","owner_email":"a@b","authorized":true}"#;
        let r = FileRecord::decode(raw).unwrap();
        assert_eq!(r.name, "x.txt");
        assert!(r.token.is_empty());
        assert!(!r.system);
        let back = FileRecord::decode(&r.encode().unwrap()).unwrap();
        assert_eq!(back, r);
    }
}
