pub mod config;
pub mod error;
pub mod indexer;
pub mod mailer;
pub mod notify;
pub mod server;
pub mod storage;
