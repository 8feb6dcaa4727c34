//! Spendometer - fundraising tracker fed by payment confirmation emails
//!
//! Polls an IMAP mailbox for PayPal notifications, extracts the donation
//! from each one, and records it exactly once in a local SQLite ledger.
//!
//! ## Module Organization
//!
//! - `config`: TOML configuration and password resolution
//! - `mailbox`: message source seam and the IMAP implementation
//! - `parser`: turns raw message bytes into a donation (pure, no I/O)
//! - `store`: SQLite ledger for donations and the ingestion checkpoint
//! - `ingest`: the run that ties fetch, parse, commit and checkpoint together

pub mod config;
pub mod error;
pub mod ingest;
pub mod mailbox;
pub mod parser;
pub mod store;

pub use error::MeterError;
