//! `fsv-app` — composition root for the entitlement ledger.
//!
//! Builds one session (config, store, purchase provider, ledger) and runs
//! single ledger commands against it.

pub mod commands;
pub mod session;

pub use commands::{Cli, Command, run};
pub use session::{AppSettings, Session};
