//! Core library of the storage satellite: a third-party intermediary that
//! forms, renews and refreshes storage contracts on a decentralized storage
//! network on behalf of multiple renters.
//!
//! The center of the crate is the [`contractor`] module with its periodic
//! maintenance pass and the `FormContracts`/`RenewContracts` entry points.
//! The host directory, wallet, transaction pool and negotiation protocol are
//! consumed through traits; the persistent store, contract set, watchdog and
//! alert registry live in this crate.

pub mod alerts;
pub mod contractor;
pub mod contracts;
pub mod data;
pub mod errors;
pub mod hostdb;
pub mod proto;
pub mod shutdown;
pub mod types;
pub mod utils;
pub mod wallet;
pub mod watchdog;

pub use contractor::Contractor;
pub use errors::{ContractorError, Result};
