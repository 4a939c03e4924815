//! Interface to the renter↔host negotiation protocol. The wire codec lives
//! with the session layer; the maintenance engine only sees negotiated
//! contracts and transaction sets.

use async_trait::async_trait;
use mockall::automock;

use crate::errors::ProtocolError;
use crate::hostdb::{HostDbEntry, HostSettings};
use crate::types::{Address, Allowance, BlockHeight, ContractMetadata, Currency, PublicKey, Transaction};
use crate::wallet::RenterSeed;

/// Everything the session layer needs to negotiate one contract.
///
/// Holds the derived renter seed; dropping the params wipes it.
pub struct ContractParams {
	pub allowance: Allowance,
	pub host: HostDbEntry,
	pub funding: Currency,
	pub start_height: BlockHeight,
	pub end_height: BlockHeight,
	pub refund_address: Address,
	pub renter_seed: RenterSeed,
}

/// The funded transaction a negotiation is built on top of.
pub struct FundedTransactionSet {
	pub transaction: Transaction,
	pub parents: Vec<Transaction>,
}

/// Outcome of a successful form or renew negotiation.
pub struct NegotiatedContract {
	pub contract: ContractMetadata,
	/// The full transaction set to be confirmed on chain.
	pub formation_set: Vec<Transaction>,
}

#[automock]
#[async_trait]
pub trait HostProtocol: Send + Sync {
	/// Opens a short-lived session with the host and fetches its current
	/// settings. Renewals use these, not the possibly stale directory entry.
	async fn session_settings(
		&self,
		renter_public_key: PublicKey,
		host: &HostDbEntry,
	) -> Result<HostSettings, ProtocolError>;

	/// Runs the formation protocol with the host in `params`.
	async fn form_contract(
		&self,
		params: &ContractParams,
		funding: &FundedTransactionSet,
	) -> Result<NegotiatedContract, ProtocolError>;

	/// Runs the renewal protocol for an existing contract.
	async fn renew_contract(
		&self,
		old_contract: &ContractMetadata,
		params: &ContractParams,
		funding: &FundedTransactionSet,
	) -> Result<NegotiatedContract, ProtocolError>;
}
