//! Interface to the host directory: the scored, filterable registry of
//! candidate hosts the satellite forms contracts with.

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::types::{Allowance, BlockHeight, ContractMetadata, Currency, PublicKey};

/// Prices and limits a host advertises in its settings table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
	pub base_rpc_price: Currency,
	pub contract_price: Currency,
	pub storage_price: Currency,
	pub upload_bandwidth_price: Currency,
	pub download_bandwidth_price: Currency,
	pub sector_access_price: Currency,
	pub max_collateral: Currency,
	pub max_duration: BlockHeight,
}

/// A host directory entry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HostDbEntry {
	pub public_key: PublicKey,
	pub net_address: String,
	/// Release version the host advertises; hosts below the supported floor
	/// are skipped by the renewal classifier.
	pub version: String,
	/// Set when the operator's filter mode excludes this host.
	pub filtered: bool,
	pub settings: HostSettings,
}

/// Score assigned to a host by the directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScoreBreakdown {
	pub score: Currency,
}

#[derive(Debug, thiserror::Error)]
#[error("host directory failure: {0}")]
pub struct HostDbError(pub String);

#[automock]
#[async_trait]
pub trait HostDb: Send + Sync {
	/// Looks up a host by public key. `Ok(None)` means the directory has
	/// never seen the host.
	async fn host(&self, public_key: PublicKey) -> Result<Option<HostDbEntry>, HostDbError>;

	/// Returns up to `n` hosts matching the allowance, excluding the
	/// blacklisted keys and any host whose address range collides with the
	/// address blacklist, sorted by descending score.
	async fn random_hosts_with_limits(
		&self,
		n: usize,
		blacklist: &[PublicKey],
		address_blacklist: &[PublicKey],
		allowance: &Allowance,
	) -> Result<Vec<HostDbEntry>, HostDbError>;

	async fn score_breakdown(&self, entry: &HostDbEntry) -> Result<ScoreBreakdown, HostDbError>;

	/// Returns the subset of `keys` whose hosts violate the directory's
	/// address-range policy.
	async fn check_for_ip_violations(
		&self,
		keys: &[PublicKey],
	) -> Result<Vec<PublicKey>, HostDbError>;

	/// Hands the directory the current view of live contracts.
	async fn update_contracts(&self, contracts: Vec<ContractMetadata>) -> Result<(), HostDbError>;
}
