//! Shared satellite structs and enums.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

/// Measured in blocks since the genesis block.
pub type BlockHeight = u64;

/// Size of a single sector on the storage network, in bytes.
pub const SECTOR_SIZE: u64 = 1 << 22;

/// Estimated size of a file contract transaction set, in bytes. Used to
/// convert per-byte fee estimates into a flat transaction fee.
pub const ESTIMATED_FILE_CONTRACT_TRANSACTION_SET_SIZE: u64 = 2048;

/// Height at which the network levy started rounding payouts down to a
/// multiple of the fund denomination.
pub const TAX_HARDFORK_HEIGHT: BlockHeight = 21_000;

const FUND_DENOMINATION: u128 = 10_000;
const TAX_NUMERATOR: u128 = 39;
const TAX_DENOMINATOR: u128 = 1000;

/// An amount of money, in base units of the network currency.
///
/// Amounts on the wire and in the store are stringified big integers, so the
/// serde representation is a decimal string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Currency(u128);

impl Currency {
	pub const ZERO: Currency = Currency(0);

	pub const fn new(value: u128) -> Self {
		Currency(value)
	}

	pub fn is_zero(&self) -> bool {
		self.0 == 0
	}

	pub fn checked_sub(self, other: Currency) -> Option<Currency> {
		self.0.checked_sub(other.0).map(Currency)
	}

	pub fn saturating_sub(self, other: Currency) -> Currency {
		Currency(self.0.saturating_sub(other.0))
	}

	pub fn add(self, other: Currency) -> Currency {
		Currency(self.0.saturating_add(other.0))
	}

	pub fn mul(self, other: Currency) -> Currency {
		Currency(self.0.saturating_mul(other.0))
	}

	pub fn mul_u64(self, factor: u64) -> Currency {
		Currency(self.0.saturating_mul(factor as u128))
	}

	pub fn div_u64(self, divisor: u64) -> Currency {
		Currency(self.0 / divisor.max(1) as u128)
	}

	pub fn div(self, divisor: Currency) -> Currency {
		Currency(self.0 / divisor.0.max(1))
	}

	/// Multiplies by an f64 factor, rounding towards zero. Only used for the
	/// configured fractional thresholds, where precision loss is acceptable.
	pub fn mul_float(self, factor: f64) -> Currency {
		Currency((self.0 as f64 * factor) as u128)
	}

	/// Fraction of `self` over `total`, as an f64 in `[0, 1]`.
	pub fn ratio(self, total: Currency) -> f64 {
		if total.is_zero() {
			return 0.0;
		}
		self.0 as f64 / total.0 as f64
	}

	pub fn as_u128(&self) -> u128 {
		self.0
	}
}

impl Display for Currency {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl Serialize for Currency {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.0.to_string())
	}
}

impl<'de> Deserialize<'de> for Currency {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let value = String::deserialize(deserializer)?;
		value
			.parse::<u128>()
			.map(Currency)
			.map_err(|e| D::Error::custom(format!("invalid currency string: {e}")))
	}
}

/// The levy charged by the network on every file contract payout.
pub fn tax(height: BlockHeight, payout: Currency) -> Currency {
	let raw = payout.0 * TAX_NUMERATOR / TAX_DENOMINATOR;
	if height >= TAX_HARDFORK_HEIGHT {
		Currency(raw - raw % FUND_DENOMINATION)
	} else {
		Currency(raw)
	}
}

macro_rules! id_type {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
		pub struct $name(pub [u8; 32]);

		impl Display for $name {
			fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
				f.write_str(&hex::encode(self.0))
			}
		}

		impl Serialize for $name {
			fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
				serializer.serialize_str(&hex::encode(self.0))
			}
		}

		impl<'de> Deserialize<'de> for $name {
			fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
				let value = String::deserialize(deserializer)?;
				let bytes = hex::decode(&value).map_err(D::Error::custom)?;
				let bytes: [u8; 32] = bytes
					.try_into()
					.map_err(|_| D::Error::custom("expected 32 hex-encoded bytes"))?;
				Ok($name(bytes))
			}
		}
	};
}

id_type!(
	/// Public key identifying a renter or a host.
	PublicKey
);
id_type!(
	/// Stable identifier of a file contract.
	ContractId
);
id_type!(
	/// An address funds can be sent to.
	Address
);
id_type!(
	/// Identifier of a transaction output, spent by exactly one transaction.
	OutputId
);
id_type!(
	/// Identifier of an on-chain transaction.
	TransactionId
);

/// A transaction output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
	pub value: Currency,
	pub address: Address,
}

/// A minimal view of an on-chain transaction: enough to track which outputs
/// it spends and creates. Signatures and contract bodies stay opaque to the
/// satellite and live with the wallet and the negotiation protocol.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
	pub id: TransactionId,
	pub inputs: Vec<OutputId>,
	pub outputs: Vec<Output>,
}

/// The latest known revision of a file contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
	pub revision_number: u64,
	pub filesize: u64,
}

/// Whether a contract is usable for uploading and renewing. `locked` is
/// terminal for the contract id; the contract itself stays on chain until
/// its end height.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractUtility {
	pub good_for_upload: bool,
	pub good_for_renew: bool,
	pub locked: bool,
}

impl ContractUtility {
	/// The utility of a freshly formed or renewed contract.
	pub fn active() -> Self {
		ContractUtility {
			good_for_upload: true,
			good_for_renew: true,
			locked: false,
		}
	}

	/// Canceled or otherwise dead: not usable for anything anymore.
	pub fn locked() -> Self {
		ContractUtility {
			good_for_upload: false,
			good_for_renew: false,
			locked: true,
		}
	}
}

/// Cumulative money spent through a contract, by category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingDetails {
	pub upload_spending: Currency,
	pub download_spending: Currency,
	pub fund_account_spending: Currency,
	pub maintenance_spending: Currency,
}

/// Everything the satellite remembers about one file contract.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContractMetadata {
	pub id: ContractId,
	pub renter_public_key: PublicKey,
	pub host_public_key: PublicKey,
	pub start_height: BlockHeight,
	pub end_height: BlockHeight,
	pub total_cost: Currency,
	pub renter_funds: Currency,
	pub spending: SpendingDetails,
	pub utility: ContractUtility,
	pub revision: Revision,
	/// Transaction carrying the latest revision, broadcast by the watchdog
	/// when the contract is superseded.
	pub revision_txn: Transaction,
}

/// Per-renter budget envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Allowance {
	pub funds: Currency,
	pub hosts: u64,
	pub period: BlockHeight,
	pub renew_window: BlockHeight,
	pub expected_storage: u64,
	pub expected_upload: u64,
	pub expected_download: u64,
	pub expected_redundancy: f64,
	pub max_rpc_price: Currency,
	pub max_contract_price: Currency,
	pub max_download_bandwidth_price: Currency,
	pub max_sector_access_price: Currency,
	pub max_storage_price: Currency,
	pub max_upload_bandwidth_price: Currency,
}

impl Allowance {
	pub fn is_set(&self) -> bool {
		self.hosts > 0 && self.period > 0 && !self.funds.is_zero()
	}
}

/// A renter whose contracts the satellite maintains.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Renter {
	pub public_key: PublicKey,
	/// Account email; unique, and the input to per-renter seed derivation.
	pub email: String,
	/// Height at which the present billing cycle began.
	pub current_period: BlockHeight,
	pub allowance: Allowance,
}

impl Renter {
	/// End height for contracts formed or renewed in the current period.
	pub fn contract_end_height(&self) -> BlockHeight {
		self.current_period + self.allowance.period + self.allowance.renew_window
	}
}

/// A consensus update delivered to the maintenance loop and the watchdog.
#[derive(Clone, Debug, Default)]
pub struct TipEvent {
	pub height: BlockHeight,
	pub synced: bool,
	/// Transactions applied by the blocks covered by this event.
	pub applied: Vec<Transaction>,
}

/// Satellite-wide knobs for the contract maintenance engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractorConfig {
	/// Global ceiling on host storage prices; hosts above it are never used,
	/// regardless of renter allowances.
	pub max_storage_price: Currency,
	/// Cap applied to the collateral a host declares.
	pub max_collateral: Currency,
	/// Hosts advertising a release below this version are skipped.
	pub min_supported_host_version: String,
	/// Minimum fraction of `allowance.funds / allowance.hosts` a single
	/// contract is funded with.
	pub file_contract_minimum_funding: f64,
	/// A contract whose remaining funds fall below this fraction of its
	/// total cost is refreshed.
	pub min_contract_fund_renewal_threshold: f64,
	/// Consecutive host-fault renewal failures tolerated in the second half
	/// of the renew window before the contract is locked.
	pub consecutive_renewals_before_replacement: u64,
	/// Extra random hosts drawn when computing minimum acceptable scores.
	pub random_hosts_buffer_for_score: usize,
	pub score_leeway_good_for_renew: u64,
	pub score_leeway_good_for_upload: u64,
	pub max_initial_contract_funding_mul_factor: u64,
	pub max_initial_contract_funding_div_factor: u64,
	pub min_initial_contract_funding_div_factor: u64,
	/// Multiplier applied to `contract_price + txn_fee` when sizing the
	/// funding of a brand-new contract.
	pub contract_fee_funding_mul_factor: u64,
	/// Cadence of the background maintenance tick.
	#[serde(with = "duration_seconds_format")]
	pub maintenance_interval: Duration,
}

impl Default for ContractorConfig {
	fn default() -> Self {
		ContractorConfig {
			max_storage_price: Currency::new(300_000_000_000),
			max_collateral: Currency::new(1_000_000_000_000_000_000_000_000_000),
			min_supported_host_version: "1.5.4".to_string(),
			file_contract_minimum_funding: 0.15,
			min_contract_fund_renewal_threshold: 0.03,
			consecutive_renewals_before_replacement: 12,
			random_hosts_buffer_for_score: 50,
			score_leeway_good_for_renew: 500,
			score_leeway_good_for_upload: 25,
			max_initial_contract_funding_mul_factor: 3,
			max_initial_contract_funding_div_factor: 2,
			min_initial_contract_funding_div_factor: 20,
			contract_fee_funding_mul_factor: 10,
			maintenance_interval: Duration::from_secs(600),
		}
	}
}

pub mod duration_seconds_format {
	use std::time::Duration;

	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(duration.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let seconds = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(seconds))
	}
}

#[cfg(test)]
mod tests {
	use hex_literal::hex;
	use test_case::test_case;

	use super::*;

	#[test]
	fn currency_round_trips_through_decimal_strings() {
		let amount = Currency::new(123_456_789_000_000_000_000_000_000);
		let encoded = serde_json::to_string(&amount).unwrap();
		assert_eq!(encoded, "\"123456789000000000000000000\"");
		let decoded: Currency = serde_json::from_str(&encoded).unwrap();
		assert_eq!(decoded, amount);
	}

	#[test]
	fn public_keys_serialize_as_hex() {
		let key = PublicKey(hex!(
			"c454470d840bc2583fcf881be4fd8a0f6daeac3a20d83b9fd4865737e56c9739"
		));
		let encoded = serde_json::to_string(&key).unwrap();
		assert_eq!(
			encoded,
			"\"c454470d840bc2583fcf881be4fd8a0f6daeac3a20d83b9fd4865737e56c9739\""
		);
		let decoded: PublicKey = serde_json::from_str(&encoded).unwrap();
		assert_eq!(decoded, key);
	}

	#[test_case(1_000_000_000, 39_000_000; "whole permille")]
	#[test_case(1_000, 39; "small payout")]
	#[test_case(0, 0; "zero payout")]
	fn tax_before_the_hardfork_is_plain_permille(payout: u128, expected: u128) {
		assert_eq!(tax(0, Currency::new(payout)), Currency::new(expected));
	}

	#[test]
	fn currency_saturates_instead_of_underflowing() {
		let small = Currency::new(10);
		let big = Currency::new(20);
		assert_eq!(small.saturating_sub(big), Currency::ZERO);
		assert_eq!(small.checked_sub(big), None);
		assert_eq!(big.checked_sub(small), Some(Currency::new(10)));
	}

	#[test]
	fn tax_rounds_to_fund_denomination_after_hardfork() {
		let payout = Currency::new(1_000_000_001);
		let before = tax(0, payout);
		let after = tax(TAX_HARDFORK_HEIGHT, payout);
		assert_eq!(before, Currency::new(39_000_000));
		assert_eq!(after, Currency::new(39_000_000));
		let odd = tax(TAX_HARDFORK_HEIGHT, Currency::new(1_000_255));
		assert_eq!(odd.as_u128() % 10_000, 0);
	}

	#[test]
	fn contract_end_height_spans_period_and_window() {
		let renter = Renter {
			public_key: PublicKey::default(),
			email: "renter@example.com".to_string(),
			current_period: 1_000,
			allowance: Allowance {
				period: 2_000,
				renew_window: 200,
				..Default::default()
			},
		};
		assert_eq!(renter.contract_end_height(), 3_200);
	}
}
