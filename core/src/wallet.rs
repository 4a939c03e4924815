//! Interfaces to the wallet and the transaction pool, plus the renter seed
//! derivation the negotiator uses.
//!
//! The satellite holds one wallet for all renters; each renter gets a
//! deterministic seed derived from the wallet's primary seed and the account
//! email. Derived seeds are usable as key material, so they are overwritten
//! with random bytes as soon as they go out of scope.

use async_trait::async_trait;
use mockall::automock;
use rand::RngCore;

use crate::errors::WalletError;
use crate::types::{Address, Currency, Output, Transaction};

/// The wallet's primary seed.
pub struct Seed(pub [u8; 32]);

/// A per-renter seed derived from the wallet seed and the account email.
/// Wiped with random bytes on drop.
pub struct RenterSeed([u8; 32]);

impl RenterSeed {
	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl Drop for RenterSeed {
	fn drop(&mut self) {
		rand::thread_rng().fill_bytes(&mut self.0);
	}
}

impl Drop for Seed {
	fn drop(&mut self) {
		rand::thread_rng().fill_bytes(&mut self.0);
	}
}

/// Derives the seed used on behalf of a renter during contract negotiation.
pub fn derive_renter_seed(seed: &Seed, email: &str) -> RenterSeed {
	let hash = blake2b_simd::Params::new()
		.hash_length(32)
		.to_state()
		.update(b"renter seed")
		.update(&seed.0)
		.update(email.as_bytes())
		.finalize();
	let mut bytes = [0u8; 32];
	bytes.copy_from_slice(hash.as_bytes());
	RenterSeed(bytes)
}

/// An in-progress transaction reserving wallet outputs. Builders must be
/// discarded on failure so the reserved outputs return to the wallet.
#[automock]
#[async_trait]
pub trait TransactionBuilder: Send + Sync {
	/// Adds inputs worth at least `amount` to the transaction.
	async fn fund(&mut self, amount: Currency) -> Result<(), WalletError>;

	/// Adds an output spending the funded inputs back to the given output's
	/// address, returning the sweep transaction and its parents.
	fn sweep(&mut self, output: Output) -> (Transaction, Vec<Transaction>);

	/// Current state of the built transaction and its parent set.
	fn view(&self) -> (Transaction, Vec<Transaction>);

	/// Releases all reserved outputs back to the wallet.
	fn discard(&mut self);
}

#[automock]
#[async_trait]
pub trait Wallet: Send + Sync {
	/// Derives a fresh address, e.g. for contract refunds.
	async fn next_address(&self) -> Result<Address, WalletError>;

	/// Returns an address handed out by [`Wallet::next_address`] to the
	/// unused pool; called when the negotiation it was derived for fails.
	async fn mark_address_unused(&self, address: Address) -> Result<(), WalletError>;

	async fn primary_seed(&self) -> Result<Seed, WalletError>;

	async fn unlocked(&self) -> Result<bool, WalletError>;

	async fn start_transaction(&self) -> Result<Box<dyn TransactionBuilder>, WalletError>;
}

#[automock]
#[async_trait]
pub trait TransactionPool: Send + Sync {
	/// Returns the (minimum, maximum) fee estimate per byte.
	async fn fee_estimation(&self) -> (Currency, Currency);

	/// Submits a transaction set for broadcast.
	async fn accept_transaction_set(&self, txns: Vec<Transaction>) -> Result<(), WalletError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn renter_seeds_are_deterministic_per_email() {
		let seed = Seed([7; 32]);
		let a = derive_renter_seed(&seed, "a@example.com");
		let b = derive_renter_seed(&seed, "b@example.com");
		let a_again = derive_renter_seed(&seed, "a@example.com");
		assert_eq!(a.as_bytes(), a_again.as_bytes());
		assert_ne!(a.as_bytes(), b.as_bytes());
	}
}
