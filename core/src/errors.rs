use thiserror::Error;

pub type Result<T> = std::result::Result<T, ContractorError>;

/// Failures surfaced by the contract maintenance engine.
#[derive(Debug, Error)]
pub enum ContractorError {
	#[error("renter is not known to the satellite")]
	RenterNotFound,
	#[error("contract not found")]
	ContractNotFound,
	#[error("allowance is not large enough to cover fees of contract creation")]
	InsufficientAllowance,
	#[error("host price was too high")]
	HostTooExpensive,
	#[error("host is blocked")]
	HostBlocked,
	#[error("could not find host in the host directory")]
	HostNotFound,
	#[error("contract has already ended")]
	ContractEnded,
	#[error("contract is not good for renew")]
	ContractNotGoodForRenew,
	#[error("price gouging detected: {0}")]
	PriceGouging(String),
	#[error("the wallet is locked")]
	WalletLocked,
	#[error("consensus is not synced yet")]
	NotSynced,
	#[error("the satellite was stopped")]
	Stopped,
	#[error("renter already has a contract with this host")]
	DuplicateContract,
	#[error("host is unsuitable: {0}")]
	UnsuitableHost(String),
	#[error("contract is already being monitored")]
	AlreadyMonitored,
	#[error("host directory error: {0}")]
	HostDb(String),
	#[error("wallet error: {0}")]
	Wallet(#[from] WalletError),
	#[error("negotiation error: {0}")]
	Protocol(#[from] ProtocolError),
	#[error("store error: {0}")]
	Store(#[from] StoreError),
	#[error("{context}: {source}")]
	Context {
		context: String,
		#[source]
		source: Box<ContractorError>,
	},
}

impl ContractorError {
	/// Annotates an error with context, preserving the original as source.
	pub fn context(self, context: impl Into<String>) -> Self {
		ContractorError::Context {
			context: context.into(),
			source: Box::new(self),
		}
	}

	/// Strips context wrappers, returning the underlying error kind.
	pub fn root(&self) -> &ContractorError {
		match self {
			ContractorError::Context { source, .. } => source.root(),
			other => other,
		}
	}

	/// Whether the failure is attributable to the remote host, as opposed to
	/// the satellite's own wallet, store, or consensus view. Host-fault
	/// failures count towards the consecutive-renewal-failure lockout.
	pub fn is_hosts_fault(&self) -> bool {
		match self {
			ContractorError::Protocol(e) => e.is_hosts_fault(),
			ContractorError::HostTooExpensive | ContractorError::PriceGouging(_) => true,
			ContractorError::Context { source, .. } => source.is_hosts_fault(),
			_ => false,
		}
	}
}

/// Failures of the wallet collaborator.
#[derive(Debug, Error)]
pub enum WalletError {
	#[error("wallet is locked")]
	Locked,
	#[error("wallet has insufficient funds")]
	InsufficientFunds,
	#[error("wallet failure: {0}")]
	Other(String),
}

/// Failures of the host negotiation protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
	/// The host rejected or aborted the negotiation.
	#[error("host rejected the negotiation: {0}")]
	HostRejected(String),
	/// The connection to the host failed mid-protocol.
	#[error("session transport failure: {0}")]
	Transport(String),
	/// The satellite could not assemble a valid request.
	#[error("negotiation failed locally: {0}")]
	Local(String),
}

impl ProtocolError {
	pub fn is_hosts_fault(&self) -> bool {
		matches!(
			self,
			ProtocolError::HostRejected(_) | ProtocolError::Transport(_)
		)
	}
}

/// Failures of the persistent store. Never fatal inside a maintenance tick;
/// callers log them and keep the in-memory state authoritative.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("store put failed for {key}: {reason}")]
	Put { key: String, reason: String },
	#[error("store get failed for {key}: {reason}")]
	Get { key: String, reason: String },
	#[error("stored record is corrupt at {key}: {reason}")]
	Corrupt { key: String, reason: String },
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hosts_fault_survives_context_wrapping() {
		let err = ContractorError::from(ProtocolError::Transport("reset".to_string()))
			.context("renewing contract");
		assert!(err.is_hosts_fault());

		let err = ContractorError::from(WalletError::Locked).context("renewing contract");
		assert!(!err.is_hosts_fault());
	}
}
