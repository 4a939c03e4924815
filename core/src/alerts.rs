//! Persistent alerts surfaced to satellite operators and renters.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Registered alerts are keyed by id: re-registering replaces the previous
/// alert rather than stacking a duplicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertId {
	/// A renter's allowance can no longer fund required contract formations
	/// or renewals.
	RenterAllowanceLowFunds,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
	Info,
	Warning,
	Error,
	Critical,
}

impl Display for AlertSeverity {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			AlertSeverity::Info => "info",
			AlertSeverity::Warning => "warning",
			AlertSeverity::Error => "error",
			AlertSeverity::Critical => "critical",
		})
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
	pub id: AlertId,
	pub msg: String,
	pub cause: String,
	pub severity: AlertSeverity,
}

pub trait Alerter: Send + Sync {
	fn register_alert(&self, id: AlertId, msg: String, cause: String, severity: AlertSeverity);
	fn unregister_alert(&self, id: AlertId);
}

/// In-memory alert registry.
#[derive(Default)]
pub struct AlertRegistry {
	alerts: RwLock<HashMap<AlertId, Alert>>,
}

impl AlertRegistry {
	pub fn active_alerts(&self) -> Vec<Alert> {
		let alerts = self.alerts.read().expect("lock acquired");
		alerts.values().cloned().collect()
	}
}

impl Alerter for AlertRegistry {
	fn register_alert(&self, id: AlertId, msg: String, cause: String, severity: AlertSeverity) {
		let mut alerts = self.alerts.write().expect("lock acquired");
		alerts.insert(
			id,
			Alert {
				id,
				msg,
				cause,
				severity,
			},
		);
	}

	fn unregister_alert(&self, id: AlertId) {
		let mut alerts = self.alerts.write().expect("lock acquired");
		alerts.remove(&id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registering_twice_keeps_a_single_alert() {
		let registry = AlertRegistry::default();
		registry.register_alert(
			AlertId::RenterAllowanceLowFunds,
			"allowance is too low".to_string(),
			"insufficient funds".to_string(),
			AlertSeverity::Warning,
		);
		registry.register_alert(
			AlertId::RenterAllowanceLowFunds,
			"allowance is still too low".to_string(),
			"insufficient funds".to_string(),
			AlertSeverity::Warning,
		);
		assert_eq!(registry.active_alerts().len(), 1);

		registry.unregister_alert(AlertId::RenterAllowanceLowFunds);
		assert!(registry.active_alerts().is_empty());
	}
}
