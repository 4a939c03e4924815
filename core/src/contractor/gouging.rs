//! Price gouging checks.
//!
//! Two deliberately different thresholds. Contract formation rejects a host
//! whose quoted price exceeds a non-zero ceiling (strict greater-than).
//! Payment contracts reject already at the ceiling (greater-or-equal) and
//! additionally check the sector access price. A zero ceiling disables that
//! check.

use crate::errors::ContractorError;
use crate::hostdb::HostSettings;
use crate::types::Allowance;

/// Checks whether the pricing for forming a regular file contract triggers
/// price gouging protection.
pub fn check_form_contract_gouging(
	allowance: &Allowance,
	host_settings: &HostSettings,
) -> Result<(), ContractorError> {
	if !allowance.max_rpc_price.is_zero() && allowance.max_rpc_price < host_settings.base_rpc_price
	{
		return Err(ContractorError::PriceGouging(
			"rpc base price of host is too high".to_string(),
		));
	}
	if !allowance.max_contract_price.is_zero()
		&& allowance.max_contract_price < host_settings.contract_price
	{
		return Err(ContractorError::PriceGouging(
			"contract price of host is too high".to_string(),
		));
	}
	Ok(())
}

/// Checks whether the pricing for forming a payment contract is too high to
/// justify a contract with this host.
pub fn check_form_payment_contract_gouging(
	allowance: &Allowance,
	host_settings: &HostSettings,
) -> Result<(), ContractorError> {
	if !allowance.max_rpc_price.is_zero() && allowance.max_rpc_price <= host_settings.base_rpc_price
	{
		return Err(ContractorError::PriceGouging(
			"rpc base price of host is too high".to_string(),
		));
	}
	if !allowance.max_contract_price.is_zero()
		&& allowance.max_contract_price <= host_settings.contract_price
	{
		return Err(ContractorError::PriceGouging(
			"contract price of host is too high".to_string(),
		));
	}
	if !allowance.max_sector_access_price.is_zero()
		&& allowance.max_sector_access_price <= host_settings.sector_access_price
	{
		return Err(ContractorError::PriceGouging(
			"sector access price of host is too high".to_string(),
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Currency;

	fn allowance_with_ceilings() -> Allowance {
		Allowance {
			max_rpc_price: Currency::new(100),
			max_contract_price: Currency::new(1_000),
			max_sector_access_price: Currency::new(10),
			..Default::default()
		}
	}

	fn settings_below_ceilings() -> HostSettings {
		HostSettings {
			base_rpc_price: Currency::new(99),
			contract_price: Currency::new(999),
			sector_access_price: Currency::new(9),
			..Default::default()
		}
	}

	#[test]
	fn prices_below_every_ceiling_are_accepted() {
		let allowance = allowance_with_ceilings();
		let settings = settings_below_ceilings();
		assert!(check_form_contract_gouging(&allowance, &settings).is_ok());
		assert!(check_form_payment_contract_gouging(&allowance, &settings).is_ok());
	}

	#[test]
	fn raising_any_single_price_above_its_ceiling_rejects() {
		let allowance = allowance_with_ceilings();

		let mut settings = settings_below_ceilings();
		settings.base_rpc_price = Currency::new(101);
		assert!(check_form_contract_gouging(&allowance, &settings).is_err());

		let mut settings = settings_below_ceilings();
		settings.contract_price = Currency::new(1_001);
		assert!(check_form_contract_gouging(&allowance, &settings).is_err());
	}

	#[test]
	fn formation_accepts_at_the_ceiling_but_payment_rejects() {
		let allowance = allowance_with_ceilings();
		let mut settings = settings_below_ceilings();
		settings.base_rpc_price = Currency::new(100);
		settings.contract_price = Currency::new(1_000);

		assert!(check_form_contract_gouging(&allowance, &settings).is_ok());
		assert!(check_form_payment_contract_gouging(&allowance, &settings).is_err());
	}

	#[test]
	fn payment_contracts_also_check_sector_access_price() {
		let allowance = allowance_with_ceilings();
		let mut settings = settings_below_ceilings();
		settings.sector_access_price = Currency::new(10);

		assert!(check_form_contract_gouging(&allowance, &settings).is_ok());
		assert!(check_form_payment_contract_gouging(&allowance, &settings).is_err());
	}

	#[test]
	fn zero_ceilings_disable_the_check() {
		let allowance = Allowance::default();
		let settings = HostSettings {
			base_rpc_price: Currency::new(u128::MAX),
			contract_price: Currency::new(u128::MAX),
			sector_access_price: Currency::new(u128::MAX),
			..Default::default()
		};
		assert!(check_form_contract_gouging(&allowance, &settings).is_ok());
		assert!(check_form_payment_contract_gouging(&allowance, &settings).is_ok());
	}
}
