//! Estimates the funding a contract needs for its next billing cycle by
//! looking at how much storage the contract holds and what the historic
//! usage pattern across its renewal lineage has been.

use tracing::warn;

use crate::data::Database;
use crate::errors::{ContractorError, Result};
use crate::types::{
	tax, Allowance, BlockHeight, ContractMetadata, Currency,
	ESTIMATED_FILE_CONTRACT_TRANSACTION_SET_SIZE,
};

use super::Contractor;

/// Upper bound on lineage walks, guarding against an (impossible) cycle in
/// the renewal maps.
const MAX_LINEAGE_WALK: usize = 10_000;

impl<DB: Database> Contractor<DB> {
	pub(crate) async fn managed_estimate_renew_funding_requirements(
		&self,
		contract: &ContractMetadata,
		block_height: BlockHeight,
		allowance: &Allowance,
	) -> Result<Currency> {
		// Fetch the host pricing to use in the estimate.
		let host = self
			.hdb
			.host(contract.host_public_key)
			.await
			.map_err(|e| ContractorError::HostDb(e.to_string()))?
			.ok_or(ContractorError::HostNotFound)?;
		if host.filtered {
			return Err(ContractorError::HostBlocked);
		}
		if host.settings.storage_price > self.config.max_storage_price {
			return Err(ContractorError::HostTooExpensive);
		}

		let current_period = {
			let state = self.state.read().expect("lock acquired");
			state
				.renters
				.get(&contract.renter_public_key)
				.ok_or(ContractorError::RenterNotFound)?
				.current_period
		};

		// Money needed to keep the existing data stored for another period.
		let data_stored = Currency::new(contract.revision.filesize as u128);
		let storage_cost = data_stored
			.mul_u64(allowance.period)
			.mul(host.settings.storage_price);

		// Walk the renewal lineage backwards, accumulating the spending of
		// every predecessor that still belongs to the current billing
		// period. Refreshes spread one period's spending over several
		// contract ids, so a single contract's counters would undershoot.
		let mut prev_upload_spending = contract.spending.upload_spending;
		let mut prev_download_spending = contract.spending.download_spending;
		let mut prev_fund_account_spending = contract.spending.fund_account_spending;
		let mut prev_maintenance_spending = contract.spending.maintenance_spending;
		{
			let state = self.state.read().expect("lock acquired");
			let mut current_id = contract.id;
			for _ in 0..MAX_LINEAGE_WALK {
				let Some(prev_id) = state.renewed_from.get(&current_id) else {
					break;
				};
				current_id = *prev_id;

				let Some(prev_contract) = state.old_contracts.get(&current_id) else {
					warn!(
						contract_id = %current_id,
						"a known previous contract is missing from the archive"
					);
					break;
				};
				if prev_contract.start_height < current_period {
					break;
				}

				prev_upload_spending =
					prev_upload_spending.add(prev_contract.spending.upload_spending);
				prev_download_spending =
					prev_download_spending.add(prev_contract.spending.download_spending);
				prev_fund_account_spending =
					prev_fund_account_spending.add(prev_contract.spending.fund_account_spending);
				prev_maintenance_spending =
					prev_maintenance_spending.add(prev_contract.spending.maintenance_spending);
			}
		}

		// Estimate the amount of data uploaded last period from the upload
		// spending. The host may have changed prices, so never assume more
		// data than the contract actually stores.
		let mut prev_upload_data_estimate = prev_upload_spending;
		if !host.settings.upload_bandwidth_price.is_zero() {
			prev_upload_data_estimate =
				prev_upload_data_estimate.div(host.settings.upload_bandwidth_price);
		}
		if data_stored < prev_upload_data_estimate {
			prev_upload_data_estimate = data_stored;
		}

		// New uploads cost their bandwidth plus the implied storage for the
		// rest of the period.
		let new_uploads_cost = prev_upload_spending.add(
			prev_upload_data_estimate
				.mul_u64(allowance.period)
				.mul(host.settings.storage_price),
		);

		// Download, ephemeral-account funding and maintenance spending are
		// expected to stay roughly constant between periods.
		let new_downloads_cost = prev_download_spending;
		let new_fund_account_cost = prev_fund_account_spending;
		let new_maintenance_cost = prev_maintenance_spending;

		let contract_price = host.settings.contract_price;

		// Transaction fees are excluded from the levy estimate: they go to
		// the miners, not into the file contract.
		let before_levy = storage_cost
			.add(new_uploads_cost)
			.add(new_downloads_cost)
			.add(new_fund_account_cost)
			.add(new_maintenance_cost)
			.add(contract_price);
		let after_levy = tax(block_height, before_levy).add(before_levy);

		let (_, max_fee) = self.tpool.fee_estimation().await;
		let txn_fees = max_fee.mul_u64(ESTIMATED_FILE_CONTRACT_TRANSACTION_SET_SIZE);

		// Add a third on top for usage volatility.
		let mut estimated_cost = after_levy.add(txn_fees);
		estimated_cost = estimated_cost.add(estimated_cost.div_u64(3));

		// Never renew a contract with less than its share of the minimum
		// allowance funding.
		let minimum = allowance
			.funds
			.mul_float(self.config.file_contract_minimum_funding)
			.div_u64(allowance.hosts);
		if estimated_cost < minimum {
			estimated_cost = minimum;
		}
		Ok(estimated_cost)
	}
}

#[cfg(test)]
mod tests {
	use crate::contractor::testing::{self, TestParts};
	use crate::errors::ContractorError;
	use crate::types::{
		Allowance, ContractId, ContractMetadata, Currency, PublicKey, Revision, SpendingDetails,
	};

	fn allowance(funds: u128, hosts: u64, period: u64) -> Allowance {
		Allowance {
			funds: Currency::new(funds),
			hosts,
			period,
			renew_window: 100,
			..Default::default()
		}
	}

	fn contract_with_spending(
		id: u8,
		renter: PublicKey,
		host: PublicKey,
		start_height: u64,
		upload: u128,
	) -> ContractMetadata {
		ContractMetadata {
			id: ContractId([id; 32]),
			renter_public_key: renter,
			host_public_key: host,
			start_height,
			end_height: start_height + 1_000,
			revision: Revision {
				revision_number: 5,
				filesize: 1 << 20,
			},
			spending: SpendingDetails {
				upload_spending: Currency::new(upload),
				..Default::default()
			},
			..Default::default()
		}
	}

	#[tokio::test]
	async fn estimate_is_floored_at_the_minimum_funding_share() {
		let renter_key = PublicKey([1; 32]);
		let host_key = PublicKey([2; 32]);

		let mut parts = TestParts::default();
		let entry = testing::host_entry(host_key, 1, 100);
		parts
			.hdb
			.expect_host()
			.returning(move |_| Ok(Some(entry.clone())));
		parts
			.tpool
			.expect_fee_estimation()
			.returning(|| (Currency::new(1), Currency::new(2)));
		let (contractor, _alerter, _events) = testing::build(parts);
		contractor.update_renter(testing::renter(renter_key, 1_000_000_000_000, 2, 1_000));

		let allowance = allowance(1_000_000_000_000, 2, 1_000);
		let contract = ContractMetadata {
			revision: Revision {
				revision_number: 1,
				filesize: 0,
			},
			renter_public_key: renter_key,
			host_public_key: host_key,
			..Default::default()
		};
		let estimate = contractor
			.managed_estimate_renew_funding_requirements(&contract, 100, &allowance)
			.await
			.unwrap();

		let minimum = allowance.funds.mul_float(0.15).div_u64(allowance.hosts);
		assert!(estimate >= minimum);
		assert_eq!(estimate, minimum);
	}

	#[tokio::test]
	async fn lineage_spending_is_accumulated_within_the_period() {
		let renter_key = PublicKey([1; 32]);
		let host_key = PublicKey([2; 32]);

		let mut parts = TestParts::default();
		// Upload price of zero: the data estimate equals the upload spend.
		let entry = testing::host_entry(host_key, 1, 100);
		parts
			.hdb
			.expect_host()
			.returning(move |_| Ok(Some(entry.clone())));
		parts
			.tpool
			.expect_fee_estimation()
			.returning(|| (Currency::ZERO, Currency::ZERO));
		let (contractor, _alerter, _events) = testing::build(parts);
		contractor.update_renter(testing::renter(renter_key, 1, 1, 10));

		// c1 (height 150, in period) <- c2 (height 400, in period) <- live c3.
		// c0 started before the period and must not be counted.
		let c0 = contract_with_spending(9, renter_key, host_key, 10, 1_000_000);
		let c1 = contract_with_spending(10, renter_key, host_key, 150, 500);
		let c2 = contract_with_spending(11, renter_key, host_key, 400, 300);
		let c3 = contract_with_spending(12, renter_key, host_key, 700, 100);
		contractor.insert_old_contract(c0.clone());
		contractor.insert_old_contract(c1.clone());
		contractor.insert_old_contract(c2.clone());
		contractor.insert_lineage(c0.id, c1.id);
		contractor.insert_lineage(c1.id, c2.id);
		contractor.insert_lineage(c2.id, c3.id);

		// current_period = 100, so c1 and c2 count, c0 does not.
		let mut renter = testing::renter(renter_key, 1, 1, 10);
		renter.current_period = 100;
		contractor.update_renter(renter);

		let allowance = allowance(1, 1, 10);
		let estimate = contractor
			.managed_estimate_renew_funding_requirements(&c3, 700, &allowance)
			.await
			.unwrap();

		// upload spend total: 100 + 300 + 500 = 900; upload price is zero so
		// the data estimate is capped at the stored bytes. With storage
		// price 1 and period 10:
		//   storage = filesize * 10, uploads = 900 + min(900, filesize) * 10
		let data = 1u128 << 20;
		let before_levy = data * 10 + 900 + 900 * 10 + 100;
		// height 700 is below the levy hardfork, so no rounding applies
		let expected = before_levy + before_levy * 39 / 1000;
		let expected = expected + expected / 3;
		assert_eq!(estimate.as_u128(), expected);
	}

	#[tokio::test]
	async fn filtered_hosts_are_rejected() {
		let host_key = PublicKey([2; 32]);
		let renter_key = PublicKey([1; 32]);

		let mut parts = TestParts::default();
		let mut entry = testing::host_entry(host_key, 1, 100);
		entry.filtered = true;
		parts
			.hdb
			.expect_host()
			.returning(move |_| Ok(Some(entry.clone())));
		let (contractor, _alerter, _events) = testing::build(parts);
		contractor.update_renter(testing::renter(renter_key, 1, 1, 10));

		let contract = ContractMetadata {
			renter_public_key: renter_key,
			host_public_key: host_key,
			..Default::default()
		};
		let result = contractor
			.managed_estimate_renew_funding_requirements(&contract, 100, &allowance(1, 1, 10))
			.await;
		assert!(matches!(result, Err(ContractorError::HostBlocked)));
	}

	#[tokio::test]
	async fn unknown_hosts_are_rejected() {
		let renter_key = PublicKey([1; 32]);
		let mut parts = TestParts::default();
		parts.hdb.expect_host().returning(|_| Ok(None));
		let (contractor, _alerter, _events) = testing::build(parts);
		contractor.update_renter(testing::renter(renter_key, 1, 1, 10));

		let contract = ContractMetadata {
			renter_public_key: renter_key,
			..Default::default()
		};
		let result = contractor
			.managed_estimate_renew_funding_requirements(&contract, 100, &allowance(1, 1, 10))
			.await;
		assert!(matches!(result, Err(ContractorError::HostNotFound)));
	}

	#[tokio::test]
	async fn walk_stops_at_an_unknown_predecessor() {
		let renter_key = PublicKey([1; 32]);
		let host_key = PublicKey([2; 32]);

		let mut parts = TestParts::default();
		let entry = testing::host_entry(host_key, 1, 100);
		parts
			.hdb
			.expect_host()
			.returning(move |_| Ok(Some(entry.clone())));
		parts
			.tpool
			.expect_fee_estimation()
			.returning(|| (Currency::ZERO, Currency::ZERO));
		let (contractor, _alerter, _events) = testing::build(parts);
		let mut renter = testing::renter(renter_key, 1, 1, 10);
		renter.current_period = 0;
		contractor.update_renter(renter);

		// Lineage points to a predecessor that is not in the archive: the
		// walk proceeds with what was gathered so far.
		let live = contract_with_spending(12, renter_key, host_key, 700, 100);
		contractor.insert_lineage(ContractId([99; 32]), live.id);

		let estimate = contractor
			.managed_estimate_renew_funding_requirements(&live, 700, &allowance(1, 1, 10))
			.await;
		assert!(estimate.is_ok());
	}

	#[tokio::test]
	async fn walk_survives_a_pathological_lineage_cycle() {
		let renter_key = PublicKey([1; 32]);
		let host_key = PublicKey([2; 32]);

		let mut parts = TestParts::default();
		let entry = testing::host_entry(host_key, 1, 100);
		parts
			.hdb
			.expect_host()
			.returning(move |_| Ok(Some(entry.clone())));
		parts
			.tpool
			.expect_fee_estimation()
			.returning(|| (Currency::ZERO, Currency::ZERO));
		let (contractor, _alerter, _events) = testing::build(parts);
		let mut renter = testing::renter(renter_key, 1, 1, 10);
		renter.current_period = 0;
		contractor.update_renter(renter);

		// Two archived contracts pointing at each other. The walk cap stops
		// the loop and the estimate still comes out.
		let a = contract_with_spending(10, renter_key, host_key, 100, 1);
		let b = contract_with_spending(11, renter_key, host_key, 100, 1);
		contractor.insert_old_contract(a.clone());
		contractor.insert_old_contract(b.clone());
		contractor.insert_lineage(a.id, b.id);
		contractor.insert_lineage(b.id, a.id);

		let live = contract_with_spending(12, renter_key, host_key, 700, 1);
		contractor.insert_lineage(b.id, live.id);

		let estimate = contractor
			.managed_estimate_renew_funding_requirements(&live, 700, &allowance(1, 1, 10))
			.await;
		assert!(estimate.is_ok());
	}
}
