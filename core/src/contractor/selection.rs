//! Host selection: candidate batches for contract formation and the score
//! floors below which existing contracts stop being worth keeping.

use crate::data::Database;
use crate::errors::{ContractorError, Result};
use crate::hostdb::HostDbEntry;
use crate::types::{Currency, PublicKey, Renter};

use super::Contractor;

/// Minimum acceptable host scores for a renter's contracts, derived from a
/// random sample of hosts that could replace them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MinimumScores {
	pub good_for_renew: Currency,
	pub good_for_upload: Currency,
}

impl<DB: Database> Contractor<DB> {
	/// Pulls a fresh set of hosts matching the allowance and uses the lowest
	/// score among them as the baseline for whether existing contracts are
	/// still worthwhile.
	pub(crate) async fn managed_find_min_allowed_host_scores(
		&self,
		renter_public_key: PublicKey,
	) -> Result<MinimumScores> {
		let renter = self.renter(renter_public_key)?;

		let host_count = renter.allowance.hosts as usize;
		let hosts = self
			.hdb
			.random_hosts_with_limits(
				host_count + self.config.random_hosts_buffer_for_score,
				&[],
				&[],
				&renter.allowance,
			)
			.await
			.map_err(|e| ContractorError::HostDb(e.to_string()))?;
		if hosts.is_empty() {
			return Err(ContractorError::HostDb(
				"no hosts returned in the random sample".to_string(),
			));
		}

		let mut lowest_score: Option<Currency> = None;
		for host in &hosts {
			let breakdown = self
				.hdb
				.score_breakdown(host)
				.await
				.map_err(|e| ContractorError::HostDb(e.to_string()))?;
			lowest_score = Some(match lowest_score {
				Some(lowest) if lowest <= breakdown.score => lowest,
				_ => breakdown.score,
			});
		}
		let lowest_score = lowest_score.expect("sample is non-empty");

		Ok(MinimumScores {
			good_for_renew: lowest_score.div_u64(self.config.score_leeway_good_for_renew),
			good_for_upload: lowest_score.div_u64(self.config.score_leeway_good_for_upload),
		})
	}

	/// Candidates for forming `needed` new contracts, honouring the renter's
	/// blacklist and the address blacklist. The directory returns them
	/// sorted by its score.
	pub(crate) async fn managed_candidate_hosts(
		&self,
		renter: &Renter,
		blacklist: &[PublicKey],
		address_blacklist: &[PublicKey],
		needed: usize,
	) -> Result<Vec<HostDbEntry>> {
		self.hdb
			.random_hosts_with_limits(
				needed * 4 + self.config.random_hosts_buffer_for_score,
				blacklist,
				address_blacklist,
				&renter.allowance,
			)
			.await
			.map_err(|e| ContractorError::HostDb(e.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use crate::contractor::testing::{self, TestParts};
	use crate::hostdb::ScoreBreakdown;
	use crate::types::{Currency, PublicKey};

	#[tokio::test]
	async fn score_floors_divide_the_lowest_sampled_score() {
		let renter_key = PublicKey([1; 32]);

		let mut parts = TestParts::default();
		parts.config.score_leeway_good_for_renew = 500;
		parts.config.score_leeway_good_for_upload = 25;
		let sample = vec![
			testing::host_entry(PublicKey([10; 32]), 1, 1),
			testing::host_entry(PublicKey([11; 32]), 1, 1),
			testing::host_entry(PublicKey([12; 32]), 1, 1),
		];
		parts
			.hdb
			.expect_random_hosts_with_limits()
			.returning(move |_, _, _, _| Ok(sample.clone()));
		parts.hdb.expect_score_breakdown().returning(|entry| {
			// score by the first key byte: 10_000, 11_000, 12_000
			Ok(ScoreBreakdown {
				score: Currency::new(entry.public_key.0[0] as u128 * 1_000),
			})
		});
		let (contractor, _alerter, _events) = testing::build(parts);
		contractor.update_renter(testing::renter(renter_key, 1_000, 3, 100));

		let scores = contractor
			.managed_find_min_allowed_host_scores(renter_key)
			.await
			.unwrap();
		assert_eq!(scores.good_for_renew, Currency::new(10_000 / 500));
		assert_eq!(scores.good_for_upload, Currency::new(10_000 / 25));
	}

	#[tokio::test]
	async fn an_empty_sample_is_an_error() {
		let renter_key = PublicKey([1; 32]);
		let mut parts = TestParts::default();
		parts
			.hdb
			.expect_random_hosts_with_limits()
			.returning(|_, _, _, _| Ok(vec![]));
		let (contractor, _alerter, _events) = testing::build(parts);
		contractor.update_renter(testing::renter(renter_key, 1_000, 3, 100));

		assert!(contractor
			.managed_find_min_allowed_host_scores(renter_key)
			.await
			.is_err());
	}

	#[tokio::test]
	async fn candidate_batches_are_sized_from_need_and_buffer() {
		let renter_key = PublicKey([1; 32]);
		let mut parts = TestParts::default();
		parts.config.random_hosts_buffer_for_score = 50;
		parts
			.hdb
			.expect_random_hosts_with_limits()
			.withf(|n, blacklist, address_blacklist, _| {
				*n == 2 * 4 + 50 && blacklist.len() == 1 && address_blacklist.is_empty()
			})
			.returning(|_, _, _, _| Ok(vec![]));
		let (contractor, _alerter, _events) = testing::build(parts);
		let renter = testing::renter(renter_key, 1_000, 3, 100);
		contractor.update_renter(renter.clone());

		let candidates = contractor
			.managed_candidate_hosts(&renter, &[PublicKey([9; 32])], &[], 2)
			.await
			.unwrap();
		assert!(candidates.is_empty());
	}
}
