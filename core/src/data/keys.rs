pub const RENTER_KEY_PREFIX: &str = "renter";
pub const RENTER_INDEX_KEY: &str = "renter_index";
pub const RENEWAL_LINEAGE_KEY: &str = "renewal_lineage";
pub const OLD_CONTRACTS_KEY: &str = "old_contracts";
pub const DOUBLE_SPENT_KEY: &str = "double_spent";
pub const LOCKED_FUNDS_KEY_PREFIX: &str = "locked_funds";
