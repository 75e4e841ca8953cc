pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_LISTINGS_PER_TENANT: usize = 100_000;
pub const MAX_RESERVATIONS_PER_LISTING: usize = 20_000;
pub const MAX_OVERRIDES_PER_LISTING: usize = 2_000;

/// Longest stay accepted anywhere, in nights.
pub const MAX_STAY_NIGHTS: i64 = 366;

pub const MAX_SLUG_LEN: usize = 128;
pub const MAX_TEXT_LEN: usize = 1_024;
pub const MAX_GUEST_INFO_LEN: usize = 16 * 1_024;
pub const MAX_AMENITIES: usize = 64;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;
