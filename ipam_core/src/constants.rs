//! Constants shared by the store and the allocation engine

/// `type` of a row that only exists as binary-tree structure.
pub const HIDDEN: &str = "hidden";

pub const DEFAULT_RIB: &str = "default";
pub const DEFAULT_TYPE: &str = "container";
pub const ALLOCATION_TYPE: &str = "Assigned";

pub const V4_BITS: u8 = 32;
pub const V6_BITS: u8 = 128;

pub const SNAPSHOT_VERSION: u16 = 1;

// metric names
pub const M_ADD: &str = "ipam_add_total";
pub const M_ALLOCATE: &str = "ipam_allocations_total";
pub const M_FIND: &str = "ipam_find_total";
pub const M_EXHAUSTED: &str = "ipam_pool_exhausted_total";
pub const M_RELEASE: &str = "ipam_release_total";
pub const M_DELETE: &str = "ipam_delete_total";
pub const M_PRUNED: &str = "ipam_pruned_rows_total";
pub const M_ROWS: &str = "ipam_rows";
