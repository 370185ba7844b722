//! Engine configuration

use crate::constants::{ALLOCATION_TYPE, DEFAULT_RIB, DEFAULT_TYPE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpamConfig {
    /// RIB used when an operation does not name one.
    pub default_rib: String,
    /// `type` given to prefixes imported through `add_prefix`.
    pub default_type: String,
    /// `type` given to blocks handed out by `find`.
    pub allocation_type: String,
    /// Where `Ipam::open` loads from and `Ipam::persist` writes to.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            default_rib: DEFAULT_RIB.to_string(),
            default_type: DEFAULT_TYPE.to_string(),
            allocation_type: ALLOCATION_TYPE.to_string(),
            snapshot_path: None,
        }
    }
}

impl IpamConfig {
    /// Defaults overridden by `IPAM_DEFAULT_RIB`, `IPAM_DEFAULT_TYPE`,
    /// `IPAM_ALLOCATION_TYPE` and `IPAM_SNAPSHOT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let set = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = set("IPAM_DEFAULT_RIB") {
            cfg.default_rib = v;
        }
        if let Some(v) = set("IPAM_DEFAULT_TYPE") {
            cfg.default_type = v;
        }
        if let Some(v) = set("IPAM_ALLOCATION_TYPE") {
            cfg.allocation_type = v;
        }
        if let Some(v) = set("IPAM_SNAPSHOT") {
            cfg.snapshot_path = Some(PathBuf::from(v));
        }
        cfg
    }

    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }
}
