//! Query Facade: read-only lookups for collaborators.
//!
//! These take the store's read lock only. "Visible" below means any row
//! whose type is not `hidden`.

use crate::engine::Ipam;
use crate::errors::{Error, Result};
use crate::predicate::Cmp;
use crate::store::Select;
use crate::types::{Net, Prefix, PrefixId, Version};

impl Ipam {
    /// The row stored for exactly this block, hidden or not.
    pub fn get_prefix(&self, prefix: &str, rib: Option<&str>) -> Result<Prefix> {
        let net = Net::parse(prefix)?;
        let rib = self.rib(rib);
        self.table()
            .read()?
            .exact(rib, &net)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("prefix '{net}' not found in rib '{rib}'")))
    }

    pub fn get_by_id(&self, id: PrefixId) -> Result<Prefix> {
        self.table()
            .read()?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("prefix {id} not found")))
    }

    /// Exact match, visible rows only.
    pub fn find_exact(&self, prefix: &str, rib: Option<&str>) -> Result<Option<Prefix>> {
        let net = Net::parse(prefix)?;
        let table = self.table().read()?;
        Ok(table
            .exact(self.rib(rib), &net)
            .filter(|p| !p.is_hidden())
            .cloned())
    }

    /// Longest visible prefix containing `ip` (an address or a block),
    /// routing-table style. The block itself counts.
    pub fn find_longer(&self, ip: &str, rib: Option<&str>) -> Result<Option<Prefix>> {
        let net = Net::parse(ip)?;
        let rib = self.rib(rib);
        let table = self.table().read()?;
        if let Some(p) = table.exact(rib, &net).filter(|p| !p.is_hidden()) {
            return Ok(Some(p.clone()));
        }
        Ok(table
            .select(&Select::ancestor_candidates(rib, &net).hidden(false))
            .into_iter()
            .find(|p| p.net.contains(&net))
            .cloned())
    }

    /// Every visible row inside the block, the block itself included, in
    /// address order.
    pub fn find_covered(&self, prefix: &str, rib: Option<&str>) -> Result<Vec<Prefix>> {
        let net = Net::parse(prefix)?;
        let q = Select::new(self.rib(rib), net.version())
            .within(&net)
            .len(Cmp::Ge, net.len())
            .hidden(false);
        Ok(self.table().read()?.select(&q).into_iter().cloned().collect())
    }

    /// Visible prefixes without an owner.
    pub fn roots(&self, rib: Option<&str>, version: Version) -> Result<Vec<Prefix>> {
        let q = Select::new(self.rib(rib), version)
            .hidden(false)
            .parent_in(vec![None]);
        Ok(self.table().read()?.select(&q).into_iter().cloned().collect())
    }

    /// Visible prefixes owned by `id`.
    pub fn children(&self, id: PrefixId) -> Result<Vec<Prefix>> {
        let table = self.table().read()?;
        let owner = table
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("prefix {id} not found")))?;
        let q = Select::descendants(&owner.rib, &owner.net)
            .hidden(false)
            .parent_in(vec![Some(id)]);
        Ok(table.select(&q).into_iter().cloned().collect())
    }

    pub fn has_descendants(&self, prefix: &str, rib: Option<&str>) -> Result<bool> {
        let net = Net::parse(prefix)?;
        Ok(self.table().read()?.has_descendants(self.rib(rib), &net))
    }
}
