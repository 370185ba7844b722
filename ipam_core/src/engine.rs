//! Allocation Engine.
//!
//! [`Ipam`] is the service object collaborators hold. Every public
//! operation runs inside one store [`Transaction`]: populate and prune steps
//! either all land or none do.
//!
//! Terminology used below:
//! * the *binary parent* of a row is the block one bit shorter; it always
//!   exists for non-root rows and is found by exact key,
//! * the *owner* (`parent` column) is the nearest enclosing non-hidden row.

use crate::config::IpamConfig;
use crate::constants::{
    HIDDEN, M_ADD, M_ALLOCATE, M_DELETE, M_EXHAUSTED, M_FIND, M_PRUNED, M_RELEASE,
};
use crate::ensure_logging;
use crate::errors::{Error, Result};
use crate::helpers;
use crate::predicate::Cmp;
use crate::store::{Order, PrefixTable, Select, Snapshot, Transaction};
use crate::tags::TagIndex;
use crate::types::{Net, Prefix, PrefixId, PrefixTag, Version};
use log::{debug, info, trace, warn};
use metrics::counter;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// What to write into the row a populate walk ends at.
#[derive(Clone, Copy)]
struct Leaf<'a> {
    name: &'a str,
    kind: &'a str,
    free: bool,
}

pub struct Ipam {
    table: Arc<PrefixTable>,
    tags: TagIndex,
    config: IpamConfig,
}

impl Ipam {
    pub fn new(table: Arc<PrefixTable>, config: IpamConfig) -> Self {
        Self::with_tags(table, TagIndex::new(), config)
    }

    fn with_tags(table: Arc<PrefixTable>, tags: TagIndex, config: IpamConfig) -> Self {
        ensure_logging();
        Self {
            table,
            tags,
            config,
        }
    }

    /// Build an engine, restoring the snapshot at `config.snapshot_path`
    /// when one exists.
    pub fn open(config: IpamConfig) -> Result<Self> {
        ensure_logging();
        match config.snapshot_path.clone() {
            Some(path) if path.exists() => {
                let snap = Snapshot::load(&path)?;
                let (table, tags) = snap.into_parts()?;
                let live: Vec<PrefixTag> = {
                    let rows = table.read()?;
                    tags.into_iter()
                        .filter(|t| rows.get(t.prefix).is_some())
                        .collect()
                };
                info!(
                    "[OPEN] restored {} row(s) and {} tag(s) from {}",
                    table.read()?.len(),
                    live.len(),
                    path.display()
                );
                Ok(Self::with_tags(
                    Arc::new(table),
                    TagIndex::from_entries(live),
                    config,
                ))
            }
            _ => Ok(Self::new(Arc::new(PrefixTable::new()), config)),
        }
    }

    /// Write the table to the configured snapshot path.
    pub fn persist(&self) -> Result<()> {
        let path = self
            .config
            .snapshot_path
            .as_deref()
            .ok_or_else(|| Error::Persistence("no snapshot path configured".into()))?;
        self.snapshot_to(path)
    }

    pub fn snapshot_to(&self, path: &Path) -> Result<()> {
        let table = self.table.read()?;
        Snapshot::capture(&table, self.tags.entries()).save(path)?;
        debug!("[PERSIST] {} row(s) written to {}", table.len(), path.display());
        Ok(())
    }

    pub fn table(&self) -> &Arc<PrefixTable> {
        &self.table
    }

    pub fn config(&self) -> &IpamConfig {
        &self.config
    }

    pub(crate) fn rib<'a>(&'a self, rib: Option<&'a str>) -> &'a str {
        rib.unwrap_or(&self.config.default_rib)
    }

    fn visible_kind(kind: &str) -> Result<()> {
        if kind == HIDDEN {
            return Err(Error::Validation(format!("type '{HIDDEN}' is reserved")));
        }
        Ok(())
    }

    // Commit and forget tags of rows that no longer exist.
    fn finish(&self, tx: Transaction<'_>) {
        for id in tx.commit() {
            self.tags.drop_prefix(id);
        }
    }

    /// Register a prefix the administrator names directly.
    ///
    /// * exact row exists: its type and name are updated and it takes
    ///   ownership of the rows inside it that shared its owner,
    /// * nothing covers it: it becomes a root and adopts the parentless rows
    ///   inside it, materialising the path down to each,
    /// * otherwise the deepest covering row is split down to it.
    pub fn add_prefix(
        &self,
        name: &str,
        prefix: &str,
        kind: Option<&str>,
        rib: Option<&str>,
    ) -> Result<Prefix> {
        let net = Net::parse(prefix)?;
        let rib = self.rib(rib);
        let kind = kind.unwrap_or(&self.config.default_type);
        Self::visible_kind(kind)?;
        info!("[ADD] {net} rib={rib} name='{name}' type={kind}");
        counter!(M_ADD).increment(1);

        let mut tx = self.table.begin()?;
        let row = if let Some(existing) = tx.exact(rib, &net).cloned() {
            debug!("[ADD] {net} exists ({}), updating", existing.id);
            let updated = tx.update(existing.id, |p| {
                p.kind = kind.to_string();
                p.name = name.to_string();
            })?;
            let adopt = ids(tx.select(
                &Select::descendants(rib, &net).parent_in(vec![existing.parent]),
            ));
            for id in adopt {
                tx.update(id, |p| p.parent = Some(existing.id))?;
            }
            updated
        } else if let Some(cover) = tx.covering(rib, &net).cloned() {
            if !cover.is_hidden() && !cover.free && !tx.has_descendants(rib, &cover.net) {
                warn!("[ADD] {net} refused, {} is allocated", cover.net);
                return Err(Error::Validation(format!(
                    "Unable to add '{net}', '{}' is allocated",
                    cover.net
                )));
            }
            debug!("[ADD] {net} splits from {}", cover.net);
            let leaf = Leaf {
                name,
                kind,
                free: true,
            };
            self.populate(&mut tx, cover, net, leaf)?
        } else {
            let root = Prefix::new(net, rib, name, kind);
            let root_id = tx.insert(root)?;
            let orphans: Vec<(PrefixId, Net)> = tx
                .select(
                    &Select::descendants(rib, &net)
                        .parent_in(vec![None])
                        .order(Order::LenAsc),
                )
                .iter()
                .map(|p| (p.id, p.net))
                .collect();
            debug!("[ADD] {net} is a new root adopting {} row(s)", orphans.len());
            for (id, child) in orphans {
                tx.update(id, |p| p.parent = Some(root_id))?;
                let start = row_of(&tx, root_id)?;
                let leaf = Leaf {
                    name: "",
                    kind: HIDDEN,
                    free: true,
                };
                self.populate(&mut tx, start, child, leaf)?;
            }
            row_of(&tx, root_id)?
        };
        self.finish(tx);
        Ok(row)
    }

    /// Claim one specific block.
    pub fn allocate_prefix(
        &self,
        name: &str,
        prefix: &str,
        kind: Option<&str>,
        rib: Option<&str>,
    ) -> Result<Prefix> {
        let net = Net::parse(prefix)?;
        let rib = self.rib(rib);
        let kind = kind.unwrap_or(&self.config.allocation_type);
        Self::visible_kind(kind)?;
        info!("[ALLOCATE] {net} rib={rib} name='{name}' type={kind}");
        let not_free = || Error::Validation(format!("Unable to allocate '{net}', not free"));

        let mut tx = self.table.begin()?;
        let row = match tx.exact(rib, &net).cloned() {
            Some(existing) if !existing.free => return Err(not_free()),
            Some(existing) => tx.update(existing.id, |p| {
                p.free = false;
                p.kind = kind.to_string();
                p.name = name.to_string();
            })?,
            None => {
                let cover = tx.covering(rib, &net).cloned().ok_or_else(|| {
                    Error::NotFound(format!("Unable to allocate '{net}', no covering prefix"))
                })?;
                if !cover.free {
                    return Err(not_free());
                }
                let leaf = Leaf {
                    name,
                    kind,
                    free: false,
                };
                self.populate(&mut tx, cover, net, leaf)?
            }
        };
        self.finish(tx);
        counter!(M_ALLOCATE).increment(1);
        info!("[ALLOCATE] {net} -> {}", row.id);
        Ok(row)
    }

    /// Hand out the first free block of `length` from the pool `tag`.
    ///
    /// The tightest free block wins: longest prefix first, then lowest
    /// address. Free space is the pool's own free prefixes plus the hidden
    /// free rows they own; free real prefixes nested inside are separate
    /// pools and are not touched.
    pub fn find(
        &self,
        length: u8,
        tag: &str,
        name: Option<&str>,
        kind: Option<&str>,
    ) -> Result<String> {
        if length > 128 {
            return Err(Error::InvalidPrefix(format!("prefix length /{length}")));
        }
        let name = name.unwrap_or("");
        let kind = kind.unwrap_or(&self.config.allocation_type);
        Self::visible_kind(kind)?;
        counter!(M_FIND).increment(1);

        let pool = self.tags.id_tags(tag);
        let mut tx = self.table.begin()?;
        let candidates: Vec<Prefix> = pool
            .iter()
            .filter_map(|id| tx.get(*id))
            .filter(|p| !p.is_hidden() && length <= p.net.bits())
            .cloned()
            .collect();
        debug!("[FIND] /{length} from '{tag}': {} candidate(s)", candidates.len());

        let mut groups: BTreeMap<(String, Version), Vec<Option<PrefixId>>> = BTreeMap::new();
        for c in &candidates {
            groups
                .entry((c.rib.clone(), c.version()))
                .or_default()
                .push(Some(c.id));
        }
        let mut free: Vec<Prefix> = candidates
            .iter()
            .filter(|c| c.free && c.prefix_len() <= length)
            .cloned()
            .collect();
        for ((rib, version), owners) in groups {
            let q = Select::new(&rib, version)
                .hidden(true)
                .free(true)
                .len(Cmp::Le, length)
                .parent_in(owners);
            free.extend(tx.select(&q).into_iter().cloned());
        }

        let Some(best) = free
            .into_iter()
            .min_by_key(|p| (Reverse(p.prefix_len()), p.version(), p.net.addr(), p.rib.clone()))
        else {
            counter!(M_EXHAUSTED).increment(1);
            info!("[FIND] pool '{tag}' exhausted for /{length}");
            return Err(Error::NotFound(format!(
                "Unable to allocate address from pool '{tag}'"
            )));
        };

        let row = if best.prefix_len() == length {
            trace!("[FIND] direct hit {}", best.net);
            tx.update(best.id, |p| {
                p.free = false;
                p.kind = kind.to_string();
                p.name = name.to_string();
            })?
        } else {
            let target = best.net.first_subnet(length)?;
            let leaf = Leaf {
                name,
                kind,
                free: false,
            };
            self.populate(&mut tx, best, target, leaf)?
        };
        self.finish(tx);
        counter!(M_ALLOCATE).increment(1);
        info!("[FIND] '{tag}' /{length} -> {}", row.net);
        Ok(row.cidr())
    }

    /// Return an allocated block. Unknown and already free prefixes are a
    /// no-op; a block with rows beneath it is refused.
    pub fn release_prefix(&self, prefix: &str, rib: Option<&str>) -> Result<()> {
        let net = Net::parse(prefix)?;
        let rib = self.rib(rib);
        let mut tx = self.table.begin()?;
        let Some(row) = tx.exact(rib, &net).cloned() else {
            warn!("[RELEASE] {net} not found in rib '{rib}', nothing to do");
            return Ok(());
        };
        if row.free {
            debug!("[RELEASE] {net} already free");
            return Ok(());
        }
        if tx.has_descendants(rib, &net) {
            return Err(Error::Validation(format!(
                "Unable to release '{net}', has sub-prefixes"
            )));
        }
        info!("[RELEASE] {net} rib={rib}");
        tx.update(row.id, |p| {
            p.free = true;
            p.kind = HIDDEN.to_string();
        })?;
        self.retire(&mut tx, row.id)?;
        self.finish(tx);
        counter!(M_RELEASE).increment(1);
        Ok(())
    }

    /// Remove a prefix. Returns `false` when it did not exist.
    pub fn delete_prefix(&self, prefix: &str, rib: Option<&str>) -> Result<bool> {
        let net = Net::parse(prefix)?;
        let rib = self.rib(rib);
        let mut tx = self.table.begin()?;
        let Some(row) = tx.exact(rib, &net).cloned() else {
            warn!("[DELETE] {net} not found in rib '{rib}', nothing to do");
            return Ok(false);
        };
        info!("[DELETE] {net} rib={rib} ({})", row.id);
        self.retire(&mut tx, row.id)?;
        self.finish(tx);
        counter!(M_DELETE).increment(1);
        Ok(true)
    }

    /// Reserve `start` and split it down to `target`, creating both halves
    /// at every level. The half away from the target stays free; the walk
    /// ends by writing `leaf` at `target`. An existing `target` row is left
    /// as is.
    fn populate(
        &self,
        tx: &mut Transaction<'_>,
        start: Prefix,
        target: Net,
        leaf: Leaf<'_>,
    ) -> Result<Prefix> {
        if target.len() <= start.prefix_len() || !start.net.contains(&target) {
            return Err(Error::Invariant(format!(
                "cannot split {} down to {target}",
                start.net
            )));
        }
        let rib = start.rib.clone();
        let mut owner = start.owner_for_children();
        if start.free {
            tx.update(start.id, |p| p.free = false)?;
        }
        let mut cur = start.net;
        loop {
            let (lo, hi) = cur
                .halves()
                .ok_or_else(|| Error::Invariant(format!("{cur} cannot be split")))?;
            let (next, other) = if helpers::get_bit(target.addr(), cur.len(), cur.bits()) == 0 {
                (lo, hi)
            } else {
                (hi, lo)
            };
            trace!("[POPULATE] {cur} -> {next} (free {other})");
            if tx.exact(&rib, &other).is_none() {
                tx.insert(Prefix::hidden(other, &rib, owner, true))?;
            }
            if next == target {
                if let Some(existing) = tx.exact(&rib, &target) {
                    return Ok(existing.clone());
                }
                let mut row = Prefix::new(target, &rib, leaf.name, leaf.kind);
                row.free = leaf.free;
                row.parent = owner;
                tx.insert(row.clone())?;
                return Ok(row);
            }
            match tx.exact(&rib, &next).cloned() {
                Some(row) => {
                    if row.free {
                        tx.update(row.id, |p| p.free = false)?;
                    }
                    if !row.is_hidden() {
                        owner = Some(row.id);
                    }
                }
                None => {
                    tx.insert(Prefix::hidden(next, &rib, owner, false))?;
                }
            }
            cur = next;
        }
    }

    /// Turn a row into structure: hand what it owns to its own owner, then
    /// drop it (tree root) or free it and prune when nothing is beneath it.
    fn retire(&self, tx: &mut Transaction<'_>, id: PrefixId) -> Result<()> {
        let row = row_of(tx, id)?;
        tx.update(id, |p| p.kind = HIDDEN.to_string())?;
        let owned = ids(tx.select(
            &Select::descendants(&row.rib, &row.net).parent_in(vec![Some(id)]),
        ));
        for child in owned {
            tx.update(child, |p| p.parent = row.parent)?;
        }
        if tx.has_descendants(&row.rib, &row.net) {
            debug!("[DELETE] {} keeps its sub-prefixes", row.net);
            return Ok(());
        }
        if tx.is_tree_root(&row.rib, &row.net) {
            debug!("[DELETE] {} is a childless root, removing", row.net);
            tx.delete(id)?;
            return Ok(());
        }
        tx.update(id, |p| p.free = true)?;
        self.prune(tx, &row.rib, row.net)?;
        Ok(())
    }

    /// Collapse hidden free sibling pairs upward from `net` into their
    /// binary parent. Stops at the first row that is not hidden and free or
    /// whose sibling is in use. Returns the number of rows removed.
    fn prune(&self, tx: &mut Transaction<'_>, rib: &str, net: Net) -> Result<usize> {
        let mut cur = net;
        let mut removed = 0usize;
        while let Some(row) = tx.exact(rib, &cur).cloned() {
            if !(row.is_hidden() && row.free) {
                break;
            }
            let up = cur.parent().and_then(|n| tx.exact(rib, &n).cloned());
            let Some(up) = up else {
                trace!("[PRUNE] dropping bare root {cur}");
                tx.delete(row.id)?;
                removed += 1;
                break;
            };
            let sib_net = cur.sibling()?;
            let sib = tx
                .exact(rib, &sib_net)
                .cloned()
                .ok_or_else(|| Error::Invariant(format!("{cur}: sibling {sib_net} missing")))?;
            if !(sib.is_hidden() && sib.free) {
                break;
            }
            trace!("[PRUNE] {cur} + {sib_net} -> {}", up.net);
            tx.delete(row.id)?;
            tx.delete(sib.id)?;
            tx.update(up.id, |p| p.free = true)?;
            removed += 2;
            cur = up.net;
        }
        if removed > 0 {
            debug!("[PRUNE] removed {removed} row(s) above {net}");
            counter!(M_PRUNED).increment(removed as u64);
        }
        Ok(removed)
    }

    /// Put a prefix into the pool `tag`. Adding the same pair twice is a
    /// no-op.
    pub fn add_tag(&self, prefix: PrefixId, tag: &str) -> Result<PrefixTag> {
        // held so a concurrent delete cannot slip in between check and add
        let table = self.table.read()?;
        if table.get(prefix).is_none() {
            return Err(Error::NotFound(format!("prefix {prefix} not found")));
        }
        if self.tags.add(prefix, tag) {
            debug!("[TAG] {prefix} -> '{tag}'");
        }
        Ok(PrefixTag {
            prefix,
            tag: tag.to_string(),
        })
    }

    pub fn remove_tag(&self, prefix: PrefixId, tag: &str) -> bool {
        self.tags.remove(prefix, tag)
    }

    /// Ids of the prefixes in the pool `tag`.
    pub fn id_tags(&self, tag: &str) -> Vec<PrefixId> {
        self.tags.id_tags(tag)
    }

    pub fn tags_of(&self, prefix: PrefixId) -> Vec<String> {
        self.tags.tags_of(prefix)
    }
}

fn ids(rows: Vec<&Prefix>) -> Vec<PrefixId> {
    rows.into_iter().map(|p| p.id).collect()
}

fn row_of(tx: &Transaction<'_>, id: PrefixId) -> Result<Prefix> {
    tx.get(id)
        .cloned()
        .ok_or_else(|| Error::Invariant(format!("row {id} vanished mid-operation")))
}
