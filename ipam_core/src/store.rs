//! Prefix Store: the relational table holding every tree node.
//!
//! Rows live in one table keyed by id, with a unique ordered index on
//! `(rib, version, address, prefix_len)` per tree. Structural queries are
//! expressed as [`Select`] filters whose address bounds are
//! [`WordPredicate`]s over the stored `a1..a4` words.
//!
//! Writes go through a [`Transaction`]: it owns the table's write lock for
//! its whole lifetime and keeps an undo log, so an operation either commits
//! every row it touched or none of them.

use crate::constants::{ALLOCATION_TYPE, M_ROWS, SNAPSHOT_VERSION};
use crate::errors::{Error, Result};
use crate::predicate::{Cmp, WordPredicate};
use crate::types::{Net, Prefix, PrefixId, PrefixRecord, PrefixTag, Version};
use log::{debug, error, trace};
use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Deref;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type TreeKey = (String, Version);
type Index = BTreeMap<(u128, u8), PrefixId>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Order {
    /// Address ascending, shorter prefix first on equal addresses.
    #[default]
    Address,
    /// Longest prefix first, then address ascending.
    LenDesc,
    /// Shortest prefix first, then address ascending.
    LenAsc,
}

/// Filter over the rows of one tree.
#[derive(Clone, Debug)]
pub struct Select {
    rib: String,
    version: Version,
    addr: Vec<WordPredicate>,
    len: Vec<(Cmp, u8)>,
    free: Option<bool>,
    hidden: Option<bool>,
    parents: Option<Vec<Option<PrefixId>>>,
    order: Order,
    limit: Option<usize>,
}

impl Select {
    pub fn new(rib: &str, version: Version) -> Self {
        Self {
            rib: rib.to_string(),
            version,
            addr: Vec::new(),
            len: Vec::new(),
            free: None,
            hidden: None,
            parents: None,
            order: Order::Address,
            limit: None,
        }
    }

    /// Rows strictly more specific than `net` inside its range.
    pub fn descendants(rib: &str, net: &Net) -> Self {
        Self::new(rib, net.version()).within(net).len(Cmp::Gt, net.len())
    }

    /// Rows shorter than `len` whose address is `<= addr`, longest first:
    /// the candidates for a covering supernet.
    pub fn ancestor_candidates(rib: &str, net: &Net) -> Self {
        Self::new(rib, net.version())
            .addr(WordPredicate::le(net.addr()))
            .len(Cmp::Lt, net.len())
            .order(Order::LenDesc)
    }

    /// Address inside `[network, last]` of `net`.
    pub fn within(self, net: &Net) -> Self {
        self.addr(WordPredicate::ge(net.addr()))
            .addr(WordPredicate::le(net.last()))
    }

    pub fn addr(mut self, p: WordPredicate) -> Self {
        self.addr.push(p);
        self
    }

    pub fn len(mut self, cmp: Cmp, len: u8) -> Self {
        self.len.push((cmp, len));
        self
    }

    pub fn free(mut self, free: bool) -> Self {
        self.free = Some(free);
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = Some(hidden);
        self
    }

    pub fn parent_in(mut self, parents: Vec<Option<PrefixId>>) -> Self {
        self.parents = Some(parents);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    fn accepts(&self, p: &Prefix) -> bool {
        let words = p.words();
        self.addr.iter().all(|pred| pred.matches(&words))
            && self.len.iter().all(|&(cmp, l)| cmp.holds(p.prefix_len(), l))
            && self.free.map_or(true, |f| p.free == f)
            && self.hidden.map_or(true, |h| p.is_hidden() == h)
            && self
                .parents
                .as_ref()
                .map_or(true, |set| set.contains(&p.parent))
    }

    /// Narrowest index range implied by the address predicates.
    fn bounds(&self) -> Option<(u128, u128)> {
        self.addr.iter().try_fold((0u128, u128::MAX), |(lo, hi), p| {
            let (plo, phi) = p.bounds()?;
            let (lo, hi) = (lo.max(plo), hi.min(phi));
            (lo <= hi).then_some((lo, hi))
        })
    }
}

/// The table contents. Read through [`PrefixTable::read`] or a
/// [`Transaction`].
#[derive(Default)]
pub struct Table {
    rows: HashMap<PrefixId, Prefix>,
    trees: BTreeMap<TreeKey, Index>,
}

impl Table {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Prefix> {
        self.rows.values()
    }

    pub fn get(&self, id: PrefixId) -> Option<&Prefix> {
        self.rows.get(&id)
    }

    fn tree(&self, rib: &str, version: Version) -> Option<&Index> {
        self.trees.get(&(rib.to_string(), version))
    }

    /// Exact match on `(rib, version, address, prefix_len)`.
    pub fn exact(&self, rib: &str, net: &Net) -> Option<&Prefix> {
        self.tree(rib, net.version())?
            .get(&(net.addr(), net.len()))
            .and_then(|id| self.rows.get(id))
    }

    /// Deepest existing row strictly covering `net`.
    pub fn covering(&self, rib: &str, net: &Net) -> Option<&Prefix> {
        (0..net.len())
            .rev()
            .find_map(|len| self.exact(rib, &net.supernet(len)))
    }

    pub fn select(&self, q: &Select) -> Vec<&Prefix> {
        let Some(tree) = self.tree(&q.rib, q.version) else {
            return Vec::new();
        };
        let Some((lo, hi)) = q.bounds() else {
            return Vec::new();
        };
        let rows = tree
            .range((lo, 0)..=(hi, u8::MAX))
            .filter_map(|(_, id)| self.rows.get(id))
            .filter(|p| q.accepts(p));
        // index order is address order, so a limit can stop the scan early
        let mut out: Vec<&Prefix> = match (q.order, q.limit) {
            (Order::Address, Some(n)) => rows.take(n).collect(),
            _ => rows.collect(),
        };
        match q.order {
            Order::Address => {}
            Order::LenDesc => out.sort_by(|a, b| {
                b.prefix_len()
                    .cmp(&a.prefix_len())
                    .then(a.net.addr().cmp(&b.net.addr()))
            }),
            Order::LenAsc => out.sort_by(|a, b| {
                a.prefix_len()
                    .cmp(&b.prefix_len())
                    .then(a.net.addr().cmp(&b.net.addr()))
            }),
        }
        if let Some(n) = q.limit {
            out.truncate(n);
        }
        out
    }

    pub fn has_descendants(&self, rib: &str, net: &Net) -> bool {
        !self.select(&Select::descendants(rib, net).limit(1)).is_empty()
    }

    /// No row exists one level up: `net` heads its own tree.
    pub fn is_tree_root(&self, rib: &str, net: &Net) -> bool {
        net.parent()
            .map_or(true, |up| self.exact(rib, &up).is_none())
    }

    fn insert_row(&mut self, p: Prefix) -> Result<()> {
        let key = (p.net.addr(), p.net.len());
        let tree = self
            .trees
            .entry((p.rib.clone(), p.version()))
            .or_default();
        if let Some(existing) = tree.get(&key) {
            return Err(Error::Invariant(format!(
                "{} already stored in rib '{}' as {existing}",
                p.net, p.rib
            )));
        }
        tree.insert(key, p.id);
        self.rows.insert(p.id, p);
        Ok(())
    }

    fn remove_row(&mut self, id: PrefixId) -> Option<Prefix> {
        let p = self.rows.remove(&id)?;
        let tree_key = (p.rib.clone(), p.version());
        if let Some(tree) = self.trees.get_mut(&tree_key) {
            tree.remove(&(p.net.addr(), p.net.len()));
            if tree.is_empty() {
                self.trees.remove(&tree_key);
            }
        }
        Some(p)
    }

    /// Verify the structural invariants of one tree.
    pub fn check_invariants(&self, rib: &str, version: Version) -> Result<()> {
        let Some(tree) = self.tree(rib, version) else {
            return Ok(());
        };
        let fail = |msg: String| Err(Error::Invariant(msg));
        for id in tree.values() {
            let Some(p) = self.rows.get(id) else {
                return fail(format!("index points at missing row {id}"));
            };
            let net = p.net;
            if let Some(owner_id) = p.parent {
                let Some(owner) = self.rows.get(&owner_id) else {
                    return fail(format!("{net}: owner {owner_id} missing"));
                };
                if owner.is_hidden() || owner.rib != p.rib || !owner.net.contains(&net) || owner.net.len() >= net.len() {
                    return fail(format!("{net}: owner {} does not own it", owner.net));
                }
                let up = net.parent().map(|n| self.exact(rib, &n));
                if !matches!(up, Some(Some(_))) {
                    return fail(format!("{net}: path to owner {} not materialised", owner.net));
                }
            }
            if let Some(up) = net.parent() {
                if let Some(parent) = self.exact(rib, &up) {
                    if parent.free {
                        return fail(format!("{net}: parent {up} is free"));
                    }
                    let Ok(sib) = net.sibling() else {
                        return fail(format!("{net}: no sibling"));
                    };
                    let Some(sibling) = self.exact(rib, &sib) else {
                        return fail(format!("{net}: sibling {sib} missing"));
                    };
                    if p.free && p.is_hidden() && sibling.free && sibling.is_hidden() {
                        return fail(format!("{net}: unpruned free pair with {sib}"));
                    }
                }
            }
            let below = self.has_descendants(rib, &net);
            if p.free && below {
                return fail(format!("{net}: free but has descendants"));
            }
            if p.free && !p.is_hidden() && !below && p.kind == ALLOCATION_TYPE {
                return fail(format!("{net}: allocated block is free"));
            }
            if p.is_hidden() && !p.free && !below {
                return fail(format!("{net}: hidden reserved leaf"));
            }
            if p.is_hidden() && p.free && self.is_tree_root(rib, &net) {
                return fail(format!("{net}: stray hidden root"));
            }
        }
        Ok(())
    }
}

enum Undo {
    Insert(PrefixId),
    Update(Prefix),
    Delete(Prefix),
}

/// The shared prefix table.
#[derive(Default)]
pub struct PrefixTable {
    inner: RwLock<Table>,
}

impl PrefixTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, Table>> {
        self.inner
            .read()
            .map_err(|e| Error::Lock(format!("read lock failed: {e}")))
    }

    /// Start an all-or-nothing unit of work. Writers are serialised.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let guard = self
            .inner
            .write()
            .map_err(|e| Error::Lock(format!("write lock failed: {e}")))?;
        trace!("[TXN] begin");
        Ok(Transaction {
            guard,
            undo: Vec::new(),
            removed: Vec::new(),
            committed: false,
        })
    }

    pub fn check_invariants(&self, rib: &str, version: Version) -> Result<()> {
        self.read()?.check_invariants(rib, version)
    }

    pub fn load_rows(rows: Vec<Prefix>) -> Result<Self> {
        let mut table = Table::default();
        for p in rows {
            table
                .insert_row(p)
                .map_err(|e| Error::Persistence(e.to_string()))?;
        }
        Ok(Self {
            inner: RwLock::new(table),
        })
    }
}

/// Write access to the table. Dropping without [`Transaction::commit`]
/// rolls every change back.
pub struct Transaction<'a> {
    guard: RwLockWriteGuard<'a, Table>,
    undo: Vec<Undo>,
    removed: Vec<PrefixId>,
    committed: bool,
}

impl Deref for Transaction<'_> {
    type Target = Table;

    fn deref(&self) -> &Table {
        &self.guard
    }
}

impl Transaction<'_> {
    pub fn insert(&mut self, p: Prefix) -> Result<PrefixId> {
        let id = p.id;
        trace!("[TXN] insert {} ({id})", p.net);
        self.guard.insert_row(p)?;
        self.undo.push(Undo::Insert(id));
        Ok(id)
    }

    /// Change the mutable columns of a row (`free`, `type`, `name`,
    /// `parent`). Address, length and rib never change.
    pub fn update<F>(&mut self, id: PrefixId, f: F) -> Result<Prefix>
    where
        F: FnOnce(&mut Prefix),
    {
        let row = self
            .guard
            .rows
            .get_mut(&id)
            .ok_or_else(|| Error::Invariant(format!("update of missing row {id}")))?;
        let before = row.clone();
        f(row);
        if row.net != before.net || row.rib != before.rib || row.id != before.id {
            *row = before;
            return Err(Error::Invariant(format!("key columns of {id} are immutable")));
        }
        let after = row.clone();
        self.undo.push(Undo::Update(before));
        Ok(after)
    }

    pub fn delete(&mut self, id: PrefixId) -> Result<Prefix> {
        let p = self
            .guard
            .remove_row(id)
            .ok_or_else(|| Error::Invariant(format!("delete of missing row {id}")))?;
        trace!("[TXN] delete {} ({id})", p.net);
        self.removed.push(id);
        self.undo.push(Undo::Delete(p.clone()));
        Ok(p)
    }

    /// Make every change durable. Returns the ids physically deleted.
    pub fn commit(mut self) -> Vec<PrefixId> {
        self.committed = true;
        debug!(
            "[TXN] commit: {} change(s), {} row(s) deleted",
            self.undo.len(),
            self.removed.len()
        );
        gauge!(M_ROWS).set(self.guard.len() as f64);
        let kept: HashSet<PrefixId> = self.guard.rows.keys().copied().collect();
        std::mem::take(&mut self.removed)
            .into_iter()
            .filter(|id| !kept.contains(id))
            .collect()
    }

    fn rollback(&mut self) {
        let n = self.undo.len();
        while let Some(step) = self.undo.pop() {
            let outcome = match step {
                Undo::Insert(id) => {
                    self.guard.remove_row(id);
                    Ok(())
                }
                Undo::Update(before) => {
                    self.guard.rows.insert(before.id, before);
                    Ok(())
                }
                Undo::Delete(p) => self.guard.insert_row(p),
            };
            if let Err(e) = outcome {
                error!("[TXN] rollback step failed: {e}");
            }
        }
        if n > 0 {
            debug!("[TXN] rolled back {n} change(s)");
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

/// On-disk image of the prefix and tag tables.
#[derive(Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u16,
    pub prefixes: Vec<PrefixRecord>,
    pub tags: Vec<PrefixTag>,
}

impl Snapshot {
    pub fn capture(table: &Table, tags: Vec<PrefixTag>) -> Self {
        let mut prefixes: Vec<PrefixRecord> = table.rows().cloned().map(PrefixRecord::from).collect();
        prefixes.sort_by_key(|r| (r.rib.clone(), r.version, r.a1, r.a2, r.a3, r.a4, r.prefix_len));
        Self {
            version: SNAPSHOT_VERSION,
            prefixes,
            tags,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let snap: Snapshot = serde_json::from_slice(&std::fs::read(path)?)?;
        if snap.version != SNAPSHOT_VERSION {
            return Err(Error::Persistence(format!(
                "snapshot version {} unsupported (expected {SNAPSHOT_VERSION})",
                snap.version
            )));
        }
        Ok(snap)
    }

    pub fn into_parts(self) -> Result<(PrefixTable, Vec<PrefixTag>)> {
        let rows = self
            .prefixes
            .into_iter()
            .map(Prefix::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((PrefixTable::load_rows(rows)?, self.tags))
    }
}
