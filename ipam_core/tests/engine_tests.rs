use std::{
    collections::HashSet,
    sync::{Arc, Barrier},
    thread,
};

use ipam_core::{Error, ErrorCode, Ipam, IpamConfig, Net, PrefixTable, Version};

fn engine() -> Ipam {
    Ipam::new(Arc::new(PrefixTable::new()), IpamConfig::default())
}

/// `(cidr, free, type)` of every row in the table, sorted.
fn state(ipam: &Ipam) -> Vec<(String, bool, String)> {
    let t = ipam.table().read().unwrap();
    let mut out: Vec<_> = t.rows().map(|p| (p.cidr(), p.free, p.kind.clone())).collect();
    out.sort();
    out
}

fn pool(ipam: &Ipam, cidr: &str, tag: &str) {
    let p = ipam.add_prefix(tag, cidr, None, None).unwrap();
    ipam.add_tag(p.id, tag).unwrap();
}

#[test]
fn exact_add_is_idempotent() {
    let ipam = engine();
    let a = ipam.add_prefix("a", "10.0.0.0/8", None, None).unwrap();
    let rows = state(&ipam);
    let b = ipam.add_prefix("a", "10.0.0.0/8", None, None).unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(state(&ipam), rows);

    let c = ipam.add_prefix("renamed", "10.0.0.0/8", Some("aggregate"), None).unwrap();
    assert_eq!(c.id, a.id);
    assert_eq!(c.kind, "aggregate");
    assert_eq!(c.name, "renamed");
}

#[test]
fn find_until_exhausted() {
    let ipam = engine();
    pool(&ipam, "192.168.0.0/22", "lan");
    let mut got = Vec::new();
    for _ in 0..4 {
        got.push(ipam.find(24, "lan", Some("x"), None).unwrap());
    }
    assert_eq!(
        got,
        ["192.168.0.0/24", "192.168.1.0/24", "192.168.2.0/24", "192.168.3.0/24"]
    );
    let err = ipam.find(24, "lan", None, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert_eq!(err.to_string(), "Unable to allocate address from pool 'lan'");
    // a different length does not fit either
    assert!(ipam.find(30, "lan", None, None).is_err());
    ipam.table().check_invariants("default", Version::V4).unwrap();
}

#[test]
fn unknown_pool_is_exhausted() {
    let ipam = engine();
    assert!(matches!(
        ipam.find(24, "nobody", None, None),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        ipam.find(129, "nobody", None, None),
        Err(Error::InvalidPrefix(_))
    ));
}

#[test]
fn tightest_block_is_used_first() {
    let ipam = engine();
    pool(&ipam, "10.0.0.0/16", "p");
    assert_eq!(ipam.find(24, "p", None, None).unwrap(), "10.0.0.0/24");
    // 10.0.1.0/24 is the smallest free block that fits a /26
    assert_eq!(ipam.find(26, "p", None, None).unwrap(), "10.0.1.0/26");
    assert_eq!(ipam.find(20, "p", None, None).unwrap(), "10.0.16.0/20");
    assert_eq!(ipam.find(26, "p", None, None).unwrap(), "10.0.1.64/26");
}

#[test]
fn pools_span_several_prefixes() {
    let ipam = engine();
    let a = ipam.add_prefix("a", "10.0.0.0/24", None, None).unwrap();
    let b = ipam.add_prefix("b", "10.9.0.0/25", None, None).unwrap();
    ipam.add_tag(a.id, "multi").unwrap();
    ipam.add_tag(b.id, "multi").unwrap();
    ipam.add_tag(b.id, "multi").unwrap();
    assert_eq!(ipam.id_tags("multi").len(), 2);
    assert_eq!(ipam.tags_of(b.id), vec!["multi".to_string()]);

    // the /25 is the tighter fit
    assert_eq!(ipam.find(25, "multi", None, None).unwrap(), "10.9.0.0/25");
    assert_eq!(ipam.find(25, "multi", None, None).unwrap(), "10.0.0.0/25");
    assert_eq!(ipam.find(25, "multi", None, None).unwrap(), "10.0.0.128/25");
    assert!(ipam.find(25, "multi", None, None).is_err());
}

#[test]
fn nested_free_container_is_its_own_pool() {
    let ipam = engine();
    pool(&ipam, "10.0.0.0/23", "outer");
    let inner = ipam.add_prefix("inner", "10.0.0.0/24", None, None).unwrap();
    ipam.add_tag(inner.id, "inner").unwrap();
    // the outer pool skips the free inner container
    assert_eq!(ipam.find(25, "outer", None, None).unwrap(), "10.0.1.0/25");
    assert_eq!(ipam.find(25, "inner", None, None).unwrap(), "10.0.0.0/25");
    assert_eq!(
        ipam.get_prefix("10.0.0.0/25", None).unwrap().parent,
        Some(inner.id)
    );
}

#[test]
fn release_then_reallocate_restores_state() {
    let ipam = engine();
    pool(&ipam, "172.16.0.0/16", "p");
    ipam.find(24, "p", None, None).unwrap();
    let before = state(&ipam);

    ipam.allocate_prefix("a", "172.16.77.0/24", None, None).unwrap();
    let allocated = state(&ipam);
    ipam.release_prefix("172.16.77.0/24", None).unwrap();
    assert_eq!(state(&ipam), before);

    ipam.allocate_prefix("a", "172.16.77.0/24", None, None).unwrap();
    assert_eq!(state(&ipam), allocated);
    ipam.table().check_invariants("default", Version::V4).unwrap();
}

#[test]
fn allocate_without_cover_is_not_found() {
    let ipam = engine();
    let err = ipam.allocate_prefix("a", "10.0.0.0/24", None, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert!(state(&ipam).is_empty());
}

#[test]
fn allocate_existing_free_prefix() {
    let ipam = engine();
    let p = ipam.add_prefix("c", "10.0.0.0/24", None, None).unwrap();
    let a = ipam.allocate_prefix("mine", "10.0.0.0/24", None, None).unwrap();
    assert_eq!(a.id, p.id);
    assert!(!a.free);
    assert_eq!(a.kind, "Assigned");
    assert!(matches!(
        ipam.allocate_prefix("again", "10.0.0.0/24", None, None),
        Err(Error::Validation(_))
    ));
}

#[test]
fn nested_add_under_allocated_block_is_refused() {
    let ipam = engine();
    pool(&ipam, "10.0.0.0/22", "p");
    assert_eq!(ipam.find(24, "p", None, None).unwrap(), "10.0.0.0/24");
    let before = state(&ipam);

    let err = ipam.add_prefix("sub", "10.0.0.0/26", None, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Validation);
    assert_eq!(state(&ipam), before);
    assert!(!ipam.delete_prefix("10.0.0.0/26", None).unwrap());

    let block = ipam.get_prefix("10.0.0.0/24", None).unwrap();
    assert!(!block.free);
    assert_eq!(block.kind, "Assigned");
    assert!(matches!(
        ipam.allocate_prefix("other", "10.0.0.0/24", None, None),
        Err(Error::Validation(_))
    ));
    ipam.table().check_invariants("default", Version::V4).unwrap();
}

#[test]
fn deleting_free_nested_container_collapses_into_parent() {
    let ipam = engine();
    ipam.add_prefix("outer", "10.0.0.0/22", None, None).unwrap();
    ipam.add_prefix("inner", "10.0.0.0/23", None, None).unwrap();
    // outer, inner and the hidden free 10.0.2.0/23
    assert_eq!(state(&ipam).len(), 3);
    ipam.table().check_invariants("default", Version::V4).unwrap();

    assert!(ipam.delete_prefix("10.0.0.0/23", None).unwrap());
    let after = state(&ipam);
    assert_eq!(3 - after.len(), 2);
    assert_eq!(after, vec![("10.0.0.0/22".into(), true, "container".into())]);
    ipam.table().check_invariants("default", Version::V4).unwrap();
}

#[test]
fn prune_climbs_one_level_per_pair() {
    let ipam = engine();
    pool(&ipam, "10.0.0.0/8", "big");
    let host = ipam.find(32, "big", None, None).unwrap();
    assert_eq!(host, "10.0.0.0/32");
    // root, plus two rows per level from /9 to /32
    assert_eq!(state(&ipam).len(), 1 + 2 * 24);
    ipam.release_prefix(&host, None).unwrap();
    assert_eq!(state(&ipam), vec![("10.0.0.0/8".into(), true, "container".into())]);
}

#[test]
fn deleted_rows_lose_their_tags() {
    let ipam = engine();
    let p = ipam.add_prefix("gone", "10.0.0.0/16", None, None).unwrap();
    ipam.add_tag(p.id, "t").unwrap();
    assert!(ipam.delete_prefix("10.0.0.0/16", None).unwrap());
    assert!(ipam.id_tags("t").is_empty());
    assert!(matches!(ipam.add_tag(p.id, "t"), Err(Error::NotFound(_))));
}

#[test]
fn deleted_pool_member_stops_serving() {
    let ipam = engine();
    pool(&ipam, "10.0.0.0/8", "p");
    ipam.add_prefix("keep", "10.1.0.0/16", None, None).unwrap();
    ipam.delete_prefix("10.0.0.0/8", None).unwrap();
    // the /8 is structure now
    let row = ipam.get_prefix("10.0.0.0/8", None).unwrap();
    assert!(row.is_hidden());
    assert!(ipam.find(24, "p", None, None).is_err());
    let keep = ipam.get_prefix("10.1.0.0/16", None).unwrap();
    assert_eq!(keep.parent, None);
    assert_eq!(ipam.roots(None, Version::V4).unwrap(), vec![keep]);
    ipam.table().check_invariants("default", Version::V4).unwrap();

    ipam.delete_prefix("10.1.0.0/16", None).unwrap();
    assert!(state(&ipam).is_empty());
}

#[test]
fn ribs_are_independent() {
    let ipam = engine();
    let a = ipam.add_prefix("a", "10.0.0.0/24", None, Some("red")).unwrap();
    let b = ipam.add_prefix("b", "10.0.0.0/24", None, Some("blue")).unwrap();
    assert_ne!(a.id, b.id);
    ipam.add_tag(a.id, "red").unwrap();
    assert_eq!(ipam.find(25, "red", None, None).unwrap(), "10.0.0.0/25");
    assert!(ipam.get_prefix("10.0.0.0/25", Some("red")).is_ok());
    assert!(ipam.get_prefix("10.0.0.0/25", Some("blue")).is_err());
    assert!(ipam.get_prefix("10.0.0.0/24", None).is_err());
    assert!(ipam.get_prefix("10.0.0.0/24", Some("blue")).unwrap().free);
}

#[test]
fn ipv6_pools() {
    let ipam = engine();
    pool(&ipam, "2001:db8::/32", "v6");
    assert_eq!(ipam.find(48, "v6", None, None).unwrap(), "2001:db8::/48");
    assert_eq!(ipam.find(48, "v6", None, None).unwrap(), "2001:db8:1::/48");
    assert_eq!(ipam.find(64, "v6", None, None).unwrap(), "2001:db8:2::/64");
    assert_eq!(
        ipam.find(128, "v6", None, None).unwrap(),
        "2001:db8:2:1::/128"
    );
    ipam.table().check_invariants("default", Version::V6).unwrap();

    // v4 and v6 rows never mix
    pool(&ipam, "0.0.0.0/0", "v4");
    assert_eq!(ipam.find(1, "v4", None, None).unwrap(), "0.0.0.0/1");
    let v6 = ipam.get_prefix("2001:db8::/32", None).unwrap();
    assert_eq!(v6.parent, None);
}

#[test]
fn whole_ipv6_space() {
    let ipam = engine();
    pool(&ipam, "::/0", "all");
    assert_eq!(ipam.find(1, "all", None, None).unwrap(), "::/1");
    assert_eq!(ipam.find(1, "all", None, None).unwrap(), "8000::/1");
    assert!(ipam.find(1, "all", None, None).is_err());
    ipam.release_prefix("::/1", None).unwrap();
    ipam.release_prefix("8000::/1", None).unwrap();
    assert_eq!(state(&ipam), vec![("::/0".into(), true, "container".into())]);
}

#[test]
fn query_facade() {
    let ipam = engine();
    let sup = ipam.add_prefix("sup", "196.25.0.0/20", None, None).unwrap();
    let mid = ipam.add_prefix("mid", "196.25.2.0/24", None, None).unwrap();
    let leaf = ipam.allocate_prefix("leaf", "196.25.2.0/26", None, None).unwrap();

    let longer = |ip: &str| ipam.find_longer(ip, None).unwrap().map(|p| p.cidr());
    assert_eq!(longer("196.25.2.7").as_deref(), Some("196.25.2.0/26"));
    assert_eq!(longer("196.25.2.200").as_deref(), Some("196.25.2.0/24"));
    assert_eq!(longer("196.25.9.1").as_deref(), Some("196.25.0.0/20"));
    assert_eq!(longer("196.25.2.0/24").as_deref(), Some("196.25.2.0/24"));
    assert_eq!(longer("10.0.0.1"), None);

    // structural rows are invisible to find_exact but not to get_prefix
    assert!(ipam.find_exact("196.25.0.0/23", None).unwrap().is_none());
    assert!(ipam.get_prefix("196.25.0.0/23", None).unwrap().is_hidden());
    assert_eq!(
        ipam.find_exact("196.25.2.0/24", None).unwrap().map(|p| p.id),
        Some(mid.id)
    );

    let covered: Vec<String> = ipam
        .find_covered("196.25.0.0/20", None)
        .unwrap()
        .iter()
        .map(|p| p.cidr())
        .collect();
    assert_eq!(covered, ["196.25.0.0/20", "196.25.2.0/24", "196.25.2.0/26"]);

    assert_eq!(ipam.roots(None, Version::V4).unwrap(), vec![ipam.get_by_id(sup.id).unwrap()]);
    assert!(ipam.roots(None, Version::V6).unwrap().is_empty());
    let kids: Vec<_> = ipam.children(sup.id).unwrap().iter().map(|p| p.id).collect();
    assert_eq!(kids, vec![mid.id]);
    let kids: Vec<_> = ipam.children(mid.id).unwrap().iter().map(|p| p.id).collect();
    assert_eq!(kids, vec![leaf.id]);

    assert!(ipam.has_descendants("196.25.2.0/24", None).unwrap());
    assert!(!ipam.has_descendants("196.25.2.0/26", None).unwrap());

    let err = ipam.get_prefix("196.25.15.0/24", None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    let err = ipam.get_prefix("not-a-prefix", None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPrefix);
}

#[test]
fn concurrent_finds_never_collide() {
    let ipam = Arc::new(engine());
    pool(&ipam, "10.20.0.0/20", "shared");
    let threads = 8;
    let per_thread = 16;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let ipam = Arc::clone(&ipam);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..per_thread)
                    .map(|_| ipam.find(28, "shared", None, None).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for h in handles {
        for cidr in h.join().unwrap() {
            assert!(seen.insert(cidr.clone()), "{cidr} handed out twice");
        }
    }
    assert_eq!(seen.len(), threads * per_thread);
    let nets: Vec<Net> = seen.iter().map(|s| Net::parse(s).unwrap()).collect();
    for (i, a) in nets.iter().enumerate() {
        for b in &nets[i + 1..] {
            assert!(!a.contains(b) && !b.contains(a));
        }
    }
    ipam.table().check_invariants("default", Version::V4).unwrap();
}

#[test]
fn snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ipam.json");
    let config = IpamConfig::default().with_snapshot(&path);

    let ipam = Ipam::open(config.clone()).unwrap();
    pool(&ipam, "196.25.0.0/22", "p");
    assert_eq!(ipam.find(24, "p", None, None).unwrap(), "196.25.0.0/24");
    assert_eq!(ipam.find(24, "p", None, None).unwrap(), "196.25.1.0/24");
    ipam.persist().unwrap();
    let before = state(&ipam);
    drop(ipam);

    let ipam = Ipam::open(config).unwrap();
    assert_eq!(state(&ipam), before);
    assert_eq!(ipam.id_tags("p").len(), 1);
    assert_eq!(ipam.find(24, "p", None, None).unwrap(), "196.25.2.0/24");
    ipam.table().check_invariants("default", Version::V4).unwrap();
}

#[test]
fn persist_needs_a_path() {
    let ipam = engine();
    assert_eq!(ipam.persist().unwrap_err().code(), ErrorCode::Persistence);
}

#[test]
fn corrupt_snapshot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, b"{\"version\": 1, \"prefixes\": [").unwrap();
    let err = Ipam::open(IpamConfig::default().with_snapshot(&path))
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::Persistence);
}
