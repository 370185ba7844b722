//! Row and key types of the prefix table

use crate::constants::{HIDDEN, V4_BITS, V6_BITS};
use crate::errors::{Error, Result};
use crate::helpers::{self, join_words, split_words};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

/// Opaque row identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrefixId(Uuid);

impl PrefixId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PrefixId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PrefixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Version {
    V4,
    V6,
}

impl Version {
    #[inline]
    pub fn bits(self) -> u8 {
        match self {
            Version::V4 => V4_BITS,
            Version::V6 => V6_BITS,
        }
    }
}

impl From<Version> for u8 {
    fn from(v: Version) -> u8 {
        match v {
            Version::V4 => 4,
            Version::V6 => 6,
        }
    }
}

impl TryFrom<u8> for Version {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            4 => Ok(Version::V4),
            6 => Ok(Version::V6),
            other => Err(Error::InvalidPrefix(format!("unknown IP version {other}"))),
        }
    }
}

/// A canonical CIDR block: host bits are always zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Net {
    version: Version,
    addr: u128,
    len: u8,
}

impl Net {
    /// Build a block, zeroing host bits. Rejects lengths and addresses that
    /// do not fit the family.
    pub fn new(version: Version, addr: u128, len: u8) -> Result<Self> {
        let bits = version.bits();
        if len > bits {
            return Err(Error::InvalidPrefix(format!(
                "prefix length /{len} exceeds {bits} bits"
            )));
        }
        if addr & !helpers::width_mask(bits) != 0 {
            return Err(Error::InvalidPrefix(format!(
                "address {addr:#x} does not fit IPv{}",
                u8::from(version)
            )));
        }
        Ok(Self {
            version,
            addr: helpers::canonical(addr, len, bits),
            len,
        })
    }

    /// Parse `addr/len` or a bare address (taken as a host route).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(net) = s.parse::<IpNet>() {
            Ok(Self::from_ip(net.network(), net.prefix_len()))
        } else if let Ok(ip) = s.parse::<IpAddr>() {
            let len = match ip {
                IpAddr::V4(_) => V4_BITS,
                IpAddr::V6(_) => V6_BITS,
            };
            Ok(Self::from_ip(ip, len))
        } else {
            Err(Error::InvalidPrefix(s.to_string()))
        }
    }

    fn from_ip(ip: IpAddr, len: u8) -> Self {
        let (version, addr) = match ip {
            IpAddr::V4(v4) => (Version::V4, u128::from(u32::from(v4))),
            IpAddr::V6(v6) => (Version::V6, u128::from(v6)),
        };
        Self {
            version,
            addr: helpers::canonical(addr, len, version.bits()),
            len,
        }
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn addr(&self) -> u128 {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> u8 {
        self.len
    }

    #[inline]
    pub fn bits(&self) -> u8 {
        self.version.bits()
    }

    pub fn network(&self) -> IpAddr {
        match self.version {
            Version::V4 => IpAddr::V4(Ipv4Addr::from(self.addr as u32)),
            Version::V6 => IpAddr::V6(Ipv6Addr::from(self.addr)),
        }
    }

    pub fn last(&self) -> u128 {
        helpers::last(self.addr, self.len, self.bits())
    }

    pub fn size(&self) -> Option<u128> {
        helpers::size(self.len, self.bits())
    }

    pub fn words(&self) -> [u32; 4] {
        split_words(self.addr)
    }

    pub fn contains(&self, other: &Net) -> bool {
        self.version == other.version
            && helpers::contains(self.addr, self.len, other.addr, other.len, self.bits())
    }

    /// Both halves one level deeper, lower half first.
    pub fn halves(&self) -> Option<(Net, Net)> {
        helpers::halves(self.addr, self.len, self.bits()).map(|(lo, hi)| {
            let len = self.len + 1;
            (
                Net { version: self.version, addr: lo, len },
                Net { version: self.version, addr: hi, len },
            )
        })
    }

    pub fn sibling(&self) -> Result<Net> {
        let addr = helpers::sibling(self.addr, self.len, self.bits())?;
        Ok(Net { addr, ..*self })
    }

    /// The block one level up; `None` at `/0`.
    pub fn parent(&self) -> Option<Net> {
        self.len.checked_sub(1).map(|len| self.supernet(len))
    }

    /// The covering block of length `len` (<= own length).
    pub fn supernet(&self, len: u8) -> Net {
        debug_assert!(len <= self.len);
        Net {
            version: self.version,
            addr: helpers::canonical(self.addr, len, self.bits()),
            len,
        }
    }

    /// A block of length `len` starting at this block's network address.
    pub fn first_subnet(&self, len: u8) -> Result<Net> {
        if len < self.len {
            return Err(Error::InvalidPrefix(format!(
                "/{len} is shorter than {self}"
            )));
        }
        Net::new(self.version, self.addr, len)
    }
}

impl fmt::Display for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.len)
    }
}

impl std::str::FromStr for Net {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Net::parse(s)
    }
}

/// One node of a binary radix tree of address space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "PrefixRecord", try_from = "PrefixRecord")]
pub struct Prefix {
    pub id: PrefixId,
    pub net: Net,
    pub rib: String,
    pub free: bool,
    /// `type` column; [`HIDDEN`] marks structure-only rows.
    pub kind: String,
    /// Owning prefix: the nearest enclosing non-hidden row, `None` for roots.
    pub parent: Option<PrefixId>,
    pub name: String,
    pub creation_time: DateTime<Utc>,
}

impl Prefix {
    pub fn new(net: Net, rib: &str, name: &str, kind: &str) -> Self {
        Self {
            id: PrefixId::new(),
            net,
            rib: rib.to_string(),
            free: true,
            kind: kind.to_string(),
            parent: None,
            name: name.to_string(),
            creation_time: Utc::now(),
        }
    }

    pub(crate) fn hidden(net: Net, rib: &str, owner: Option<PrefixId>, free: bool) -> Self {
        Self {
            free,
            parent: owner,
            ..Self::new(net, rib, "", HIDDEN)
        }
    }

    #[inline]
    pub fn is_hidden(&self) -> bool {
        self.kind == HIDDEN
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.net.version()
    }

    #[inline]
    pub fn prefix_len(&self) -> u8 {
        self.net.len()
    }

    pub fn words(&self) -> [u32; 4] {
        self.net.words()
    }

    pub fn cidr(&self) -> String {
        self.net.to_string()
    }

    /// Owner to record on rows created beneath this one.
    pub fn owner_for_children(&self) -> Option<PrefixId> {
        if self.is_hidden() {
            self.parent
        } else {
            Some(self.id)
        }
    }
}

/// Storage layout of a [`Prefix`]: the address as four 32-bit words.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrefixRecord {
    pub id: PrefixId,
    pub a1: u32,
    pub a2: u32,
    pub a3: u32,
    pub a4: u32,
    pub prefix_len: u8,
    pub version: Version,
    pub rib: String,
    pub free: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub parent: Option<PrefixId>,
    pub name: String,
    pub creation_time: DateTime<Utc>,
}

impl From<Prefix> for PrefixRecord {
    fn from(p: Prefix) -> Self {
        let [a1, a2, a3, a4] = p.net.words();
        Self {
            id: p.id,
            a1,
            a2,
            a3,
            a4,
            prefix_len: p.net.len(),
            version: p.net.version(),
            rib: p.rib,
            free: p.free,
            kind: p.kind,
            parent: p.parent,
            name: p.name,
            creation_time: p.creation_time,
        }
    }
}

impl TryFrom<PrefixRecord> for Prefix {
    type Error = Error;

    fn try_from(r: PrefixRecord) -> Result<Self> {
        let addr = join_words([r.a1, r.a2, r.a3, r.a4]);
        let net = Net::new(r.version, addr, r.prefix_len)?;
        if net.addr() != addr {
            return Err(Error::InvalidPrefix(format!(
                "row {} has host bits set beyond /{}",
                r.id, r.prefix_len
            )));
        }
        Ok(Self {
            id: r.id,
            net,
            rib: r.rib,
            free: r.free,
            kind: r.kind,
            parent: r.parent,
            name: r.name,
            creation_time: r.creation_time,
        })
    }
}

/// Association of a pool name with a prefix.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrefixTag {
    pub prefix: PrefixId,
    pub tag: String,
}
