use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::PrefixSet;

/// Membership set over IPv4/IPv6 ranges backed by patricia tries.
///
/// Built once at startup and shared read-only afterwards. An empty set
/// matches nothing.
pub struct IpRangeSet {
    v4: PrefixSet<Ipv4Net>,
    v6: PrefixSet<Ipv6Net>,
    len: usize,
    v6_len: usize,
}

impl Default for IpRangeSet {
    fn default() -> Self {
        Self {
            v4: PrefixSet::new(),
            v6: PrefixSet::new(),
            len: 0,
            v6_len: 0,
        }
    }
}

impl std::fmt::Debug for IpRangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpRangeSet")
            .field("len", &self.len)
            .field("v6_len", &self.v6_len)
            .finish()
    }
}

impl IpRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, net: IpNet) {
        match net {
            IpNet::V4(n) => {
                self.v4.insert(n);
            }
            IpNet::V6(n) => {
                self.v6.insert(n);
                self.v6_len += 1;
            }
        }
        self.len += 1;
    }

    /// Insert a single address as a host-mask range (/32 or /128).
    pub fn insert_host(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(a) => self.insert(IpNet::V4(Ipv4Net::from(a))),
            IpAddr::V6(a) => self.insert(IpNet::V6(Ipv6Net::from(a))),
        }
    }

    /// True iff any stored range covers `ip`. A shortest-prefix walk down
    /// the trie, so O(prefix length) regardless of how many ranges are
    /// loaded.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(a) => self.v4.get_spm(&Ipv4Net::from(a)).is_some(),
            IpAddr::V6(a) => self.v6.get_spm(&Ipv6Net::from(a)).is_some(),
        }
    }

    /// Whether any IPv6 range is loaded. Drives the AAAA policy: with an
    /// IPv4-only route table, AAAA answers bypass the route test.
    pub fn has_v6(&self) -> bool {
        self.v6_len > 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Load CIDR ranges from a file, one per line. Blank lines and
    /// `#` comments are skipped.
    pub fn load(path: &Path) -> Result<LoadedIpRanges> {
        let mut set = Self::new();
        for (lineno, entry) in read_list(path)? {
            let net: IpNet = entry
                .parse()
                .with_context(|| format!("{}:{}: bad CIDR {:?}", path.display(), lineno, entry))?;
            set.insert(net);
        }
        Ok(LoadedIpRanges(set))
    }

    /// Load CIDR ranges or bare addresses from a file. Bare addresses get
    /// a host mask, matching the blacklist file format.
    pub fn load_with_hosts(path: &Path) -> Result<LoadedIpRanges> {
        let mut set = Self::new();
        for (lineno, entry) in read_list(path)? {
            if let Ok(net) = entry.parse::<IpNet>() {
                set.insert(net);
            } else {
                let ip: IpAddr = entry.parse().with_context(|| {
                    format!(
                        "{}:{}: neither CIDR nor IP {:?}",
                        path.display(),
                        lineno,
                        entry
                    )
                })?;
                set.insert_host(ip);
            }
        }
        Ok(LoadedIpRanges(set))
    }
}

/// An `IpRangeSet` that has been through its load step.
///
/// Only the file loaders and the explicit [`LoadedIpRanges::absent`]
/// escape hatch produce this type, and pool classification accepts
/// nothing else. Handing the classifier a set that was never loaded is
/// therefore a type error, not a runtime surprise.
#[derive(Debug)]
pub struct LoadedIpRanges(IpRangeSet);

impl LoadedIpRanges {
    /// A configuration with no route file at all. The classifier treats
    /// this the same as an empty loaded file: nothing matches.
    pub fn absent() -> Self {
        Self(IpRangeSet::new())
    }

    pub fn into_inner(self) -> IpRangeSet {
        self.0
    }
}

impl std::ops::Deref for LoadedIpRanges {
    type Target = IpRangeSet;

    fn deref(&self) -> &IpRangeSet {
        &self.0
    }
}

#[derive(Debug, Default)]
struct DomainNode {
    children: HashMap<String, DomainNode>,
    terminal: bool,
}

/// Suffix set over domain names, keyed by reversed dot-separated labels.
///
/// `has_suffix("a.b.example.com")` is true when "example.com" (or any other
/// ancestor suffix) was inserted. Lookups are case-insensitive.
#[derive(Debug, Default)]
pub struct DomainSet {
    root: DomainNode,
    len: usize,
}

impl DomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, domain: &str) {
        let domain = domain.trim_matches('.');
        if domain.is_empty() {
            return;
        }
        let mut node = &mut self.root;
        for label in domain.rsplit('.') {
            node = node
                .children
                .entry(label.to_ascii_lowercase())
                .or_default();
        }
        if !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
    }

    /// Walk from the rightmost label; true iff any visited node was
    /// inserted as a terminal. Empty set matches nothing.
    pub fn has_suffix(&self, name: &str) -> bool {
        let name = name.trim_matches('.');
        if name.is_empty() || self.len == 0 {
            return false;
        }
        let mut node = &self.root;
        for label in name.rsplit('.') {
            let key = label.to_ascii_lowercase();
            match node.children.get(&key) {
                Some(next) => {
                    if next.terminal {
                        return true;
                    }
                    node = next;
                }
                None => return false,
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Load domains from a file, one per line, `#` comments skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let mut set = Self::new();
        for (_, entry) in read_list(path)? {
            set.insert(&entry);
        }
        Ok(set)
    }
}

/// Shared list-file reader: yields (line number, trimmed entry) with blank
/// lines and `#` comments stripped.
fn read_list(path: &Path) -> Result<Vec<(usize, String)>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("open list file {}", path.display()))?;
    let mut entries = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        entries.push((idx + 1, line.to_string()));
    }
    Ok(entries)
}
