use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::matcher::{DomainSet, IpRangeSet, LoadedIpRanges};
use crate::upstream::{Proto, Upstream};

pub const DEFAULT_LISTEN: &str = "[::]:53";
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_UDP_MAX_SIZE: u16 = 4096;

/// Raw configuration as it arrives from the CLI and/or a JSON file.
/// Unset fields fall back to defaults during `ServerConfig::build`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub china_cidr: Option<PathBuf>,
    #[serde(default)]
    pub ip_blacklist: Option<PathBuf>,
    #[serde(default)]
    pub domain_blacklist: Option<PathBuf>,
    #[serde(default)]
    pub domain_polluted: Option<PathBuf>,
    #[serde(default)]
    pub trusted_servers: Vec<String>,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub udp_max_size: Option<u16>,
    #[serde(default)]
    pub tcp_only: bool,
    #[serde(default)]
    pub mutation: bool,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub reuse_port: bool,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub test_domains: Option<Vec<String>>,
}

impl RawConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("open config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parse config file {}", path.display()))
    }
}

/// Immutable server configuration: matchers loaded, upstreams classified,
/// every option resolved. Built once at startup and shared read-only.
#[derive(Debug)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub timeout: Duration,
    pub udp_max_size: u16,
    pub mutation: bool,
    pub bidirectional: bool,
    pub reuse_port: bool,
    pub delay: Duration,
    pub test_domains: Vec<String>,
    pub china_route: IpRangeSet,
    pub ip_blacklist: IpRangeSet,
    pub domain_blacklist: DomainSet,
    pub domain_polluted: DomainSet,
    pub trusted: Vec<Upstream>,
    pub untrusted: Vec<Upstream>,
}

impl ServerConfig {
    /// Validate and assemble the runtime configuration. Every offense is
    /// collected before failing so a broken config reports all problems
    /// at once.
    pub fn build(raw: RawConfig) -> Result<Self> {
        let mut offenses: Vec<String> = Vec::new();

        let listen_str = raw.listen.as_deref().unwrap_or(DEFAULT_LISTEN);
        let listen: Option<SocketAddr> = match listen_str.parse() {
            Ok(addr) => Some(addr),
            Err(err) => {
                offenses.push(format!("listen address {listen_str:?}: {err}"));
                None
            }
        };

        // The route set must be loaded before any server can be
        // classified; PoolBuilder only accepts the loaders' proof type.
        let china_route: LoadedIpRanges = match &raw.china_cidr {
            Some(path) => match IpRangeSet::load(path) {
                Ok(set) => set,
                Err(err) => {
                    offenses.push(format!("china route list: {err:#}"));
                    LoadedIpRanges::absent()
                }
            },
            None => {
                warn!("China route list is not specified; CHNRoute classification disabled");
                LoadedIpRanges::absent()
            }
        };

        let ip_blacklist = match &raw.ip_blacklist {
            Some(path) => match IpRangeSet::load_with_hosts(path) {
                Ok(set) => set.into_inner(),
                Err(err) => {
                    offenses.push(format!("ip blacklist: {err:#}"));
                    IpRangeSet::new()
                }
            },
            None => IpRangeSet::new(),
        };

        let domain_blacklist = load_domains(&raw.domain_blacklist, "domain blacklist", &mut offenses);
        let domain_polluted = load_domains(&raw.domain_polluted, "domain polluted list", &mut offenses);

        let mut pools = PoolBuilder::new(&china_route);
        for schema in &raw.trusted_servers {
            if let Err(err) = pools.add_trusted(schema) {
                offenses.push(format!("trusted server {schema:?}: {err:#}"));
            }
        }
        for schema in &raw.servers {
            if let Err(err) = pools.add_auto(schema) {
                offenses.push(format!("server {schema:?}: {err:#}"));
            }
        }
        let (mut trusted, mut untrusted) = pools.finish();
        if trusted.is_empty() && untrusted.is_empty() {
            offenses.push("no upstream servers configured".to_string());
        }

        if raw.tcp_only {
            for up in trusted.iter_mut().chain(untrusted.iter_mut()) {
                up.protos = vec![Proto::Tcp];
            }
        }

        let timeout = Duration::from_millis(raw.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        if timeout.is_zero() {
            offenses.push("timeout must be positive".to_string());
        }
        let delay = Duration::from_millis(raw.delay_ms.unwrap_or(0));

        let udp_max_size = raw.udp_max_size.unwrap_or(DEFAULT_UDP_MAX_SIZE);
        if udp_max_size < 512 {
            offenses.push(format!(
                "udp max size {udp_max_size} below the 512-byte protocol minimum"
            ));
        }

        let test_domains = raw
            .test_domains
            .unwrap_or_else(|| vec!["qq.com".to_string()]);

        if !offenses.is_empty() {
            bail!("invalid configuration:\n  - {}", offenses.join("\n  - "));
        }
        let Some(listen) = listen else {
            bail!("invalid configuration: listen address unusable");
        };

        Ok(Self {
            listen,
            timeout,
            udp_max_size,
            mutation: raw.mutation,
            bidirectional: raw.bidirectional,
            reuse_port: raw.reuse_port,
            delay,
            test_domains,
            china_route: china_route.into_inner(),
            ip_blacklist,
            domain_blacklist,
            domain_polluted,
            trusted,
            untrusted,
        })
    }
}

fn load_domains(path: &Option<PathBuf>, what: &str, offenses: &mut Vec<String>) -> DomainSet {
    match path {
        Some(p) => match DomainSet::load(p) {
            Ok(set) => set,
            Err(err) => {
                offenses.push(format!("{what}: {err:#}"));
                DomainSet::new()
            }
        },
        None => DomainSet::new(),
    }
}

/// Splits upstreams into the trusted and untrusted pools.
///
/// Construction demands [`LoadedIpRanges`], the proof type only the
/// route loaders produce, so classifying servers against a set that was
/// never loaded does not compile. Duplicate addresses are coalesced; an
/// address already pinned trusted stays trusted.
pub struct PoolBuilder<'a> {
    china: &'a LoadedIpRanges,
    trusted: Vec<Upstream>,
    untrusted: Vec<Upstream>,
    warned_unclassifiable: bool,
}

impl<'a> PoolBuilder<'a> {
    pub fn new(china: &'a LoadedIpRanges) -> Self {
        Self {
            china,
            trusted: Vec::new(),
            untrusted: Vec::new(),
            warned_unclassifiable: false,
        }
    }

    pub fn add_trusted(&mut self, schema: &str) -> Result<()> {
        let up = Upstream::parse(schema)?;
        self.insert(up, true);
        Ok(())
    }

    /// Classify by host address: inside the China routes lands untrusted,
    /// outside lands trusted. With no routes loaded everything defaults
    /// to trusted, once-warned.
    pub fn add_auto(&mut self, schema: &str) -> Result<()> {
        let up = Upstream::parse(schema)?;
        let trusted = if self.china.is_empty() {
            if !self.warned_unclassifiable {
                warn!("no China routes loaded; auto-classified servers default to trusted");
                self.warned_unclassifiable = true;
            }
            true
        } else {
            !self.china.contains(up.addr.ip())
        };
        self.insert(up, trusted);
        Ok(())
    }

    fn insert(&mut self, up: Upstream, trusted: bool) {
        let seen = self
            .trusted
            .iter()
            .chain(self.untrusted.iter())
            .any(|existing| existing.addr == up.addr);
        if seen {
            return;
        }
        if trusted {
            self.trusted.push(up);
        } else {
            self.untrusted.push(up);
        }
    }

    pub fn finish(self) -> (Vec<Upstream>, Vec<Upstream>) {
        (self.trusted, self.untrusted)
    }
}
