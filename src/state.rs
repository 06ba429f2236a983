//! In-memory resolver state: the virtual IP pool and its name tables.
//!
//! Names are kept in canonical form (lowercase, trailing dot), so `svc`,
//! `svc.` and `SVC.` are the same key. Resolution order for a query name:
//! - exact mapping
//! - alias pointing at a mapping
//! - `<query>.<search domain>.` for each search domain, first hit wins

use ipnet::Ipv4Net;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

use crate::error::{MappingError, SidecarError};
use crate::metrics;

/// Thread-safe resolver state shared by the DNS handler and the controller.
///
/// Cloning is cheap and every clone sees the same tables.
#[derive(Debug, Clone)]
pub struct DnsState {
    range: Ipv4Net,
    inner: Arc<RwLock<DnsStateInner>>,
}

#[derive(Debug, Default)]
struct DnsStateInner {
    /// canonical name -> allocated IP
    mappings: HashMap<String, Ipv4Addr>,

    /// alias name -> canonical name
    aliases: HashMap<String, String>,

    /// Addresses currently held by a mapping. Always the same size as `mappings`.
    used_ips: HashSet<Ipv4Addr>,

    /// Search suffixes without trailing dot, in priority order.
    search_domains: Vec<String>,
}

impl DnsState {
    /// Create an empty state drawing addresses from `cidr`.
    ///
    /// Host bits are masked off, so `127.0.66.9/24` behaves like `127.0.66.0/24`.
    pub fn new(cidr: &str) -> Result<Self, SidecarError> {
        let range: Ipv4Net =
            cidr.trim()
                .parse()
                .map_err(|e: ipnet::AddrParseError| SidecarError::InvalidAddressRange {
                    range: cidr.to_string(),
                    reason: e.to_string(),
                })?;

        Ok(Self::with_range(range))
    }

    /// Create an empty state for an already parsed range.
    pub fn with_range(range: Ipv4Net) -> Self {
        Self {
            range: range.trunc(),
            inner: Arc::new(RwLock::new(DnsStateInner::default())),
        }
    }

    /// The synthetic address range.
    pub fn range(&self) -> Ipv4Net {
        self.range
    }

    /// Number of addresses in the range, network and broadcast included.
    pub fn capacity(&self) -> u64 {
        1u64 << (32 - u32::from(self.range.prefix_len()))
    }

    /// Address at `index` within the range, or `None` past its end.
    pub fn get_ip(&self, index: usize) -> Option<Ipv4Addr> {
        let index = u64::try_from(index).ok()?;
        if index >= self.capacity() {
            return None;
        }
        Some(self.nth(index))
    }

    fn nth(&self, offset: u64) -> Ipv4Addr {
        // offset < capacity, so the sum stays within the range
        Ipv4Addr::from(u32::from(self.range.network()) + offset as u32)
    }

    /// Map `name` to a virtual IP, allocating the lowest free address.
    ///
    /// Returns the existing address if `name` is already mapped.
    pub fn add_mapping(&self, name: &str) -> Result<Ipv4Addr, MappingError> {
        let name = canonical_name(name);
        let mut inner = self.inner.write();

        if let Some(ip) = inner.mappings.get(&name).copied() {
            return Ok(ip);
        }

        let ip = if inner.used_ips.len() as u64 >= self.capacity() {
            None
        } else {
            let used = &inner.used_ips;
            (0..self.capacity())
                .map(|offset| self.nth(offset))
                .find(|ip| !used.contains(ip))
        };

        let Some(ip) = ip else {
            debug!(name = %name, range = %self.range, "no unused IP found");
            return Err(MappingError::PoolExhausted { range: self.range });
        };

        inner.used_ips.insert(ip);
        inner.mappings.insert(name.clone(), ip);
        debug!(name = %name, ip = %ip, "added mapping");

        Ok(ip)
    }

    /// Register `aliases` as alternative names for `canonical`.
    ///
    /// The canonical mapping does not need to exist yet; aliases resolve
    /// once it does.
    pub fn add_mapping_alias<I, S>(&self, canonical: &str, aliases: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let canonical = canonical_name(canonical);
        let mut inner = self.inner.write();

        for alias in aliases {
            let alias = canonical_name(alias.as_ref());
            debug!(alias = %alias, canonical = %canonical, "added alias");
            inner.aliases.insert(alias, canonical.clone());
        }
    }

    /// Remove the mapping for `name`, free its address and drop its aliases.
    pub fn remove_mapping(&self, name: &str) -> Result<Ipv4Addr, MappingError> {
        let name = canonical_name(name);
        let mut inner = self.inner.write();

        let ip = inner
            .mappings
            .remove(&name)
            .ok_or_else(|| MappingError::UnknownMapping(name.clone()))?;
        inner.used_ips.remove(&ip);
        inner.aliases.retain(|_, target| *target != name);

        debug!(name = %name, ip = %ip, "removed mapping");
        Ok(ip)
    }

    /// Replace the search domain list.
    pub fn set_search_domains<I, S>(&self, domains: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains: Vec<String> = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        debug!(domains = ?domains, "set search domains");
        self.inner.write().search_domains = domains;
    }

    /// Current search domains, in priority order.
    pub fn search_domains(&self) -> Vec<String> {
        self.inner.read().search_domains.clone()
    }

    /// Resolve a query name against mappings, aliases and search domains.
    pub fn resolve(&self, query: &str) -> Option<Ipv4Addr> {
        let name = canonical_name(query);
        let inner = self.inner.read();

        if let Some(ip) = inner.mappings.get(&name) {
            return Some(*ip);
        }

        if let Some(ip) = inner
            .aliases
            .get(&name)
            .and_then(|canonical| inner.mappings.get(canonical))
        {
            return Some(*ip);
        }

        // The root name never expands into a search domain.
        if name == "." {
            return None;
        }

        inner.search_domains.iter().find_map(|search| {
            let full = join_domain(&name, search);
            let ip = inner.mappings.get(&full).copied()?;
            debug!(query = %name, matched = %full, "resolved via search domain");
            Some(ip)
        })
    }

    /// Exact mapping lookup, without aliases or search domains.
    pub fn lookup(&self, name: &str) -> Option<Ipv4Addr> {
        self.inner.read().mappings.get(&canonical_name(name)).copied()
    }

    /// Number of canonical mappings (equals the number of used addresses).
    pub fn mappings_count(&self) -> usize {
        self.inner.read().mappings.len()
    }

    /// Number of registered aliases.
    pub fn aliases_count(&self) -> usize {
        self.inner.read().aliases.len()
    }

    /// Emit current pool metrics.
    pub fn emit_metrics(&self) {
        let inner = self.inner.read();
        metrics::record_pool_state(inner.used_ips.len(), self.capacity(), inner.aliases.len());
    }
}

/// Canonical form of a DNS name: trimmed, lowercase, trailing dot.
pub fn canonical_name(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    if name.ends_with('.') {
        name
    } else {
        name + "."
    }
}

/// Join a query name and a search domain into a fully-qualified name.
pub fn join_domain(name: &str, search: &str) -> String {
    let name = name.trim_end_matches('.');
    let search = search.trim_end_matches('.');

    match (name.is_empty(), search.is_empty()) {
        (true, _) => format!("{search}."),
        (false, true) => format!("{name}."),
        (false, false) => format!("{name}.{search}."),
    }
}
