//! Reverse lookups of peer addresses, and the cache that saves repeating them.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::process::Command;

/// Blocking reverse lookup. Only ever called from a helper thread.
pub trait Resolver: Send + Sync {
    fn reverse(&self, ip: IpAddr) -> io::Result<String>;
}

/// Asks the system resolver through `getent hosts`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;
impl Resolver for SystemResolver {
    fn reverse(&self, ip: IpAddr) -> io::Result<String> {
        let output = Command::new("getent").arg("hosts").arg(ip.to_string()).output()?;
        if !output.status.success() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("no name for {ip}")));
        }
        parse_getent(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unexpected getent output"))
    }
}

/// `getent hosts` prints `<address> <canonical name> [aliases...]`.
fn parse_getent(output: &str) -> Option<String> {
    output.lines().next()?.split_whitespace().nth(1).map(str::to_owned)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsEntry {
    pub ip: IpAddr,
    pub hostname: String,
    /// Unix seconds of the lookup.
    pub time: u64,
}

#[derive(Debug, Default)]
pub struct DnsCache {
    entries: HashMap<IpAddr, DnsEntry>,
}
impl DnsCache {
    /// A missing or unreadable cache file starts an empty cache.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                log::warn!("unable to read dns cache {}: {e}", path.display());
                return Self::default();
            }
        };
        match serde_json::from_str::<Vec<DnsEntry>>(&contents) {
            Ok(entries) => {
                log::info!("loaded {} cached hostnames", entries.len());
                Self {
                    entries: entries.into_iter().map(|e| (e.ip, e)).collect(),
                }
            }
            Err(e) => {
                log::warn!("ignoring malformed dns cache {}: {e}", path.display());
                Self::default()
            }
        }
    }
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.entries()).map_err(io::Error::from)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn get(&self, ip: IpAddr) -> Option<&str> {
        self.entries.get(&ip).map(|e| e.hostname.as_str())
    }
    pub fn insert(&mut self, ip: IpAddr, hostname: impl Into<String>, now: u64) {
        let hostname = hostname.into();
        log::debug!("{ip} is {hostname}");
        self.entries.insert(ip, DnsEntry { ip, hostname, time: now });
    }
    /// Forgets entries older than `max_age` seconds. Returns how many went.
    pub fn prune(&mut self, now: u64, max_age: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now.saturating_sub(e.time) <= max_age);
        let pruned = before - self.entries.len();
        if pruned > 0 {
            log::info!("pruned {pruned} stale hostnames");
        }
        pruned
    }
    /// Every entry, ordered by address.
    pub fn entries(&self) -> Vec<&DnsEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|e| e.ip);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getent_output() {
        assert_eq!(
            parse_getent("203.0.113.5     host.example.com host\n").as_deref(),
            Some("host.example.com")
        );
        assert_eq!(parse_getent(""), None);
        assert_eq!(parse_getent("203.0.113.5\n"), None);
    }

    #[test]
    fn survives_a_restart_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns.json");
        let old: IpAddr = "198.51.100.1".parse().unwrap();
        let new: IpAddr = "203.0.113.5".parse().unwrap();

        let mut cache = DnsCache::load(&path);
        assert!(cache.is_empty());
        cache.insert(old, "old.example.com", 100);
        cache.insert(new, "host.example.com", 1_000);
        cache.save(&path).unwrap();

        let mut cache = DnsCache::load(&path);
        assert_eq!(cache.get(new), Some("host.example.com"));
        assert_eq!(cache.prune(1_050, 500), 1);
        assert_eq!(cache.get(old), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn garbage_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(DnsCache::load(&path).is_empty());
    }
}
