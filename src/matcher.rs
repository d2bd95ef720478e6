//! Route matching over CIDR ranges, exact IPs and domain suffixes.
//!
//! The matcher is built once at startup from a plain-text rule file
//! (one rule per line, blank lines skipped):
//! - a line containing `/` is parsed as a CIDR and inserted into a binary
//!   prefix trie (malformed CIDRs are skipped),
//! - a line parsing as a bare IP goes into the exact-IP set,
//! - anything else is a domain-suffix rule.
//!
//! After construction the matcher is immutable and may be queried from any
//! number of tasks without synchronization.

use std::collections::HashSet;
use std::io::BufRead;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnet::IpNet;

use crate::logger::log;

/// Binary trie over address bits. Lookup cost is bounded by the address bit
/// length (32 or 128), independent of the number of inserted prefixes.
#[derive(Debug, Default)]
struct TrieNode {
    children: [Option<Box<TrieNode>>; 2],
    terminal: bool,
}

impl TrieNode {
    fn insert(&mut self, bits: impl Iterator<Item = u8>) {
        let mut node = self;
        for bit in bits {
            node = node.children[bit as usize].get_or_insert_with(Box::default);
        }
        node.terminal = true;
    }

    /// Walk the address bits; any terminal node passed on the way means some
    /// inserted prefix covers the address.
    fn contains(&self, bits: impl Iterator<Item = u8>) -> bool {
        let mut node = self;
        if node.terminal {
            return true;
        }
        for bit in bits {
            match &node.children[bit as usize] {
                Some(child) => {
                    node = child;
                    if node.terminal {
                        return true;
                    }
                }
                None => return false,
            }
        }
        false
    }
}

fn ip_bits(ip: IpAddr) -> (Vec<u8>, usize) {
    match ip {
        IpAddr::V4(v4) => (v4.octets().to_vec(), 32),
        IpAddr::V6(v6) => (v6.octets().to_vec(), 128),
    }
}

fn bit_iter(octets: Vec<u8>, len: usize) -> impl Iterator<Item = u8> {
    (0..len).map(move |i| (octets[i / 8] >> (7 - (i % 8))) & 1)
}

/// Prefix trie with separate roots for IPv4 and IPv6.
#[derive(Debug, Default)]
struct PrefixTrie {
    v4: TrieNode,
    v6: TrieNode,
}

impl PrefixTrie {
    fn insert(&mut self, net: IpNet) {
        let prefix_len = net.prefix_len() as usize;
        match net.network() {
            IpAddr::V4(v4) => self.v4.insert(bit_iter(v4.octets().to_vec(), prefix_len)),
            IpAddr::V6(v6) => self.v6.insert(bit_iter(v6.octets().to_vec(), prefix_len)),
        }
    }

    fn contains(&self, ip: IpAddr) -> bool {
        let (octets, len) = ip_bits(ip);
        match ip {
            IpAddr::V4(_) => self.v4.contains(bit_iter(octets, len)),
            IpAddr::V6(_) => self.v6.contains(bit_iter(octets, len)),
        }
    }
}

/// Host membership test used by the route decision.
#[derive(Debug, Default)]
pub struct RouteMatcher {
    nets: PrefixTrie,
    ips: HashSet<IpAddr>,
    domains: HashSet<String>,
}

impl RouteMatcher {
    /// Matcher that never matches anything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from a line-oriented rule source.
    pub fn from_reader(reader: impl BufRead) -> Self {
        let mut matcher = Self::empty();
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::warn!(error = %e, "Rule source read error, stopping rule load");
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.contains('/') {
                match line.parse::<IpNet>() {
                    Ok(net) => matcher.nets.insert(net),
                    Err(_) => log::debug!(rule = line, "Skipping malformed CIDR rule"),
                }
                continue;
            }
            if let Ok(ip) = line.parse::<IpAddr>() {
                matcher.ips.insert(ip);
                continue;
            }
            matcher.domains.insert(line.to_string());
        }
        matcher
    }

    /// Build from a rule file. The file is looked up next to the running
    /// executable first, then at the path as given; a missing file yields an
    /// empty matcher.
    pub fn from_file(name: &str) -> Self {
        let Some(path) = resolve_rule_path(name) else {
            log::info!(rules = name, "Rule file not found, matcher is empty");
            return Self::empty();
        };
        match std::fs::File::open(&path) {
            Ok(file) => {
                let matcher = Self::from_reader(std::io::BufReader::new(file));
                log::info!(
                    rules = %path.display(),
                    exact_ips = matcher.ips.len(),
                    domains = matcher.domains.len(),
                    "Route matcher loaded"
                );
                matcher
            }
            Err(e) => {
                log::warn!(rules = %path.display(), error = %e, "Cannot read rule file");
                Self::empty()
            }
        }
    }

    /// Check whether a host is covered by the rule set.
    ///
    /// IP literals are answered from the trie and the exact-IP set; names are
    /// answered by right-aligned suffix matching against the domain set,
    /// starting from the two last labels and growing left. A rule
    /// `example.com` matches `example.com` and `foo.example.com`, never
    /// `notexample.com`.
    pub fn check(&self, host: &str) -> bool {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.nets.contains(ip) || self.ips.contains(&ip);
        }

        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() < 2 {
            return false;
        }
        let mut suffix = labels[labels.len() - 1].to_string();
        for label in labels[..labels.len() - 1].iter().rev() {
            suffix = format!("{}.{}", label, suffix);
            if self.domains.contains(&suffix) {
                return true;
            }
        }
        false
    }
}

/// Resolve a rule/config file name: executable directory first, then as-is.
pub fn resolve_rule_path(name: &str) -> Option<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    let as_given = Path::new(name);
    if as_given.exists() {
        Some(as_given.to_path_buf())
    } else {
        None
    }
}
