//! Address & Port Pool (spec §4.4), ported from the hash table and
//! bitmap allocator in `core.c` (`hash_enter`/`hash_lookup`, `port_get`/
//! `port_put`).
//!
//! The original's open-addressed hash table is replaced with a `HashMap`
//! keyed by `(hostname, port)` — same contract, no hand-rolled hashing. The
//! port bitmap keeps the original's bit-scan discipline verbatim (Design
//! Note: "Bit-level port allocation") because the ascending, wraparound,
//! per-word-masked scan order is directly observable in port-reuse tests.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::ResourceError;

/// Lowest ephemeral source port this pool will hand out, matching
/// `IPPORT_RESERVED`.
pub const MIN_PORT: u16 = 1024;
pub const MAX_PORT: u16 = 65535;
const NUM_PORTS: usize = (MAX_PORT - MIN_PORT + 1) as usize;
const BITS_PER_WORD: usize = u64::BITS as usize;
const NUM_WORDS: usize = (NUM_PORTS + BITS_PER_WORD - 1) / BITS_PER_WORD;

/// One local source address plus its independent ephemeral-port bitmap.
/// The pool round-robins across these, grounded on `add_addresses`' "all
/// matching addresses enter a round-robin pool" contract.
pub struct SourceAddr {
    pub ip: IpAddr,
    free_map: [u64; NUM_WORDS],
    /// Word index to resume scanning from, carried across calls like the
    /// original's `static int previous`.
    previous: usize,
    /// Bitmask applied to `free_map[previous]` on the next scan, carried
    /// across calls like the original's `static u_long mask`.
    mask: u64,
}

impl SourceAddr {
    fn new(ip: IpAddr) -> Self {
        SourceAddr {
            ip,
            free_map: [u64::MAX; NUM_WORDS],
            previous: 0,
            mask: u64::MAX,
        }
    }

    /// Ascending scan with wraparound, one word at a time, masking off bits
    /// already considered in the current word. Ported from `port_get`.
    fn acquire_port(&mut self) -> Result<u16, ResourceError> {
        let mut i = self.previous;
        if self.free_map[i] & self.mask == 0 {
            loop {
                i += 1;
                if i >= NUM_WORDS {
                    i = 0;
                }
                if i == self.previous {
                    return Err(ResourceError::PortExhausted);
                }
                if self.free_map[i] != 0 {
                    break;
                }
            }
            self.mask = u64::MAX;
        }
        self.previous = i;

        let bit = (self.free_map[i] & self.mask).trailing_zeros() as usize;
        self.mask = if bit >= BITS_PER_WORD - 1 {
            0
        } else {
            !((1u64 << (bit + 1)) - 1)
        };
        self.free_map[i] &= !(1u64 << bit);

        let port = bit + i * BITS_PER_WORD + MIN_PORT as usize;
        Ok(port as u16)
    }

    /// Ported from `port_put`.
    fn release_port(&mut self, port: u16) {
        let offset = (port - MIN_PORT) as usize;
        let word = offset / BITS_PER_WORD;
        let bit = offset % BITS_PER_WORD;
        self.free_map[word] |= 1u64 << bit;
    }

    #[cfg(test)]
    fn bitmap_snapshot(&self) -> [u64; NUM_WORDS] {
        self.free_map
    }
}

/// Hostname/port → resolved address cache, plus the round-robin source
/// address pool.
#[derive(Default)]
pub struct AddrPool {
    cache: HashMap<(String, u16), SocketAddr>,
    sources: Vec<SourceAddr>,
    next_source: usize,
}

impl AddrPool {
    pub fn new() -> Self {
        AddrPool::default()
    }

    /// Resolve `(host, port)` through the cache, falling back to the OS
    /// resolver on a miss and caching the result, grounded on
    /// `core_addr_intern`.
    pub fn resolve(&mut self, host: &str, port: u16) -> std::io::Result<SocketAddr> {
        let key = (host.to_string(), port);
        if let Some(addr) = self.cache.get(&key) {
            return Ok(*addr);
        }
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"))?;
        self.cache.insert(key, addr);
        Ok(addr)
    }

    /// Add one local source address to the round-robin pool, ported from
    /// the single-host case of `add_addresses`; IPv4 ranges and interface
    /// names are parsed by the caller (config layer) into individual `IpAddr`s.
    pub fn add_source(&mut self, ip: IpAddr) {
        self.sources.push(SourceAddr::new(ip));
    }

    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Strict round-robin, ported from `next_source`'s contract in spec §4.4.
    pub fn next_source(&mut self) -> Option<usize> {
        if self.sources.is_empty() {
            return None;
        }
        let idx = self.next_source;
        self.next_source = (self.next_source + 1) % self.sources.len();
        Some(idx)
    }

    pub fn source_addr(&self, entry: usize) -> IpAddr {
        self.sources[entry].ip
    }

    pub fn acquire_port(&mut self, entry: usize) -> Result<u16, ResourceError> {
        self.sources[entry].acquire_port()
    }

    pub fn release_port(&mut self, entry: usize, port: u16) {
        self.sources[entry].release_port(port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_restores_bitmap() {
        let mut source = SourceAddr::new("127.0.0.1".parse().unwrap());
        let before = source.bitmap_snapshot();
        let port = source.acquire_port().unwrap();
        assert_ne!(source.bitmap_snapshot(), before);
        source.release_port(port);
        assert_eq!(source.bitmap_snapshot(), before);
    }

    #[test]
    fn ports_are_not_reissued_until_released() {
        let mut source = SourceAddr::new("127.0.0.1".parse().unwrap());
        let a = source.acquire_port().unwrap();
        let b = source.acquire_port().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn ascending_scan_order() {
        let mut source = SourceAddr::new("127.0.0.1".parse().unwrap());
        let first = source.acquire_port().unwrap();
        let second = source.acquire_port().unwrap();
        assert_eq!(first, MIN_PORT);
        assert_eq!(second, MIN_PORT + 1);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut source = SourceAddr::new("127.0.0.1".parse().unwrap());
        for _ in 0..NUM_PORTS {
            source.acquire_port().unwrap();
        }
        assert_eq!(source.acquire_port(), Err(ResourceError::PortExhausted));
    }

    #[test]
    fn round_robin_cycles_sources() {
        let mut pool = AddrPool::new();
        pool.add_source("10.0.0.1".parse().unwrap());
        pool.add_source("10.0.0.2".parse().unwrap());
        assert_eq!(pool.next_source(), Some(0));
        assert_eq!(pool.next_source(), Some(1));
        assert_eq!(pool.next_source(), Some(0));
    }
}
