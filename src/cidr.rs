//! CIDR prefix algebra: parsing, masking, splitting and uniform address
//! sampling for both IPv4 and IPv6 networks.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use rand::RngCore;
use serde::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrefixError {
    #[error("parse cidr {input:?}: {reason}")]
    Parse { input: String, reason: String },
    #[error("invalid split step: {0}")]
    InvalidStep(u8),
    #[error("cannot split {prefix} by step {step}")]
    SplitOverflow { prefix: Prefix, step: u8 },
}

/// An IP network in canonical (masked) form: host bits are always zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Prefix {
    addr: IpAddr,
    bits: u8,
}

impl Prefix {
    /// Parses a CIDR string such as `1.1.0.0/16` or `2606:4700::/32`.
    /// Surrounding whitespace is trimmed; an input without `/` is an error.
    /// The result is masked.
    pub fn parse(input: &str) -> Result<Prefix, PrefixError> {
        let s = input.trim();
        let (addr_part, bits_part) = s.split_once('/').ok_or_else(|| PrefixError::Parse {
            input: s.to_string(),
            reason: "missing /bits".to_string(),
        })?;
        let addr: IpAddr = addr_part.parse().map_err(|e| PrefixError::Parse {
            input: s.to_string(),
            reason: format!("bad address: {e}"),
        })?;
        let bits: u8 = bits_part.parse().map_err(|e| PrefixError::Parse {
            input: s.to_string(),
            reason: format!("bad prefix length: {e}"),
        })?;
        let max = family_max_bits(&addr);
        if bits > max {
            return Err(PrefixError::Parse {
                input: s.to_string(),
                reason: format!("prefix length {bits} exceeds {max}"),
            });
        }
        Ok(Prefix {
            addr: mask_addr(addr, bits),
            bits,
        })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// 32 for IPv4 prefixes, 128 for IPv6.
    pub fn family_max_bits(&self) -> u8 {
        family_max_bits(&self.addr)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                u32::from(a) & mask4(self.bits) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                u128::from(a) & mask6(self.bits) == u128::from(net)
            }
            _ => false,
        }
    }

    /// Splits the prefix into `2^step` equal children with
    /// `bits + step` prefix length, in ascending address order.
    pub fn split(&self, step: u8) -> Result<Vec<Prefix>, PrefixError> {
        if step == 0 {
            return Err(PrefixError::InvalidStep(step));
        }
        let new_bits = self.bits as u32 + step as u32;
        if new_bits > self.family_max_bits() as u32 {
            return Err(PrefixError::SplitOverflow {
                prefix: *self,
                step,
            });
        }
        let new_bits = new_bits as u8;
        let parts = 1u64 << step;
        let mut out = Vec::with_capacity(parts as usize);
        match self.addr {
            IpAddr::V4(net) => {
                let base = u32::from(net);
                let shift = 32 - new_bits as u32;
                for i in 0..parts {
                    let child = base | ((i as u32) << shift);
                    out.push(Prefix {
                        addr: IpAddr::V4(Ipv4Addr::from(child)),
                        bits: new_bits,
                    });
                }
            }
            IpAddr::V6(net) => {
                let base = u128::from(net);
                let shift = 128 - new_bits as u32;
                for i in 0..parts {
                    let child = base | ((i as u128) << shift);
                    out.push(Prefix {
                        addr: IpAddr::V6(Ipv6Addr::from(child)),
                        bits: new_bits,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Picks a uniformly random address inside the prefix. IPv6 host bits
    /// are drawn from the OS entropy source when available so that
    /// independently seeded callers do not correlate; on failure the
    /// provided rng is used. A prefix with no host bits returns its own
    /// address.
    pub fn random_addr<R: RngCore>(&self, rng: &mut R) -> IpAddr {
        match self.addr {
            IpAddr::V4(net) => {
                let host_bits = 32 - self.bits as u32;
                let host = (rng.next_u64() & ((1u64 << host_bits) - 1)) as u32;
                IpAddr::V4(Ipv4Addr::from(u32::from(net) | host))
            }
            IpAddr::V6(net) => {
                let host_bits = 128 - self.bits as u32;
                if host_bits == 0 {
                    return IpAddr::V6(net);
                }
                let mut raw = [0u8; 16];
                if rand::rngs::OsRng.try_fill_bytes(&mut raw).is_err() {
                    rng.fill_bytes(&mut raw);
                }
                let mut host = u128::from_be_bytes(raw);
                if host_bits < 128 {
                    host &= (1u128 << host_bits) - 1;
                }
                IpAddr::V6(Ipv6Addr::from(u128::from(net) | host))
            }
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.bits)
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for Prefix {
    type Err = PrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Prefix::parse(s)
    }
}

impl serde::Serialize for Prefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn family_max_bits(addr: &IpAddr) -> u8 {
    if addr.is_ipv4() {
        32
    } else {
        128
    }
}

fn mask4(bits: u8) -> u32 {
    if bits == 0 {
        0
    } else {
        u32::MAX << (32 - bits as u32)
    }
}

fn mask6(bits: u8) -> u128 {
    if bits == 0 {
        0
    } else {
        u128::MAX << (128 - bits as u32)
    }
}

fn mask_addr(addr: IpAddr, bits: u8) -> IpAddr {
    match addr {
        IpAddr::V4(a) => IpAddr::V4(Ipv4Addr::from(u32::from(a) & mask4(bits))),
        IpAddr::V6(a) => IpAddr::V6(Ipv6Addr::from(u128::from(a) & mask6(bits))),
    }
}

/// Parses a list of CIDR strings, skipping entries that are empty after
/// trimming. All results are masked.
pub fn parse_cidrs(items: &[String]) -> Result<Vec<Prefix>, PrefixError> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let s = item.trim();
        if s.is_empty() {
            continue;
        }
        out.push(Prefix::parse(s)?);
    }
    Ok(out)
}

/// Parses CIDR file content: one prefix per line, blank lines ignored,
/// `#` starts a comment (full line or trailing).
pub fn parse_cidr_lines(text: &str) -> Result<Vec<Prefix>, PrefixError> {
    let mut out = Vec::new();
    for raw in text.lines() {
        let mut line = raw.trim();
        if let Some(idx) = line.find('#') {
            line = line[..idx].trim_end();
        }
        if line.is_empty() {
            continue;
        }
        out.push(Prefix::parse(line)?);
    }
    Ok(out)
}

pub fn read_cidrs_from_file(path: &Path) -> anyhow::Result<Vec<Prefix>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read cidr file {}", path.display()))?;
    Ok(parse_cidr_lines(&text)?)
}

/// Lexicographic prefix order used for deterministic tie-breaking:
/// IPv4 before IPv6, then network address, then prefix length.
pub fn cmp_prefixes(a: &Prefix, b: &Prefix) -> Ordering {
    a.cmp(b)
}
