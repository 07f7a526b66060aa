//! Provides functions to parse IPv4 range files into a canonical set of ranges.
//!
//! A range file holds one directive per line:
//!
//! ```text
//! # comment
//! 1.2.3.4                    single address
//! 1.2.3.0/24                 CIDR block
//! 1.2.3.0-1.2.3.255          dash range
//! 1.2.3.10-250               dash range, last octet only on the right
//! 1.2.3.0/24-1.2.4.0/24      network of the left block to broadcast of the right
//! ```
//!
//! Lines that fail to parse are skipped with a warning.
mod cursor;

pub use cursor::{addresses, AddressCursor};

use std::cmp::Reverse;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use cidr_utils::cidr::Ipv4Inet;
use log::warn;
use thiserror::Error;
use tokio::fs;

/// An inclusive block of IPv4 addresses, stored as their big-endian `u32` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    start: u32,
    end: u32,
}

/// Why a single range directive was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeParseError {
    /// One side of the directive is not a dotted-quad IPv4 address.
    #[error("invalid IPv4 address '{0}'")]
    Address(String),
    /// The CIDR block is malformed, e.g. a prefix length above 32.
    #[error("invalid CIDR block '{input}': {reason}")]
    Cidr {
        /// The rejected block.
        input: String,
        /// What the CIDR parser objected to.
        reason: String,
    },
    /// The directive has more than one `-`.
    #[error("expected exactly one '-' in '{0}'")]
    Fields(String),
    /// The range ends before it starts.
    #[error("range starts at {start} but ends at {end}")]
    Reversed {
        /// First address of the rejected range.
        start: Ipv4Addr,
        /// Last address of the rejected range.
        end: Ipv4Addr,
    },
}

impl AddressRange {
    /// Builds a range, rejecting `start > end`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, RangeParseError> {
        if start > end {
            return Err(RangeParseError::Reversed { start, end });
        }
        Ok(Self {
            start: u32::from(start),
            end: u32::from(end),
        })
    }

    /// A range covering exactly one address.
    pub fn single(addr: Ipv4Addr) -> Self {
        let value = u32::from(addr);
        Self {
            start: value,
            end: value,
        }
    }

    /// First address of the range.
    pub fn start(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    /// Last address of the range.
    pub fn end(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.end)
    }

    /// `end - start`, the key ranges are ordered by during canonicalization.
    pub fn span(&self) -> u32 {
        self.end - self.start
    }

    /// Number of addresses covered. A full `0.0.0.0/0` holds 2^32, hence `u64`.
    pub fn size(&self) -> u64 {
        u64::from(self.span()) + 1
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Self) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    /// Lazily walks the range in ascending order.
    pub fn iter(&self) -> AddressCursor {
        AddressCursor::new(*self)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start(), self.end())
    }
}

impl IntoIterator for &AddressRange {
    type Item = Ipv4Addr;
    type IntoIter = AddressCursor;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromStr for AddressRange {
    type Err = RangeParseError;

    /// Parses a single directive. Comments and blank lines are the caller's concern.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();

        match (line.contains('-'), line.contains('/')) {
            // 1.9.22.0/24-1.9.23.0/24 or 1.9.22.0-1.9.23.0/24
            (true, true) => {
                let (left, right) = split_dash(line)?;
                let start = match left.split_once('/') {
                    Some((addr, _)) => parse_ipv4(addr)?,
                    None => parse_ipv4(left)?,
                };
                let (_, end) = cidr_bounds(right)?;
                Self::new(start, end)
            }
            (false, true) => {
                let (start, end) = cidr_bounds(line)?;
                Self::new(start, end)
            }
            (true, false) => {
                let (left, right) = split_dash(line)?;
                let start = parse_ipv4(left)?;
                let end = if right.contains('.') {
                    parse_ipv4(right)?
                } else {
                    let octet = right
                        .parse::<u8>()
                        .map_err(|_| RangeParseError::Address(right.to_owned()))?;
                    let [a, b, c, _] = start.octets();
                    Ipv4Addr::new(a, b, c, octet)
                };
                Self::new(start, end)
            }
            (false, false) => parse_ipv4(line).map(Self::single),
        }
    }
}

fn split_dash(line: &str) -> Result<(&str, &str), RangeParseError> {
    let mut parts = line.split('-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(left), Some(right), None) => Ok((left.trim(), right.trim())),
        _ => Err(RangeParseError::Fields(line.to_owned())),
    }
}

fn parse_ipv4(input: &str) -> Result<Ipv4Addr, RangeParseError> {
    let input = input.trim();
    input
        .parse::<Ipv4Addr>()
        .map_err(|_| RangeParseError::Address(input.to_owned()))
}

/// Network and broadcast address of a CIDR block. Host bits in the address are
/// tolerated, as in `1.2.3.4/24`.
fn cidr_bounds(cidr: &str) -> Result<(Ipv4Addr, Ipv4Addr), RangeParseError> {
    let cidr = cidr.trim();
    if !cidr.contains('/') {
        return Err(RangeParseError::Cidr {
            input: cidr.to_owned(),
            reason: "missing '/'".to_owned(),
        });
    }
    let network = Ipv4Inet::from_str(cidr)
        .map_err(|e| RangeParseError::Cidr {
            input: cidr.to_owned(),
            reason: e.to_string(),
        })?
        .network();

    Ok((network.first_address(), network.last_address()))
}

/// Parses every directive in `content`, warning about and skipping bad lines.
///
/// `source` only names the input in warnings.
///
/// ```rust
/// # use gscan::address::parse_ranges;
/// let ranges = parse_ranges("# office\n10.0.0.0/30\nnot-an-ip\n", "inline");
/// assert_eq!(ranges.len(), 1);
/// assert_eq!(ranges[0].size(), 4);
/// ```
pub fn parse_ranges(content: &str, source: &str) -> Vec<AddressRange> {
    content
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            match line.parse::<AddressRange>() {
                Ok(range) => Some(range),
                Err(e) => {
                    warn!("Invalid line [{}] {line:?} in IP range file {source}: {e}", index + 1);
                    None
                }
            }
        })
        .collect()
}

/// Drops every range that another range fully contains.
///
/// Ranges are ordered by size, largest first, and a range is kept only if no range
/// kept before it covers it. Equal ranges keep their first occurrence. Partially
/// overlapping ranges are both kept.
///
/// ```rust
/// # use gscan::address::{canonicalize, parse_ranges};
/// let raw = parse_ranges("1.9.22.0-1.9.22.255\n1.9.0.0/16\n", "inline");
/// let kept = canonicalize(raw);
/// assert_eq!(kept.len(), 1);
/// assert_eq!(kept[0].to_string(), "1.9.0.0-1.9.255.255");
/// ```
pub fn canonicalize(mut ranges: Vec<AddressRange>) -> Vec<AddressRange> {
    // stable, so ties keep input order
    ranges.sort_by_key(|range| Reverse(range.span()));

    let mut kept: Vec<AddressRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if !kept.iter().any(|larger| larger.contains(&range)) {
            kept.push(range);
        }
    }
    kept
}

/// Reads and canonicalizes a range file.
///
/// A missing or unreadable file is an error; malformed lines are not.
pub async fn read_range_file(path: &Path) -> anyhow::Result<Vec<AddressRange>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read IP range file {}", path.display()))?;
    let ranges = parse_ranges(&content, &path.display().to_string());
    Ok(canonicalize(ranges))
}
