// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Port range sets.
//!
//! Ranges are written as a comma-separated list of single ports or
//! inclusive `begin-end` spans, e.g. `"9000-9010,9100"`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error parsing a port range expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeParseError {
    /// A bound is not a number.
    #[error("invalid port '{0}' in range expression")]
    InvalidPort(String),
    /// `begin` is larger than `end`.
    #[error("invalid range {0}-{1}: begin is larger than end")]
    Reversed(u64, u64),
}

/// One inclusive span of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub begin: u64,
    /// Last port (inclusive).
    pub end: u64,
}

impl PortRange {
    /// Create a span. `begin` must not exceed `end`.
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    fn len(&self) -> u64 {
        self.end - self.begin + 1
    }
}

/// A normalised (sorted, non-overlapping) set of port ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ranges(Vec<PortRange>);

impl Ranges {
    /// Build a set from arbitrary spans.
    pub fn new(ranges: impl IntoIterator<Item = PortRange>) -> Self {
        Self(ranges.into_iter().collect()).squash()
    }

    /// A set holding one span.
    pub fn span(begin: u64, end: u64) -> Self {
        Self::new([PortRange::new(begin, end)])
    }

    /// A set holding one port.
    pub fn port(port: u64) -> Self {
        Self::span(port, port)
    }

    /// Sort and merge overlapping or adjacent spans.
    pub fn squash(mut self) -> Self {
        self.0.sort();
        let mut merged: Vec<PortRange> = Vec::with_capacity(self.0.len());
        for range in self.0 {
            match merged.last_mut() {
                Some(last) if range.begin <= last.end.saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        Self(merged)
    }

    /// Iterate over the spans.
    pub fn iter(&self) -> impl Iterator<Item = &PortRange> {
        self.0.iter()
    }

    /// Whether the set holds no ports.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of ports in the set.
    pub fn size(&self) -> u64 {
        self.0.iter().map(PortRange::len).sum()
    }

    /// Whether `port` is in the set.
    pub fn contains_port(&self, port: u64) -> bool {
        self.0.iter().any(|r| r.begin <= port && port <= r.end)
    }

    /// Whether every port of `other` is in the set.
    pub fn contains(&self, other: &Ranges) -> bool {
        other.0.iter().all(|wanted| {
            self.0
                .iter()
                .any(|have| have.begin <= wanted.begin && wanted.end <= have.end)
        })
    }

    /// Remove every port of `other` from the set.
    pub fn subtract(&mut self, other: &Ranges) {
        for cut in &other.0 {
            let mut remaining = Vec::with_capacity(self.0.len() + 1);
            for range in self.0.drain(..) {
                if cut.end < range.begin || range.end < cut.begin {
                    remaining.push(range);
                    continue;
                }
                if range.begin < cut.begin {
                    remaining.push(PortRange::new(range.begin, cut.begin - 1));
                }
                if cut.end < range.end {
                    remaining.push(PortRange::new(cut.end + 1, range.end));
                }
            }
            self.0 = remaining;
        }
    }

    /// Lowest port in the set that is not below `floor`.
    pub fn min_from(&self, floor: u64) -> Option<u64> {
        self.0
            .iter()
            .filter(|r| r.end >= floor)
            .map(|r| r.begin.max(floor))
            .min()
    }

    /// Take the lowest port at or above `floor` out of the set.
    pub fn take_from(&mut self, floor: u64) -> Option<u64> {
        let port = self.min_from(floor)?;
        self.subtract(&Ranges::port(port));
        Some(port)
    }
}

impl std::str::FromStr for Ranges {
    type Err = RangeParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u64>()
                .map_err(|_| RangeParseError::InvalidPort(p.trim().to_string()))
        };

        let mut ranges = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let range = match part.split_once('-') {
                Some((begin, end)) => {
                    let (begin, end) = (parse(begin)?, parse(end)?);
                    if begin > end {
                        return Err(RangeParseError::Reversed(begin, end));
                    }
                    PortRange::new(begin, end)
                }
                None => {
                    let port = parse(part)?;
                    PortRange::new(port, port)
                }
            };
            ranges.push(range);
        }
        Ok(Self::new(ranges))
    }
}

impl TryFrom<String> for Ranges {
    type Error = RangeParseError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ranges> for String {
    fn from(ranges: Ranges) -> Self {
        ranges.to_string()
    }
}

impl std::fmt::Display for Ranges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|r| {
                if r.begin == r.end {
                    r.begin.to_string()
                } else {
                    format!("{}-{}", r.begin, r.end)
                }
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}
