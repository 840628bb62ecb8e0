//! Token ring positions and the ordered primary-range set of a node

use crate::cluster::ClusterTopology;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{error, info};

/// A position on the hashed partition ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub i64);

impl Token {
    pub const MIN: Token = Token(i64::MIN);
    pub const MAX: Token = Token(i64::MAX);
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(Token)
            .map_err(|e| Error::Topology(format!("invalid token '{}': {}", s, e)))
    }
}

/// A contiguous slice `(begin, end]` of the ring.
///
/// When `begin >= end` the range wraps past the end of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenRange {
    pub begin: Token,
    pub end: Token,
}

impl TokenRange {
    pub fn new(begin: Token, end: Token) -> Self {
        Self { begin, end }
    }

    pub fn wraps(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains(&self, token: Token) -> bool {
        if self.wraps() {
            token > self.begin || token <= self.end
        } else {
            token > self.begin && token <= self.end
        }
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.begin, self.end)
    }
}

/// The primary ranges owned by the local node, in natural range order.
///
/// The ordering is load-bearing: a repair checkpoint stores the `end` token of
/// the last completed range and resumes by locating it in a freshly computed
/// set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRangeSet {
    ranges: Vec<TokenRange>,
}

impl TokenRangeSet {
    /// Sort and validate a set of ranges.
    pub fn from_ranges(mut ranges: Vec<TokenRange>) -> Result<Self> {
        ranges.sort();

        if ranges.len() > 1 {
            if let Some(r) = ranges.iter().find(|r| r.begin == r.end) {
                return Err(Error::Topology(format!(
                    "illegal local primary range {}: full-ring range among {} ranges",
                    r,
                    ranges.len()
                )));
            }
        }

        for pair in ranges.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a == b {
                return Err(Error::Topology(format!("duplicate primary range {}", a)));
            }
            if !a.wraps() && !b.wraps() && b.begin < a.end {
                return Err(Error::Topology(format!(
                    "overlapping primary ranges {} and {}",
                    a, b
                )));
            }
        }

        let wrapping: Vec<&TokenRange> = ranges.iter().filter(|r| r.wraps()).collect();
        if wrapping.len() > 1 {
            return Err(Error::Topology(format!(
                "{} wrapping primary ranges, at most one allowed",
                wrapping.len()
            )));
        }
        if let Some(w) = wrapping.first() {
            if ranges.len() > 1 {
                for r in ranges.iter().filter(|r| !r.wraps()) {
                    if r.begin < w.end || r.end > w.begin {
                        return Err(Error::Topology(format!(
                            "primary range {} overlaps wrapping range {}",
                            r, w
                        )));
                    }
                }
            }
        }

        Ok(Self { ranges })
    }

    /// Compute the local primary ranges of `keyspace` from the topology.
    pub async fn local(topology: &dyn ClusterTopology, keyspace: &str) -> Result<Self> {
        let ranges = topology.local_primary_ranges(keyspace).await?;
        Self::from_ranges(ranges).map_err(|e| {
            error!("Illegal local primary ranges for {}: {}. Stop the repair", keyspace, e);
            e
        })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TokenRange> {
        self.ranges.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenRange> {
        self.ranges.iter()
    }

    /// Index of the range whose end token equals `token`.
    pub fn position_of_end(&self, token: &Token) -> Option<usize> {
        self.ranges.iter().position(|r| r.end == *token)
    }

    /// Index of the first range still to repair after `last_token` completed.
    ///
    /// A token that is no longer a range boundary means the ring changed since
    /// the checkpoint was written; the run starts over from the first range.
    pub fn resume_index(&self, last_token: Option<&Token>) -> usize {
        let Some(token) = last_token else {
            return 0;
        };
        match self.position_of_end(token) {
            Some(pos) => {
                let next = (pos + 1).min(self.ranges.len());
                info!(
                    "Last token is {}, starting repair from range #{} of {}",
                    token,
                    next,
                    self.ranges.len()
                );
                next
            }
            None => {
                error!(
                    "Recorded last working range \"{}\" is not found, starting from beginning",
                    token
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(begin: i64, end: i64) -> TokenRange {
        TokenRange::new(Token(begin), Token(end))
    }

    #[test]
    fn test_ranges_are_sorted() {
        let set = TokenRangeSet::from_ranges(vec![r(200, 300), r(-50, 0), r(0, 100)]).unwrap();
        let ends: Vec<i64> = set.iter().map(|r| r.end.0).collect();
        assert_eq!(ends, vec![0, 100, 300]);
    }

    #[test]
    fn test_same_input_gives_same_order() {
        let a = TokenRangeSet::from_ranges(vec![r(10, 20), r(30, 40), r(-5, 5)]).unwrap();
        let b = TokenRangeSet::from_ranges(vec![r(30, 40), r(-5, 5), r(10, 20)]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_overlap_rejected() {
        let err = TokenRangeSet::from_ranges(vec![r(0, 100), r(50, 150)]).unwrap_err();
        assert!(matches!(err, Error::Topology(_)));
    }

    #[test]
    fn test_duplicate_rejected() {
        assert!(TokenRangeSet::from_ranges(vec![r(0, 100), r(0, 100)]).is_err());
    }

    #[test]
    fn test_wrapping_range_accepted_when_disjoint() {
        let set = TokenRangeSet::from_ranges(vec![r(900, -900), r(0, 100)]).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.get(1).unwrap().wraps());
    }

    #[test]
    fn test_wrapping_range_overlap_rejected() {
        assert!(TokenRangeSet::from_ranges(vec![r(900, -900), r(-1000, 100)]).is_err());
    }

    #[test]
    fn test_single_full_ring_range_allowed() {
        let set = TokenRangeSet::from_ranges(vec![r(42, 42)]).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.get(0).unwrap().contains(Token(7)));
    }

    #[test]
    fn test_resume_index() {
        let set = TokenRangeSet::from_ranges(vec![r(0, 100), r(100, 200), r(200, 300)]).unwrap();
        assert_eq!(set.resume_index(None), 0);
        assert_eq!(set.resume_index(Some(&Token(100))), 1);
        assert_eq!(set.resume_index(Some(&Token(200))), 2);
        assert_eq!(set.resume_index(Some(&Token(300))), 3);
        // Not a boundary any more: start over
        assert_eq!(set.resume_index(Some(&Token(150))), 0);
    }

    #[test]
    fn test_token_parse_and_display() {
        let t: Token = "-9223372036854775808".parse().unwrap();
        assert_eq!(t, Token::MIN);
        assert_eq!(Token(17).to_string(), "17");
        assert!("abc".parse::<Token>().is_err());
    }

    #[test]
    fn test_range_contains() {
        assert!(r(0, 100).contains(Token(100)));
        assert!(!r(0, 100).contains(Token(0)));
        assert!(r(900, -900).contains(Token(i64::MAX)));
        assert!(r(900, -900).contains(Token(-900)));
        assert!(!r(900, -900).contains(Token(0)));
    }
}
