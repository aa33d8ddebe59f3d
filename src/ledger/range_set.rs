use crate::core::{Result, RmError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

lazy_static::lazy_static! {
    static ref RANGE_PATTERN: Regex =
        Regex::new(r"\[\s*(\d+)\s*,\s*(\d+)\s*\]").expect("static range pattern");
}

/// Inclusive `[lower, upper]` span of message numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AckRange {
    pub lower: u64,
    pub upper: u64,
}

impl AckRange {
    pub fn new(lower: u64, upper: u64) -> Result<Self> {
        if lower == 0 {
            return Err(RmError::Serialization(
                "message numbers start at 1".to_string(),
            ));
        }
        if lower > upper {
            return Err(RmError::Serialization(format!(
                "range lower bound {} exceeds upper bound {}",
                lower, upper
            )));
        }
        Ok(Self { lower, upper })
    }

    pub fn single(number: u64) -> Result<Self> {
        Self::new(number, number)
    }

    pub fn contains(&self, number: u64) -> bool {
        self.lower <= number && number <= self.upper
    }

    pub fn numbers(&self) -> RangeInclusive<u64> {
        self.lower..=self.upper
    }

    pub fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }
}

impl fmt::Display for AckRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.lower, self.upper)
    }
}

/// Ordered set of disjoint, merged ranges.
///
/// Adjacent ranges are coalesced, so `[1,3]` plus `[4,4]` is stored as `[1,4]`.
/// Serialized in the compact form `"[1,3][5,7]"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RangeSet {
    ranges: Vec<AckRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = AckRange>) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.insert(range);
        }
        set
    }

    pub fn ranges(&self) -> &[AckRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn highest(&self) -> Option<u64> {
        self.ranges.last().map(|range| range.upper)
    }

    pub fn covered_count(&self) -> u64 {
        self.ranges.iter().map(AckRange::len).sum()
    }

    pub fn contains(&self, number: u64) -> bool {
        self.position_of(number).is_some()
    }

    /// True if every number of `range` is already in the set.
    pub fn covers(&self, range: &AckRange) -> bool {
        match self.position_of(range.lower) {
            Some(index) => self.ranges[index].upper >= range.upper,
            None => false,
        }
    }

    /// True once `[1, last]` has been fully covered.
    pub fn is_complete_up_to(&self, last: u64) -> bool {
        match self.ranges.first() {
            Some(first) => first.lower == 1 && first.upper >= last,
            None => false,
        }
    }

    /// Merges `range` into the set and returns the sub-ranges that were not covered before.
    pub fn insert(&mut self, range: AckRange) -> Vec<AckRange> {
        let fresh = self.uncovered_parts(&range);
        if !fresh.is_empty() {
            self.ranges.push(range);
            self.normalize();
        }
        fresh
    }

    pub fn insert_number(&mut self, number: u64) -> bool {
        match AckRange::single(number) {
            Ok(range) => !self.insert(range).is_empty(),
            Err(_) => false,
        }
    }

    /// Numbers in `[1, upper]` that are missing from the set.
    pub fn gaps_up_to(&self, upper: u64) -> Vec<AckRange> {
        match AckRange::new(1, upper) {
            Ok(range) => self.uncovered_parts(&range),
            Err(_) => Vec::new(),
        }
    }

    fn uncovered_parts(&self, range: &AckRange) -> Vec<AckRange> {
        let mut fresh = Vec::new();
        let mut cursor = Some(range.lower);

        for existing in &self.ranges {
            let Some(start) = cursor else { break };
            if existing.upper < start {
                continue;
            }
            if existing.lower > range.upper {
                break;
            }
            if existing.lower > start {
                fresh.push(AckRange {
                    lower: start,
                    upper: existing.lower - 1,
                });
            }
            cursor = if existing.upper >= range.upper {
                None
            } else {
                Some(existing.upper + 1)
            };
        }

        if let Some(start) = cursor {
            fresh.push(AckRange {
                lower: start,
                upper: range.upper,
            });
        }
        fresh
    }

    fn position_of(&self, number: u64) -> Option<usize> {
        let index = self.ranges.partition_point(|range| range.upper < number);
        self.ranges
            .get(index)
            .filter(|range| range.contains(number))
            .map(|_| index)
    }

    fn normalize(&mut self) {
        self.ranges.sort();
        let mut merged: Vec<AckRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if range.lower <= last.upper.saturating_add(1) => {
                    last.upper = last.upper.max(range.upper);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for range in &self.ranges {
            write!(f, "{}", range)?;
        }
        Ok(())
    }
}

impl FromStr for RangeSet {
    type Err = RmError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let mut consumed = 0usize;
        let mut set = RangeSet::new();

        for captures in RANGE_PATTERN.captures_iter(trimmed) {
            let whole = captures.get(0).map(|m| (m.start(), m.end()));
            let Some((start, end)) = whole else { continue };
            if !trimmed[consumed..start].trim().is_empty() {
                return Err(RmError::Serialization(format!(
                    "unexpected text in range string '{}'",
                    s
                )));
            }
            consumed = end;

            let lower = parse_bound(captures.get(1).map(|m| m.as_str()), s)?;
            let upper = parse_bound(captures.get(2).map(|m| m.as_str()), s)?;
            set.insert(AckRange::new(lower, upper)?);
        }

        if !trimmed[consumed..].trim().is_empty() {
            return Err(RmError::Serialization(format!(
                "unexpected text in range string '{}'",
                s
            )));
        }
        Ok(set)
    }
}

fn parse_bound(raw: Option<&str>, source: &str) -> Result<u64> {
    raw.and_then(|text| text.parse::<u64>().ok()).ok_or_else(|| {
        RmError::Serialization(format!("invalid range bound in '{}'", source))
    })
}

impl From<RangeSet> for String {
    fn from(set: RangeSet) -> Self {
        set.to_string()
    }
}

impl TryFrom<String> for RangeSet {
    type Error = RmError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(lower: u64, upper: u64) -> AckRange {
        AckRange::new(lower, upper).unwrap()
    }

    #[test]
    fn merges_gapped_ranges_once_gap_is_filled() {
        let mut set = RangeSet::new();
        set.insert(range(1, 3));
        set.insert(range(5, 7));
        assert_eq!(set.to_string(), "[1,3][5,7]");

        let fresh = set.insert(range(4, 4));
        assert_eq!(fresh, vec![range(4, 4)]);
        assert_eq!(set.ranges(), &[range(1, 7)]);
    }

    #[test]
    fn insert_reports_only_new_numbers() {
        let mut set = RangeSet::from_ranges([range(2, 4), range(8, 9)]);
        let fresh = set.insert(range(1, 10));
        assert_eq!(fresh, vec![range(1, 1), range(5, 7), range(10, 10)]);
        assert_eq!(set.to_string(), "[1,10]");
    }

    #[test]
    fn adding_a_number_twice_is_idempotent() {
        let mut set = RangeSet::new();
        assert!(set.insert_number(5));
        let snapshot = set.clone();
        assert!(!set.insert_number(5));
        assert_eq!(set, snapshot);
    }

    #[test]
    fn covers_and_completion() {
        let set = RangeSet::from_ranges([range(1, 4), range(6, 6)]);
        assert!(set.covers(&range(2, 3)));
        assert!(!set.covers(&range(3, 6)));
        assert!(set.is_complete_up_to(4));
        assert!(!set.is_complete_up_to(6));
        assert_eq!(set.gaps_up_to(7), vec![range(5, 5), range(7, 7)]);
        assert_eq!(set.covered_count(), 5);
        assert_eq!(set.highest(), Some(6));
    }

    #[test]
    fn parses_compact_form() {
        let set: RangeSet = "[1,3][5,7]".parse().unwrap();
        assert_eq!(set.ranges(), &[range(1, 3), range(5, 7)]);

        let merged: RangeSet = " [5, 7] [1,4] ".parse().unwrap();
        assert_eq!(merged.to_string(), "[1,7]");

        assert!("".parse::<RangeSet>().unwrap().is_empty());
        assert!("[1,3]x[5,6]".parse::<RangeSet>().is_err());
        assert!("[4,2]".parse::<RangeSet>().is_err());
        assert!("[0,2]".parse::<RangeSet>().is_err());
    }

    #[test]
    fn serde_uses_compact_string() {
        let set = RangeSet::from_ranges([range(1, 2), range(9, 9)]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "\"[1,2][9,9]\"");
        let back: RangeSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
