//! Leaf segment names.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of one append segment of a leaf: `<instance>.<seq>`.
///
/// Segments order numerically by instance, then sequence; the greatest
/// segment in a leaf's directory is the leaf's current segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Segment {
    pub instance: u64,
    pub seq: u64,
}

impl Segment {
    pub fn new(instance: u64, seq: u64) -> Self {
        Segment { instance, seq }
    }
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.instance, self.seq).cmp(&(other.instance, other.seq))
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.instance, self.seq)
    }
}

impl FromStr for Segment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (instance, seq) = s
            .split_once('.')
            .ok_or_else(|| format!("segment name {s:?} has no '.'"))?;
        let instance = instance
            .parse()
            .map_err(|_| format!("bad instance in segment name {s:?}"))?;
        let seq = seq
            .parse()
            .map_err(|_| format!("bad sequence in segment name {s:?}"))?;
        Ok(Segment { instance, seq })
    }
}

impl From<Segment> for String {
    fn from(segment: Segment) -> Self {
        segment.to_string()
    }
}

impl TryFrom<String> for Segment {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_ordering() {
        let mut names: Vec<Segment> = ["1.10", "0.3", "1.2", "10.0", "2.0"]
            .iter()
            .map(|name| name.parse().unwrap())
            .collect();
        names.sort();
        let sorted: Vec<String> = names.iter().map(Segment::to_string).collect();
        assert_eq!(sorted, vec!["0.3", "1.2", "1.10", "2.0", "10.0"]);
    }

    #[test]
    fn test_rejects_malformed_names() {
        assert!("12".parse::<Segment>().is_err());
        assert!("a.1".parse::<Segment>().is_err());
        assert!("1.b".parse::<Segment>().is_err());
    }

    #[test]
    fn test_serializes_as_string() {
        let json = serde_json::to_string(&Segment::new(2, 7)).unwrap();
        assert_eq!(json, "\"2.7\"");
        let back: Segment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Segment::new(2, 7));
    }
}
