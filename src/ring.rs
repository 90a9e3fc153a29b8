use std::fmt;

/// A token type wide enough for both Murmur3 (`i64`) and Random (`0..2^127`) partitioners.
pub type Token = i128;

/// A half-open range `(start, end]` on the token ring.
///
/// When `start >= end` the range wraps around the end of the ring. A range with
/// `start == end` covers the whole ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RingRange {
  pub start: Token,
  pub end: Token,
}

impl RingRange {
  pub fn new(start: Token, end: Token) -> Self {
    Self { start, end }
  }

  /// Whether the range crosses the end of the ring.
  pub fn is_wrapping(&self) -> bool {
    self.start >= self.end
  }

  /// Number of tokens covered, or `None` for a full-ring range (its span depends on the partitioner).
  pub fn span(&self) -> Option<u128> {
    if self.start == self.end {
      return None;
    }
    // Distance modulo 2^128 covers both the plain and the wrapping case.
    Some((self.end as u128).wrapping_sub(self.start as u128))
  }

  /// Returns true if `token` lies in `(start, end]`.
  pub fn contains(&self, token: Token) -> bool {
    if self.start == self.end {
      return true;
    }
    if self.is_wrapping() {
      token > self.start || token <= self.end
    } else {
      token > self.start && token <= self.end
    }
  }

  /// Returns true if every token of `other` is also in `self`.
  pub fn encloses(&self, other: &RingRange) -> bool {
    if self.start == self.end {
      return true;
    }
    if other.start == other.end {
      return false;
    }
    match (self.is_wrapping(), other.is_wrapping()) {
      (false, false) => self.start <= other.start && other.end <= self.end,
      (true, false) => other.start >= self.start || other.end <= self.end,
      (true, true) => other.start >= self.start && other.end <= self.end,
      (false, true) => false,
    }
  }
}

impl fmt::Display for RingRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({},{}]", self.start, self.end)
  }
}

/// Replica placement for one keyspace: each ring range mapped to the endpoints owning it.
///
/// Node agents build one of these from the cluster's range-to-endpoint map and use
/// [`TokenRing::endpoints_for`] to answer coordinator lookups.
#[derive(Debug, Clone, Default)]
pub struct TokenRing {
  ranges: Vec<(RingRange, Vec<String>)>,
}

impl TokenRing {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_range(mut self, range: RingRange, endpoints: Vec<String>) -> Self {
    self.ranges.push((range, endpoints));
    self
  }

  pub fn insert(&mut self, range: RingRange, endpoints: Vec<String>) {
    self.ranges.push((range, endpoints));
  }

  /// Endpoints of the first ring range enclosing `segment`, or an empty list if none does.
  pub fn endpoints_for(&self, segment: &RingRange) -> Vec<String> {
    self
      .ranges
      .iter()
      .find(|(range, _)| range.encloses(segment))
      .map(|(_, endpoints)| endpoints.clone())
      .unwrap_or_default()
  }

  pub fn len(&self) -> usize {
    self.ranges.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ranges.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_range_encloses_sub_range() {
    let outer = RingRange::new(0, 100);
    assert!(outer.encloses(&RingRange::new(0, 50)));
    assert!(outer.encloses(&RingRange::new(10, 100)));
    assert!(!outer.encloses(&RingRange::new(-10, 50)));
    assert!(!outer.encloses(&RingRange::new(50, 150)));
  }

  #[test]
  fn wrapping_range_encloses_both_sides() {
    let wrapping = RingRange::new(100, -100);
    assert!(wrapping.is_wrapping());
    assert!(wrapping.encloses(&RingRange::new(150, 200)));
    assert!(wrapping.encloses(&RingRange::new(-300, -200)));
    assert!(wrapping.encloses(&RingRange::new(200, -200)));
    assert!(!wrapping.encloses(&RingRange::new(0, 50)));
    assert!(!RingRange::new(0, 50).encloses(&wrapping));
  }

  #[test]
  fn contains_is_start_exclusive() {
    let range = RingRange::new(0, 10);
    assert!(!range.contains(0));
    assert!(range.contains(1));
    assert!(range.contains(10));
    assert!(!range.contains(11));
  }

  #[test]
  fn span_handles_wraparound() {
    assert_eq!(RingRange::new(0, 10).span(), Some(10));
    assert_eq!(RingRange::new(5, 5).span(), None);
    assert_eq!(RingRange::new(Token::MAX - 1, Token::MIN + 1).span(), Some(3));
  }

  #[test]
  fn token_ring_lookup() {
    let ring = TokenRing::new()
      .with_range(RingRange::new(0, 100), vec!["10.0.0.1".into(), "10.0.0.2".into()])
      .with_range(RingRange::new(100, 0), vec!["10.0.0.3".into()]);

    assert_eq!(ring.endpoints_for(&RingRange::new(10, 20)), vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(ring.endpoints_for(&RingRange::new(150, 160)), vec!["10.0.0.3"]);
    // Straddles two ownership ranges: unmappable.
    assert!(ring.endpoints_for(&RingRange::new(50, 150)).is_empty());
  }
}
