//! Index Bounds — 인덱스 컬럼 위의 구간 대수
//!
//! A [`Point`] is a value (or ±∞) with an inclusive flag; a [`Segment`] is an
//! ordered pair of points; a [`NumberLine`] is a sorted, coalesced union of
//! segments over one column's domain.
//!
//! [`compile_bounds`] turns a predicate tree into the `NumberLine` a scan on
//! one index column may be restricted to. Parts of the tree that do not
//! constrain the column widen the result, never narrow it:
//!
//! | node | result |
//! |------|--------|
//! | comparison on the column | exact segment(s) |
//! | anything else            | unknown (full line) |
//! | AND                      | intersection of known parts |
//! | OR                       | union, unknown if any part is unknown |
//! | NOT                      | complement of an exact part, else unknown |

use super::{Comparator, Operand, Params, Predicate};
use crate::schema::Value;
use std::cmp::Ordering;
use std::fmt;

// ════════════════════════════════════════════
// Points
// ════════════════════════════════════════════

/// Position on a column's domain.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    NegInfinity,
    Value(Value),
    PosInfinity,
}

impl Endpoint {
    fn rank(&self) -> u8 {
        match self {
            Endpoint::NegInfinity => 0,
            Endpoint::Value(_) => 1,
            Endpoint::PosInfinity => 2,
        }
    }

    fn cmp(&self, other: &Endpoint) -> Ordering {
        match (self, other) {
            (Endpoint::Value(a), Endpoint::Value(b)) => total_cmp(a, b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    pub fn is_infinite(&self) -> bool {
        !matches!(self, Endpoint::Value(_))
    }
}

/// Total order over values: compatible kinds by value, otherwise by kind.
pub(crate) fn total_cmp(a: &Value, b: &Value) -> Ordering {
    a.compare(b)
        .unwrap_or_else(|| kind_rank(a).cmp(&kind_rank(b)))
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) | Value::Int(_) | Value::UInt(_) | Value::Float(_) => 1,
        Value::Timestamp(_) => 2,
        Value::Text(_) | Value::Bytes(_) => 3,
    }
}

/// A bound: a value or ±∞, with an inclusive flag.
///
/// Infinite points are always exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub value: Endpoint,
    pub inclusive: bool,
}

impl Point {
    pub fn neg_infinity() -> Self {
        Self {
            value: Endpoint::NegInfinity,
            inclusive: false,
        }
    }

    pub fn pos_infinity() -> Self {
        Self {
            value: Endpoint::PosInfinity,
            inclusive: false,
        }
    }

    pub fn inclusive(value: Value) -> Self {
        Self {
            value: Endpoint::Value(value),
            inclusive: true,
        }
    }

    pub fn exclusive(value: Value) -> Self {
        Self {
            value: Endpoint::Value(value),
            inclusive: false,
        }
    }

    /// Order by value, ties broken by inclusiveness.
    ///
    /// Two inclusive points on the same value are equal; a tie involving an
    /// exclusive point is never equal and yields `None`.
    pub fn compare(&self, other: &Point) -> Option<Ordering> {
        match self.value.cmp(&other.value) {
            Ordering::Equal if self.value.is_infinite() => Some(Ordering::Equal),
            Ordering::Equal if self.inclusive && other.inclusive => Some(Ordering::Equal),
            Ordering::Equal => None,
            ord => Some(ord),
        }
    }

    /// Order as lower bounds: on a tie the exclusive point starts later.
    fn cmp_as_low(&self, other: &Point) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| other.inclusive.cmp(&self.inclusive))
    }

    /// Order as upper bounds: on a tie the exclusive point ends earlier.
    fn cmp_as_high(&self, other: &Point) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| self.inclusive.cmp(&other.inclusive))
    }

    /// The same position seen from the other side of a gap.
    fn flipped(&self) -> Point {
        if self.value.is_infinite() {
            return self.clone();
        }
        Point {
            value: self.value.clone(),
            inclusive: !self.inclusive,
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Endpoint::NegInfinity => f.write_str("-inf"),
            Endpoint::PosInfinity => f.write_str("+inf"),
            Endpoint::Value(v) => write!(f, "{v}"),
        }
    }
}

// ════════════════════════════════════════════
// Segments
// ════════════════════════════════════════════

/// A contiguous range between two points, `low` never above `high`.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub low: Point,
    pub high: Point,
}

impl Segment {
    /// Build from two points in either order.
    pub fn new(a: Point, b: Point) -> Self {
        if a.value.cmp(&b.value) == Ordering::Greater {
            Self { low: b, high: a }
        } else {
            Self { low: a, high: b }
        }
    }

    pub fn full() -> Self {
        Self {
            low: Point::neg_infinity(),
            high: Point::pos_infinity(),
        }
    }

    /// `[value, value]`
    pub fn point(value: Value) -> Self {
        Self {
            low: Point::inclusive(value.clone()),
            high: Point::inclusive(value),
        }
    }

    /// True when no value lies inside.
    pub fn is_empty(&self) -> bool {
        match self.low.value.cmp(&self.high.value) {
            Ordering::Greater => true,
            Ordering::Equal => {
                !(self.low.inclusive && self.high.inclusive) || self.low.value.is_infinite()
            }
            Ordering::Less => false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.low.value == Endpoint::NegInfinity && self.high.value == Endpoint::PosInfinity
    }

    /// True when `value` lies between low and high, honoring inclusiveness.
    pub fn contains(&self, value: &Value) -> bool {
        let at = Endpoint::Value(value.clone());
        let above_low = match self.low.value.cmp(&at) {
            Ordering::Less => true,
            Ordering::Equal => self.low.inclusive,
            Ordering::Greater => false,
        };
        let below_high = match at.cmp(&self.high.value) {
            Ordering::Less => true,
            Ordering::Equal => self.high.inclusive,
            Ordering::Greater => false,
        };
        above_low && below_high
    }

    /// Tightest bound covered by both, `None` if they do not overlap.
    pub fn intersect(&self, other: &Segment) -> Option<Segment> {
        let low = if self.low.cmp_as_low(&other.low) == Ordering::Less {
            other.low.clone()
        } else {
            self.low.clone()
        };
        let high = if self.high.cmp_as_high(&other.high) == Ordering::Greater {
            other.high.clone()
        } else {
            self.high.clone()
        };
        let segment = Segment { low, high };
        (!segment.is_empty()).then_some(segment)
    }

    /// Loosest bound covering both.
    pub fn span(&self, other: &Segment) -> Segment {
        let low = if self.low.cmp_as_low(&other.low) == Ordering::Greater {
            other.low.clone()
        } else {
            self.low.clone()
        };
        let high = if self.high.cmp_as_high(&other.high) == Ordering::Less {
            other.high.clone()
        } else {
            self.high.clone()
        };
        Segment { low, high }
    }

    /// True when the union of the two is one contiguous segment.
    fn touches(&self, next: &Segment) -> bool {
        match self.high.value.cmp(&next.low.value) {
            Ordering::Greater => true,
            Ordering::Equal => self.high.inclusive || next.low.inclusive,
            Ordering::Less => false,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.low.inclusive { '[' } else { '(' };
        let close = if self.high.inclusive { ']' } else { ')' };
        write!(f, "{open}{}, {}{close}", self.low, self.high)
    }
}

// ════════════════════════════════════════════
// Number lines
// ════════════════════════════════════════════

/// Sorted, non-overlapping union of segments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NumberLine {
    segments: Vec<Segment>,
}

impl NumberLine {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self {
            segments: vec![Segment::full()],
        }
    }

    pub fn from_segment(segment: Segment) -> Self {
        Self::from_segments(vec![segment])
    }

    /// Sort and coalesce arbitrary segments.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        let mut segments: Vec<Segment> = segments.into_iter().filter(|s| !s.is_empty()).collect();
        segments.sort_by(|a, b| a.low.cmp_as_low(&b.low));

        let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
        for segment in segments {
            match merged.last_mut() {
                Some(last) if last.touches(&segment) => *last = last.span(&segment),
                _ => merged.push(segment),
            }
        }
        Self { segments: merged }
    }

    /// Line for `column <op> value`.
    pub fn for_comparison(op: Comparator, value: Value) -> Self {
        let segment = match op {
            Comparator::Eq => Segment::point(value),
            Comparator::Lt => Segment::new(Point::neg_infinity(), Point::exclusive(value)),
            Comparator::Le => Segment::new(Point::neg_infinity(), Point::inclusive(value)),
            Comparator::Gt => Segment::new(Point::exclusive(value), Point::pos_infinity()),
            Comparator::Ge => Segment::new(Point::inclusive(value), Point::pos_infinity()),
            Comparator::Ne => return Self::from_segment(Segment::point(value)).complement(),
        };
        Self::from_segment(segment)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.segments.len() == 1 && self.segments[0].is_full()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.segments.iter().any(|s| s.contains(value))
    }

    pub fn union(&self, other: &NumberLine) -> NumberLine {
        let mut all = self.segments.clone();
        all.extend(other.segments.iter().cloned());
        Self::from_segments(all)
    }

    pub fn intersect(&self, other: &NumberLine) -> NumberLine {
        let mut out = Vec::new();
        for a in &self.segments {
            for b in &other.segments {
                if let Some(s) = a.intersect(b) {
                    out.push(s);
                }
            }
        }
        Self::from_segments(out)
    }

    /// Every value not on this line.
    ///
    /// Each transition point flips inclusiveness; an unbounded side gains or
    /// loses its infinite endpoint.
    pub fn complement(&self) -> NumberLine {
        let mut out = Vec::with_capacity(self.segments.len() + 1);
        let mut from = Point::neg_infinity();
        let mut open_left = true;

        for segment in &self.segments {
            if segment.low.value != Endpoint::NegInfinity {
                let low = if open_left { from.clone() } else { from.flipped() };
                out.push(Segment {
                    low,
                    high: segment.low.flipped(),
                });
            }
            from = segment.high.clone();
            open_left = false;
        }
        if open_left {
            return Self::full();
        }
        if from.value != Endpoint::PosInfinity {
            out.push(Segment {
                low: from.flipped(),
                high: Point::pos_infinity(),
            });
        }
        Self::from_segments(out)
    }

    /// Smallest single segment covering the whole line.
    pub fn hull(&self) -> Option<Segment> {
        let first = self.segments.first()?;
        let last = self.segments.last()?;
        Some(Segment {
            low: first.low.clone(),
            high: last.high.clone(),
        })
    }
}

impl fmt::Display for NumberLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("{}");
        }
        let parts: Vec<String> = self.segments.iter().map(|s| s.to_string()).collect();
        f.write_str(&parts.join(" U "))
    }
}

// ════════════════════════════════════════════
// Compiler
// ════════════════════════════════════════════

/// Bound of one predicate subtree on one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    /// The subtree does not constrain the column
    Unknown,
    /// Matching rows lie exactly on this line
    Exact(NumberLine),
    /// Matching rows lie on this line, which may hold non-matching values
    Superset(NumberLine),
}

impl Bound {
    /// Line a scan must cover.
    pub fn into_line(self) -> NumberLine {
        match self {
            Bound::Unknown => NumberLine::full(),
            Bound::Exact(line) | Bound::Superset(line) => line,
        }
    }
}

/// Compile `predicate` into the range of `column` a scan has to read.
///
/// A parameter operand with no value in `params` leaves its comparison
/// unknown.
pub fn compile_bounds(predicate: &Predicate, column: &str, params: &Params) -> NumberLine {
    bound_of(predicate, column, params).into_line()
}

pub(crate) fn bound_of(predicate: &Predicate, column: &str, params: &Params) -> Bound {
    match predicate {
        Predicate::Compare {
            column: c,
            op,
            operand,
        } if c == column => match resolve(operand, params) {
            Some(value) => Bound::Exact(NumberLine::for_comparison(*op, value)),
            None => Bound::Unknown,
        },
        Predicate::Between {
            column: c,
            low,
            high,
        } if c == column => match (resolve(low, params), resolve(high, params)) {
            // a reversed range matches nothing; its ends are not swapped
            (Some(low), Some(high)) => Bound::Exact(NumberLine::from_segment(Segment {
                low: Point::inclusive(low),
                high: Point::inclusive(high),
            })),
            _ => Bound::Unknown,
        },
        Predicate::And(children) => {
            let mut line: Option<NumberLine> = None;
            let mut exact = true;
            for child in children {
                match bound_of(child, column, params) {
                    Bound::Unknown => exact = false,
                    Bound::Exact(l) => {
                        line = Some(line.map_or(l.clone(), |acc| acc.intersect(&l)));
                    }
                    Bound::Superset(l) => {
                        exact = false;
                        line = Some(line.map_or(l.clone(), |acc| acc.intersect(&l)));
                    }
                }
            }
            match line {
                None => Bound::Unknown,
                Some(line) if exact => Bound::Exact(line),
                Some(line) => Bound::Superset(line),
            }
        }
        Predicate::Or(children) => {
            let mut line = NumberLine::empty();
            let mut exact = true;
            for child in children {
                match bound_of(child, column, params) {
                    Bound::Unknown => return Bound::Unknown,
                    Bound::Exact(l) => line = line.union(&l),
                    Bound::Superset(l) => {
                        exact = false;
                        line = line.union(&l);
                    }
                }
            }
            if exact {
                Bound::Exact(line)
            } else {
                Bound::Superset(line)
            }
        }
        Predicate::Not(child) => match bound_of(child, column, params) {
            Bound::Exact(line) => Bound::Exact(line.complement()),
            _ => Bound::Unknown,
        },
        _ => Bound::Unknown,
    }
}

fn resolve(operand: &Operand, params: &Params) -> Option<Value> {
    let value = match operand {
        Operand::Literal(v) => v.clone(),
        Operand::Param(name) => params.get(name)?.clone(),
    };
    (!value.is_null()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn seg(lo: i64, lo_inc: bool, hi: i64, hi_inc: bool) -> Segment {
        let p = |v: i64, inc: bool| {
            if inc {
                Point::inclusive(Value::Int(v))
            } else {
                Point::exclusive(Value::Int(v))
            }
        };
        Segment::new(p(lo, lo_inc), p(hi, hi_inc))
    }

    #[test]
    fn test_point_tie_breaking() {
        let a = Point::inclusive(Value::Int(5));
        let b = Point::inclusive(Value::Int(5));
        let c = Point::exclusive(Value::Int(5));
        assert_eq!(a.compare(&b), Some(Ordering::Equal));
        assert_eq!(a.compare(&c), None);
        assert_eq!(
            Point::inclusive(Value::Int(4)).compare(&c),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_segment_contains_respects_inclusiveness() {
        let s = seg(1, true, 5, false);
        assert!(s.contains(&Value::Int(1)));
        assert!(s.contains(&Value::Int(4)));
        assert!(!s.contains(&Value::Int(5)));
        assert!(!s.contains(&Value::Int(0)));
    }

    #[test]
    fn test_intersect_and_span() {
        let a = seg(1, true, 10, true);
        let b = seg(5, false, 20, true);
        assert_eq!(a.intersect(&b), Some(seg(5, false, 10, true)));
        assert_eq!(a.span(&b), seg(1, true, 20, true));
        assert_eq!(seg(1, true, 5, false).intersect(&seg(5, true, 9, true)), None);
    }

    #[test]
    fn test_union_coalesces_adjacent_segments() {
        let line = NumberLine::from_segments(vec![seg(5, true, 9, true), seg(1, true, 5, false)]);
        assert_eq!(line.segments(), &[seg(1, true, 9, true)]);

        let gap = NumberLine::from_segments(vec![seg(1, true, 5, false), seg(5, false, 9, true)]);
        assert_eq!(gap.segments().len(), 2);
    }

    #[test]
    fn test_not_equal_is_two_open_rays() {
        let line = NumberLine::for_comparison(Comparator::Ne, Value::Int(3));
        assert_eq!(line.segments().len(), 2);
        assert!(!line.contains(&Value::Int(3)));
        assert!(line.contains(&Value::Int(2)));
        assert!(line.contains(&Value::Int(4)));
    }

    #[test]
    fn test_complement_of_bounded_segment() {
        let line = NumberLine::from_segment(seg(1, true, 5, false));
        let c = line.complement();
        assert!(c.contains(&Value::Int(0)));
        assert!(!c.contains(&Value::Int(1)));
        assert!(c.contains(&Value::Int(5)));
        assert_eq!(NumberLine::full().complement(), NumberLine::empty());
        assert_eq!(NumberLine::empty().complement(), NumberLine::full());
    }

    #[test]
    fn test_or_with_unbounded_branch_spans_the_full_line() {
        let p = Predicate::lt("age", 30).or(Predicate::eq("state", "SC"));
        let line = compile_bounds(&p, "age", &Params::new());
        assert!(line.is_full());
    }

    #[test]
    fn test_and_narrows_even_with_unrelated_terms() {
        let p = Predicate::ge("age", 18)
            .and(Predicate::lt("age", 65))
            .and(Predicate::eq("state", "SC"));
        let line = compile_bounds(&p, "age", &Params::new());
        assert_eq!(line.segments(), &[seg(18, true, 65, false)]);
    }

    #[test]
    fn test_not_over_superset_is_unknown() {
        let inner = Predicate::lt("age", 30).and(Predicate::eq("state", "SC"));
        let line = compile_bounds(&inner.not(), "age", &Params::new());
        assert!(line.is_full());

        let exact = compile_bounds(&Predicate::lt("age", 30).not(), "age", &Params::new());
        assert_eq!(
            exact.segments(),
            &[Segment::new(Point::inclusive(Value::Int(30)), Point::pos_infinity())]
        );
    }

    #[test]
    fn test_params_and_between() {
        let p = Predicate::between("age", Operand::param("lo"), Operand::param("hi"));
        let mut params = Params::new();
        params.set("lo", 10);
        params.set("hi", 20);
        assert_eq!(
            compile_bounds(&p, "age", &params).segments(),
            &[seg(10, true, 20, true)]
        );
        assert!(compile_bounds(&p, "age", &Params::new()).is_full());
    }

    #[test]
    fn test_reversed_between_is_empty() {
        let reversed = Predicate::between("age", 20, 10);
        let line = compile_bounds(&reversed, "age", &Params::new());
        assert!(line.is_empty());
        assert!(compile_bounds(&reversed.not(), "age", &Params::new()).is_full());
    }

    fn arb_segment() -> impl Strategy<Value = Segment> {
        (-50i64..50, any::<bool>(), 0i64..30, any::<bool>())
            .prop_map(|(lo, lo_inc, len, hi_inc)| seg(lo, lo_inc, lo + len, hi_inc))
    }

    fn arb_line() -> impl Strategy<Value = NumberLine> {
        prop::collection::vec(arb_segment(), 0..5).prop_map(NumberLine::from_segments)
    }

    proptest! {
        #[test]
        fn prop_segment_intersection_commutes(a in arb_segment(), b in arb_segment()) {
            prop_assert_eq!(a.intersect(&b), b.intersect(&a));
        }

        #[test]
        fn prop_line_intersection_associates(a in arb_line(), b in arb_line(), c in arb_line()) {
            prop_assert_eq!(a.intersect(&b).intersect(&c), a.intersect(&b.intersect(&c)));
        }

        #[test]
        fn prop_double_complement(a in arb_line()) {
            prop_assert_eq!(a.complement().complement(), a);
        }

        #[test]
        fn prop_union_with_complement_is_full(a in arb_line()) {
            prop_assert!(a.union(&a.complement()).is_full());
        }

        #[test]
        fn prop_membership_matches_bounds(s in arb_segment(), v in -60i64..90) {
            let value = Value::Int(v);
            let (lo, hi) = match (&s.low.value, &s.high.value) {
                (Endpoint::Value(Value::Int(lo)), Endpoint::Value(Value::Int(hi))) => (*lo, *hi),
                _ => unreachable!(),
            };
            let expected = (v > lo || (v == lo && s.low.inclusive))
                && (v < hi || (v == hi && s.high.inclusive));
            prop_assert_eq!(s.contains(&value), expected);
        }

        #[test]
        fn prop_complement_partitions_values(a in arb_line(), v in -60i64..90) {
            let value = Value::Int(v);
            prop_assert_ne!(a.contains(&value), a.complement().contains(&value));
        }
    }
}
