//! Pairwise walkers over sorted disjoint range lists.
//!
//! [`RangePairIter`] is the workhorse of every binary operator: it walks
//! two sorted disjoint-range lists and reports, in strictly increasing key
//! order, which segments lie only in the first list, only in the second,
//! or in both. Where ranges partially overlap it splits them, emitting a
//! break event *before* the split so the caller can duplicate payload and
//! let the halves diverge.
//!
//! The walk is a cooperative coroutine expressed as an explicit state
//! machine: `next()` returns a tagged event and records the label to
//! resume from. The iterator is single pass, holds no heap state, and
//! keeps only the two cursors plus the saved bottom halves of
//! in-progress splits.

use super::cond::CondVals;
use super::key::{Key, KeyOps};

/// One range with caller payload, usually a transition handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeEntry<P: Copy> {
    pub low: Key,
    pub high: Key,
    pub payload: P,
}

/// Events reported to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangePairStep {
    /// The current segment is present only in the first list.
    InFirst,
    /// The current segment is present only in the second list.
    InSecond,
    /// The current segment is present in both lists with coinciding ends.
    Overlap,
    /// The first list's range is about to be split; the event that
    /// follows covers only its front part.
    BreakFirst,
    /// Likewise for the second list.
    BreakSecond,
}

/// Resume labels. Each names the yield point the iterator last returned
/// from; entry performs the work that follows that yield, then falls
/// back into the scan loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resume {
    Begin,
    Scan,
    AfterOnlyFirst,
    AfterOnlySecond,
    AfterBreakFirstStick,
    AfterStickFirst,
    AfterBreakSecondStick,
    AfterStickSecond,
    AfterBreakFirstDrag,
    AfterDragFirst,
    AfterBreakSecondDrag,
    AfterDragSecond,
    AfterExact,
    End,
}

struct Cursor<'a, P: Copy> {
    list: &'a [RangeEntry<P>],
    next: usize,
    cur: Option<RangeEntry<P>>,
}

impl<'a, P: Copy> Cursor<'a, P> {
    fn new(list: &'a [RangeEntry<P>]) -> Cursor<'a, P> {
        Cursor {
            list,
            next: 0,
            cur: None,
        }
    }

    fn load_first(&mut self) {
        self.next = 0;
        self.increment();
    }

    fn increment(&mut self) {
        self.cur = self.list.get(self.next).copied();
        self.next += 1;
    }
}

/// The range-pair walker. See the module docs for the event contract.
pub struct RangePairIter<'a, P: Copy> {
    key_ops: KeyOps,
    s1: Cursor<'a, P>,
    s2: Cursor<'a, P>,
    resume: Resume,
    bottom1: Option<RangeEntry<P>>,
    bottom2: Option<RangeEntry<P>>,
}

impl<'a, P: Copy> RangePairIter<'a, P> {
    pub fn new(
        key_ops: KeyOps,
        list1: &'a [RangeEntry<P>],
        list2: &'a [RangeEntry<P>],
    ) -> RangePairIter<'a, P> {
        RangePairIter {
            key_ops,
            s1: Cursor::new(list1),
            s2: Cursor::new(list2),
            resume: Resume::Begin,
            bottom1: None,
            bottom2: None,
        }
    }

    /// The current segment on the first list. Valid after an `InFirst`,
    /// `Overlap`, `BreakFirst` event.
    pub fn first(&self) -> RangeEntry<P> {
        self.s1.cur.expect("no current first-list segment")
    }

    /// The current segment on the second list.
    pub fn second(&self) -> RangeEntry<P> {
        self.s2.cur.expect("no current second-list segment")
    }

    /// Replace the payload of the current first-list segment. Called on
    /// `BreakFirst` to give the front half its own copy; the saved bottom
    /// half keeps the original payload.
    pub fn set_first_payload(&mut self, payload: P) {
        if let Some(cur) = self.s1.cur.as_mut() {
            cur.payload = payload;
        }
    }

    pub fn set_second_payload(&mut self, payload: P) {
        if let Some(cur) = self.s2.cur.as_mut() {
            cur.payload = payload;
        }
    }

    /// Advance to the next event. Returns `None` once both lists are
    /// drained.
    pub fn next(&mut self) -> Option<RangePairStep> {
        let ops = self.key_ops;
        loop {
            match self.resume {
                Resume::Begin => {
                    self.s1.load_first();
                    self.s2.load_first();
                    self.resume = Resume::Scan;
                }

                Resume::Scan => match (self.s1.cur, self.s2.cur) {
                    (None, None) => {
                        self.resume = Resume::End;
                        return None;
                    }
                    (Some(_), None) => {
                        self.resume = Resume::AfterOnlyFirst;
                        return Some(RangePairStep::InFirst);
                    }
                    (None, Some(_)) => {
                        self.resume = Resume::AfterOnlySecond;
                        return Some(RangePairStep::InSecond);
                    }
                    (Some(a), Some(b)) => {
                        if ops.lt(a.high, b.low) {
                            // No overlap, first range in front.
                            self.resume = Resume::AfterOnlyFirst;
                            return Some(RangePairStep::InFirst);
                        } else if ops.lt(b.high, a.low) {
                            // No overlap, second range in front.
                            self.resume = Resume::AfterOnlySecond;
                            return Some(RangePairStep::InSecond);
                        } else if ops.lt(a.low, b.low) {
                            // First range sticks out front. Break it into
                            // the front part and the overlapping rest.
                            self.bottom1 = Some(RangeEntry {
                                low: b.low,
                                high: a.high,
                                payload: a.payload,
                            });
                            self.s1.cur.as_mut().unwrap().high = ops.decrement(b.low);
                            self.resume = Resume::AfterBreakFirstStick;
                            return Some(RangePairStep::BreakFirst);
                        } else if ops.lt(b.low, a.low) {
                            self.bottom2 = Some(RangeEntry {
                                low: a.low,
                                high: b.high,
                                payload: b.payload,
                            });
                            self.s2.cur.as_mut().unwrap().high = ops.decrement(a.low);
                            self.resume = Resume::AfterBreakSecondStick;
                            return Some(RangePairStep::BreakSecond);
                        } else if ops.lt(a.high, b.high) {
                            // Low ends coincide, second range runs longer.
                            // Break it into an evenly overlapping front
                            // and a remainder.
                            self.bottom2 = Some(RangeEntry {
                                low: ops.increment(a.high),
                                high: b.high,
                                payload: b.payload,
                            });
                            self.s2.cur.as_mut().unwrap().high = a.high;
                            self.resume = Resume::AfterBreakSecondDrag;
                            return Some(RangePairStep::BreakSecond);
                        } else if ops.lt(b.high, a.high) {
                            self.bottom1 = Some(RangeEntry {
                                low: ops.increment(b.high),
                                high: a.high,
                                payload: a.payload,
                            });
                            self.s1.cur.as_mut().unwrap().high = b.high;
                            self.resume = Resume::AfterBreakFirstDrag;
                            return Some(RangePairStep::BreakFirst);
                        } else {
                            // Exact overlap.
                            self.resume = Resume::AfterExact;
                            return Some(RangePairStep::Overlap);
                        }
                    }
                },

                Resume::AfterOnlyFirst => {
                    self.s1.increment();
                    self.resume = Resume::Scan;
                }
                Resume::AfterOnlySecond => {
                    self.s2.increment();
                    self.resume = Resume::Scan;
                }

                // Stick-out splits: the broken-off front is only in the
                // one list; afterwards the saved bottom becomes current.
                Resume::AfterBreakFirstStick => {
                    self.resume = Resume::AfterStickFirst;
                    return Some(RangePairStep::InFirst);
                }
                Resume::AfterStickFirst => {
                    self.s1.cur = self.bottom1.take();
                    self.resume = Resume::Scan;
                }
                Resume::AfterBreakSecondStick => {
                    self.resume = Resume::AfterStickSecond;
                    return Some(RangePairStep::InSecond);
                }
                Resume::AfterStickSecond => {
                    self.s2.cur = self.bottom2.take();
                    self.resume = Resume::Scan;
                }

                // Drag-behind splits: the broken-off front overlaps
                // exactly; the shorter side is consumed, the saved bottom
                // becomes current on the longer side.
                Resume::AfterBreakSecondDrag => {
                    self.resume = Resume::AfterDragSecond;
                    return Some(RangePairStep::Overlap);
                }
                Resume::AfterDragSecond => {
                    self.s2.cur = self.bottom2.take();
                    self.s1.increment();
                    self.resume = Resume::Scan;
                }
                Resume::AfterBreakFirstDrag => {
                    self.resume = Resume::AfterDragFirst;
                    return Some(RangePairStep::Overlap);
                }
                Resume::AfterDragFirst => {
                    self.s1.cur = self.bottom1.take();
                    self.s2.increment();
                    self.resume = Resume::Scan;
                }

                Resume::AfterExact => {
                    self.s1.increment();
                    self.s2.increment();
                    self.resume = Resume::Scan;
                }

                Resume::End => return None,
            }
        }
    }
}

/// Events reported by the value-pair walker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValPairStep {
    InFirst,
    InSecond,
    Overlap,
}

/// One single-key entry with payload, used on cond lists.
#[derive(Clone, Copy, Debug)]
pub struct ValEntry<P: Copy> {
    pub key: CondVals,
    pub payload: P,
}

/// Companion walker over two sorted single-key lists. Same contract as
/// [`RangePairIter`] but keys cannot split, so there are no break events.
pub struct ValPairIter<'a, P: Copy> {
    list1: &'a [ValEntry<P>],
    list2: &'a [ValEntry<P>],
    i1: usize,
    i2: usize,
    cur: Option<(ValPairStep, usize, usize)>,
}

impl<'a, P: Copy> ValPairIter<'a, P> {
    pub fn new(list1: &'a [ValEntry<P>], list2: &'a [ValEntry<P>]) -> ValPairIter<'a, P> {
        ValPairIter {
            list1,
            list2,
            i1: 0,
            i2: 0,
            cur: None,
        }
    }

    pub fn first(&self) -> ValEntry<P> {
        self.list1[self.cur.expect("no current entry").1]
    }

    pub fn second(&self) -> ValEntry<P> {
        self.list2[self.cur.expect("no current entry").2]
    }

    pub fn next(&mut self) -> Option<ValPairStep> {
        // Consume whatever the previous event covered.
        if let Some((step, _, _)) = self.cur.take() {
            match step {
                ValPairStep::InFirst => self.i1 += 1,
                ValPairStep::InSecond => self.i2 += 1,
                ValPairStep::Overlap => {
                    self.i1 += 1;
                    self.i2 += 1;
                }
            }
        }
        let step = match (self.list1.get(self.i1), self.list2.get(self.i2)) {
            (None, None) => return None,
            (Some(_), None) => ValPairStep::InFirst,
            (None, Some(_)) => ValPairStep::InSecond,
            (Some(a), Some(b)) => {
                if a.key < b.key {
                    ValPairStep::InFirst
                } else if b.key < a.key {
                    ValPairStep::InSecond
                } else {
                    ValPairStep::Overlap
                }
            }
        };
        self.cur = Some((step, self.i1, self.i2));
        Some(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(ranges: &[(i64, i64)]) -> Vec<RangeEntry<usize>> {
        ranges
            .iter()
            .enumerate()
            .map(|(i, &(low, high))| RangeEntry {
                low: Key(low),
                high: Key(high),
                payload: i,
            })
            .collect()
    }

    fn run(l1: &[(i64, i64)], l2: &[(i64, i64)]) -> Vec<(RangePairStep, i64, i64)> {
        let e1 = entries(l1);
        let e2 = entries(l2);
        let mut it = RangePairIter::new(KeyOps::unsigned_octet(), &e1, &e2);
        let mut out = Vec::new();
        while let Some(step) = it.next() {
            let (low, high) = match step {
                RangePairStep::InFirst | RangePairStep::BreakFirst => {
                    (it.first().low.0, it.first().high.0)
                }
                RangePairStep::InSecond | RangePairStep::BreakSecond => {
                    (it.second().low.0, it.second().high.0)
                }
                RangePairStep::Overlap => (it.first().low.0, it.first().high.0),
            };
            out.push((step, low, high));
        }
        out
    }

    #[test]
    fn disjoint_lists_interleave() {
        use RangePairStep::*;
        let events = run(&[(0, 1), (10, 11)], &[(4, 5)]);
        assert_eq!(
            events,
            vec![(InFirst, 0, 1), (InSecond, 4, 5), (InFirst, 10, 11)]
        );
    }

    #[test]
    fn exact_overlap() {
        use RangePairStep::*;
        let events = run(&[(3, 7)], &[(3, 7)]);
        assert_eq!(events, vec![(Overlap, 3, 7)]);
    }

    #[test]
    fn first_sticks_out_front() {
        use RangePairStep::*;
        // The break event already shows the narrowed front half; the
        // saved bottom half carries the overlap.
        let events = run(&[(0, 9)], &[(5, 9)]);
        assert_eq!(
            events,
            vec![(BreakFirst, 0, 4), (InFirst, 0, 4), (Overlap, 5, 9)]
        );
    }

    #[test]
    fn second_drags_behind() {
        use RangePairStep::*;
        let events = run(&[(0, 4)], &[(0, 9)]);
        assert_eq!(
            events,
            vec![(BreakSecond, 0, 4), (Overlap, 0, 4), (InSecond, 5, 9)]
        );
    }

    #[test]
    fn nested_range_splits_twice() {
        use RangePairStep::*;
        // Second list's range is strictly inside the first's.
        let events = run(&[(0, 9)], &[(3, 6)]);
        assert_eq!(
            events,
            vec![
                (BreakFirst, 0, 2),
                (InFirst, 0, 2),
                (BreakFirst, 3, 6),
                (Overlap, 3, 6),
                (InFirst, 7, 9),
            ]
        );
    }

    #[test]
    fn emitted_segments_strictly_increase() {
        let events = run(&[(0, 5), (8, 20), (30, 31)], &[(2, 10), (15, 35)]);
        let mut last_low = -1i64;
        for &(step, low, _) in &events {
            if matches!(
                step,
                RangePairStep::InFirst | RangePairStep::InSecond | RangePairStep::Overlap
            ) {
                assert!(low > last_low, "segments must increase: {:?}", events);
                last_low = low;
            }
        }
    }

    #[test]
    fn break_payload_replacement_only_affects_front() {
        let e1 = entries(&[(0, 9)]);
        let e2 = entries(&[(5, 9)]);
        let mut it = RangePairIter::new(KeyOps::unsigned_octet(), &e1, &e2);
        assert_eq!(it.next(), Some(RangePairStep::BreakFirst));
        it.set_first_payload(99);
        assert_eq!(it.next(), Some(RangePairStep::InFirst));
        assert_eq!(it.first().payload, 99);
        assert_eq!(it.next(), Some(RangePairStep::Overlap));
        // The bottom half kept the original payload.
        assert_eq!(it.first().payload, 0);
        assert_eq!(it.next(), None);
    }

    #[test]
    fn val_pair_walk() {
        use ValPairStep::*;
        let l1 = [
            ValEntry {
                key: CondVals(0),
                payload: 0usize,
            },
            ValEntry {
                key: CondVals(2),
                payload: 1,
            },
        ];
        let l2 = [
            ValEntry {
                key: CondVals(1),
                payload: 0usize,
            },
            ValEntry {
                key: CondVals(2),
                payload: 1,
            },
        ];
        let mut it = ValPairIter::new(&l1, &l2);
        assert_eq!(it.next(), Some(InFirst));
        assert_eq!(it.first().key, CondVals(0));
        assert_eq!(it.next(), Some(InSecond));
        assert_eq!(it.second().key, CondVals(1));
        assert_eq!(it.next(), Some(Overlap));
        assert_eq!(it.next(), None);
    }
}
