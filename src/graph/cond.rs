//! Condition sets and interned condition spaces.
//!
//! A condition space multiplexes one character range over a boolean vector
//! of guard actions: a space of cardinality `n` indexes a `2^n` family of
//! sub-transitions, each keyed by a [`CondVals`] bitvector. Spaces are
//! interned in the shared [`FsmCtx`](super::ctx::FsmCtx) by their guard
//! set and referenced by id; they outlive every graph that mentions them.

use smallvec::SmallVec;

use super::act::ActionId;

/// Handle to an interned [`CondSpace`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CondSpaceId(pub u32);

/// A selection of guard truth values, one bit per guard in the space,
/// bit `i` corresponding to the `i`-th guard in cond-id order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CondVals(pub u64);

/// One guard in a condition set. The cond id gives guards a stable order
/// independent of action-dictionary order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CondGuard {
    pub cond_id: i32,
    pub action: ActionId,
}

/// An ordered set of guard actions, sorted by cond id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CondSet {
    guards: SmallVec<[CondGuard; 2]>,
}

impl CondSet {
    pub fn new() -> CondSet {
        CondSet::default()
    }

    pub fn single(cond_id: i32, action: ActionId) -> CondSet {
        let mut set = CondSet::new();
        set.insert(cond_id, action);
        set
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn guards(&self) -> &[CondGuard] {
        &self.guards
    }

    pub fn contains(&self, cond_id: i32) -> bool {
        self.guards
            .binary_search_by_key(&cond_id, |g| g.cond_id)
            .is_ok()
    }

    pub fn insert(&mut self, cond_id: i32, action: ActionId) {
        if let Err(pos) = self.guards.binary_search_by_key(&cond_id, |g| g.cond_id) {
            self.guards.insert(pos, CondGuard { cond_id, action });
        }
    }

    /// Set union.
    pub fn merge(&self, other: &CondSet) -> CondSet {
        let mut out = self.clone();
        for g in &other.guards {
            out.insert(g.cond_id, g.action);
        }
        out
    }

    /// Position of each of `self`'s guards within `full`. `self` must be a
    /// subset of `full`.
    pub fn positions_in(&self, full: &CondSet) -> SmallVec<[u32; 4]> {
        self.guards
            .iter()
            .map(|g| {
                full.guards
                    .binary_search_by_key(&g.cond_id, |h| h.cond_id)
                    .expect("guard set is not a subset of the merged space") as u32
            })
            .collect()
    }
}

/// An interned condition set with a stable id.
#[derive(Clone, Debug)]
pub struct CondSpace {
    pub set: CondSet,
    pub space_id: u32,
}

impl CondSpace {
    /// Number of condition-value vectors the space indexes.
    pub fn full_size(&self) -> u64 {
        1u64 << self.set.len()
    }
}

/// Restrict a value vector over a full space to the sub-space whose guard
/// positions are `positions`.
pub fn restrict_vals(vals: CondVals, positions: &[u32]) -> CondVals {
    let mut out = 0u64;
    for (i, &pos) in positions.iter().enumerate() {
        out |= ((vals.0 >> pos) & 1) << i;
    }
    CondVals(out)
}

/// Enumerate the value vectors over `merged` whose restriction to the
/// sub-space at `positions` equals `vals`. Each existing value expands to
/// `2^(|merged| - |sub|)` values, preserving the original assignment and
/// ranging over the new guards.
pub fn expand_vals(vals: CondVals, positions: &[u32], merged_len: usize) -> Vec<CondVals> {
    let full = 1u64 << merged_len;
    let mut out = Vec::with_capacity(1 << (merged_len - positions.len()));
    for w in 0..full {
        if restrict_vals(CondVals(w), positions) == vals {
            out.push(CondVals(w));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cond_set_sorted_by_cond_id() {
        let mut set = CondSet::new();
        set.insert(5, ActionId(0));
        set.insert(2, ActionId(1));
        set.insert(5, ActionId(9));
        assert_eq!(set.len(), 2);
        assert_eq!(set.guards()[0].cond_id, 2);
        assert_eq!(set.guards()[1].cond_id, 5);
    }

    #[test]
    fn restriction_gathers_bits() {
        // Sub-space occupies positions 0 and 2 of a 3-guard space.
        let positions = [0u32, 2u32];
        assert_eq!(restrict_vals(CondVals(0b101), &positions), CondVals(0b11));
        assert_eq!(restrict_vals(CondVals(0b010), &positions), CondVals(0b00));
    }

    #[test]
    fn expansion_preserves_assignment() {
        // One original guard at position 1 of a 2-guard merged space.
        let expanded = expand_vals(CondVals(1), &[1], 2);
        assert_eq!(expanded, vec![CondVals(0b10), CondVals(0b11)]);
        let expanded = expand_vals(CondVals(0), &[1], 2);
        assert_eq!(expanded, vec![CondVals(0b00), CondVals(0b01)]);
    }

    #[test]
    fn expansion_count_is_power_of_two() {
        let expanded = expand_vals(CondVals(0), &[0], 3);
        assert_eq!(expanded.len(), 4);
    }
}
