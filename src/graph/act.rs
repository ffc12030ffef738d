//! Actions, action tables and the priority system.
//!
//! Host-language actions are opaque to the graph: it sees a name (or a
//! source location for anonymous blocks), a handle to the inline body, and
//! reference counters. Embeddings are keyed by an *ordering*, a
//! monotonically increasing integer assigned by the caller; ordering is the
//! only evidence of temporal embedding that survives the algebra.
//!
//! Priorities resolve ambiguity during determinization. A [`PriorDesc`] is
//! shared between embeddings; a [`PriorTable`] entry pairs an ordering with
//! a descriptor. Within a table there is at most one entry per descriptor
//! key; merging keeps the higher priority.

use smallvec::SmallVec;

use super::ctx::FsmCtx;
use crate::FsmError;

/// Handle to an interned [`Action`] in the shared dictionary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId(pub u32);

/// Handle to a shared [`PriorDesc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriorId(pub u32);

/// Opaque handle to a host-language inline block owned by the parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InlineRef(pub u32);

/// Opaque handle to a longest-match part owned by the scanner builder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LmPartId(pub u32);

/// Source position, used to name anonymous actions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputLoc {
    pub line: u32,
    pub col: u32,
}

/// A host-language action reference.
///
/// The six reference counters are maintained by the binding operations;
/// their sum drives dead-action elimination downstream of the graph.
#[derive(Clone, Debug)]
pub struct Action {
    pub loc: InputLoc,
    pub name: String,
    pub body: InlineRef,
    /// Declaration-order id, assigned by the dictionary.
    pub action_id: u32,
    /// Identity when the action is used as a condition guard.
    pub cond_id: i32,
    /// Budget bucket for condition-space expansion accounting.
    pub cost_id: i64,

    pub num_trans_refs: u32,
    pub num_to_state_refs: u32,
    pub num_from_state_refs: u32,
    pub num_eof_refs: u32,
    pub num_cond_refs: u32,
    pub num_nfa_refs: u32,
}

impl Action {
    /// References in the final machine. Condition references are counted
    /// separately because guards survive even when embeddings die.
    pub fn num_refs(&self) -> u32 {
        self.num_trans_refs
            + self.num_to_state_refs
            + self.num_from_state_refs
            + self.num_eof_refs
            + self.num_nfa_refs
    }

    /// Name for diagnostics: the declared name, or `line:col` if anonymous.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{}:{}", self.loc.line, self.loc.col)
        } else {
            self.name.clone()
        }
    }
}

/// One embedding in an action table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ActionTableEl {
    pub ordering: i32,
    pub action: ActionId,
}

/// Ordered map from ordering to action.
///
/// Kept sorted by ordering so two tables with the same embeddings compare
/// equal by structure, which the minimizers rely on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionTable {
    els: SmallVec<[ActionTableEl; 4]>,
}

impl ActionTable {
    pub fn new() -> ActionTable {
        ActionTable::default()
    }

    pub fn is_empty(&self) -> bool {
        self.els.is_empty()
    }

    pub fn len(&self) -> usize {
        self.els.len()
    }

    pub fn els(&self) -> &[ActionTableEl] {
        &self.els
    }

    /// Insert unless the ordering is already present.
    pub fn set_action(&mut self, ordering: i32, action: ActionId) {
        if let Err(pos) = self.els.binary_search_by_key(&ordering, |el| el.ordering) {
            self.els.insert(pos, ActionTableEl { ordering, action });
        }
    }

    /// Set union by ordering.
    pub fn set_actions(&mut self, other: &ActionTable) {
        for el in &other.els {
            self.set_action(el.ordering, el.action);
        }
    }

    pub fn has_action(&self, action: ActionId) -> bool {
        self.els.iter().any(|el| el.action == action)
    }

    pub fn clear(&mut self) {
        self.els.clear();
    }

    /// Drop all orderings, leaving a bag of actions keyed 0..n. Used by the
    /// final compression pass, after which embedding order no longer
    /// matters for equality.
    pub fn null_orderings(&mut self) {
        for (i, el) in self.els.iter_mut().enumerate() {
            el.ordering = i as i32;
        }
    }
}

/// Ordered map from ordering to longest-match part.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LmActionTable {
    els: SmallVec<[(i32, LmPartId); 2]>,
}

impl LmActionTable {
    pub fn new() -> LmActionTable {
        LmActionTable::default()
    }

    pub fn is_empty(&self) -> bool {
        self.els.is_empty()
    }

    pub fn els(&self) -> &[(i32, LmPartId)] {
        &self.els
    }

    pub fn set_action(&mut self, ordering: i32, part: LmPartId) {
        if let Err(pos) = self.els.binary_search_by_key(&ordering, |el| el.0) {
            self.els.insert(pos, (ordering, part));
        }
    }

    pub fn set_actions(&mut self, other: &LmActionTable) {
        for &(ordering, part) in &other.els {
            self.set_action(ordering, part);
        }
    }
}

/// Error-table element; the transfer point encodes when the embedding is
/// moved onto transitions and the EOF table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ErrActionTableEl {
    pub ordering: i32,
    pub action: ActionId,
    pub transfer_point: i32,
}

/// Ordered set of error action embeddings, keyed by ordering.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrActionTable {
    els: SmallVec<[ErrActionTableEl; 2]>,
}

impl ErrActionTable {
    pub fn new() -> ErrActionTable {
        ErrActionTable::default()
    }

    pub fn is_empty(&self) -> bool {
        self.els.is_empty()
    }

    pub fn els(&self) -> &[ErrActionTableEl] {
        &self.els
    }

    pub fn set_action(&mut self, ordering: i32, action: ActionId, transfer_point: i32) {
        if let Err(pos) = self.els.binary_search_by_key(&ordering, |el| el.ordering) {
            self.els.insert(
                pos,
                ErrActionTableEl {
                    ordering,
                    action,
                    transfer_point,
                },
            );
        }
    }

    pub fn set_actions(&mut self, other: &ErrActionTable) {
        for el in &other.els {
            self.set_action(el.ordering, el.action, el.transfer_point);
        }
    }

    pub fn clear(&mut self) {
        self.els.clear();
    }
}

/// A shared priority descriptor. `key` partitions the priority space;
/// only descriptors with the same key interact. `guard_id` is nonzero for
/// descriptors that take part in guarded unions; `pair` links the two
/// descriptors of a guard pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriorDesc {
    pub key: i32,
    pub priority: i32,
    pub guard_id: i64,
    pub pair: Option<PriorId>,
}

/// One priority embedding: ordering plus shared descriptor. Comparison
/// is by descriptor identity, not `(key, value)`; identity is stricter
/// and can lose merges, but weakening it would require re-selecting
/// descriptors during fusion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PriorEl {
    pub ordering: i32,
    pub desc: PriorId,
}

/// Ordered set of priority embeddings, at most one per descriptor key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PriorTable {
    els: SmallVec<[PriorEl; 2]>,
}

impl PriorTable {
    pub fn new() -> PriorTable {
        PriorTable::default()
    }

    pub fn is_empty(&self) -> bool {
        self.els.is_empty()
    }

    pub fn len(&self) -> usize {
        self.els.len()
    }

    pub fn els(&self) -> &[PriorEl] {
        &self.els
    }

    pub fn clear(&mut self) {
        self.els.clear();
    }

    /// Insert a priority embedding. If an embedding with the same
    /// descriptor key exists the higher priority survives, ties going to
    /// the later ordering.
    pub fn set_prior(&mut self, ctx: &FsmCtx, ordering: i32, desc: PriorId) {
        let key = ctx.prior(desc).key;
        match self
            .els
            .binary_search_by_key(&key, |el| ctx.prior(el.desc).key)
        {
            Err(pos) => self.els.insert(pos, PriorEl { ordering, desc }),
            Ok(pos) => {
                let held = self.els[pos];
                let held_pr = ctx.prior(held.desc).priority;
                let new_pr = ctx.prior(desc).priority;
                if new_pr > held_pr || (new_pr == held_pr && ordering >= held.ordering) {
                    self.els[pos] = PriorEl { ordering, desc };
                }
            }
        }
    }

    /// Union by descriptor key under the `set_prior` rule.
    pub fn set_priors(&mut self, ctx: &FsmCtx, other: &PriorTable) {
        for el in &other.els {
            self.set_prior(ctx, el.ordering, el.desc);
        }
    }
}

/// Decide which of two priority tables dominates.
///
/// Scans both tables for entries on the same descriptor key and compares
/// their priorities; the first differing key decides. Equal priorities
/// from distinct guard descriptors colliding during a union cannot be
/// resolved and raise [`FsmError::PriorInteraction`] with the offending
/// key.
pub fn compare_prior(
    ctx: &FsmCtx,
    table1: &PriorTable,
    table2: &PriorTable,
) -> Result<std::cmp::Ordering, FsmError> {
    let mut i1 = table1.els().iter().peekable();
    let mut i2 = table2.els().iter().peekable();
    while let (Some(el1), Some(el2)) = (i1.peek(), i2.peek()) {
        let d1 = ctx.prior(el1.desc);
        let d2 = ctx.prior(el2.desc);
        if d1.key < d2.key {
            i1.next();
        } else if d2.key < d1.key {
            i2.next();
        } else {
            if d1.priority < d2.priority {
                return Ok(std::cmp::Ordering::Less);
            } else if d1.priority > d2.priority {
                return Ok(std::cmp::Ordering::Greater);
            } else if ctx.in_union_op()
                && el1.desc != el2.desc
                && d1.guard_id != 0
                && d2.guard_id != 0
                && d1.guard_id != d2.guard_id
            {
                return Err(FsmError::PriorInteraction(d1.key));
            }
            i1.next();
            i2.next();
        }
    }
    Ok(std::cmp::Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ctx::FsmCtx;

    #[test]
    fn action_table_keeps_first_embedding_per_ordering() {
        let mut table = ActionTable::new();
        table.set_action(3, ActionId(0));
        table.set_action(1, ActionId(1));
        table.set_action(3, ActionId(2));
        assert_eq!(table.len(), 2);
        assert_eq!(table.els()[0].action, ActionId(1));
        assert_eq!(table.els()[1].action, ActionId(0));
    }

    #[test]
    fn action_table_union_is_structural() {
        let mut a = ActionTable::new();
        a.set_action(1, ActionId(0));
        let mut b = ActionTable::new();
        b.set_action(2, ActionId(1));
        b.set_actions(&a);
        let mut c = ActionTable::new();
        c.set_action(1, ActionId(0));
        c.set_action(2, ActionId(1));
        assert_eq!(b, c);
    }

    #[test]
    fn prior_table_higher_priority_wins() {
        let mut ctx = FsmCtx::new(crate::graph::key::KeyOps::unsigned_octet());
        let low = ctx.add_prior_desc(0, 1, 0);
        let high = ctx.add_prior_desc(0, 5, 0);
        let mut table = PriorTable::new();
        table.set_prior(&ctx, 0, low);
        table.set_prior(&ctx, 1, high);
        assert_eq!(table.len(), 1);
        assert_eq!(table.els()[0].desc, high);
        // A lower priority on the same key does not displace it.
        table.set_prior(&ctx, 2, low);
        assert_eq!(table.els()[0].desc, high);
    }

    #[test]
    fn compare_prior_picks_winner_on_shared_key() {
        let mut ctx = FsmCtx::new(crate::graph::key::KeyOps::unsigned_octet());
        let low = ctx.add_prior_desc(7, 1, 0);
        let high = ctx.add_prior_desc(7, 2, 0);
        let mut t1 = PriorTable::new();
        t1.set_prior(&ctx, 0, low);
        let mut t2 = PriorTable::new();
        t2.set_prior(&ctx, 0, high);
        assert_eq!(
            compare_prior(&ctx, &t1, &t2).unwrap(),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            compare_prior(&ctx, &t2, &t1).unwrap(),
            std::cmp::Ordering::Greater
        );
    }

    #[test]
    fn guard_collision_is_an_error_during_union() {
        let mut ctx = FsmCtx::new(crate::graph::key::KeyOps::unsigned_octet());
        let g1 = ctx.add_prior_desc(3, 0, 101);
        let g2 = ctx.add_prior_desc(3, 0, 102);
        let mut t1 = PriorTable::new();
        t1.set_prior(&ctx, 0, g1);
        let mut t2 = PriorTable::new();
        t2.set_prior(&ctx, 0, g2);
        assert!(compare_prior(&ctx, &t1, &t2).is_ok());
        ctx.set_union_op(true);
        match compare_prior(&ctx, &t1, &t2) {
            Err(FsmError::PriorInteraction(key)) => assert_eq!(key, 3),
            other => panic!("expected PriorInteraction, got {:?}", other),
        }
    }
}
