//! The shared context every graph in an operation points into.
//!
//! The context owns the interned dictionaries whose entries outlive any
//! one graph: the action dictionary, the priority descriptors and the
//! condition-space map. It also carries the key ops, the minimization
//! selectors and the resource limits. Two graphs may only be operands of
//! a binary operator when they were built against the same context;
//! violating that is a programming error, not a recoverable one.

use rustc_hash::FxHashMap;

use super::act::{Action, ActionId, InlineRef, InputLoc, PriorDesc, PriorId};
use super::cond::{CondSet, CondSpace, CondSpaceId};
use super::key::KeyOps;
use crate::FsmError;

/// Which minimization strategy the pipeline runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinimizeLevel {
    Approximate,
    Stable,
    Partition1,
    Partition2,
}

/// When minimization runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinimizeOpt {
    None,
    AtEnd,
    MostOps,
    EveryOp,
}

/// Shared settings and interned dictionaries.
pub struct FsmCtx {
    pub key_ops: KeyOps,

    pub minimize_level: MinimizeLevel,
    pub minimize_opt: MinimizeOpt,

    /// Abort subset construction past this many states; non-positive means
    /// no limit.
    pub state_limit: i64,

    /// Reject NFA repetitions that cannot make progress.
    pub nfa_term_check: bool,

    /// Expansion budget per cost id for condition spaces.
    pub cond_cost_limit: u64,

    actions: Vec<Action>,
    priors: Vec<PriorDesc>,
    cond_spaces: Vec<CondSpace>,
    cond_space_map: FxHashMap<CondSet, CondSpaceId>,
    cond_costs: FxHashMap<i64, u64>,
    next_cond_id: i32,
    union_op: bool,
}

impl FsmCtx {
    pub fn new(key_ops: KeyOps) -> FsmCtx {
        FsmCtx {
            key_ops,
            minimize_level: MinimizeLevel::Partition2,
            minimize_opt: MinimizeOpt::AtEnd,
            state_limit: -1,
            nfa_term_check: false,
            cond_cost_limit: 1 << 16,
            actions: Vec::new(),
            priors: Vec::new(),
            cond_spaces: Vec::new(),
            cond_space_map: FxHashMap::default(),
            cond_costs: FxHashMap::default(),
            next_cond_id: 1,
            union_op: false,
        }
    }

    /*
     * Action dictionary. Append-only; ids are declaration order.
     */

    pub fn add_action(&mut self, loc: InputLoc, name: &str, body: InlineRef) -> ActionId {
        let id = ActionId(self.actions.len() as u32);
        let cond_id = self.next_cond_id;
        self.next_cond_id += 1;
        self.actions.push(Action {
            loc,
            name: name.to_string(),
            body,
            action_id: id.0,
            cond_id,
            cost_id: id.0 as i64,
            num_trans_refs: 0,
            num_to_state_refs: 0,
            num_from_state_refs: 0,
            num_eof_refs: 0,
            num_cond_refs: 0,
            num_nfa_refs: 0,
        });
        id
    }

    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id.0 as usize]
    }

    pub fn action_mut(&mut self, id: ActionId) -> &mut Action {
        &mut self.actions[id.0 as usize]
    }

    pub fn find_action(&self, name: &str) -> Option<ActionId> {
        self.actions
            .iter()
            .position(|a| a.name == name)
            .map(|i| ActionId(i as u32))
    }

    /*
     * Priority descriptors. Shared, append-only.
     */

    pub fn add_prior_desc(&mut self, key: i32, priority: i32, guard_id: i64) -> PriorId {
        let id = PriorId(self.priors.len() as u32);
        self.priors.push(PriorDesc {
            key,
            priority,
            guard_id,
            pair: None,
        });
        id
    }

    pub fn prior(&self, id: PriorId) -> &PriorDesc {
        &self.priors[id.0 as usize]
    }

    /// Link the two descriptors of a guard pair through their reciprocal
    /// pointer fields.
    pub fn pair_priors(&mut self, a: PriorId, b: PriorId) {
        self.priors[a.0 as usize].pair = Some(b);
        self.priors[b.0 as usize].pair = Some(a);
    }

    /*
     * Condition spaces, interned by guard set.
     */

    /// Look the set up in the interned map, returning the existing space
    /// or inserting a new one with a fresh id.
    pub fn add_cond_space(&mut self, set: CondSet) -> CondSpaceId {
        if let Some(&id) = self.cond_space_map.get(&set) {
            return id;
        }
        let id = CondSpaceId(self.cond_spaces.len() as u32);
        self.cond_spaces.push(CondSpace {
            set: set.clone(),
            space_id: id.0,
        });
        self.cond_space_map.insert(set, id);
        id
    }

    pub fn cond_space(&self, id: CondSpaceId) -> &CondSpace {
        &self.cond_spaces[id.0 as usize]
    }

    /// Charge `added` sub-transitions against the budget for `cost_id`.
    pub fn charge_cond_cost(&mut self, cost_id: i64, added: u64) -> Result<(), FsmError> {
        let entry = self.cond_costs.entry(cost_id).or_insert(0);
        *entry += added;
        if *entry > self.cond_cost_limit {
            return Err(FsmError::CondCostTooHigh(cost_id));
        }
        Ok(())
    }

    /*
     * Union bookkeeping for guarded priority interaction detection.
     */

    pub fn in_union_op(&self) -> bool {
        self.union_op
    }

    pub fn set_union_op(&mut self, on: bool) {
        self.union_op = on;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cond_spaces_are_interned() {
        let mut ctx = FsmCtx::new(KeyOps::unsigned_octet());
        let a = ctx.add_action(InputLoc::default(), "g1", InlineRef(0));
        let cid = ctx.action(a).cond_id;
        let s1 = ctx.add_cond_space(CondSet::single(cid, a));
        let s2 = ctx.add_cond_space(CondSet::single(cid, a));
        assert_eq!(s1, s2);
        let s3 = ctx.add_cond_space(CondSet::new());
        assert_ne!(s1, s3);
        assert_eq!(ctx.cond_space(s1).full_size(), 2);
        assert_eq!(ctx.cond_space(s3).full_size(), 1);
    }

    #[test]
    fn cond_cost_budget_overflows() {
        let mut ctx = FsmCtx::new(KeyOps::unsigned_octet());
        ctx.cond_cost_limit = 8;
        assert!(ctx.charge_cond_cost(1, 8).is_ok());
        match ctx.charge_cond_cost(1, 1) {
            Err(FsmError::CondCostTooHigh(1)) => {}
            other => panic!("expected CondCostTooHigh, got {:?}", other),
        }
    }

    #[test]
    fn actions_get_distinct_cond_ids() {
        let mut ctx = FsmCtx::new(KeyOps::unsigned_octet());
        let a = ctx.add_action(InputLoc::default(), "a", InlineRef(0));
        let b = ctx.add_action(InputLoc::default(), "", InlineRef(1));
        assert_ne!(ctx.action(a).cond_id, ctx.action(b).cond_id);
        assert_eq!(ctx.action(b).display_name(), "0:0");
    }
}
