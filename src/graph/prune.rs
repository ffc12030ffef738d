//! Reachability marking, pruning passes and integrity verification.
//!
//! Construction parks temporarily unreachable states on the misfit list;
//! `remove_misfits` deletes them once an operator completes. The
//! unreachable/dead-end passes prune the main list by forward and
//! backward marking. `verify_integrity` walks the whole graph checking
//! the structural invariants the rest of the crate relies on.

use tracing::debug;

use super::ctx::FsmCtx;
use super::fsm::Fsm;
use super::state::{InRef, StateId, TransBody, SB_ISMARKED};

impl Fsm {
    fn clear_marks(&mut self) {
        for state in self.states() {
            self.st_mut(state).bits &= !SB_ISMARKED;
        }
    }

    /// Mark all states reachable forward from `state`, following out
    /// transitions, the EOF target and NFA edges.
    pub fn mark_reachable_from_here(&mut self, state: StateId) {
        let mut stack = vec![state];
        while let Some(id) = stack.pop() {
            if self.st(id).is_marked() {
                continue;
            }
            self.st_mut(id).bits |= SB_ISMARKED;
            let out = self.st(id).out.clone();
            for tid in out {
                for target in self.tr(tid).targets() {
                    stack.push(target);
                }
            }
            if let Some(eof) = self.st(id).eof_target {
                stack.push(eof);
            }
            let nfa: Vec<StateId> = self.st(id).nfa_out.iter().map(|&(t, _)| t).collect();
            stack.extend(nfa);
        }
    }

    /// Forward marking that does not descend past final states.
    pub fn mark_reachable_from_here_stop_final(&mut self, state: StateId) {
        let mut stack = vec![state];
        while let Some(id) = stack.pop() {
            if self.st(id).is_marked() {
                continue;
            }
            self.st_mut(id).bits |= SB_ISMARKED;
            if self.st(id).is_final() {
                continue;
            }
            let out = self.st(id).out.clone();
            for tid in out {
                for target in self.tr(tid).targets() {
                    stack.push(target);
                }
            }
        }
    }

    /// Mark all states that reach `state`, walking in-lists and NFA
    /// back-references.
    pub fn mark_reachable_from_here_reverse(&mut self, state: StateId) {
        let mut stack = vec![state];
        while let Some(id) = stack.pop() {
            if self.st(id).is_marked() {
                continue;
            }
            self.st_mut(id).bits |= SB_ISMARKED;
            let froms: Vec<StateId> = self
                .st(id)
                .in_refs
                .iter()
                .map(|r| self.tr(r.trans()).from)
                .collect();
            stack.extend(froms);
            let nfa_in = self.st(id).nfa_in.clone();
            stack.extend(nfa_in);
        }
    }

    /// Remove states with no path from the start state or an entry
    /// point.
    pub fn remove_unreachable_states(&mut self) {
        self.clear_marks();
        if let Some(start) = self.start_state() {
            self.mark_reachable_from_here(start);
        }
        let entries: Vec<StateId> = self.entry_points().values().copied().collect();
        for state in entries {
            self.mark_reachable_from_here(state);
        }
        let doomed: Vec<StateId> = self
            .states()
            .into_iter()
            .filter(|&s| !self.st(s).is_marked())
            .collect();
        let removed = doomed.len();
        for state in doomed {
            self.detach_state(state);
        }
        self.clear_marks();
        if removed > 0 {
            debug!(removed, remaining = self.state_count(), "unreachable states removed");
        }
    }

    /// Remove states with no path to any final state.
    pub fn remove_dead_end_states(&mut self) {
        self.clear_marks();
        let fins = self.fin_states().to_vec();
        for fin in fins {
            self.mark_reachable_from_here_reverse(fin);
        }
        let doomed: Vec<StateId> = self
            .states()
            .into_iter()
            .filter(|&s| !self.st(s).is_marked())
            .collect();
        let removed = doomed.len();
        for state in doomed {
            self.detach_state(state);
        }
        self.clear_marks();
        if removed > 0 {
            debug!(removed, remaining = self.state_count(), "dead end states removed");
        }
    }

    /// Delete everything parked on the misfit list. Detaching one misfit
    /// can orphan another; the loop drains until the list is empty.
    pub fn remove_misfits(&mut self) {
        let mut removed = 0usize;
        while let Some(&state) = self.misfit_list.last() {
            self.detach_state(state);
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, remaining = self.state_count(), "misfits removed");
        }
    }

    /*
     * Self-consistency checks.
     */

    /// Walk every state and check the structural invariants. Panics on
    /// violation; meant for tests and paranoid callers.
    pub fn verify_integrity(&self, ctx: &FsmCtx) {
        let key_ops = ctx.key_ops;
        for state in self.states() {
            // Out list: ranges non-empty, sorted, pairwise disjoint.
            let mut prev_high: Option<super::key::Key> = None;
            for &tid in &self.st(state).out {
                let trans = self.tr(tid);
                assert_eq!(trans.from, state, "transition from-state out of sync");
                assert!(
                    key_ops.le(trans.low, trans.high),
                    "empty transition range"
                );
                if let Some(ph) = prev_high {
                    assert!(
                        key_ops.lt(ph, trans.low),
                        "out list not sorted and disjoint"
                    );
                }
                prev_high = Some(trans.high);

                // Every target's in-list holds this transition exactly
                // once, and cond keys are unique and inside the space.
                match &trans.body {
                    TransBody::Plain(data) => {
                        if let Some(to) = data.to {
                            let count = self
                                .st(to)
                                .in_refs
                                .iter()
                                .filter(|r| **r == InRef::Plain(tid))
                                .count();
                            assert_eq!(count, 1, "in-list reference count wrong");
                        }
                    }
                    TransBody::Cond { space, conds } => {
                        let full = ctx.cond_space(*space).full_size();
                        let mut prev_vals = None;
                        for c in conds {
                            assert!(c.vals.0 < full, "cond key outside space");
                            if let Some(pv) = prev_vals {
                                assert!(pv < c.vals, "cond list not sorted unique");
                            }
                            prev_vals = Some(c.vals);
                            if let Some(to) = c.data.to {
                                let count = self
                                    .st(to)
                                    .in_refs
                                    .iter()
                                    .filter(|r| **r == InRef::Cond(tid, c.vals))
                                    .count();
                                assert_eq!(count, 1, "cond in-list reference count wrong");
                            }
                        }
                    }
                }
            }

            // Every in-list entry points back at this state.
            for r in &self.st(state).in_refs {
                let trans = self.tr(r.trans());
                let to = match r {
                    InRef::Plain(_) => trans.plain().expect("ref shape mismatch").to,
                    InRef::Cond(_, vals) => {
                        trans.cond(*vals).expect("ref shape mismatch").to
                    }
                };
                assert_eq!(to, Some(state), "in-list entry mistargeted");
            }

            // Finality flag and set agree.
            assert_eq!(
                self.st(state).is_final(),
                self.fin_states().binary_search(&state).is_ok(),
                "final flag and final set disagree"
            );
        }

        // Entry points name listed states that carry the id.
        for (&id, &state) in self.entry_points() {
            assert!(
                self.states().contains(&state),
                "entry state not on the state list"
            );
            assert!(
                self.has_entry_id(state, id),
                "entry id missing from state"
            );
        }

        if let Some(start) = self.start_state() {
            assert!(
                self.states().contains(&start) || self.misfit_list.contains(&start),
                "start state not on a list"
            );
        }
    }

    /// Verify that every state is forward-reachable from the start state
    /// or an entry point.
    pub fn verify_reachability(&mut self) {
        self.clear_marks();
        if let Some(start) = self.start_state() {
            self.mark_reachable_from_here(start);
        }
        let entries: Vec<StateId> = self.entry_points().values().copied().collect();
        for state in entries {
            self.mark_reachable_from_here(state);
        }
        for state in self.states() {
            assert!(self.st(state).is_marked(), "unreachable state in graph");
        }
        self.clear_marks();
    }

    /// Verify that every state reaches some final state.
    pub fn verify_no_dead_end_states(&mut self) {
        self.clear_marks();
        let fins = self.fin_states().to_vec();
        for fin in fins {
            self.mark_reachable_from_here_reverse(fin);
        }
        for state in self.states() {
            assert!(self.st(state).is_marked(), "dead end state in graph");
        }
        self.clear_marks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::key::{Key, KeyOps};

    fn ctx() -> FsmCtx {
        FsmCtx::new(KeyOps::unsigned_octet())
    }

    #[test]
    fn unreachable_states_are_removed() {
        let c = ctx();
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        let orphan = fsm.add_state();
        fsm.set_start_state(a);
        fsm.set_fin_state(b);
        fsm.attach_new_trans(c.key_ops, a, Some(b), Key(1), Key(1));
        fsm.attach_new_trans(c.key_ops, orphan, Some(b), Key(2), Key(2));
        fsm.remove_unreachable_states();
        assert_eq!(fsm.state_count(), 2);
        fsm.verify_reachability();
        fsm.verify_integrity(&c);
    }

    #[test]
    fn dead_end_states_are_removed() {
        let c = ctx();
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        let pit = fsm.add_state();
        fsm.set_start_state(a);
        fsm.set_fin_state(b);
        fsm.attach_new_trans(c.key_ops, a, Some(b), Key(1), Key(1));
        fsm.attach_new_trans(c.key_ops, a, Some(pit), Key(2), Key(2));
        fsm.remove_dead_end_states();
        assert_eq!(fsm.state_count(), 2);
        fsm.verify_no_dead_end_states();
        fsm.verify_integrity(&c);
    }

    #[test]
    fn misfit_removal_cascades() {
        let c = ctx();
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        fsm.set_start_state(a);
        fsm.set_misfit_accounting(true);
        // b is only reachable from c, and c from nothing.
        let b = fsm.add_state();
        let cc = fsm.add_state();
        fsm.attach_new_trans(c.key_ops, cc, Some(b), Key(1), Key(1));
        assert_eq!(fsm.misfit_list.len(), 1);
        fsm.remove_misfits();
        assert_eq!(fsm.state_count(), 1);
        assert!(fsm.misfit_list.is_empty());
    }
}
