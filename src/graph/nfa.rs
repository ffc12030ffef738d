//! NFA-preserving operators.
//!
//! Unlike the determinizing operators, these wire machines together with
//! epsilon edges carrying push/pop action bookkeeping and leave the graph
//! marked as an NFA. A later determinization pass consumes the epsilon
//! edges by the usual fill-in route, treating epsilon closures as set
//! formation: push actions land on the transitions entering a drawn-in
//! branch, pop actions on the absorbing state's EOF table.

use tracing::debug;

use super::act::ActionId;
use super::ctx::FsmCtx;
use super::fsm::Fsm;
use super::merge::MergeData;
use super::state::{NfaActions, StateId};
use crate::FsmError;

/// Depth/group schedule for one round of NFA condition expansion, used
/// to bound iterated operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NfaRound {
    pub depth: i64,
    pub groups: i64,
}

pub type NfaRoundVect = Vec<NfaRound>;

impl Fsm {
    /// Record an NFA epsilon edge between two states. Repeated edges to
    /// the same target merge their bookkeeping tables.
    pub(crate) fn attach_to_nfa(&mut self, from: StateId, to: StateId, actions: NfaActions) {
        let fresh = !self.nfa_out_contains(from, to);
        self.push_nfa_out(from, to, actions);
        if fresh {
            self.push_nfa_in(to, from);
            if from != to {
                self.inc_foreign(to);
            }
        }
    }

    /// Union the operands without subset construction: a fresh start
    /// state grows an epsilon edge to every operand's old start, each
    /// carrying the push/pop bookkeeping. The graph is left marked NFA.
    pub fn nfa_union_op(
        &mut self,
        ctx: &mut FsmCtx,
        others: Vec<Fsm>,
        push: Option<ActionId>,
        pop: Option<ActionId>,
    ) -> Result<(), FsmError> {
        let mut starts: Vec<StateId> = Vec::with_capacity(others.len() + 1);
        starts.push(self.start_state().expect("operand has no start state"));
        self.unset_start_state();
        for mut other in others {
            let old = other.start_state().expect("operand has no start state");
            other.unset_start_state();
            let map = self.import(other);
            starts.push(map[old.index()].expect("start state not imported"));
        }

        let new_start = self.add_state();
        for s in &starts {
            let mut actions = NfaActions::default();
            if let Some(a) = push {
                actions.push.set_action(0, a);
                ctx.action_mut(a).num_nfa_refs += 1;
            }
            if let Some(a) = pop {
                actions.pop.set_action(0, a);
                ctx.action_mut(a).num_nfa_refs += 1;
            }
            self.attach_to_nfa(new_start, *s, actions);
        }
        self.set_start_state(new_start);
        self.mark_nfa_state(new_start);
        if ctx.state_limit > 0 && self.state_count() as i64 > ctx.state_limit {
            return Err(FsmError::TooManyStates);
        }
        debug!(branches = starts.len(), "nfa union wired");
        Ok(())
    }

    /// NFA-style bounded repetition. The repeated machine is bracketed
    /// by a fresh start and final state; `init` runs on entry, `max`
    /// guards re-entry, `min` guards the exit edge, and `push`/`pop`
    /// bracket each round.
    pub fn nfa_repeat_op(
        &mut self,
        ctx: &mut FsmCtx,
        init: ActionId,
        min: ActionId,
        max: ActionId,
        push: ActionId,
        pop: ActionId,
    ) -> Result<(), FsmError> {
        let prev_start = self.start_state().expect("machine has no start state");
        // A repetition of a machine that accepts without consuming can
        // loop forever on the empty string.
        if ctx.nfa_term_check && self.is_final(prev_start) {
            return Err(FsmError::Repetition);
        }
        self.unset_start_state();

        let new_start = self.add_state();
        let mut enter = NfaActions::default();
        enter.push.set_action(0, push);
        enter.push.set_action(1, init);
        enter.pop.set_action(0, pop);
        ctx.action_mut(push).num_nfa_refs += 1;
        ctx.action_mut(init).num_nfa_refs += 1;
        ctx.action_mut(pop).num_nfa_refs += 1;
        self.attach_to_nfa(new_start, prev_start, enter);
        self.set_start_state(new_start);

        let new_final = self.add_state();
        for fin in self.fin_states().to_vec() {
            let mut again = NfaActions::default();
            again.push.set_action(0, push);
            again.push.set_action(1, max);
            again.pop.set_action(0, pop);
            ctx.action_mut(push).num_nfa_refs += 1;
            ctx.action_mut(max).num_nfa_refs += 1;
            ctx.action_mut(pop).num_nfa_refs += 1;
            self.attach_to_nfa(fin, prev_start, again);

            let mut leave = NfaActions::default();
            leave.push.set_action(0, min);
            ctx.action_mut(min).num_nfa_refs += 1;
            self.attach_to_nfa(fin, new_final, leave);

            self.unset_fin_state(fin);
            self.mark_nfa_state(fin);
        }
        self.set_fin_state(new_final);
        self.mark_nfa_state(new_start);
        self.mark_nfa_state(new_final);
        Ok(())
    }

    /// Put every state carrying NFA edges on the NFA list with its
    /// representative bit set, ready for a fill-in round.
    pub fn prepare_nfa_round(&mut self) {
        for state in self.states() {
            if !self.nfa_out_of(state).is_empty() && !self.on_nfa_list(state) {
                self.mark_nfa_state(state);
            }
        }
    }

    /// Consume the NFA epsilon edges by drawing each branch into the
    /// state that owns the edge, bounded by the round schedule. After
    /// the rounds the machine is an ordinary graph again.
    pub fn nfa_fill_in_states(
        &mut self,
        ctx: &mut FsmCtx,
        rounds: &NfaRoundVect,
    ) -> Result<(), FsmError> {
        let depth_bound: i64 = rounds.iter().map(|r| r.depth).max().unwrap_or(1).max(1);
        self.set_misfit_accounting(true);
        let mut md = MergeData::default();
        for _round in 0..depth_bound {
            let worklist = self.take_nfa_list();
            if worklist.is_empty() {
                break;
            }
            for state in worklist {
                if !self.state_alive(state) {
                    continue;
                }
                // Drain to closure: drawing a branch whose head is
                // itself an NFA state copies that head's epsilon edges
                // up with combined bookkeeping, so they are consumed
                // here too. Each target is drawn at most once.
                let mut drawn: Vec<StateId> = Vec::new();
                loop {
                    let edges = self.take_nfa_out(state);
                    let mut progressed = false;
                    for (targ, actions) in edges {
                        if drawn.contains(&targ) {
                            continue;
                        }
                        drawn.push(targ);
                        progressed = true;

                        let nested = self.nfa_out_of(targ).to_vec();
                        for (t2, a2) in nested {
                            if t2 == state || drawn.contains(&t2) {
                                continue;
                            }
                            let mut acts = NfaActions::default();
                            acts.push = actions.push.clone();
                            acts.push.set_actions(&a2.push);
                            acts.pop = actions.pop.clone();
                            acts.pop.set_actions(&a2.pop);
                            self.attach_to_nfa(state, t2, acts);
                        }

                        // Draw the branch in through a shadow so the
                        // push bookkeeping lands only on the branch's
                        // own transitions.
                        let shadow = self.add_state();
                        self.merge_states(ctx, &mut md, shadow, targ)?;
                        if !actions.push.is_empty() {
                            let out = self.out_trans(shadow).to_vec();
                            for tid in out {
                                for el in actions.push.els().to_vec() {
                                    self.embed_action_on_trans(tid, el.ordering, el.action);
                                }
                            }
                        }
                        self.merge_states(ctx, &mut md, state, shadow)?;
                        if !actions.pop.is_empty() {
                            self.merge_pop_into_eof(state, &actions.pop);
                        }
                    }
                    if !progressed {
                        break;
                    }
                }
                self.clear_nfa_bit(state);
            }
            self.fill_in_states(ctx, &mut md)?;
            // States created by the fill may themselves carry NFA edges
            // drawn in from members; queue them for the next round.
            self.prepare_nfa_round();
        }
        self.finalize_nfa_round();
        self.remove_misfits();
        self.set_misfit_accounting(false);
        Ok(())
    }

    /// Drop any remaining NFA structure, returning the graph to ordinary
    /// form.
    pub fn finalize_nfa_round(&mut self) {
        for state in self.states() {
            let edges = self.take_nfa_out(state);
            drop(edges);
            self.clear_nfa_bit(state);
        }
        self.take_nfa_list();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::act::{InlineRef, InputLoc};
    use crate::graph::key::{Key, KeyOps};

    fn ctx() -> FsmCtx {
        FsmCtx::new(KeyOps::unsigned_octet())
    }

    #[test]
    fn nfa_union_wires_epsilon_edges() {
        let mut c = ctx();
        let a = Fsm::concat_fsm_char(&c, Key(b'a' as i64));
        let b = Fsm::concat_fsm_char(&c, Key(b'b' as i64));
        let mut m = a;
        m.nfa_union_op(&mut c, vec![b], None, None).unwrap();
        let start = m.start_state().unwrap();
        assert_eq!(m.nfa_out_of(start).len(), 2);
        assert!(m.on_nfa_list(start));
        // No subset construction happened: both branches keep their own
        // states.
        assert_eq!(m.state_count(), 5);
    }

    #[test]
    fn nfa_fill_in_consumes_epsilon_edges() {
        let mut c = ctx();
        let a = Fsm::concat_fsm_char(&c, Key(b'a' as i64));
        let b = Fsm::concat_fsm_char(&c, Key(b'b' as i64));
        let mut m = a;
        m.nfa_union_op(&mut c, vec![b], None, None).unwrap();
        m.nfa_fill_in_states(&mut c, &vec![NfaRound { depth: 1, groups: 1 }])
            .unwrap();
        let start = m.start_state().unwrap();
        assert!(m.nfa_out_of(start).is_empty());
        // The start now matches both branches directly.
        assert_eq!(m.out_trans(start).len(), 2);
    }

    #[test]
    fn nfa_repeat_checks_termination() {
        let mut c = ctx();
        c.nfa_term_check = true;
        let init = c.add_action(InputLoc::default(), "init", InlineRef(0));
        let min = c.add_action(InputLoc::default(), "min", InlineRef(1));
        let max = c.add_action(InputLoc::default(), "max", InlineRef(2));
        let push = c.add_action(InputLoc::default(), "push", InlineRef(3));
        let pop = c.add_action(InputLoc::default(), "pop", InlineRef(4));
        let mut m = Fsm::lambda_fsm();
        match m.nfa_repeat_op(&mut c, init, min, max, push, pop) {
            Err(FsmError::Repetition) => {}
            other => panic!("expected Repetition, got {:?}", other),
        }
    }
}
