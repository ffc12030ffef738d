//! Primitive constructors and the algebraic operators.
//!
//! Constructors build trivial machines; operators mutate the left operand
//! in place and consume the right one (its states migrate into the left's
//! storage, its shell is dropped). Union, intersection and subtraction
//! share one worker that merges the two start states and determinizes by
//! subset construction; intersection and subtraction steer it with
//! provenance bits on the final states.

use super::ctx::FsmCtx;
use super::fsm::Fsm;
use super::key::Key;
use super::merge::MergeData;
use super::state::{StateId, SB_BOTH, SB_GRAPH1, SB_GRAPH2};
use crate::FsmError;

impl Fsm {
    /*
     * Building basic machines.
     */

    /// A machine matching the single key `c`.
    pub fn concat_fsm_char(ctx: &FsmCtx, c: Key) -> Fsm {
        Fsm::concat_fsm(ctx, &[c])
    }

    /// A machine matching the keys of `str` in sequence.
    pub fn concat_fsm(ctx: &FsmCtx, str: &[Key]) -> Fsm {
        let mut fsm = Fsm::new();
        let mut last = fsm.add_state();
        fsm.set_start_state(last);
        for &c in str {
            let next = fsm.add_state();
            fsm.attach_new_trans(ctx.key_ops, last, Some(next), c, c);
            last = next;
        }
        fsm.set_fin_state(last);
        fsm
    }

    /// Case-insensitive version of [`Fsm::concat_fsm`]: each step matches
    /// the key and its opposite-case partner.
    pub fn concat_fsm_ci(ctx: &FsmCtx, str: &[Key]) -> Fsm {
        let mut fsm = Fsm::new();
        let mut last = fsm.add_state();
        fsm.set_start_state(last);
        for &c in str {
            let next = fsm.add_state();
            let mut keys: Vec<Key> = vec![c];
            if c.is_ascii_upper() {
                keys.push(c.to_ascii_lower());
            } else if c.is_ascii_lower() {
                keys.push(c.to_ascii_upper());
            }
            keys.sort_by(|&a, &b| ctx.key_ops.cmp(a, b));
            for k in keys {
                fsm.attach_new_trans(ctx.key_ops, last, Some(next), k, k);
            }
            last = next;
        }
        fsm.set_fin_state(last);
        fsm
    }

    /// A machine matching any one key of `set`.
    pub fn or_fsm(ctx: &FsmCtx, set: &[Key]) -> Fsm {
        let mut fsm = Fsm::new();
        let start = fsm.add_state();
        let fin = fsm.add_state();
        fsm.set_start_state(start);
        fsm.set_fin_state(fin);
        let mut keys: Vec<Key> = set.to_vec();
        keys.sort_by(|&a, &b| ctx.key_ops.cmp(a, b));
        keys.dedup();
        for k in keys {
            fsm.attach_new_trans(ctx.key_ops, start, Some(fin), k, k);
        }
        fsm
    }

    /// A machine matching one key in `[low, high]`.
    pub fn range_fsm(ctx: &FsmCtx, low: Key, high: Key) -> Result<Fsm, FsmError> {
        if ctx.key_ops.lt(high, low) {
            return Err(FsmError::TransDensity);
        }
        let mut fsm = Fsm::new();
        let start = fsm.add_state();
        let fin = fsm.add_state();
        fsm.set_start_state(start);
        fsm.set_fin_state(fin);
        fsm.attach_new_trans(ctx.key_ops, start, Some(fin), low, high);
        Ok(fsm)
    }

    /// A machine matching any number of keys in `[low, high]`: one final
    /// start state with a self loop.
    pub fn range_star_fsm(ctx: &FsmCtx, low: Key, high: Key) -> Result<Fsm, FsmError> {
        if ctx.key_ops.lt(high, low) {
            return Err(FsmError::TransDensity);
        }
        let mut fsm = Fsm::new();
        let start = fsm.add_state();
        fsm.set_start_state(start);
        fsm.set_fin_state(start);
        fsm.attach_new_trans(ctx.key_ops, start, Some(start), low, high);
        Ok(fsm)
    }

    /// The machine of the empty language: a lone non-final start state.
    pub fn empty_fsm() -> Fsm {
        let mut fsm = Fsm::new();
        let start = fsm.add_state();
        fsm.set_start_state(start);
        fsm
    }

    /// The machine of the empty string: a lone final start state.
    pub fn lambda_fsm() -> Fsm {
        let mut fsm = Fsm::new();
        let start = fsm.add_state();
        fsm.set_start_state(start);
        fsm.set_fin_state(start);
        fsm
    }

    /*
     * Kleene star and repetition.
     */

    /// Zero or more repetitions, in place. The start state is isolated,
    /// made final, and every final state is merged with it.
    pub fn star_op(&mut self, ctx: &mut FsmCtx) -> Result<(), FsmError> {
        self.set_misfit_accounting(true);
        self.isolate_start_state(ctx)?;
        let start = self.start_state().expect("machine has no start state");
        let mut md = MergeData::default();
        // Merge the start into the other final states first; merging it
        // with itself while its transitions are being doubled up would
        // leak the duplicates into states that follow it in the set.
        let fins = self.fin_states().to_vec();
        for fin in fins {
            if fin != start {
                self.merge_states_leaving(ctx, &mut md, fin, start)?;
            }
        }
        if self.fin_states().binary_search(&start).is_ok() {
            self.merge_states_leaving(ctx, &mut md, start, start)?;
        }
        self.set_fin_state(start);
        self.fill_in_states(ctx, &mut md)?;
        self.remove_misfits();
        self.set_misfit_accounting(false);
        Ok(())
    }

    /// Exactly `times` repetitions. Zero repetitions is the empty-string
    /// machine; a negative count is a repetition error.
    pub fn repeat_op(&mut self, ctx: &mut FsmCtx, times: i32) -> Result<(), FsmError> {
        if times < 0 {
            return Err(FsmError::Repetition);
        }
        if times == 0 {
            *self = Fsm::lambda_fsm();
            return Ok(());
        }
        let mut copy_from = self.duplicate();
        for _ in 1..times {
            let dup = copy_from.duplicate();
            self.do_concat(ctx, dup, None, false)?;
        }
        Ok(())
    }

    /// Up to `times` repetitions, including none.
    pub fn optional_repeat_op(&mut self, ctx: &mut FsmCtx, times: i32) -> Result<(), FsmError> {
        if times < 0 {
            return Err(FsmError::Repetition);
        }
        if times == 0 {
            *self = Fsm::lambda_fsm();
            return Ok(());
        }
        let mut copy_from = self.duplicate();
        // Track the frontier (final states of the most recent copy) with
        // the provenance bits; each new copy concatenates optionally off
        // the frontier so every prefix count stays accepting.
        self.set_fin_bits(SB_GRAPH1);
        for _ in 1..times {
            let mut dup = copy_from.duplicate();
            dup.set_fin_bits(SB_GRAPH2);
            let frontier: Vec<StateId> = self
                .fin_states()
                .iter()
                .copied()
                .filter(|&s| self.state_bits(s) & SB_GRAPH1 != 0)
                .collect();
            self.unset_fin_bits(SB_GRAPH1);
            self.do_concat(ctx, dup, Some(frontier), true)?;
            self.shift_graph2_to_graph1();
        }
        self.unset_fin_bits(SB_BOTH);
        // Zero repetitions accept too.
        self.isolate_start_state(ctx)?;
        let start = self.start_state().expect("machine has no start state");
        self.set_fin_state(start);
        Ok(())
    }

    fn shift_graph2_to_graph1(&mut self) {
        for state in self.states() {
            let bits = self.state_bits(state);
            if bits & SB_GRAPH2 != 0 {
                self.set_state_bits(state, (bits & !SB_GRAPH2) | SB_GRAPH1);
            }
        }
    }

    /*
     * Concatenation.
     */

    /// Concatenate `other` onto this machine. `other` is consumed.
    pub fn concat_op(&mut self, ctx: &mut FsmCtx, other: Fsm) -> Result<(), FsmError> {
        self.do_concat(ctx, other, None, false)
    }

    /// Worker for concatenation. `from_states` is the set of states the
    /// other machine is drawn in from, defaulting to the final states.
    /// When `optional`, this machine's final states stay final.
    pub(crate) fn do_concat(
        &mut self,
        ctx: &mut FsmCtx,
        mut other: Fsm,
        from_states: Option<Vec<StateId>>,
        optional: bool,
    ) -> Result<(), FsmError> {
        self.set_misfit_accounting(true);
        other.set_misfit_accounting(true);

        let other_start_old = other.start_state().expect("operand has no start state");
        other.unset_start_state();
        let other_fins_old = other.fin_states().to_vec();
        let map = self.import(other);
        let other_start = map[other_start_old.index()].expect("start state not imported");

        let from_states = match from_states {
            Some(set) => set,
            None => self.fin_states().to_vec(),
        };

        if !optional {
            self.unset_all_fin_states();
        }
        for fin in other_fins_old {
            let mapped = map[fin.index()].expect("final state not imported");
            self.set_fin_state(mapped);
        }

        let mut md = MergeData::default();
        for state in from_states {
            self.merge_states_leaving(ctx, &mut md, state, other_start)?;
            // A former final state that did not get finality back has no
            // further use for its pending out data.
            if !self.is_final(state) {
                self.clear_out_data(state);
            }
        }
        self.fill_in_states(ctx, &mut md)?;
        self.remove_misfits();
        self.set_misfit_accounting(false);
        Ok(())
    }

    /*
     * Union, intersection, subtraction.
     */

    /// Union with `other`, determinized. `other` is consumed.
    pub fn union_op(&mut self, ctx: &mut FsmCtx, mut other: Fsm) -> Result<(), FsmError> {
        ctx.set_union_op(true);
        self.set_misfit_accounting(true);
        other.set_misfit_accounting(true);
        let result = self.do_or(ctx, other);
        if result.is_ok() {
            self.remove_misfits();
        }
        self.set_misfit_accounting(false);
        ctx.set_union_op(false);
        result
    }

    /// Intersection with `other`. Both operands' final states are tagged
    /// with a provenance bit; only combined states carrying both stay
    /// final.
    pub fn intersect_op(&mut self, ctx: &mut FsmCtx, mut other: Fsm) -> Result<(), FsmError> {
        self.set_misfit_accounting(true);
        other.set_misfit_accounting(true);
        self.set_fin_bits(SB_GRAPH1);
        other.set_fin_bits(SB_GRAPH2);
        let result = self.do_or(ctx, other);
        if result.is_ok() {
            self.unset_incomplete_finals();
            self.remove_misfits();
        }
        self.set_misfit_accounting(false);
        result?;
        self.remove_dead_end_states();
        self.unset_fin_bits(SB_BOTH);
        Ok(())
    }

    /// Subtraction of `other`'s language. Final states of `other` mark
    /// their combinations as killers; any final state carrying the mark
    /// is unset.
    pub fn subtract_op(&mut self, ctx: &mut FsmCtx, mut other: Fsm) -> Result<(), FsmError> {
        self.set_misfit_accounting(true);
        other.set_misfit_accounting(true);
        other.set_fin_bits(SB_GRAPH1);
        let result = self.do_or(ctx, other);
        if result.is_ok() {
            self.unset_killed_finals();
            self.remove_misfits();
        }
        self.set_misfit_accounting(false);
        result?;
        self.remove_dead_end_states();
        self.unset_fin_bits(SB_GRAPH1);
        Ok(())
    }

    /// Worker for the determinizing binary operators: merge the two
    /// start states into a fresh one and run the subset construction.
    fn do_or(&mut self, ctx: &mut FsmCtx, mut other: Fsm) -> Result<(), FsmError> {
        let my_start = self.start_state().expect("operand has no start state");
        let other_start_old = other.start_state().expect("operand has no start state");
        self.unset_start_state();
        other.unset_start_state();
        let map = self.import(other);
        let other_start = map[other_start_old.index()].expect("start state not imported");

        let new_start = self.add_state();
        self.set_start_state(new_start);
        let mut md = MergeData::default();
        self.merge_state_set(ctx, &mut md, new_start, &[my_start, other_start])?;
        self.fill_in_states(ctx, &mut md)
    }

    /*
     * Epsilon transitions and the join operator.
     */

    /// Add a pending epsilon transition out of every final state, naming
    /// the entry points to be drawn in.
    pub fn epsilon_trans(&mut self, id: i32) {
        for fin in self.fin_states().to_vec() {
            self.push_epsilon_id(fin, id);
        }
    }

    /// Resolve pending epsilon transitions by merging the named entry
    /// states' out transitions into each pending state.
    pub fn epsilon_op(&mut self, ctx: &mut FsmCtx) -> Result<(), FsmError> {
        self.set_misfit_accounting(true);
        for state in self.states() {
            self.set_owning_graph(state, 0);
        }
        let mut md = MergeData::default();
        self.resolve_epsilon_trans(ctx, &mut md)?;
        self.fill_in_states(ctx, &mut md)?;
        self.remove_misfits();
        self.set_misfit_accounting(false);
        Ok(())
    }

    /// Epsilon-join over named entry points: bring the other machines
    /// in, resolve pending epsilons, then rebuild the start and final
    /// states from the `start_id` and `final_id` entry points.
    pub fn join_op(
        &mut self,
        ctx: &mut FsmCtx,
        start_id: i32,
        final_id: i32,
        others: Vec<Fsm>,
    ) -> Result<(), FsmError> {
        self.unset_start_state();
        for state in self.states() {
            self.set_owning_graph(state, 0);
        }
        let mut graph_num = 1u32;
        for mut other in others {
            other.unset_start_state();
            let map = self.import(other);
            for mapped in map.into_iter().flatten() {
                self.set_owning_graph(mapped, graph_num);
            }
            graph_num += 1;
        }

        self.set_misfit_accounting(true);
        let mut md = MergeData::default();
        self.resolve_epsilon_trans(ctx, &mut md)?;

        let start_states: Vec<StateId> = self
            .states()
            .into_iter()
            .filter(|&s| self.has_entry_id(s, start_id))
            .collect();
        let new_start = self.add_state();
        self.set_start_state(new_start);
        self.merge_state_set(ctx, &mut md, new_start, &start_states)?;

        self.unset_all_fin_states();
        let final_states: Vec<StateId> = self
            .states()
            .into_iter()
            .filter(|&s| self.has_entry_id(s, final_id))
            .collect();
        for state in final_states {
            self.set_fin_state(state);
        }

        self.fill_in_states(ctx, &mut md)?;
        self.remove_misfits();
        self.set_misfit_accounting(false);
        Ok(())
    }

    /// Bring the other machines into this one without any merging. Entry
    /// points and final states are kept; start-state status is dropped.
    pub fn glob_op(&mut self, others: Vec<Fsm>) {
        for mut other in others {
            other.unset_start_state();
            self.import(other);
        }
    }

    /// Resolution worker: compute each pending state's epsilon closure
    /// over the entry-point graph, then merge the closure in.
    pub(crate) fn resolve_epsilon_trans(
        &mut self,
        ctx: &mut FsmCtx,
        md: &mut MergeData,
    ) -> Result<(), FsmError> {
        let pending: Vec<StateId> = self
            .states()
            .into_iter()
            .filter(|&s| !self.epsilon_ids(s).is_empty())
            .collect();
        for state in pending {
            self.clear_ept_vect(state);
            self.epsilon_fill_ept_vect_from(state, state, false);
            let vect = self.take_ept_vect(state);
            for (targ, leaving) in vect {
                if leaving {
                    self.merge_states_leaving(ctx, md, state, targ)?;
                } else {
                    self.merge_states(ctx, md, state, targ)?;
                }
            }
            self.clear_epsilon_ids(state);
        }
        Ok(())
    }

    /// Transitively collect the targets of a state's pending epsilons
    /// into its resolution vector, tracking whether each hop leaves the
    /// owning machine. The membership test breaks cycles.
    fn epsilon_fill_ept_vect_from(&mut self, root: StateId, from: StateId, parent_leaving: bool) {
        let ids = self.epsilon_ids(from).to_vec();
        for id in ids {
            let targets: Vec<StateId> = self
                .states()
                .into_iter()
                .filter(|&s| self.has_entry_id(s, id))
                .collect();
            for targ in targets {
                let leaving =
                    parent_leaving || self.owning_graph(targ) != self.owning_graph(root);
                if !self.in_ept_vect(root, targ) {
                    self.push_ept_vect(root, targ, leaving);
                    self.epsilon_fill_ept_vect_from(root, targ, leaving);
                }
            }
        }
    }
}
