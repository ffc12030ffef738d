//! The graph value and its housekeeping.
//!
//! A [`Fsm`] owns two slabs (states and transitions) plus the lists that
//! give them meaning: the main state list, the misfit list of states that
//! are currently unreachable but may be revived, the NFA list, the entry
//! point map, the start state and the final-state set.
//!
//! Attachment discipline: a transition is owned by its from state and
//! listed in its target's in-list exactly once. Start-state status and
//! entry-point registrations count as foreign in-references, which is what
//! lets misfit accounting park states the moment their last reference
//! goes away and revive them when one comes back.

use std::collections::BTreeMap;

use super::act::{ActionId, ActionTable, ErrActionTable, PriorId};
use super::cond::CondVals;
use super::ctx::FsmCtx;
use super::key::{Key, KeyOps};
use super::state::{
    InRef, Scratch, State, StateId, Trans, TransBody, TransData, TransId, SB_ISFINAL, SB_NFA_REP,
    SB_ONLIST,
};
use crate::FsmError;

/// Which states an embedding targets. One parameterized worker per
/// table covers the whole variant grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Embedding {
    Start,
    All,
    Final,
    NotStart,
    NotFinal,
    Middle,
}

/// A mutable automaton graph. All operators mutate in place; binary
/// operators consume their right operand. Copies are made with
/// [`Fsm::duplicate`].
#[derive(Default)]
pub struct Fsm {
    states: Vec<Option<State>>,
    free_states: Vec<StateId>,
    transs: Vec<Option<Trans>>,
    free_transs: Vec<TransId>,

    pub(crate) state_list: Vec<StateId>,
    pub(crate) misfit_list: Vec<StateId>,
    pub(crate) nfa_list: Vec<StateId>,

    pub(crate) entry_points: BTreeMap<i32, StateId>,
    pub(crate) start_state: Option<StateId>,
    pub(crate) fin_set: Vec<StateId>,

    pub(crate) misfit_accounting: bool,
}

impl Fsm {
    pub fn new() -> Fsm {
        Fsm::default()
    }

    /*
     * Slab access.
     */

    #[inline]
    pub(crate) fn st(&self, id: StateId) -> &State {
        self.states[id.index()].as_ref().unwrap()
    }

    #[inline]
    pub(crate) fn st_mut(&mut self, id: StateId) -> &mut State {
        self.states[id.index()].as_mut().unwrap()
    }

    #[inline]
    pub(crate) fn tr(&self, id: TransId) -> &Trans {
        self.transs[id.index()].as_ref().unwrap()
    }

    #[inline]
    pub(crate) fn tr_mut(&mut self, id: TransId) -> &mut Trans {
        self.transs[id.index()].as_mut().unwrap()
    }

    pub fn start_state(&self) -> Option<StateId> {
        self.start_state
    }

    pub fn fin_states(&self) -> &[StateId] {
        &self.fin_set
    }

    pub fn entry_points(&self) -> &BTreeMap<i32, StateId> {
        &self.entry_points
    }

    /// States on the main list, in list order.
    pub fn states(&self) -> Vec<StateId> {
        self.state_list.clone()
    }

    pub fn state_count(&self) -> usize {
        self.state_list.len()
    }

    pub fn is_final(&self, id: StateId) -> bool {
        self.st(id).is_final()
    }

    pub fn out_trans(&self, id: StateId) -> &[TransId] {
        &self.st(id).out
    }

    pub fn trans_keys(&self, id: TransId) -> (Key, Key) {
        let t = self.tr(id);
        (t.low, t.high)
    }

    pub fn trans_body(&self, id: TransId) -> &TransBody {
        &self.tr(id).body
    }

    pub(crate) fn state_bits(&self, id: StateId) -> u32 {
        self.st(id).bits
    }

    pub(crate) fn set_state_bits(&mut self, id: StateId, bits: u32) {
        self.st_mut(id).bits = bits;
    }

    pub(crate) fn has_entry_id(&self, id: StateId, entry: i32) -> bool {
        self.st(id).entry_ids.binary_search(&entry).is_ok()
    }

    pub(crate) fn epsilon_ids(&self, id: StateId) -> &[i32] {
        &self.st(id).epsilon_ids
    }

    pub(crate) fn push_epsilon_id(&mut self, id: StateId, entry: i32) {
        let eps = &mut self.st_mut(id).epsilon_ids;
        if let Err(pos) = eps.binary_search(&entry) {
            eps.insert(pos, entry);
        }
    }

    pub(crate) fn clear_epsilon_ids(&mut self, id: StateId) {
        self.st_mut(id).epsilon_ids.clear();
    }

    pub(crate) fn owning_graph(&self, id: StateId) -> u32 {
        self.st(id).owning_graph
    }

    pub(crate) fn set_owning_graph(&mut self, id: StateId, graph: u32) {
        self.st_mut(id).owning_graph = graph;
    }

    pub(crate) fn state_alive(&self, id: StateId) -> bool {
        self.states.get(id.index()).map_or(false, |s| s.is_some())
    }

    pub(crate) fn nfa_out_of(&self, id: StateId) -> &[(StateId, super::state::NfaActions)] {
        &self.st(id).nfa_out
    }

    pub(crate) fn nfa_out_contains(&self, from: StateId, to: StateId) -> bool {
        self.st(from).nfa_out.binary_search_by_key(&to, |el| el.0).is_ok()
    }

    pub(crate) fn push_nfa_out(&mut self, from: StateId, to: StateId, actions: super::state::NfaActions) {
        self.st_mut(from).insert_nfa_out(to, actions);
    }

    pub(crate) fn push_nfa_in(&mut self, to: StateId, from: StateId) {
        self.st_mut(to).nfa_in.push(from);
    }

    /// Remove and return a state's NFA edges, unlinking the targets'
    /// back-references.
    pub(crate) fn take_nfa_out(&mut self, id: StateId) -> Vec<(StateId, super::state::NfaActions)> {
        let edges = std::mem::take(&mut self.st_mut(id).nfa_out);
        for (to, _) in &edges {
            if let Some(pos) = self.st(*to).nfa_in.iter().position(|&s| s == id) {
                self.st_mut(*to).nfa_in.remove(pos);
                if *to != id {
                    self.dec_foreign(*to);
                }
            }
        }
        edges
    }

    pub(crate) fn mark_nfa_state(&mut self, id: StateId) {
        if self.st(id).bits & SB_NFA_REP == 0 {
            self.st_mut(id).bits |= SB_NFA_REP;
            self.nfa_list.push(id);
        }
    }

    pub(crate) fn on_nfa_list(&self, id: StateId) -> bool {
        self.st(id).bits & SB_NFA_REP != 0
    }

    pub(crate) fn take_nfa_list(&mut self) -> Vec<StateId> {
        std::mem::take(&mut self.nfa_list)
    }

    pub(crate) fn clear_nfa_bit(&mut self, id: StateId) {
        self.st_mut(id).bits &= !SB_NFA_REP;
    }

    pub(crate) fn merge_pop_into_eof(&mut self, id: StateId, pop: &ActionTable) {
        self.st_mut(id).eof_actions.set_actions(pop);
    }

    pub(crate) fn clear_ept_vect(&mut self, id: StateId) {
        self.st_mut(id).ept_vect.clear();
    }

    pub(crate) fn take_ept_vect(&mut self, id: StateId) -> Vec<(StateId, bool)> {
        std::mem::take(&mut self.st_mut(id).ept_vect)
    }

    pub(crate) fn in_ept_vect(&self, id: StateId, targ: StateId) -> bool {
        self.st(id).ept_vect.iter().any(|&(t, _)| t == targ)
    }

    pub(crate) fn push_ept_vect(&mut self, id: StateId, targ: StateId, leaving: bool) {
        self.st_mut(id).ept_vect.push((targ, leaving));
    }

    /*
     * Allocation.
     */

    fn alloc_state_slot(&mut self) -> StateId {
        match self.free_states.pop() {
            Some(id) => {
                self.states[id.index()] = Some(State::default());
                id
            }
            None => {
                let id = StateId(self.states.len() as u32);
                self.states.push(Some(State::default()));
                id
            }
        }
    }

    /// New up a state and add it to the graph. Under misfit accounting
    /// the state starts on the misfit list until something references it.
    /// The on-list bit tracks main-list membership.
    pub fn add_state(&mut self) -> StateId {
        let id = self.alloc_state_slot();
        if self.misfit_accounting {
            self.misfit_list.push(id);
        } else {
            self.state_list.push(id);
            self.st_mut(id).bits |= SB_ONLIST;
        }
        id
    }

    fn alloc_trans(&mut self, trans: Trans) -> TransId {
        match self.free_transs.pop() {
            Some(id) => {
                self.transs[id.index()] = Some(trans);
                id
            }
            None => {
                let id = TransId(self.transs.len() as u32);
                self.transs.push(Some(trans));
                id
            }
        }
    }

    pub(crate) fn free_trans(&mut self, id: TransId) {
        self.transs[id.index()] = None;
        self.free_transs.push(id);
    }

    /*
     * Foreign-reference accounting. Moving between the main and misfit
     * lists happens exactly on the 0 <-> 1 edges; the on-list bit says
     * which list a state is on without scanning both.
     */

    pub(crate) fn inc_foreign(&mut self, id: StateId) {
        if self.misfit_accounting
            && self.st(id).foreign_in_refs == 0
            && self.st(id).bits & SB_ONLIST == 0
        {
            let pos = self
                .misfit_list
                .iter()
                .position(|&s| s == id)
                .expect("state missing from misfit list");
            self.misfit_list.remove(pos);
            self.state_list.push(id);
            self.st_mut(id).bits |= SB_ONLIST;
        }
        self.st_mut(id).foreign_in_refs += 1;
    }

    pub(crate) fn dec_foreign(&mut self, id: StateId) {
        self.st_mut(id).foreign_in_refs -= 1;
        if self.st(id).foreign_in_refs == 0
            && self.misfit_accounting
            && self.st(id).bits & SB_ONLIST != 0
        {
            let pos = self
                .state_list
                .iter()
                .position(|&s| s == id)
                .expect("state missing from state list");
            self.state_list.remove(pos);
            self.misfit_list.push(id);
            self.st_mut(id).bits &= !SB_ONLIST;
        }
    }

    /*
     * Attaching and detaching.
     */

    fn attach_to_in_list(&mut self, from: StateId, to: StateId, in_ref: InRef) {
        if from != to {
            self.inc_foreign(to);
        }
        self.st_mut(to).in_refs.push(in_ref);
    }

    fn detach_from_in_list(&mut self, from: StateId, to: StateId, in_ref: InRef) {
        let refs = &mut self.st_mut(to).in_refs;
        let pos = refs
            .iter()
            .position(|r| *r == in_ref)
            .expect("transition missing from in-list");
        refs.remove(pos);
        if from != to {
            self.dec_foreign(to);
        }
    }

    /// Point an existing plain transition at `to` and record the back
    /// reference.
    pub(crate) fn attach_trans(&mut self, from: StateId, to: StateId, tid: TransId) {
        let data = self.tr_mut(tid).plain_mut().expect("attach on cond trans");
        debug_assert!(data.to.is_none());
        data.to = Some(to);
        self.attach_to_in_list(from, to, InRef::Plain(tid));
    }

    pub(crate) fn detach_trans(&mut self, from: StateId, to: StateId, tid: TransId) {
        let data = self.tr_mut(tid).plain_mut().expect("detach on cond trans");
        debug_assert_eq!(data.to, Some(to));
        data.to = None;
        self.detach_from_in_list(from, to, InRef::Plain(tid));
    }

    pub(crate) fn attach_cond(&mut self, from: StateId, to: StateId, tid: TransId, vals: CondVals) {
        let data = self.tr_mut(tid).cond_mut(vals).expect("no such cond key");
        debug_assert!(data.to.is_none());
        data.to = Some(to);
        self.attach_to_in_list(from, to, InRef::Cond(tid, vals));
    }

    pub(crate) fn detach_cond(&mut self, from: StateId, to: StateId, tid: TransId, vals: CondVals) {
        let data = self.tr_mut(tid).cond_mut(vals).expect("no such cond key");
        debug_assert_eq!(data.to, Some(to));
        data.to = None;
        self.detach_from_in_list(from, to, InRef::Cond(tid, vals));
    }

    /// Allocate a plain transition over `[low, high]`, link it between
    /// `from` and `to`, and insert it into `from`'s out list in key order.
    pub fn attach_new_trans(
        &mut self,
        key_ops: KeyOps,
        from: StateId,
        to: Option<StateId>,
        low: Key,
        high: Key,
    ) -> TransId {
        let tid = self.alloc_trans(Trans {
            from,
            low,
            high,
            body: TransBody::Plain(TransData::default()),
        });
        if let Some(to) = to {
            self.attach_trans(from, to, tid);
        }
        self.out_list_insert(key_ops, from, tid);
        tid
    }

    /// Add a sub-transition keyed by `vals` to an existing conditional
    /// transition, linked to `to`. The key must not be taken.
    pub fn attach_new_cond(
        &mut self,
        from: StateId,
        to: Option<StateId>,
        tid: TransId,
        vals: CondVals,
    ) {
        match &mut self.tr_mut(tid).body {
            TransBody::Cond { conds, .. } => {
                let pos = conds
                    .binary_search_by_key(&vals, |c| c.vals)
                    .expect_err("cond key already present");
                conds.insert(
                    pos,
                    super::state::CondTarget {
                        vals,
                        data: TransData::default(),
                    },
                );
            }
            TransBody::Plain(_) => panic!("attach_new_cond on plain trans"),
        }
        if let Some(to) = to {
            self.attach_cond(from, to, tid, vals);
        }
    }

    /// Insert an already-built transition into its from state's out list,
    /// keeping the list sorted by low key.
    pub(crate) fn out_list_insert(&mut self, key_ops: KeyOps, state: StateId, tid: TransId) {
        let low = self.tr(tid).low;
        let out = &self.st(state).out;
        let pos = out.partition_point(|&t| key_ops.lt(self.tr(t).low, low));
        self.st_mut(state).out.insert(pos, tid);
    }

    /// Deep-copy a transition for `from`, re-attaching every target. The
    /// copy shares nothing with the source but its targets.
    pub(crate) fn dup_trans(&mut self, from: StateId, src: TransId) -> TransId {
        let src_trans = self.tr(src).clone();
        let body = match src_trans.body {
            TransBody::Plain(ref data) => TransBody::Plain(data.dup_tables()),
            TransBody::Cond { space, ref conds } => TransBody::Cond {
                space,
                conds: conds
                    .iter()
                    .map(|c| super::state::CondTarget {
                        vals: c.vals,
                        data: c.data.dup_tables(),
                    })
                    .collect(),
            },
        };
        let tid = self.alloc_trans(Trans {
            from,
            low: src_trans.low,
            high: src_trans.high,
            body,
        });
        // Re-establish targets through the attach path so in-lists and
        // foreign counts stay right.
        match &src_trans.body {
            TransBody::Plain(data) => {
                if let Some(to) = data.to {
                    self.attach_trans(from, to, tid);
                }
                let dst = self.tr_mut(tid).plain_mut().unwrap();
                dst.actions = data.actions.clone();
                dst.priors = data.priors.clone();
                dst.lm_actions = data.lm_actions.clone();
            }
            TransBody::Cond { conds, .. } => {
                for c in conds {
                    if let Some(to) = c.data.to {
                        self.attach_cond(from, to, tid, c.vals);
                    }
                    let dst = self.tr_mut(tid).cond_mut(c.vals).unwrap();
                    dst.actions = c.data.actions.clone();
                    dst.priors = c.data.priors.clone();
                    dst.lm_actions = c.data.lm_actions.clone();
                }
            }
        }
        tid
    }

    /// Fully detach a transition from its targets and release it. The
    /// caller removes it from the out list.
    pub(crate) fn detach_and_free_trans(&mut self, tid: TransId) {
        let from = self.tr(tid).from;
        match self.tr(tid).body.clone() {
            TransBody::Plain(data) => {
                if let Some(to) = data.to {
                    self.detach_trans(from, to, tid);
                }
            }
            TransBody::Cond { conds, .. } => {
                for c in &conds {
                    if let Some(to) = c.data.to {
                        self.detach_cond(from, to, tid, c.vals);
                    }
                }
            }
        }
        self.free_trans(tid);
    }

    /// Detach a state from everything: its out transitions are freed, its
    /// in transitions become error transitions, and it leaves every list.
    /// The slab slot is recycled.
    pub(crate) fn detach_state(&mut self, id: StateId) {
        // Free the out transitions.
        let out = std::mem::take(&mut self.st_mut(id).out);
        for tid in out {
            self.detach_and_free_trans(tid);
        }

        // Redirect in transitions to the implicit error state.
        let in_refs = std::mem::take(&mut self.st_mut(id).in_refs);
        for in_ref in in_refs {
            let tid = in_ref.trans();
            let from = self.tr(tid).from;
            match in_ref {
                InRef::Plain(_) => {
                    let data = self.tr_mut(tid).plain_mut().unwrap();
                    data.to = None;
                }
                InRef::Cond(_, vals) => {
                    let data = self.tr_mut(tid).cond_mut(vals).unwrap();
                    data.to = None;
                }
            }
            if from != id {
                self.dec_foreign(id);
            }
        }

        // Drop NFA linkage in both directions.
        let nfa_out = std::mem::take(&mut self.st_mut(id).nfa_out);
        for (to, _) in nfa_out {
            if let Some(pos) = self.st(to).nfa_in.iter().position(|&s| s == id) {
                self.st_mut(to).nfa_in.remove(pos);
                if to != id {
                    self.dec_foreign(to);
                }
            }
        }
        let nfa_in = std::mem::take(&mut self.st_mut(id).nfa_in);
        for from in nfa_in {
            if let Ok(pos) = self.st(from).nfa_out.binary_search_by_key(&id, |el| el.0) {
                self.st_mut(from).nfa_out.remove(pos);
            }
        }

        // Membership cleanup.
        if self.start_state == Some(id) {
            self.start_state = None;
        }
        let entry_ids: Vec<i32> = self.st(id).entry_ids.to_vec();
        for en in entry_ids {
            if self.entry_points.get(&en) == Some(&id) {
                self.entry_points.remove(&en);
            }
        }
        if let Ok(pos) = self.fin_set.binary_search(&id) {
            self.fin_set.remove(pos);
        }
        if self.st(id).bits & SB_ONLIST != 0 {
            let pos = self
                .state_list
                .iter()
                .position(|&s| s == id)
                .expect("state missing from state list");
            self.state_list.remove(pos);
        } else {
            let pos = self
                .misfit_list
                .iter()
                .position(|&s| s == id)
                .expect("state missing from misfit list");
            self.misfit_list.remove(pos);
        }
        // The NFA list may be taken out for a fill round while the bit
        // is still set.
        if self.st(id).bits & SB_NFA_REP != 0 {
            if let Some(pos) = self.nfa_list.iter().position(|&s| s == id) {
                self.nfa_list.remove(pos);
            }
        }

        self.states[id.index()] = None;
        self.free_states.push(id);
    }

    /*
     * Start, entry and final state management.
     */

    pub fn set_start_state(&mut self, id: StateId) {
        assert!(self.start_state.is_none(), "start state already set");
        self.start_state = Some(id);
        self.inc_foreign(id);
    }

    pub fn unset_start_state(&mut self) {
        if let Some(id) = self.start_state.take() {
            self.dec_foreign(id);
        }
    }

    /// Register a named entry point.
    pub fn set_entry(&mut self, id: i32, state: StateId) {
        self.st_mut(state).insert_entry_id(id);
        if self.entry_points.insert(id, state).is_none() {
            self.inc_foreign(state);
        }
    }

    /// Move an entry registration from one state to another.
    pub fn change_entry(&mut self, id: i32, to: StateId, from: StateId) {
        if self.entry_points.get(&id) == Some(&from) {
            self.entry_points.insert(id, to);
            self.st_mut(from).remove_entry_id(id);
            self.st_mut(to).insert_entry_id(id);
            self.inc_foreign(to);
            self.dec_foreign(from);
        }
    }

    pub fn unset_entry(&mut self, id: i32) {
        if let Some(state) = self.entry_points.remove(&id) {
            self.st_mut(state).remove_entry_id(id);
            self.dec_foreign(state);
        }
    }

    pub fn unset_all_entry_points(&mut self) {
        let ids: Vec<i32> = self.entry_points.keys().copied().collect();
        for id in ids {
            self.unset_entry(id);
        }
    }

    /// Bring in another machine's entry points through a state map. On an
    /// id collision the existing registration wins.
    pub(crate) fn copy_in_entry_points(
        &mut self,
        other_entries: &BTreeMap<i32, StateId>,
        map: &[Option<StateId>],
    ) {
        for (&id, &old_state) in other_entries {
            let new_state = map[old_state.index()].expect("entry state not imported");
            if !self.entry_points.contains_key(&id) {
                self.entry_points.insert(id, new_state);
            }
        }
    }

    pub fn set_fin_state(&mut self, id: StateId) {
        if !self.st(id).is_final() {
            self.st_mut(id).bits |= SB_ISFINAL;
            if let Err(pos) = self.fin_set.binary_search(&id) {
                self.fin_set.insert(pos, id);
            }
        }
    }

    /// A state that stops being final no longer needs its pending out
    /// data.
    pub fn unset_fin_state(&mut self, id: StateId) {
        if self.st(id).is_final() {
            self.clear_out_data(id);
            self.st_mut(id).bits &= !SB_ISFINAL;
            if let Ok(pos) = self.fin_set.binary_search(&id) {
                self.fin_set.remove(pos);
            }
        }
    }

    /// Unset every final state, keeping pending out data. The concat
    /// worker still needs the out tables to transfer onto leaving
    /// transitions; it clears them itself for states that do not become
    /// final again.
    pub fn unset_all_fin_states(&mut self) {
        let fins = std::mem::take(&mut self.fin_set);
        for id in fins {
            self.st_mut(id).bits &= !SB_ISFINAL;
        }
    }

    /// Mark every final state with the given provenance bits.
    pub fn set_fin_bits(&mut self, bits: u32) {
        let fins = self.fin_set.clone();
        for id in fins {
            self.st_mut(id).bits |= bits;
        }
    }

    pub fn unset_fin_bits(&mut self, bits: u32) {
        for id in self.states() {
            self.st_mut(id).bits &= !bits;
        }
    }

    /// Unset final states missing either provenance bit. Worker for
    /// intersection.
    pub(crate) fn unset_incomplete_finals(&mut self) {
        let fins = self.fin_set.clone();
        for id in fins {
            let bits = self.st(id).bits;
            if bits & super::state::SB_GRAPH1 == 0 || bits & super::state::SB_GRAPH2 == 0 {
                self.unset_fin_state(id);
            }
        }
    }

    /// Unset final states carrying the killer bit. Worker for
    /// subtraction.
    pub(crate) fn unset_killed_finals(&mut self) {
        let fins = self.fin_set.clone();
        for id in fins {
            if self.st(id).bits & super::state::SB_GRAPH1 != 0 {
                self.unset_fin_state(id);
            }
        }
    }

    pub fn set_misfit_accounting(&mut self, on: bool) {
        self.misfit_accounting = on;
    }

    /*
     * Pending out data on final states.
     */

    pub(crate) fn has_out_data(&self, id: StateId) -> bool {
        let st = self.st(id);
        !st.out_actions.is_empty() || !st.out_priors.is_empty() || st.out_cond_space.is_some()
    }

    pub(crate) fn clear_out_data(&mut self, id: StateId) {
        let st = self.st_mut(id);
        st.out_actions.clear();
        st.out_priors.clear();
        st.out_cond_space = None;
        st.out_cond_vals.clear();
    }

    /// Apply `src`'s pending out actions and priorities to every
    /// non-error transition leaving `dest`.
    pub(crate) fn transfer_out_data(&mut self, ctx: &FsmCtx, dest: StateId, src: StateId) {
        let out_actions = self.st(src).out_actions.clone();
        let out_priors = self.st(src).out_priors.clone();
        let out = self.st(dest).out.clone();
        for tid in out {
            match &mut self.tr_mut(tid).body {
                TransBody::Plain(data) => {
                    if data.to.is_some() {
                        data.actions.set_actions(&out_actions);
                        data.priors.set_priors(ctx, &out_priors);
                    }
                }
                TransBody::Cond { conds, .. } => {
                    for c in conds.iter_mut() {
                        if c.data.to.is_some() {
                            c.data.actions.set_actions(&out_actions);
                            c.data.priors.set_priors(ctx, &out_priors);
                        }
                    }
                }
            }
        }
    }

    /*
     * Action binding.
     */

    fn embed_targets(&self, embedding: Embedding) -> Vec<StateId> {
        let start = self.start_state;
        match embedding {
            Embedding::Start => start.into_iter().collect(),
            Embedding::All => self.states(),
            Embedding::Final => self.fin_set.clone(),
            Embedding::NotStart => self
                .states()
                .into_iter()
                .filter(|&s| Some(s) != start)
                .collect(),
            Embedding::NotFinal => self
                .states()
                .into_iter()
                .filter(|&s| !self.st(s).is_final())
                .collect(),
            Embedding::Middle => self
                .states()
                .into_iter()
                .filter(|&s| Some(s) != start && !self.st(s).is_final())
                .collect(),
        }
    }

    pub(crate) fn embed_action_on_trans(&mut self, tid: TransId, ordering: i32, action: ActionId) {
        match &mut self.tr_mut(tid).body {
            TransBody::Plain(data) => data.actions.set_action(ordering, action),
            TransBody::Cond { conds, .. } => {
                for c in conds.iter_mut() {
                    c.data.actions.set_action(ordering, action);
                }
            }
        }
    }

    fn embed_prior_on_trans(&mut self, ctx: &FsmCtx, tid: TransId, ordering: i32, desc: PriorId) {
        match &mut self.tr_mut(tid).body {
            TransBody::Plain(data) => data.priors.set_prior(ctx, ordering, desc),
            TransBody::Cond { conds, .. } => {
                for c in conds.iter_mut() {
                    c.data.priors.set_prior(ctx, ordering, desc);
                }
            }
        }
    }

    /// Embed an action on every transition leaving the start state. The
    /// start state is isolated first so the embedding cannot leak into
    /// paths that re-enter it.
    pub fn start_fsm_action(
        &mut self,
        ctx: &mut FsmCtx,
        ordering: i32,
        action: ActionId,
    ) -> Result<(), FsmError> {
        self.isolate_start_state(ctx)?;
        let start = self.start_state.expect("machine has no start state");
        let out = self.st(start).out.clone();
        for tid in out {
            self.embed_action_on_trans(tid, ordering, action);
            ctx.action_mut(action).num_trans_refs += 1;
        }
        // A final start state will leave via future out transitions too.
        if self.st(start).is_final() {
            self.st_mut(start).out_actions.set_action(ordering, action);
        }
        Ok(())
    }

    /// Embed an action on every transition in the machine.
    pub fn all_trans_action(&mut self, ctx: &mut FsmCtx, ordering: i32, action: ActionId) {
        for state in self.states() {
            let out = self.st(state).out.clone();
            for tid in out {
                self.embed_action_on_trans(tid, ordering, action);
                ctx.action_mut(action).num_trans_refs += 1;
            }
        }
    }

    /// Embed an action on every transition into a final state.
    pub fn finish_fsm_action(&mut self, ctx: &mut FsmCtx, ordering: i32, action: ActionId) {
        let fins = self.fin_set.clone();
        for fin in fins {
            let in_refs = self.st(fin).in_refs.clone();
            for in_ref in in_refs {
                match in_ref {
                    InRef::Plain(tid) => {
                        let data = self.tr_mut(tid).plain_mut().unwrap();
                        data.actions.set_action(ordering, action);
                    }
                    InRef::Cond(tid, vals) => {
                        let data = self.tr_mut(tid).cond_mut(vals).unwrap();
                        data.actions.set_action(ordering, action);
                    }
                }
                ctx.action_mut(action).num_trans_refs += 1;
            }
        }
    }

    /// Embed a pending action on the final states, applied to any future
    /// transition leaving the machine.
    pub fn leave_fsm_action(&mut self, ctx: &mut FsmCtx, ordering: i32, action: ActionId) {
        let fins = self.fin_set.clone();
        for fin in fins {
            self.st_mut(fin).out_actions.set_action(ordering, action);
            ctx.action_mut(action).num_trans_refs += 1;
        }
    }

    /// Embed a longest-match part on every transition into a final state.
    pub fn long_match_action(&mut self, ordering: i32, part: super::act::LmPartId) {
        let fins = self.fin_set.clone();
        for fin in fins {
            let in_refs = self.st(fin).in_refs.clone();
            for in_ref in in_refs {
                match in_ref {
                    InRef::Plain(tid) => {
                        let data = self.tr_mut(tid).plain_mut().unwrap();
                        data.lm_actions.set_action(ordering, part);
                    }
                    InRef::Cond(tid, vals) => {
                        let data = self.tr_mut(tid).cond_mut(vals).unwrap();
                        data.lm_actions.set_action(ordering, part);
                    }
                }
            }
            self.st_mut(fin).insert_lm_item(part);
        }
    }

    /// Embed a to-state action on the selected states.
    pub fn to_state_action(
        &mut self,
        ctx: &mut FsmCtx,
        embedding: Embedding,
        ordering: i32,
        action: ActionId,
    ) {
        for state in self.embed_targets(embedding) {
            self.st_mut(state)
                .to_state_actions
                .set_action(ordering, action);
            ctx.action_mut(action).num_to_state_refs += 1;
        }
    }

    /// Embed a from-state action on the selected states.
    pub fn from_state_action(
        &mut self,
        ctx: &mut FsmCtx,
        embedding: Embedding,
        ordering: i32,
        action: ActionId,
    ) {
        for state in self.embed_targets(embedding) {
            self.st_mut(state)
                .from_state_actions
                .set_action(ordering, action);
            ctx.action_mut(action).num_from_state_refs += 1;
        }
    }

    /// Embed an EOF action on the selected states.
    pub fn eof_action(
        &mut self,
        ctx: &mut FsmCtx,
        embedding: Embedding,
        ordering: i32,
        action: ActionId,
    ) {
        for state in self.embed_targets(embedding) {
            self.st_mut(state).eof_actions.set_action(ordering, action);
            ctx.action_mut(action).num_eof_refs += 1;
        }
    }

    /// Embed an error action on the selected states. The transfer point
    /// decides when the embedding moves onto error transitions.
    pub fn error_action(
        &mut self,
        ctx: &mut FsmCtx,
        embedding: Embedding,
        ordering: i32,
        action: ActionId,
        transfer_point: i32,
    ) {
        for state in self.embed_targets(embedding) {
            self.st_mut(state)
                .err_actions
                .set_action(ordering, action, transfer_point);
            ctx.action_mut(action).num_trans_refs += 1;
        }
    }

    pub fn set_error_action(
        &mut self,
        ctx: &mut FsmCtx,
        state: StateId,
        ordering: i32,
        action: ActionId,
        transfer_point: i32,
    ) {
        self.st_mut(state)
            .err_actions
            .set_action(ordering, action, transfer_point);
        ctx.action_mut(action).num_trans_refs += 1;
    }

    pub fn set_error_actions(&mut self, state: StateId, other: &ErrActionTable) {
        self.st_mut(state).err_actions.set_actions(other);
    }

    /*
     * Priority binding.
     */

    /// Set a priority on the transitions leaving the start state.
    pub fn start_fsm_prior(
        &mut self,
        ctx: &mut FsmCtx,
        ordering: i32,
        desc: PriorId,
    ) -> Result<(), FsmError> {
        self.isolate_start_state(ctx)?;
        let start = self.start_state.expect("machine has no start state");
        let out = self.st(start).out.clone();
        for tid in out {
            self.embed_prior_on_trans(ctx, tid, ordering, desc);
        }
        if self.st(start).is_final() {
            self.st_mut(start).out_priors.set_prior(ctx, ordering, desc);
        }
        Ok(())
    }

    /// Set a priority on every transition in the machine.
    pub fn all_trans_prior(&mut self, ctx: &FsmCtx, ordering: i32, desc: PriorId) {
        for state in self.states() {
            let out = self.st(state).out.clone();
            for tid in out {
                self.embed_prior_on_trans(ctx, tid, ordering, desc);
            }
        }
    }

    /// Set a priority on the transitions into final states.
    pub fn finish_fsm_prior(&mut self, ctx: &FsmCtx, ordering: i32, desc: PriorId) {
        let fins = self.fin_set.clone();
        for fin in fins {
            let in_refs = self.st(fin).in_refs.clone();
            for in_ref in in_refs {
                match in_ref {
                    InRef::Plain(tid) => {
                        let data = self.tr_mut(tid).plain_mut().unwrap();
                        data.priors.set_prior(ctx, ordering, desc);
                    }
                    InRef::Cond(tid, vals) => {
                        let data = self.tr_mut(tid).cond_mut(vals).unwrap();
                        data.priors.set_prior(ctx, ordering, desc);
                    }
                }
            }
        }
    }

    /// Set a pending priority on the final states.
    pub fn leave_fsm_prior(&mut self, ctx: &FsmCtx, ordering: i32, desc: PriorId) {
        let fins = self.fin_set.clone();
        for fin in fins {
            self.st_mut(fin).out_priors.set_prior(ctx, ordering, desc);
        }
    }

    /// Clear every priority table in the machine so stale priorities
    /// cannot block merges in the final minimization.
    pub fn clear_all_priorities(&mut self) {
        for state in self.states() {
            self.st_mut(state).out_priors.clear();
            self.st_mut(state).guarded_in_priors.clear();
            let out = self.st(state).out.clone();
            for tid in out {
                match &mut self.tr_mut(tid).body {
                    TransBody::Plain(data) => data.priors.clear(),
                    TransBody::Cond { conds, .. } => {
                        for c in conds.iter_mut() {
                            c.data.priors.clear();
                        }
                    }
                }
            }
        }
    }

    /// Renumber action orderings so only the set of actions matters for
    /// state comparison. Run before the final minimization.
    pub fn null_action_keys(&mut self) {
        for state in self.states() {
            let st = self.st_mut(state);
            st.to_state_actions.null_orderings();
            st.from_state_actions.null_orderings();
            st.out_actions.null_orderings();
            st.eof_actions.null_orderings();
            let out = self.st(state).out.clone();
            for tid in out {
                match &mut self.tr_mut(tid).body {
                    TransBody::Plain(data) => data.actions.null_orderings(),
                    TransBody::Cond { conds, .. } => {
                        for c in conds.iter_mut() {
                            c.data.actions.null_orderings();
                        }
                    }
                }
            }
        }
    }

    /// Shift the orderings on the start state's out transitions to begin
    /// at `from_order`, preserving relative order. Returns the next free
    /// ordering. Used before a kleene star so start embeddings keep their
    /// source position.
    pub fn shift_start_action_order(&mut self, from_order: i32) -> i32 {
        let Some(start) = self.start_state else {
            return from_order;
        };
        let mut next = from_order;
        let out = self.st(start).out.clone();
        for tid in out {
            let tables: Vec<&mut ActionTable> = match &mut self.tr_mut(tid).body {
                TransBody::Plain(data) => vec![&mut data.actions],
                TransBody::Cond { conds, .. } => {
                    conds.iter_mut().map(|c| &mut c.data.actions).collect()
                }
            };
            for table in tables {
                let mut rebuilt = ActionTable::new();
                for el in table.els() {
                    rebuilt.set_action(next, el.action);
                    next += 1;
                }
                *table = rebuilt;
            }
        }
        next
    }

    /*
     * Error transitions.
     */

    /// Fill every uncovered key range of the state's out list with an
    /// explicit error transition.
    pub fn fill_gaps(&mut self, ctx: &FsmCtx, state: StateId) {
        let key_ops = ctx.key_ops;
        let out = self.st(state).out.clone();
        let mut gaps: Vec<(Key, Key)> = Vec::new();
        let mut next_low = key_ops.min_key;
        let mut past_end = false;
        for tid in &out {
            let (low, high) = self.trans_keys(*tid);
            if key_ops.lt(next_low, low) {
                gaps.push((next_low, key_ops.decrement(low)));
            }
            if key_ops.eq(high, key_ops.max_key) {
                past_end = true;
                break;
            }
            next_low = key_ops.increment(high);
        }
        if !past_end && key_ops.le(next_low, key_ops.max_key) {
            gaps.push((next_low, key_ops.max_key));
        }
        for (low, high) in gaps {
            self.attach_new_trans(key_ops, state, None, low, high);
        }
    }

    /// Whether the state's out transitions cover the whole key space.
    pub fn out_list_covers(&self, ctx: &FsmCtx, state: StateId) -> bool {
        let key_ops = ctx.key_ops;
        let mut next_low = key_ops.min_key;
        for tid in &self.st(state).out {
            let (low, high) = self.trans_keys(*tid);
            if key_ops.lt(next_low, low) {
                return false;
            }
            if key_ops.eq(high, key_ops.max_key) {
                return true;
            }
            next_low = key_ops.increment(high);
        }
        false
    }

    /// Whether the state has an error path: a gap in its out list or an
    /// explicit transition into the error state.
    pub fn any_error_range(&self, ctx: &FsmCtx, state: StateId) -> bool {
        if !self.out_list_covers(ctx, state) {
            return true;
        }
        self.st(state).out.iter().any(|&tid| match &self.tr(tid).body {
            TransBody::Plain(data) => data.to.is_none(),
            TransBody::Cond { conds, .. } => conds.iter().any(|c| c.data.to.is_none()),
        })
    }

    pub fn has_error_trans(&self, ctx: &FsmCtx) -> bool {
        self.states()
            .into_iter()
            .any(|s| self.any_error_range(ctx, s))
    }

    /// Move error embeddings with the given transfer point onto the
    /// state's error transitions and its EOF table.
    pub fn transfer_error_actions(&mut self, state: StateId, transfer_point: i32) {
        let els: Vec<super::act::ErrActionTableEl> = self
            .st(state)
            .err_actions
            .els()
            .iter()
            .copied()
            .filter(|el| el.transfer_point == transfer_point)
            .collect();
        if els.is_empty() {
            return;
        }
        let remaining: Vec<super::act::ErrActionTableEl> = self
            .st(state)
            .err_actions
            .els()
            .iter()
            .copied()
            .filter(|el| el.transfer_point != transfer_point)
            .collect();
        {
            let table = &mut self.st_mut(state).err_actions;
            table.clear();
            for el in remaining {
                table.set_action(el.ordering, el.action, el.transfer_point);
            }
        }
        let out = self.st(state).out.clone();
        for tid in out {
            match &mut self.tr_mut(tid).body {
                TransBody::Plain(data) => {
                    if data.to.is_none() {
                        for el in &els {
                            data.actions.set_action(el.ordering, el.action);
                        }
                    }
                }
                TransBody::Cond { conds, .. } => {
                    for c in conds.iter_mut() {
                        if c.data.to.is_none() {
                            for el in &els {
                                c.data.actions.set_action(el.ordering, el.action);
                            }
                        }
                    }
                }
            }
        }
        for el in &els {
            self.st_mut(state)
                .eof_actions
                .set_action(el.ordering, el.action);
        }
    }

    /// Give the state an explicit error target: gaps become transitions
    /// to `target` carrying the supplied actions.
    pub fn set_error_target(
        &mut self,
        ctx: &FsmCtx,
        state: StateId,
        target: StateId,
        actions: &[(i32, ActionId)],
    ) {
        self.fill_gaps(ctx, state);
        let out = self.st(state).out.clone();
        for tid in out {
            let is_err = match &self.tr(tid).body {
                TransBody::Plain(data) => data.to.is_none(),
                TransBody::Cond { .. } => false,
            };
            if is_err {
                self.attach_trans(state, target, tid);
                let data = self.tr_mut(tid).plain_mut().unwrap();
                for &(ordering, action) in actions {
                    data.actions.set_action(ordering, action);
                }
            }
        }
    }

    /*
     * Bringing another machine's storage into this one.
     */

    /// Move every state and transition of `other` into this graph's
    /// slabs, returning the state translation map. Entry points, final
    /// states and list memberships carry over; `other`'s start state must
    /// already be unset.
    pub(crate) fn import(&mut self, other: Fsm) -> Vec<Option<StateId>> {
        assert!(
            other.start_state.is_none(),
            "unset the start state before importing"
        );
        let mut smap: Vec<Option<StateId>> = vec![None; other.states.len()];
        let mut tmap: Vec<Option<TransId>> = vec![None; other.transs.len()];

        for &old in other.state_list.iter().chain(other.misfit_list.iter()) {
            smap[old.index()] = Some(self.alloc_state_slot());
        }
        for (i, slot) in other.transs.iter().enumerate() {
            if slot.is_some() {
                tmap[i] = Some(self.alloc_trans(Trans {
                    from: StateId(0),
                    low: Key(0),
                    high: Key(0),
                    body: TransBody::Plain(TransData::default()),
                }));
            }
        }

        let map_state = |id: StateId| smap[id.index()].expect("dangling state in import");
        let map_trans = |id: TransId| tmap[id.index()].expect("dangling trans in import");

        for (i, slot) in other.transs.into_iter().enumerate() {
            let Some(mut trans) = slot else { continue };
            trans.from = map_state(trans.from);
            match &mut trans.body {
                TransBody::Plain(data) => {
                    data.to = data.to.map(map_state);
                }
                TransBody::Cond { conds, .. } => {
                    for c in conds.iter_mut() {
                        c.data.to = c.data.to.map(map_state);
                    }
                }
            }
            let new_id = tmap[i].unwrap();
            self.transs[new_id.index()] = Some(trans);
        }

        for (i, slot) in other.states.into_iter().enumerate() {
            let Some(mut state) = slot else { continue };
            for tid in state.out.iter_mut() {
                *tid = map_trans(*tid);
            }
            for in_ref in state.in_refs.iter_mut() {
                *in_ref = match *in_ref {
                    InRef::Plain(t) => InRef::Plain(map_trans(t)),
                    InRef::Cond(t, v) => InRef::Cond(map_trans(t), v),
                };
            }
            state.eof_target = state.eof_target.map(map_state);
            for (to, _) in state.nfa_out.iter_mut() {
                *to = map_state(*to);
            }
            for from in state.nfa_in.iter_mut() {
                *from = map_state(*from);
            }
            state.ept_vect = state
                .ept_vect
                .iter()
                .map(|&(t, l)| (map_state(t), l))
                .collect();
            debug_assert!(state.dict_set.is_none());
            let new_id = smap[i].unwrap();
            self.states[new_id.index()] = Some(state);
        }

        for old in other.state_list {
            self.state_list.push(map_state(old));
        }
        for old in other.misfit_list {
            self.misfit_list.push(map_state(old));
        }
        for old in other.nfa_list {
            self.nfa_list.push(map_state(old));
        }
        for old in other.fin_set {
            let new = map_state(old);
            if let Err(pos) = self.fin_set.binary_search(&new) {
                self.fin_set.insert(pos, new);
            }
        }
        self.copy_in_entry_points(&other.entry_points, &smap);

        smap
    }

    /*
     * Duplication.
     */

    fn state_map(&self, id: StateId) -> StateId {
        match self.st(id).scratch {
            Scratch::StateMap(to) => to,
            _ => panic!("state map not assigned"),
        }
    }

    /// Deep copy of the machine. Every state records the state
    /// representing it in the copy through its scratch field while
    /// transitions, entry points, finality and the start state are
    /// rebuilt over the mapping; the scratch is cleared afterwards.
    pub fn duplicate(&mut self) -> Fsm {
        let mut dup = Fsm::new();
        let main = self.state_list.clone();
        let misfits = self.misfit_list.clone();

        // Allocate one state in the copy per live state and record the
        // mapping on the source state.
        for &old in main.iter().chain(misfits.iter()) {
            let new_id = dup.alloc_state_slot();
            self.st_mut(old).scratch = Scratch::StateMap(new_id);
        }
        dup.state_list = main.iter().map(|&s| self.state_map(s)).collect();
        dup.misfit_list = misfits.iter().map(|&s| self.state_map(s)).collect();

        // Copy the transitions, remapping both endpoints. The id map is
        // needed afterwards to rebuild the in-lists.
        let mut tmap: Vec<Option<TransId>> = vec![None; self.transs.len()];
        for &old in main.iter().chain(misfits.iter()) {
            let out = self.st(old).out.clone();
            for tid in out {
                let mut trans = self.tr(tid).clone();
                trans.from = self.state_map(trans.from);
                match &mut trans.body {
                    TransBody::Plain(data) => {
                        data.to = data.to.map(|t| self.state_map(t));
                    }
                    TransBody::Cond { conds, .. } => {
                        for c in conds.iter_mut() {
                            c.data.to = c.data.to.map(|t| self.state_map(t));
                        }
                    }
                }
                tmap[tid.index()] = Some(dup.alloc_trans(trans));
            }
        }

        // Copy the states themselves.
        for &old in main.iter().chain(misfits.iter()) {
            let mut state = self.st(old).clone();
            for tid in state.out.iter_mut() {
                *tid = tmap[tid.index()].expect("unmapped trans in duplicate");
            }
            for in_ref in state.in_refs.iter_mut() {
                *in_ref = match *in_ref {
                    InRef::Plain(t) => {
                        InRef::Plain(tmap[t.index()].expect("unmapped trans in duplicate"))
                    }
                    InRef::Cond(t, v) => {
                        InRef::Cond(tmap[t.index()].expect("unmapped trans in duplicate"), v)
                    }
                };
            }
            state.eof_target = state.eof_target.map(|t| self.state_map(t));
            for (to, _) in state.nfa_out.iter_mut() {
                *to = self.state_map(*to);
            }
            for from in state.nfa_in.iter_mut() {
                *from = self.state_map(*from);
            }
            for targ in state.ept_vect.iter_mut() {
                targ.0 = self.state_map(targ.0);
            }
            state.dict_set = None;
            state.scratch = Scratch::None;
            let new_id = self.state_map(old);
            dup.states[new_id.index()] = Some(state);
        }

        dup.nfa_list = self.nfa_list.iter().map(|&s| self.state_map(s)).collect();
        dup.fin_set = self.fin_set.iter().map(|&s| self.state_map(s)).collect();
        dup.fin_set.sort_unstable();
        dup.entry_points = self
            .entry_points
            .iter()
            .map(|(&id, &s)| (id, self.state_map(s)))
            .collect();
        dup.start_state = self.start_state.map(|s| self.state_map(s));
        dup.misfit_accounting = self.misfit_accounting;

        // The scratch field goes back to the next phase.
        for &old in main.iter().chain(misfits.iter()) {
            self.st_mut(old).scratch = Scratch::None;
        }
        dup
    }

    /*
     * Ordering and numbering.
     */

    /// Rebuild the state list in depth-first order from the start state
    /// and the entry points.
    pub fn depth_first_ordering(&mut self) {
        let mut ordered: Vec<StateId> = Vec::with_capacity(self.state_list.len());
        for state in self.states() {
            self.st_mut(state).bits &= !super::state::SB_ISMARKED;
        }
        let mut roots: Vec<StateId> = Vec::new();
        if let Some(start) = self.start_state {
            roots.push(start);
        }
        roots.extend(self.entry_points.values().copied());
        for root in roots {
            self.dfo_visit(root, &mut ordered);
        }
        // Anything untouched keeps its old relative order at the end.
        for state in self.states() {
            if !self.st(state).is_marked() {
                self.st_mut(state).bits |= super::state::SB_ISMARKED;
                ordered.push(state);
            }
        }
        for &state in &ordered {
            self.st_mut(state).bits &= !super::state::SB_ISMARKED;
        }
        self.state_list = ordered;
    }

    fn dfo_visit(&mut self, root: StateId, ordered: &mut Vec<StateId>) {
        if self.st(root).is_marked() {
            return;
        }
        let mut stack = vec![root];
        while let Some(state) = stack.pop() {
            if self.st(state).is_marked() {
                continue;
            }
            self.st_mut(state).bits |= super::state::SB_ISMARKED;
            ordered.push(state);
            let out = self.st(state).out.clone();
            for tid in out.into_iter().rev() {
                for target in self.tr(tid).targets().into_iter().rev() {
                    stack.push(target);
                }
            }
            if let Some(eof) = self.st(state).eof_target {
                stack.push(eof);
            }
            let nfa_targets: Vec<StateId> =
                self.st(state).nfa_out.iter().map(|&(t, _)| t).collect();
            for t in nfa_targets.into_iter().rev() {
                stack.push(t);
            }
        }
    }

    /// Assign sequential state numbers starting at `base`, in list order.
    pub fn set_state_numbers(&mut self, base: i32) {
        let mut num = base;
        for state in self.states() {
            self.st_mut(state).scratch = Scratch::Number(num);
            num += 1;
        }
    }

    /// Reorder the state list so final states come last. Keeps relative
    /// order within each class.
    pub fn sort_states_by_final(&mut self) {
        let list = std::mem::take(&mut self.state_list);
        let (non_fin, fin): (Vec<StateId>, Vec<StateId>) =
            list.into_iter().partition(|&s| !self.st(s).is_final());
        self.state_list = non_fin;
        self.state_list.extend(fin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::key::KeyOps;

    fn ctx() -> FsmCtx {
        FsmCtx::new(KeyOps::unsigned_octet())
    }

    #[test]
    fn attach_maintains_in_list_and_sorting() {
        let ctx = ctx();
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        let t2 = fsm.attach_new_trans(ctx.key_ops, a, Some(b), Key(b'x' as i64), Key(b'z' as i64));
        let t1 = fsm.attach_new_trans(ctx.key_ops, a, Some(b), Key(b'a' as i64), Key(b'c' as i64));
        assert_eq!(fsm.out_trans(a), &[t1, t2]);
        assert_eq!(fsm.st(b).in_refs.len(), 2);
        assert_eq!(fsm.st(b).foreign_in_refs, 2);
    }

    #[test]
    fn detach_state_redirects_in_trans_to_error() {
        let ctx = ctx();
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        let t = fsm.attach_new_trans(ctx.key_ops, a, Some(b), Key(1), Key(2));
        fsm.detach_state(b);
        assert!(fsm.tr(t).plain().unwrap().to.is_none());
        assert_eq!(fsm.state_count(), 1);
    }

    #[test]
    fn misfit_accounting_moves_states_between_lists() {
        let ctx = ctx();
        let mut fsm = Fsm::new();
        fsm.set_misfit_accounting(true);
        let a = fsm.add_state();
        let b = fsm.add_state();
        assert_eq!(fsm.misfit_list.len(), 2);
        fsm.set_start_state(a);
        assert_eq!(fsm.misfit_list, vec![b]);
        let t = fsm.attach_new_trans(ctx.key_ops, a, Some(b), Key(0), Key(5));
        assert!(fsm.misfit_list.is_empty());
        let out_pos = fsm.st(a).out.iter().position(|&x| x == t).unwrap();
        fsm.st_mut(a).out.remove(out_pos);
        fsm.detach_and_free_trans(t);
        assert_eq!(fsm.misfit_list, vec![b]);
    }

    #[test]
    fn fill_gaps_covers_key_space() {
        let ctx = ctx();
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.attach_new_trans(ctx.key_ops, a, Some(b), Key(10), Key(20));
        assert!(!fsm.out_list_covers(&ctx, a));
        fsm.fill_gaps(&ctx, a);
        assert!(fsm.out_list_covers(&ctx, a));
        assert_eq!(fsm.out_trans(a).len(), 3);
    }

    #[test]
    fn duplicate_is_deep_and_clears_the_state_map() {
        let ctx = ctx();
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.set_start_state(a);
        fsm.set_fin_state(b);
        fsm.set_entry(3, a);
        fsm.attach_new_trans(ctx.key_ops, a, Some(b), Key(1), Key(4));
        fsm.attach_new_trans(ctx.key_ops, b, Some(b), Key(7), Key(7));

        let mut dup = fsm.duplicate();
        assert_eq!(dup.state_count(), 2);
        assert_eq!(dup.fin_states().len(), 1);
        let dup_start = dup.start_state().unwrap();
        assert_eq!(dup.entry_points().get(&3), Some(&dup_start));
        assert_eq!(dup.out_trans(dup_start).len(), 1);
        // The mapping scratch went back to rest on the source.
        for state in fsm.states() {
            assert_eq!(fsm.st(state).scratch, Scratch::None);
        }
        // The copy is independent: growing it leaves the source alone.
        let extra = dup.add_state();
        let dup_fin = dup.fin_states()[0];
        dup.attach_new_trans(ctx.key_ops, dup_fin, Some(extra), Key(9), Key(9));
        assert_eq!(fsm.state_count(), 2);
        assert_eq!(fsm.out_trans(b).len(), 1);
        dup.verify_integrity(&ctx);
        fsm.verify_integrity(&ctx);
    }

    #[test]
    fn shift_start_action_order_renumbers() {
        let mut c = ctx();
        let act = c.add_action(Default::default(), "a", super::super::act::InlineRef(0));
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.set_start_state(a);
        let t = fsm.attach_new_trans(c.key_ops, a, Some(b), Key(1), Key(1));
        fsm.embed_action_on_trans(t, 40, act);
        let next = fsm.shift_start_action_order(7);
        assert_eq!(next, 8);
        assert_eq!(fsm.tr(t).plain().unwrap().actions.els()[0].ordering, 7);
    }
}
