//! Transition crossing and subset construction.
//!
//! Binary operators work by merging one state's out list into another's.
//! The range-pair iterator reduces that to per-segment decisions: segments
//! in one list are kept or copied, overlapping segments are crossed. When
//! two overlapping transitions have equal priority their targets combine,
//! and the combination is identified through a dictionary mapping sets of
//! original states to the state that represents them. `fill_in_states`
//! drains the queue of freshly created combined states, computing each
//! one's out list by folding the crossing over its members; this is the
//! subset construction.
//!
//! Conditional transitions cross by first widening both sides to the
//! union of their condition spaces, then merging cond by cond with the
//! value-pair iterator. Every widening is charged against the context's
//! expansion budget.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use tracing::debug;

use super::act::compare_prior;
use super::cond::{expand_vals, CondSet, CondSpaceId, CondVals};
use super::ctx::FsmCtx;
use super::fsm::Fsm;
use super::rangeiter::{RangeEntry, RangePairIter, RangePairStep, ValEntry, ValPairIter, ValPairStep};
use super::state::{CondTarget, InRef, StateId, TransBody, TransData, TransId};
use crate::FsmError;

/// Scratch for one merge operation: the state dictionary and the queue of
/// combined states whose out lists still need filling in.
#[derive(Default)]
pub(crate) struct MergeData {
    dict: FxHashMap<Vec<StateId>, StateId>,
    fill_queue: VecDeque<StateId>,
    /// Every state that received a dict set, for cleanup.
    dict_marked: Vec<StateId>,
}

/// Addresses one transition payload: a plain transition or one cond of a
/// conditional transition.
#[derive(Clone, Copy, Debug)]
enum Slot {
    Plain(TransId),
    Cond(TransId, CondVals),
}

/// A detached working copy of a transition's conditional form, used on
/// the source side of a cross so the source machine is never widened in
/// place.
struct EffCond {
    space: CondSpaceId,
    conds: Vec<CondTarget>,
}

impl Fsm {
    fn slot_data(&self, slot: Slot) -> &TransData {
        match slot {
            Slot::Plain(tid) => self.tr(tid).plain().unwrap(),
            Slot::Cond(tid, vals) => self.tr(tid).cond(vals).unwrap(),
        }
    }

    fn slot_data_mut(&mut self, slot: Slot) -> &mut TransData {
        match slot {
            Slot::Plain(tid) => self.tr_mut(tid).plain_mut().unwrap(),
            Slot::Cond(tid, vals) => self.tr_mut(tid).cond_mut(vals).unwrap(),
        }
    }

    fn slot_detach(&mut self, from: StateId, slot: Slot) {
        if let Some(to) = self.slot_data(slot).to {
            match slot {
                Slot::Plain(tid) => self.detach_trans(from, to, tid),
                Slot::Cond(tid, vals) => self.detach_cond(from, to, tid, vals),
            }
        }
    }

    fn slot_attach(&mut self, from: StateId, slot: Slot, to: StateId) {
        match slot {
            Slot::Plain(tid) => self.attach_trans(from, to, tid),
            Slot::Cond(tid, vals) => self.attach_cond(from, to, tid, vals),
        }
    }

    /// Draw the source payload's tables into the destination slot.
    fn add_in_trans(&mut self, ctx: &FsmCtx, dest: Slot, src: &TransData) {
        let data = self.slot_data_mut(dest);
        data.actions.set_actions(&src.actions);
        data.lm_actions.set_actions(&src.lm_actions);
        let priors = src.priors.clone();
        self.slot_data_mut(dest).priors.set_priors(ctx, &priors);
    }

    /// The set of original states a target stands for.
    fn represented_set(&self, id: StateId) -> Vec<StateId> {
        match &self.st(id).dict_set {
            Some(set) => (**set).clone(),
            None => vec![id],
        }
    }

    /// Find or create the state representing the union of what the two
    /// targets represent.
    fn combined_target(
        &mut self,
        md: &mut MergeData,
        dest_to: StateId,
        src_to: StateId,
    ) -> StateId {
        let mut set = self.represented_set(dest_to);
        for s in self.represented_set(src_to) {
            if let Err(pos) = set.binary_search(&s) {
                set.insert(pos, s);
            }
        }
        if let Some(&found) = md.dict.get(&set) {
            return found;
        }
        let combined = self.add_state();
        self.st_mut(combined).dict_set = Some(Box::new(set.clone()));
        md.dict.insert(set, combined);
        md.dict_marked.push(combined);
        md.fill_queue.push_back(combined);
        combined
    }

    /// Merge the source payload into the destination slot, combining
    /// targets through the state dictionary when both are real.
    fn merge_slot(
        &mut self,
        ctx: &FsmCtx,
        md: &mut MergeData,
        from: StateId,
        dest: Slot,
        src: &TransData,
    ) -> Result<(), FsmError> {
        match (self.slot_data(dest).to, src.to) {
            (None, Some(src_to)) => {
                // Dest went to the error state, src goes somewhere real:
                // redirect dest to src's target.
                self.slot_attach(from, dest, src_to);
            }
            (Some(dest_to), Some(src_to)) if dest_to != src_to => {
                let combined = self.combined_target(md, dest_to, src_to);
                if combined != dest_to {
                    self.slot_detach(from, dest);
                    self.slot_attach(from, dest, combined);
                }
            }
            _ => {}
        }
        self.add_in_trans(ctx, dest, src);
        Ok(())
    }

    /*
     * Conditional shape handling.
     */

    /// Rewrite a plain transition as a conditional one under the empty
    /// condition space: a single cond with key 0 carrying the plain data.
    pub(crate) fn convert_trans_to_cond(&mut self, ctx: &mut FsmCtx, tid: TransId) {
        if matches!(self.tr(tid).body, TransBody::Cond { .. }) {
            return;
        }
        let empty = ctx.add_cond_space(CondSet::new());
        let body = std::mem::replace(
            &mut self.tr_mut(tid).body,
            TransBody::Cond {
                space: empty,
                conds: smallvec::SmallVec::new(),
            },
        );
        let TransBody::Plain(data) = body else {
            unreachable!()
        };
        // The in-list reference changes shape along with the transition.
        if let Some(to) = data.to {
            let refs = &mut self.st_mut(to).in_refs;
            let pos = refs
                .iter()
                .position(|r| *r == InRef::Plain(tid))
                .expect("in-list out of sync");
            refs[pos] = InRef::Cond(tid, CondVals(0));
        }
        match &mut self.tr_mut(tid).body {
            TransBody::Cond { conds, .. } => conds.push(CondTarget {
                vals: CondVals(0),
                data,
            }),
            TransBody::Plain(_) => unreachable!(),
        }
    }

    /// Rewrite every plain out transition of a state into conditional
    /// form.
    pub fn convert_to_cond(&mut self, ctx: &mut FsmCtx, state: StateId) {
        let out = self.st(state).out.clone();
        for tid in out {
            self.convert_trans_to_cond(ctx, tid);
        }
    }

    /// The union of two transitions' condition spaces.
    fn expand_cond_space(
        &self,
        ctx: &mut FsmCtx,
        dest_space: CondSpaceId,
        src_space: CondSpaceId,
    ) -> CondSpaceId {
        let merged = ctx
            .cond_space(dest_space)
            .set
            .merge(&ctx.cond_space(src_space).set);
        ctx.add_cond_space(merged)
    }

    /// Charge the expansion of a cond list against the budgets of the
    /// guards that caused it.
    fn charge_expansion(
        &self,
        ctx: &mut FsmCtx,
        from_space: CondSpaceId,
        merged_space: CondSpaceId,
        added: u64,
    ) -> Result<(), FsmError> {
        if added == 0 {
            return Ok(());
        }
        let from_set = ctx.cond_space(from_space).set.clone();
        let new_guards: Vec<i64> = ctx
            .cond_space(merged_space)
            .set
            .guards()
            .iter()
            .filter(|g| !from_set.contains(g.cond_id))
            .map(|g| ctx.action(g.action).cost_id)
            .collect();
        for cost_id in new_guards {
            ctx.charge_cond_cost(cost_id, added)?;
        }
        Ok(())
    }

    /// Re-distribute a transition's cond list over a widened space. Each
    /// existing value expands to `2^(|merged| - |from|)` values keeping
    /// the original assignment; the first expansion reuses the existing
    /// entry, the rest are duplicated and attached.
    pub(crate) fn expand_trans_conds(
        &mut self,
        ctx: &mut FsmCtx,
        tid: TransId,
        merged_space: CondSpaceId,
    ) -> Result<(), FsmError> {
        let (from_space, old_conds) = match &mut self.tr_mut(tid).body {
            TransBody::Cond { space, conds } => (*space, std::mem::take(conds)),
            TransBody::Plain(_) => panic!("expand on plain trans"),
        };
        if from_space == merged_space {
            match &mut self.tr_mut(tid).body {
                TransBody::Cond { conds, .. } => *conds = old_conds,
                TransBody::Plain(_) => unreachable!(),
            }
            return Ok(());
        }
        let positions = {
            let from_set = &ctx.cond_space(from_space).set;
            let merged_set = &ctx.cond_space(merged_space).set;
            from_set.positions_in(merged_set)
        };
        let merged_len = ctx.cond_space(merged_space).set.len();

        let old_len = old_conds.len() as u64;
        let mut new_conds: Vec<CondTarget> = Vec::new();
        let mut fresh_attach: Vec<(CondVals, StateId)> = Vec::new();
        for entry in old_conds {
            let expanded = expand_vals(entry.vals, &positions, merged_len);
            for (i, &w) in expanded.iter().enumerate() {
                if i == 0 {
                    // The existing entry is re-keyed in place; its
                    // in-list reference follows.
                    if let Some(to) = entry.data.to {
                        let refs = &mut self.st_mut(to).in_refs;
                        let pos = refs
                            .iter()
                            .position(|r| *r == InRef::Cond(tid, entry.vals))
                            .expect("in-list out of sync");
                        refs[pos] = InRef::Cond(tid, w);
                    }
                    new_conds.push(CondTarget {
                        vals: w,
                        data: entry.data.clone(),
                    });
                } else {
                    let data = entry.data.dup_tables();
                    if let Some(to) = entry.data.to {
                        fresh_attach.push((w, to));
                    }
                    new_conds.push(CondTarget { vals: w, data });
                }
            }
        }
        new_conds.sort_by_key(|c| c.vals);
        let added = new_conds.len() as u64 - old_len;
        match &mut self.tr_mut(tid).body {
            TransBody::Cond { space, conds } => {
                *space = merged_space;
                *conds = new_conds.into_iter().collect();
            }
            TransBody::Plain(_) => unreachable!(),
        }
        let from = self.tr(tid).from;
        for (vals, to) in fresh_attach {
            // Route the duplicated entries' targets through the attach
            // path so in-lists and foreign counts stay right.
            self.attach_cond(from, to, tid, vals);
        }
        self.charge_expansion(ctx, from_space, merged_space, added)
    }

    /// A detached conditional view of a transition for the source side of
    /// a cross. Targets are recorded but not linked.
    fn effective_cond_copy(&self, ctx: &mut FsmCtx, tid: TransId) -> EffCond {
        match &self.tr(tid).body {
            TransBody::Plain(data) => EffCond {
                space: ctx.add_cond_space(CondSet::new()),
                conds: vec![CondTarget {
                    vals: CondVals(0),
                    data: data.clone(),
                }],
            },
            TransBody::Cond { space, conds } => EffCond {
                space: *space,
                conds: conds.to_vec(),
            },
        }
    }

    /// Widen a detached conditional copy to the merged space.
    fn expand_eff_conds(
        &self,
        ctx: &mut FsmCtx,
        eff: EffCond,
        merged_space: CondSpaceId,
    ) -> Result<EffCond, FsmError> {
        if eff.space == merged_space {
            return Ok(eff);
        }
        let positions = {
            let from_set = &ctx.cond_space(eff.space).set;
            let merged_set = &ctx.cond_space(merged_space).set;
            from_set.positions_in(merged_set)
        };
        let merged_len = ctx.cond_space(merged_space).set.len();
        let old_len = eff.conds.len() as u64;
        let mut conds: Vec<CondTarget> = Vec::new();
        for entry in &eff.conds {
            for w in expand_vals(entry.vals, &positions, merged_len) {
                conds.push(CondTarget {
                    vals: w,
                    data: entry.data.clone(),
                });
            }
        }
        conds.sort_by_key(|c| c.vals);
        let added = conds.len() as u64 - old_len;
        self.charge_expansion(ctx, eff.space, merged_space, added)?;
        Ok(EffCond {
            space: merged_space,
            conds,
        })
    }

    /*
     * Crossing.
     */

    /// Cross two overlapping transitions, producing the transition that
    /// represents their pointwise merge. The destination transition is
    /// reused or replaced; the source is read only.
    fn cross_transitions(
        &mut self,
        ctx: &mut FsmCtx,
        md: &mut MergeData,
        from: StateId,
        dest_tid: TransId,
        src_tid: TransId,
    ) -> Result<TransId, FsmError> {
        let both_plain = self.tr(dest_tid).plain().is_some() && self.tr(src_tid).plain().is_some();
        if both_plain {
            let cmp = {
                let dest_priors = &self.tr(dest_tid).plain().unwrap().priors;
                let src_priors = &self.tr(src_tid).plain().unwrap().priors;
                compare_prior(ctx, dest_priors, src_priors)?
            };
            return match cmp {
                std::cmp::Ordering::Less => {
                    // Src dominates: dest is dropped wholesale and
                    // replaced by a copy of src.
                    self.detach_and_free_trans(dest_tid);
                    Ok(self.dup_trans(from, src_tid))
                }
                std::cmp::Ordering::Greater => Ok(dest_tid),
                std::cmp::Ordering::Equal => {
                    let src_data = self.tr(src_tid).plain().unwrap().clone();
                    self.merge_slot(ctx, md, from, Slot::Plain(dest_tid), &src_data)?;
                    Ok(dest_tid)
                }
            };
        }

        // At least one side is conditional. Work over the merged space.
        self.convert_trans_to_cond(ctx, dest_tid);
        let src_eff = self.effective_cond_copy(ctx, src_tid);
        let dest_space = match &self.tr(dest_tid).body {
            TransBody::Cond { space, .. } => *space,
            TransBody::Plain(_) => unreachable!(),
        };
        let merged_space = self.expand_cond_space(ctx, dest_space, src_eff.space);
        self.expand_trans_conds(ctx, dest_tid, merged_space)?;
        let src_eff = self.expand_eff_conds(ctx, src_eff, merged_space)?;

        // Merge cond by cond.
        let dest_keys: Vec<ValEntry<usize>> = match &self.tr(dest_tid).body {
            TransBody::Cond { conds, .. } => conds
                .iter()
                .enumerate()
                .map(|(i, c)| ValEntry {
                    key: c.vals,
                    payload: i,
                })
                .collect(),
            TransBody::Plain(_) => unreachable!(),
        };
        let src_keys: Vec<ValEntry<usize>> = src_eff
            .conds
            .iter()
            .enumerate()
            .map(|(i, c)| ValEntry {
                key: c.vals,
                payload: i,
            })
            .collect();

        let mut adopt: Vec<usize> = Vec::new();
        let mut cross: Vec<(CondVals, usize)> = Vec::new();
        {
            let mut it = ValPairIter::new(&dest_keys, &src_keys);
            while let Some(step) = it.next() {
                match step {
                    ValPairStep::InFirst => {}
                    ValPairStep::InSecond => adopt.push(it.second().payload),
                    ValPairStep::Overlap => cross.push((it.first().key, it.second().payload)),
                }
            }
        }

        for src_idx in adopt {
            let entry = &src_eff.conds[src_idx];
            let vals = entry.vals;
            let data = TransData {
                to: None,
                actions: entry.data.actions.clone(),
                priors: entry.data.priors.clone(),
                lm_actions: entry.data.lm_actions.clone(),
            };
            let target = entry.data.to;
            match &mut self.tr_mut(dest_tid).body {
                TransBody::Cond { conds, .. } => {
                    let pos = conds
                        .binary_search_by_key(&vals, |c| c.vals)
                        .expect_err("adopted cond already present");
                    conds.insert(pos, CondTarget { vals, data });
                }
                TransBody::Plain(_) => unreachable!(),
            }
            if let Some(to) = target {
                self.attach_cond(from, to, dest_tid, vals);
            }
        }

        for (vals, src_idx) in cross {
            let src_data = src_eff.conds[src_idx].data.clone();
            let slot = Slot::Cond(dest_tid, vals);
            let cmp = compare_prior(ctx, &self.slot_data(slot).priors, &src_data.priors)?;
            match cmp {
                std::cmp::Ordering::Less => {
                    // Src dominates this cond: replace its payload.
                    self.slot_detach(from, slot);
                    {
                        let data = self.slot_data_mut(slot);
                        data.actions = src_data.actions.clone();
                        data.priors = src_data.priors.clone();
                        data.lm_actions = src_data.lm_actions.clone();
                    }
                    if let Some(to) = src_data.to {
                        self.slot_attach(from, slot, to);
                    }
                }
                std::cmp::Ordering::Greater => {}
                std::cmp::Ordering::Equal => {
                    self.merge_slot(ctx, md, from, slot, &src_data)?;
                }
            }
        }

        Ok(dest_tid)
    }

    /// Merge a source state's out list into `dest`'s, segment by segment.
    pub(crate) fn out_trans_copy(
        &mut self,
        ctx: &mut FsmCtx,
        md: &mut MergeData,
        dest: StateId,
        src_out: &[TransId],
    ) -> Result<(), FsmError> {
        let key_ops = ctx.key_ops;
        let dest_old = std::mem::take(&mut self.st_mut(dest).out);
        let e1: Vec<RangeEntry<TransId>> = dest_old
            .iter()
            .map(|&t| RangeEntry {
                low: self.tr(t).low,
                high: self.tr(t).high,
                payload: t,
            })
            .collect();
        let e2: Vec<RangeEntry<TransId>> = src_out
            .iter()
            .map(|&t| RangeEntry {
                low: self.tr(t).low,
                high: self.tr(t).high,
                payload: t,
            })
            .collect();

        let mut new_out: Vec<TransId> = Vec::with_capacity(e1.len() + e2.len());
        let mut it = RangePairIter::new(key_ops, &e1, &e2);
        loop {
            // The iterator borrows the entry lists; transitions are
            // mutated between steps through their ids.
            let Some(step) = it.next() else { break };
            match step {
                RangePairStep::BreakFirst => {
                    // The dest transition is being split; the front half
                    // gets its own copy so the halves can diverge.
                    let dup = self.dup_trans(dest, it.first().payload);
                    it.set_first_payload(dup);
                }
                RangePairStep::BreakSecond => {}
                RangePairStep::InFirst => {
                    let seg = it.first();
                    let trans = self.tr_mut(seg.payload);
                    trans.low = seg.low;
                    trans.high = seg.high;
                    new_out.push(seg.payload);
                }
                RangePairStep::InSecond => {
                    let seg = it.second();
                    let dup = self.dup_trans(dest, seg.payload);
                    let trans = self.tr_mut(dup);
                    trans.low = seg.low;
                    trans.high = seg.high;
                    new_out.push(dup);
                }
                RangePairStep::Overlap => {
                    let seg1 = it.first();
                    let seg2 = it.second();
                    let merged = self.cross_transitions(ctx, md, dest, seg1.payload, seg2.payload)?;
                    let trans = self.tr_mut(merged);
                    trans.low = seg1.low;
                    trans.high = seg1.high;
                    new_out.push(merged);
                }
            }
        }
        self.st_mut(dest).out = new_out;
        Ok(())
    }

    /*
     * State merging.
     */

    /// Merge the out-condition carriers of two states.
    fn merge_out_conds(&mut self, ctx: &mut FsmCtx, dest: StateId, src: StateId) {
        let dest_carrier = (
            self.st(dest).out_cond_space,
            self.st(dest).out_cond_vals.clone(),
        );
        let src_carrier = (
            self.st(src).out_cond_space,
            self.st(src).out_cond_vals.clone(),
        );
        if src_carrier.0.is_none() && dest_carrier.0.is_none() {
            return;
        }
        let empty = ctx.add_cond_space(CondSet::new());
        let (d_space, d_vals) = match dest_carrier {
            (Some(s), v) => (s, v),
            (None, _) => (empty, vec![CondVals(0)]),
        };
        let (s_space, s_vals) = match src_carrier {
            (Some(s), v) => (s, v),
            (None, _) => (empty, vec![CondVals(0)]),
        };
        let merged = self.expand_cond_space(ctx, d_space, s_space);
        let merged_len = ctx.cond_space(merged).set.len();
        let mut vals: Vec<CondVals> = Vec::new();
        for (space, selected) in [(d_space, d_vals), (s_space, s_vals)] {
            let positions = ctx.cond_space(space).set.positions_in(&ctx.cond_space(merged).set);
            for v in selected {
                for w in expand_vals(v, &positions, merged_len) {
                    if let Err(pos) = vals.binary_search(&w) {
                        vals.insert(pos, w);
                    }
                }
            }
        }
        let st = self.st_mut(dest);
        st.out_cond_space = Some(merged);
        st.out_cond_vals = vals;
    }

    /// Merge one source state into `dest`: its out list is crossed in and
    /// its state data drawn in.
    pub(crate) fn merge_states(
        &mut self,
        ctx: &mut FsmCtx,
        md: &mut MergeData,
        dest: StateId,
        src: StateId,
    ) -> Result<(), FsmError> {
        let src_out = self.st(src).out.clone();
        self.out_trans_copy(ctx, md, dest, &src_out)?;

        if self.st(src).is_final() {
            self.set_fin_state(dest);
        }
        self.merge_out_conds(ctx, dest, src);

        if src != dest {
            let src_st = self.st(src).clone();
            {
                let dest_st = self.st_mut(dest);
                dest_st.to_state_actions.set_actions(&src_st.to_state_actions);
                dest_st
                    .from_state_actions
                    .set_actions(&src_st.from_state_actions);
                dest_st.out_actions.set_actions(&src_st.out_actions);
                dest_st.eof_actions.set_actions(&src_st.eof_actions);
                dest_st.err_actions.set_actions(&src_st.err_actions);
                for &part in src_st.lm_items.iter() {
                    dest_st.insert_lm_item(part);
                }
                for &en in src_st.entry_ids.iter() {
                    dest_st.insert_entry_id(en);
                }
                if dest_st.eof_target.is_none() {
                    dest_st.eof_target = src_st.eof_target;
                }
                dest_st.bits |= src_st.bits & super::state::SB_BOTH;
            }
            let out_priors = src_st.out_priors.clone();
            self.st_mut(dest).out_priors.set_priors(ctx, &out_priors);
            let guarded = src_st.guarded_in_priors.clone();
            self.st_mut(dest)
                .guarded_in_priors
                .set_priors(ctx, &guarded);
        }
        Ok(())
    }

    /// Merge a set of source states into `dest`, left to right.
    pub(crate) fn merge_state_set(
        &mut self,
        ctx: &mut FsmCtx,
        md: &mut MergeData,
        dest: StateId,
        srcs: &[StateId],
    ) -> Result<(), FsmError> {
        for &src in srcs {
            self.merge_states(ctx, md, dest, src)?;
        }
        Ok(())
    }

    /// Merge a source state into a final state the machine is being
    /// extended through. If the final state carries pending out data, the
    /// source's transitions first pass through a shadow state where the
    /// out actions, priorities and conditions are applied.
    pub(crate) fn merge_states_leaving(
        &mut self,
        ctx: &mut FsmCtx,
        md: &mut MergeData,
        dest: StateId,
        src: StateId,
    ) -> Result<(), FsmError> {
        if !self.has_out_data(dest) {
            return self.merge_states(ctx, md, dest, src);
        }
        let shadow = self.add_state();
        self.merge_states(ctx, md, shadow, src)?;
        self.transfer_out_data(ctx, shadow, dest);
        if let Some(space) = self.st(dest).out_cond_space {
            let set = ctx.cond_space(space).set.clone();
            let vals = self.st(dest).out_cond_vals.clone();
            let out = self.st(shadow).out.clone();
            for tid in out {
                self.embed_condition_on_trans(ctx, tid, &set, &vals)?;
            }
        }
        self.merge_states(ctx, md, dest, shadow)
    }

    /// Fill in the out lists of every combined state created by crossing.
    /// New combinations created along the way join the queue; the loop
    /// runs to closure. Aborts with `TooManyStates` if the configured
    /// limit is exceeded.
    pub(crate) fn fill_in_states(
        &mut self,
        ctx: &mut FsmCtx,
        md: &mut MergeData,
    ) -> Result<(), FsmError> {
        let mut filled = 0usize;
        while let Some(state) = md.fill_queue.pop_front() {
            let set = self
                .st(state)
                .dict_set
                .as_ref()
                .map(|s| (**s).clone())
                .expect("queued state has no dict set");
            self.merge_state_set(ctx, md, state, &set)?;
            filled += 1;
            if ctx.state_limit > 0 && self.state_count() as i64 > ctx.state_limit {
                return Err(FsmError::TooManyStates);
            }
        }
        for &state in &md.dict_marked {
            if self.state_alive(state) {
                self.st_mut(state).dict_set = None;
            }
        }
        md.dict_marked.clear();
        md.dict.clear();
        if filled > 0 {
            debug!(filled, states = self.state_count(), "subset construction round");
        }
        Ok(())
    }

    /*
     * Start state isolation.
     */

    /// Whether the start state is free of in transitions and entry
    /// points.
    pub fn is_start_state_isolated(&self) -> bool {
        let Some(start) = self.start_state() else {
            return true;
        };
        let st = self.st(start);
        st.in_refs.is_empty() && st.entry_ids.is_empty() && st.nfa_in.is_empty()
    }

    /// Ensure the start state has no inbound paths, duplicating it if
    /// necessary. Required before operators that mutate the left operand
    /// through its start state.
    pub fn isolate_start_state(&mut self, ctx: &mut FsmCtx) -> Result<(), FsmError> {
        if self.is_start_state_isolated() {
            return Ok(());
        }
        let mut md = MergeData::default();
        let prev = self.start_state().unwrap();
        self.unset_start_state();
        let new_start = self.add_state();
        self.set_start_state(new_start);
        self.merge_states(ctx, &mut md, new_start, prev)?;
        self.fill_in_states(ctx, &mut md)
    }

    /// A copy of the start state with no inbound paths, without changing
    /// which state is the start.
    pub fn dup_start_state(&mut self, ctx: &mut FsmCtx) -> Result<StateId, FsmError> {
        let start = self.start_state().expect("machine has no start state");
        let mut md = MergeData::default();
        let dup = self.add_state();
        self.merge_states(ctx, &mut md, dup, start)?;
        self.fill_in_states(ctx, &mut md)?;
        Ok(dup)
    }

    /*
     * Condition embedding.
     */

    /// Restrict a transition to the condition assignment selected by
    /// `vals` over `set`: the transition's space is widened to include
    /// the guards and conds whose assignment falls outside the selection
    /// are dropped.
    pub(crate) fn embed_condition_on_trans(
        &mut self,
        ctx: &mut FsmCtx,
        tid: TransId,
        set: &CondSet,
        vals: &[CondVals],
    ) -> Result<(), FsmError> {
        self.convert_trans_to_cond(ctx, tid);
        let dest_space = match &self.tr(tid).body {
            TransBody::Cond { space, .. } => *space,
            TransBody::Plain(_) => unreachable!(),
        };
        let merged_set = ctx.cond_space(dest_space).set.merge(set);
        let merged_space = ctx.add_cond_space(merged_set);
        self.expand_trans_conds(ctx, tid, merged_space)?;

        let positions = set.positions_in(&ctx.cond_space(merged_space).set);
        let from = self.tr(tid).from;
        let keys: Vec<CondVals> = match &self.tr(tid).body {
            TransBody::Cond { conds, .. } => conds.iter().map(|c| c.vals).collect(),
            TransBody::Plain(_) => unreachable!(),
        };
        for key in keys {
            let keep = vals.contains(&super::cond::restrict_vals(key, &positions));
            if !keep {
                self.slot_detach(from, Slot::Cond(tid, key));
                match &mut self.tr_mut(tid).body {
                    TransBody::Cond { conds, .. } => {
                        let pos = conds.binary_search_by_key(&key, |c| c.vals).unwrap();
                        conds.remove(pos);
                    }
                    TransBody::Plain(_) => unreachable!(),
                }
            }
        }
        Ok(())
    }

    /// Extend a state's out-condition carrier with the supplied guards
    /// and selected value vectors.
    pub fn embed_condition(
        &mut self,
        ctx: &mut FsmCtx,
        state: StateId,
        set: &CondSet,
        vals: &[CondVals],
    ) {
        let empty = ctx.add_cond_space(CondSet::new());
        let (old_space, old_vals) = match self.st(state).out_cond_space {
            Some(s) => (s, self.st(state).out_cond_vals.clone()),
            None => (empty, vec![CondVals(0)]),
        };
        let merged_set = ctx.cond_space(old_space).set.merge(set);
        let merged_space = ctx.add_cond_space(merged_set);
        let merged_len = ctx.cond_space(merged_space).set.len();
        let old_positions = ctx
            .cond_space(old_space)
            .set
            .positions_in(&ctx.cond_space(merged_space).set);
        let new_positions = set.positions_in(&ctx.cond_space(merged_space).set);

        let mut selected: Vec<CondVals> = Vec::new();
        for w in 0..(1u64 << merged_len) {
            let w = CondVals(w);
            let in_old = old_vals.contains(&super::cond::restrict_vals(w, &old_positions));
            let in_new = vals.contains(&super::cond::restrict_vals(w, &new_positions));
            if in_old && in_new {
                selected.push(w);
            }
        }
        let st = self.st_mut(state);
        st.out_cond_space = Some(merged_space);
        st.out_cond_vals = selected;
    }

    /// Guard the transitions leaving the start state on a condition with
    /// the given sense.
    pub fn start_fsm_condition(
        &mut self,
        ctx: &mut FsmCtx,
        action: super::act::ActionId,
        sense: bool,
    ) -> Result<(), FsmError> {
        self.isolate_start_state(ctx)?;
        let cond_id = ctx.action(action).cond_id;
        let set = CondSet::single(cond_id, action);
        let vals = vec![CondVals(if sense { 1 } else { 0 })];
        let start = self.start_state().expect("machine has no start state");
        let out = self.st(start).out.clone();
        for tid in out {
            self.embed_condition_on_trans(ctx, tid, &set, &vals)?;
            ctx.action_mut(action).num_cond_refs += 1;
        }
        Ok(())
    }

    /// Guard every transition in the machine on a condition.
    pub fn all_trans_condition(
        &mut self,
        ctx: &mut FsmCtx,
        action: super::act::ActionId,
        sense: bool,
    ) -> Result<(), FsmError> {
        let cond_id = ctx.action(action).cond_id;
        let set = CondSet::single(cond_id, action);
        let vals = vec![CondVals(if sense { 1 } else { 0 })];
        for state in self.states() {
            let out = self.st(state).out.clone();
            for tid in out {
                self.embed_condition_on_trans(ctx, tid, &set, &vals)?;
                ctx.action_mut(action).num_cond_refs += 1;
            }
        }
        Ok(())
    }

    /// Guard the machine's leaving transitions on a condition, applied
    /// through the final states' out carriers when the machine is
    /// extended.
    pub fn leave_fsm_condition(
        &mut self,
        ctx: &mut FsmCtx,
        action: super::act::ActionId,
        sense: bool,
    ) {
        let cond_id = ctx.action(action).cond_id;
        let set = CondSet::single(cond_id, action);
        let vals = vec![CondVals(if sense { 1 } else { 0 })];
        for fin in self.fin_states().to_vec() {
            self.embed_condition(ctx, fin, &set, &vals);
            ctx.action_mut(action).num_cond_refs += 1;
        }
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
    fn convert_to_cond_preserves_target_and_in_list() {
        let mut c = ctx();
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        let t = fsm.attach_new_trans(c.key_ops, a, Some(b), Key(1), Key(2));
        fsm.convert_trans_to_cond(&mut c, t);
        assert_eq!(fsm.tr(t).cond(CondVals(0)).unwrap().to, Some(b));
        assert_eq!(fsm.st(b).in_refs, vec![InRef::Cond(t, CondVals(0))]);
    }

    #[test]
    fn expansion_duplicates_conds_over_new_guard() {
        let mut c = ctx();
        let guard = c.add_action(InputLoc::default(), "g", InlineRef(0));
        let cond_id = c.action(guard).cond_id;
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        let t = fsm.attach_new_trans(c.key_ops, a, Some(b), Key(1), Key(2));
        fsm.convert_trans_to_cond(&mut c, t);
        let wide = c.add_cond_space(CondSet::single(cond_id, guard));
        fsm.expand_trans_conds(&mut c, t, wide).unwrap();
        match &fsm.tr(t).body {
            TransBody::Cond { conds, .. } => {
                assert_eq!(conds.len(), 2);
                assert_eq!(conds[0].vals, CondVals(0));
                assert_eq!(conds[1].vals, CondVals(1));
                assert_eq!(conds[0].data.to, Some(b));
                assert_eq!(conds[1].data.to, Some(b));
            }
            TransBody::Plain(_) => panic!("expected cond trans"),
        }
        // Both sub-transitions are in b's in-list.
        assert_eq!(fsm.st(b).in_refs.len(), 2);
    }

    #[test]
    fn embedding_a_condition_drops_the_other_sense() {
        let mut c = ctx();
        let guard = c.add_action(InputLoc::default(), "g", InlineRef(0));
        let cond_id = c.action(guard).cond_id;
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        let t = fsm.attach_new_trans(c.key_ops, a, Some(b), Key(1), Key(2));
        let set = CondSet::single(cond_id, guard);
        fsm.embed_condition_on_trans(&mut c, t, &set, &[CondVals(1)])
            .unwrap();
        match &fsm.tr(t).body {
            TransBody::Cond { conds, .. } => {
                assert_eq!(conds.len(), 1);
                assert_eq!(conds[0].vals, CondVals(1));
            }
            TransBody::Plain(_) => panic!("expected cond trans"),
        }
        assert_eq!(fsm.st(b).in_refs.len(), 1);
    }

    #[test]
    fn cond_cost_overflow_is_reported() {
        let mut c = ctx();
        c.cond_cost_limit = 2;
        let g1 = c.add_action(InputLoc::default(), "g1", InlineRef(0));
        let g2 = c.add_action(InputLoc::default(), "g2", InlineRef(1));
        let g3 = c.add_action(InputLoc::default(), "g3", InlineRef(2));
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        let t = fsm.attach_new_trans(c.key_ops, a, Some(b), Key(1), Key(2));
        let mut set = CondSet::new();
        for g in [g1, g2, g3] {
            set.insert(c.action(g).cond_id, g);
        }
        let wide = c.add_cond_space(set);
        fsm.convert_trans_to_cond(&mut c, t);
        match fsm.expand_trans_conds(&mut c, t, wide) {
            Err(FsmError::CondCostTooHigh(_)) => {}
            other => panic!("expected CondCostTooHigh, got {:?}", other),
        }
    }
}
