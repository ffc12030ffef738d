//! Minimization.
//!
//! Three strategies, each preserving the language:
//!
//! - `minimize_stable`: quadratic-space pair marking. Marks every
//!   distinguishable state pair, refines to a fixed point, then fuses the
//!   unmarked pairs. Slow but produces the minimal machine.
//! - `minimize_approximate`: repeatedly fuses any two states whose
//!   complete out structure is pointwise identical. No extra space, not
//!   guaranteed minimal but usually close.
//! - `minimize_partition1`/`minimize_partition2`: partition refinement.
//!   States start partitioned by finality and action/priority shape;
//!   partitions split while any member disagrees with its representative
//!   on some out segment's target partition. Partition2 revisits only
//!   partitions that can actually have changed.
//!
//! All comparisons treat priorities by descriptor identity and action
//! tables structurally, so machines differing only in embeddings do not
//! merge.

use std::cmp::Ordering;

use tracing::debug;

use super::ctx::FsmCtx;
use super::fsm::Fsm;
use super::rangeiter::{RangeEntry, RangePairIter, RangePairStep};
use super::state::{Scratch, StateId, TransBody, TransData, TransId};

/// How transition payloads are compared during a walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmpMode {
    /// Tables only; targets ignored.
    DataOnly,
    /// Tables plus target state identity.
    FullState,
    /// Tables plus the partition the target currently belongs to.
    Partition,
}

/// Marked-pair table for the stable minimization. Pairs are normalized
/// to `(lo, hi)` order before lookup.
struct MarkIndex {
    num_states: usize,
    marks: Vec<bool>,
}

impl MarkIndex {
    fn new(num_states: usize) -> MarkIndex {
        MarkIndex {
            num_states,
            marks: vec![false; num_states * num_states],
        }
    }

    fn mark_pair(&mut self, s1: usize, s2: usize) {
        let (lo, hi) = if s1 < s2 { (s1, s2) } else { (s2, s1) };
        self.marks[lo * self.num_states + hi] = true;
    }

    fn is_pair_marked(&self, s1: usize, s2: usize) -> bool {
        let (lo, hi) = if s1 < s2 { (s1, s2) } else { (s2, s1) };
        self.marks[lo * self.num_states + hi]
    }
}

impl Fsm {
    /// Run the strategy selected in the context.
    pub fn minimize(&mut self, ctx: &FsmCtx) {
        match ctx.minimize_level {
            super::ctx::MinimizeLevel::Approximate => self.minimize_approximate(ctx),
            super::ctx::MinimizeLevel::Stable => self.minimize_stable(ctx),
            super::ctx::MinimizeLevel::Partition1 => self.minimize_partition1(ctx),
            super::ctx::MinimizeLevel::Partition2 => self.minimize_partition2(ctx),
        }
    }

    /*
     * Comparison workers.
     */

    fn state_number(&self, id: StateId) -> usize {
        match self.st(id).scratch {
            Scratch::Number(n) => n as usize,
            _ => panic!("state numbers not assigned"),
        }
    }

    fn partition_of(&self, id: StateId) -> u32 {
        match self.st(id).scratch {
            Scratch::Partition(p) => p,
            _ => panic!("partitions not assigned"),
        }
    }

    fn cmp_data(&self, mode: CmpMode, d1: &TransData, d2: &TransData) -> Ordering {
        let ord = d1
            .actions
            .els()
            .cmp(d2.actions.els())
            .then_with(|| d1.priors.els().cmp(d2.priors.els()))
            .then_with(|| d1.lm_actions.els().cmp(d2.lm_actions.els()));
        if ord != Ordering::Equal {
            return ord;
        }
        match mode {
            CmpMode::DataOnly => Ordering::Equal,
            CmpMode::FullState => d1.to.cmp(&d2.to),
            CmpMode::Partition => match (d1.to, d2.to) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => self.partition_of(a).cmp(&self.partition_of(b)),
            },
        }
    }

    /// Compare two transition payloads, ignoring their key ranges.
    fn cmp_trans_payload(&self, mode: CmpMode, t1: TransId, t2: TransId) -> Ordering {
        match (&self.tr(t1).body, &self.tr(t2).body) {
            (TransBody::Plain(d1), TransBody::Plain(d2)) => self.cmp_data(mode, d1, d2),
            (TransBody::Plain(_), TransBody::Cond { .. }) => Ordering::Less,
            (TransBody::Cond { .. }, TransBody::Plain(_)) => Ordering::Greater,
            (
                TransBody::Cond {
                    space: s1,
                    conds: c1,
                },
                TransBody::Cond {
                    space: s2,
                    conds: c2,
                },
            ) => s1
                .cmp(s2)
                .then_with(|| c1.len().cmp(&c2.len()))
                .then_with(|| {
                    for (a, b) in c1.iter().zip(c2.iter()) {
                        let ord = a
                            .vals
                            .cmp(&b.vals)
                            .then_with(|| self.cmp_data(mode, &a.data, &b.data));
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                }),
        }
    }

    fn range_entries(&self, state: StateId) -> Vec<RangeEntry<TransId>> {
        self.st(state)
            .out
            .iter()
            .map(|&t| RangeEntry {
                low: self.tr(t).low,
                high: self.tr(t).high,
                payload: t,
            })
            .collect()
    }

    /// Walk the out lists of two states segment by segment and compare
    /// the payloads under the given mode. One-sided segments order the
    /// state that has them after the one that does not.
    fn cmp_out_lists(&self, ctx: &FsmCtx, mode: CmpMode, s1: StateId, s2: StateId) -> Ordering {
        let e1 = self.range_entries(s1);
        let e2 = self.range_entries(s2);
        let mut it = RangePairIter::new(ctx.key_ops, &e1, &e2);
        while let Some(step) = it.next() {
            match step {
                RangePairStep::BreakFirst | RangePairStep::BreakSecond => {}
                RangePairStep::InFirst => return Ordering::Greater,
                RangePairStep::InSecond => return Ordering::Less,
                RangePairStep::Overlap => {
                    let ord =
                        self.cmp_trans_payload(mode, it.first().payload, it.second().payload);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
        Ordering::Equal
    }

    /// Compare the data stored on two states: the entry/exit/EOF/error
    /// tables, pending out data and longest-match items.
    fn cmp_state_data(&self, s1: StateId, s2: StateId) -> Ordering {
        let a = self.st(s1);
        let b = self.st(s2);
        a.to_state_actions
            .els()
            .cmp(b.to_state_actions.els())
            .then_with(|| a.from_state_actions.els().cmp(b.from_state_actions.els()))
            .then_with(|| a.out_actions.els().cmp(b.out_actions.els()))
            .then_with(|| a.out_priors.els().cmp(b.out_priors.els()))
            .then_with(|| a.eof_actions.els().cmp(b.eof_actions.els()))
            .then_with(|| a.err_actions.els().cmp(b.err_actions.els()))
            .then_with(|| a.out_cond_space.cmp(&b.out_cond_space))
            .then_with(|| a.out_cond_vals.cmp(&b.out_cond_vals))
            .then_with(|| a.lm_items.cmp(&b.lm_items))
            .then_with(|| a.guarded_in_priors.els().cmp(b.guarded_in_priors.els()))
    }

    /*
     * Fusion workers.
     */

    /// Move the inward transitions of `src` onto `dest`.
    fn move_inward_trans(&mut self, dest: StateId, src: StateId) {
        let refs = std::mem::take(&mut self.st_mut(src).in_refs);
        for r in refs {
            let tid = r.trans();
            let from = self.tr(tid).from;
            match r {
                super::state::InRef::Plain(_) => {
                    self.tr_mut(tid).plain_mut().unwrap().to = Some(dest);
                }
                super::state::InRef::Cond(_, vals) => {
                    self.tr_mut(tid).cond_mut(vals).unwrap().to = Some(dest);
                }
            }
            if from != src {
                self.dec_foreign(src);
            }
            if from != dest {
                self.inc_foreign(dest);
            }
            self.st_mut(dest).in_refs.push(r);
        }
    }

    /// Make `src` and `dest` the same state: inward transitions, entry
    /// registrations and start status move to `dest`, then `src` is
    /// detached.
    pub(crate) fn fuse_equiv_states(&mut self, dest: StateId, src: StateId) {
        self.move_inward_trans(dest, src);
        let entry_ids: Vec<i32> = self.st(src).entry_ids.to_vec();
        for id in entry_ids {
            self.change_entry(id, dest, src);
        }
        if self.start_state() == Some(src) {
            self.unset_start_state();
            self.set_start_state(dest);
        }
        for state in self.states() {
            if self.st(state).eof_target == Some(src) {
                self.st_mut(state).eof_target = Some(dest);
            }
        }
        self.detach_state(src);
    }

    /*
     * Stable minimization.
     */

    /// Minimal machine by pair marking. Quadratic space, average
    /// quadratic time.
    pub fn minimize_stable(&mut self, ctx: &FsmCtx) {
        self.set_state_numbers(0);
        let states = self.states();
        let n = states.len();
        let mut mark = MarkIndex::new(n);

        self.initial_mark_round(ctx, &states, &mut mark);
        while self.mark_round(ctx, &states, &mut mark) {}
        self.fuse_unmarked_pairs(&states, &mark);
        debug!(states = self.state_count(), "stable minimization done");
    }

    /// Mark pairs that differ in finality, state data, or transition
    /// data on some out segment.
    fn initial_mark_round(&mut self, ctx: &FsmCtx, states: &[StateId], mark: &mut MarkIndex) {
        for i in 0..states.len() {
            for j in (i + 1)..states.len() {
                let (p, q) = (states[i], states[j]);
                if self.st(p).is_final() != self.st(q).is_final()
                    || self.cmp_state_data(p, q) != Ordering::Equal
                    || self.cmp_out_lists(ctx, CmpMode::DataOnly, p, q) != Ordering::Equal
                {
                    mark.mark_pair(i, j);
                }
            }
        }
    }

    /// One refinement round: mark unmarked pairs whose out segments send
    /// them to a distinguishable or one-sided target pair. Returns
    /// whether anything was marked.
    fn mark_round(&mut self, ctx: &FsmCtx, states: &[StateId], mark: &mut MarkIndex) -> bool {
        let mut marked_any = false;
        for i in 0..states.len() {
            for j in (i + 1)..states.len() {
                if mark.is_pair_marked(i, j) {
                    continue;
                }
                if self.should_mark_targets(ctx, mark, states[i], states[j]) {
                    mark.mark_pair(i, j);
                    marked_any = true;
                }
            }
        }
        marked_any
    }

    fn should_mark_targets(
        &self,
        ctx: &FsmCtx,
        mark: &MarkIndex,
        s1: StateId,
        s2: StateId,
    ) -> bool {
        let e1 = self.range_entries(s1);
        let e2 = self.range_entries(s2);
        let mut it = RangePairIter::new(ctx.key_ops, &e1, &e2);
        while let Some(step) = it.next() {
            match step {
                RangePairStep::BreakFirst | RangePairStep::BreakSecond => {}
                // One-sided segments already marked the pair in the
                // initial round.
                RangePairStep::InFirst | RangePairStep::InSecond => {}
                RangePairStep::Overlap => {
                    let t1 = it.first().payload;
                    let t2 = it.second().payload;
                    // Unmarked pairs passed the data compare, so the two
                    // bodies have the same shape and cond keys; targets
                    // align positionally.
                    let pairs: Vec<(Option<StateId>, Option<StateId>)> =
                        match (&self.tr(t1).body, &self.tr(t2).body) {
                            (TransBody::Plain(d1), TransBody::Plain(d2)) => {
                                vec![(d1.to, d2.to)]
                            }
                            (
                                TransBody::Cond { conds: c1, .. },
                                TransBody::Cond { conds: c2, .. },
                            ) => c1
                                .iter()
                                .zip(c2.iter())
                                .map(|(a, b)| (a.data.to, b.data.to))
                                .collect(),
                            _ => return true,
                        };
                    for (a, b) in pairs {
                        match (a, b) {
                            (None, None) => {}
                            (None, Some(_)) | (Some(_), None) => return true,
                            (Some(a), Some(b)) => {
                                if a != b
                                    && mark.is_pair_marked(
                                        self.state_number(a),
                                        self.state_number(b),
                                    )
                                {
                                    return true;
                                }
                            }
                        }
                    }
                }
            }
        }
        false
    }

    /// Fuse every pair left unmarked into the earlier member of the
    /// pair.
    fn fuse_unmarked_pairs(&mut self, states: &[StateId], mark: &MarkIndex) {
        let mut dead = vec![false; states.len()];
        for i in 0..states.len() {
            if dead[i] {
                continue;
            }
            for j in (i + 1)..states.len() {
                if dead[j] || mark.is_pair_marked(i, j) {
                    continue;
                }
                self.fuse_equiv_states(states[i], states[j]);
                dead[j] = true;
            }
        }
    }

    /*
     * Approximate minimization.
     */

    /// Repeatedly fuse states with identical complete out structure.
    pub fn minimize_approximate(&mut self, ctx: &FsmCtx) {
        while self.minimize_round(ctx) {}
        debug!(states = self.state_count(), "approximate minimization done");
    }

    /// One scan over the state list; fuses the first identical pair
    /// found. Returns whether a fusion happened.
    fn minimize_round(&mut self, ctx: &FsmCtx) -> bool {
        let states = self.states();
        for i in 0..states.len() {
            for j in (i + 1)..states.len() {
                let (p, q) = (states[i], states[j]);
                if self.st(p).is_final() == self.st(q).is_final()
                    && self.cmp_state_data(p, q) == Ordering::Equal
                    && self.cmp_out_lists(ctx, CmpMode::FullState, p, q) == Ordering::Equal
                {
                    self.fuse_equiv_states(p, q);
                    return true;
                }
            }
        }
        false
    }

    /*
     * Partition minimization.
     */

    /// Partition refinement, full rounds until no partition splits.
    pub fn minimize_partition1(&mut self, ctx: &FsmCtx) {
        let mut parts = self.init_partitions(ctx);
        loop {
            let mut split_any = false;
            for pid in 0..parts.len() {
                if self.split_partition(ctx, &mut parts, pid) {
                    split_any = true;
                }
            }
            if !split_any {
                break;
            }
        }
        self.fuse_partitions(&parts);
        debug!(states = self.state_count(), "partition minimization done");
    }

    /// Partition refinement that revisits only candidate partitions:
    /// those with a transition into a partition that just split.
    pub fn minimize_partition2(&mut self, ctx: &FsmCtx) {
        let mut parts = self.init_partitions(ctx);
        let mut active: Vec<bool> = vec![true; parts.len()];
        let mut worklist: Vec<usize> = (0..parts.len()).collect();
        while let Some(pid) = worklist.pop() {
            active[pid] = false;
            let before = parts.len();
            if self.split_partition(ctx, &mut parts, pid) {
                active.resize(parts.len(), false);
                // Everything that can reach the split members may now
                // disagree with its representative.
                let mut touched: Vec<StateId> = parts[pid].clone();
                for new_pid in before..parts.len() {
                    touched.extend(parts[new_pid].iter().copied());
                }
                let mut candidates: Vec<usize> = Vec::new();
                for state in touched {
                    let froms: Vec<StateId> = self
                        .st(state)
                        .in_refs
                        .iter()
                        .map(|r| self.tr(r.trans()).from)
                        .collect();
                    for from in froms {
                        candidates.push(self.partition_of(from) as usize);
                    }
                }
                candidates.push(pid);
                candidates.extend(before..parts.len());
                for cand in candidates {
                    if !active[cand] && parts[cand].len() > 1 {
                        active[cand] = true;
                        worklist.push(cand);
                    }
                }
            }
        }
        self.fuse_partitions(&parts);
        debug!(states = self.state_count(), "partition minimization done");
    }

    /// Initial partitioning by finality and action/priority shape. Each
    /// state joins the first partition whose representative it matches.
    fn init_partitions(&mut self, ctx: &FsmCtx) -> Vec<Vec<StateId>> {
        let mut parts: Vec<Vec<StateId>> = Vec::new();
        for state in self.states() {
            let found = parts.iter().position(|part| {
                let rep = part[0];
                self.st(rep).is_final() == self.st(state).is_final()
                    && self.cmp_state_data(rep, state) == Ordering::Equal
                    && self.cmp_out_lists(ctx, CmpMode::DataOnly, rep, state) == Ordering::Equal
            });
            match found {
                Some(pid) => parts[pid].push(state),
                None => parts.push(vec![state]),
            }
        }
        for (pid, part) in parts.iter().enumerate() {
            for &state in part {
                self.st_mut(state).scratch = Scratch::Partition(pid as u32);
            }
        }
        parts
    }

    /// Split members of the partition that disagree with the
    /// representative on some out segment's target partition. Returns
    /// whether a split happened.
    fn split_partition(
        &mut self,
        ctx: &FsmCtx,
        parts: &mut Vec<Vec<StateId>>,
        pid: usize,
    ) -> bool {
        if parts[pid].len() < 2 {
            return false;
        }
        let rep = parts[pid][0];
        let members = parts[pid].clone();
        let mut stay: Vec<StateId> = vec![rep];
        let mut moved: Vec<StateId> = Vec::new();
        for &state in &members[1..] {
            if self.cmp_out_lists(ctx, CmpMode::Partition, rep, state) == Ordering::Equal {
                stay.push(state);
            } else {
                moved.push(state);
            }
        }
        if moved.is_empty() {
            return false;
        }
        let new_pid = parts.len() as u32;
        for &state in &moved {
            self.st_mut(state).scratch = Scratch::Partition(new_pid);
        }
        parts[pid] = stay;
        parts.push(moved);
        true
    }

    /// Fuse each partition into its representative.
    fn fuse_partitions(&mut self, parts: &[Vec<StateId>]) {
        for part in parts {
            for &state in &part[1..] {
                self.fuse_equiv_states(part[0], state);
            }
        }
        for state in self.states() {
            self.st_mut(state).scratch = Scratch::None;
        }
    }

    /*
     * Transition compression.
     */

    /// Fuse adjacent transitions with contiguous ranges and identical
    /// payload into one range. Run after minimization.
    pub fn compress_transitions(&mut self, ctx: &FsmCtx) {
        let key_ops = ctx.key_ops;
        for state in self.states() {
            let mut out = self.st(state).out.clone();
            let mut i = 0;
            while i + 1 < out.len() {
                let t1 = out[i];
                let t2 = out[i + 1];
                let contiguous = key_ops.eq(key_ops.increment(self.tr(t1).high), self.tr(t2).low);
                if contiguous
                    && self.cmp_trans_payload(CmpMode::FullState, t1, t2) == Ordering::Equal
                {
                    let high = self.tr(t2).high;
                    self.tr_mut(t1).high = high;
                    self.detach_and_free_trans(t2);
                    out.remove(i + 1);
                } else {
                    i += 1;
                }
            }
            self.st_mut(state).out = out;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::key::{Key, KeyOps};

    fn ctx() -> FsmCtx {
        FsmCtx::new(KeyOps::unsigned_octet())
    }

    fn key(c: char) -> Key {
        Key::from_char(c)
    }

    #[test]
    fn stable_fuses_equivalent_tails() {
        let mut c = ctx();
        // a|b built without determinization sharing: two parallel paths
        // to distinct final states.
        let a = Fsm::concat_fsm_char(&c, key('a'));
        let b = Fsm::concat_fsm_char(&c, key('b'));
        let mut m = a;
        m.union_op(&mut c, b).unwrap();
        m.minimize_stable(&c);
        // start + one shared final state.
        assert_eq!(m.state_count(), 2);
        m.verify_integrity(&c);
    }

    #[test]
    fn approximate_fuses_identical_states() {
        let mut c = ctx();
        let a = Fsm::range_fsm(&c, key('a'), key('z')).unwrap();
        let b = Fsm::range_fsm(&c, key('A'), key('Z')).unwrap();
        let mut m = a;
        m.union_op(&mut c, b).unwrap();
        m.minimize_approximate(&c);
        assert_eq!(m.state_count(), 2);
        m.verify_integrity(&c);
    }

    #[test]
    fn partition_strategies_agree_with_stable() {
        for level in [1, 2] {
            let mut c = ctx();
            let ab = Fsm::concat_fsm(&c, &[key('a'), key('b')]);
            let cb = Fsm::concat_fsm(&c, &[key('c'), key('b')]);
            let mut m = ab;
            m.union_op(&mut c, cb).unwrap();
            if level == 1 {
                m.minimize_partition1(&c);
            } else {
                m.minimize_partition2(&c);
            }
            // start, shared middle, shared final.
            assert_eq!(m.state_count(), 3);
            m.verify_integrity(&c);
        }
    }

    #[test]
    fn compression_joins_contiguous_ranges() {
        let c = ctx();
        let mut fsm = Fsm::new();
        let a = fsm.add_state();
        let b = fsm.add_state();
        fsm.set_start_state(a);
        fsm.set_fin_state(b);
        fsm.attach_new_trans(c.key_ops, a, Some(b), key('a'), key('m'));
        fsm.attach_new_trans(c.key_ops, a, Some(b), key('n'), key('z'));
        fsm.compress_transitions(&c);
        assert_eq!(fsm.out_trans(a).len(), 1);
        let (low, high) = fsm.trans_keys(fsm.out_trans(a)[0]);
        assert_eq!((low, high), (key('a'), key('z')));
        fsm.verify_integrity(&c);
    }
}
