//! The state and transition data model.
//!
//! States and transitions live in slabs owned by the graph and are
//! referenced by index newtypes, so cyclic structure costs nothing and
//! in-transition lists are plain collections of non-owning handles. A
//! transition is a tagged union: plain data, or a condition space with a
//! list of sub-transitions keyed by condition-value vectors.

use smallvec::SmallVec;

use super::act::{ActionTable, ErrActionTable, LmActionTable, LmPartId, PriorTable};
use super::cond::{CondSpaceId, CondVals};
use super::key::Key;

/// A state identifier, an index into the graph's state slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub u32);

impl StateId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A transition identifier, an index into the graph's transition slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransId(pub u32);

impl TransId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/* State bits. Graph-1/2 mark provenance during intersection and
 * subtraction; the rest control list membership and traversal marking. */
pub const SB_GRAPH1: u32 = 0x01;
pub const SB_GRAPH2: u32 = 0x02;
pub const SB_BOTH: u32 = 0x03;
pub const SB_ISFINAL: u32 = 0x04;
pub const SB_ISMARKED: u32 = 0x08;
pub const SB_ONLIST: u32 = 0x10;
pub const SB_NFA_REP: u32 = 0x20;

/// The payload shared by plain transitions and each conditional
/// sub-transition: target state plus the three tables.
///
/// A `None` target is a transition into the implicit error state; it still
/// carries its tables so error-path actions survive merging.
#[derive(Clone, Debug, Default)]
pub struct TransData {
    pub to: Option<StateId>,
    pub actions: ActionTable,
    pub priors: PriorTable,
    pub lm_actions: LmActionTable,
}

impl TransData {
    /// Copy of the payload without the target, for splitting and crossing.
    pub fn dup_tables(&self) -> TransData {
        TransData {
            to: None,
            actions: self.actions.clone(),
            priors: self.priors.clone(),
            lm_actions: self.lm_actions.clone(),
        }
    }
}

/// One sub-transition of a conditional transition, keyed by the
/// condition-value vector that selects it.
#[derive(Clone, Debug)]
pub struct CondTarget {
    pub vals: CondVals,
    pub data: TransData,
}

/// The two transition shapes. The variant is explicit and dispatch is
/// pattern matching; nothing switches on a null condition space.
#[derive(Clone, Debug)]
pub enum TransBody {
    Plain(TransData),
    Cond {
        space: CondSpaceId,
        /// Sub-transitions sorted by `vals`, keys unique and inside
        /// `[0, full_size)` of the space.
        conds: SmallVec<[CondTarget; 2]>,
    },
}

/// A transition spanning the key range `[low, high]`. Owned by its from
/// state; within a state's out list ranges are disjoint and sorted.
#[derive(Clone, Debug)]
pub struct Trans {
    pub from: StateId,
    pub low: Key,
    pub high: Key,
    pub body: TransBody,
}

impl Trans {
    pub fn plain(&self) -> Option<&TransData> {
        match &self.body {
            TransBody::Plain(data) => Some(data),
            TransBody::Cond { .. } => None,
        }
    }

    pub fn plain_mut(&mut self) -> Option<&mut TransData> {
        match &mut self.body {
            TransBody::Plain(data) => Some(data),
            TransBody::Cond { .. } => None,
        }
    }

    /// Find a sub-transition by its condition-value key.
    pub fn cond(&self, vals: CondVals) -> Option<&TransData> {
        match &self.body {
            TransBody::Plain(_) => None,
            TransBody::Cond { conds, .. } => conds
                .binary_search_by_key(&vals, |c| c.vals)
                .ok()
                .map(|i| &conds[i].data),
        }
    }

    pub fn cond_mut(&mut self, vals: CondVals) -> Option<&mut TransData> {
        match &mut self.body {
            TransBody::Plain(_) => None,
            TransBody::Cond { conds, .. } => match conds.binary_search_by_key(&vals, |c| c.vals) {
                Ok(i) => Some(&mut conds[i].data),
                Err(_) => None,
            },
        }
    }

    /// Every target the transition can reach, across all shapes.
    pub fn targets(&self) -> SmallVec<[StateId; 2]> {
        let mut out = SmallVec::new();
        match &self.body {
            TransBody::Plain(data) => {
                if let Some(to) = data.to {
                    out.push(to);
                }
            }
            TransBody::Cond { conds, .. } => {
                for c in conds {
                    if let Some(to) = c.data.to {
                        out.push(to);
                    }
                }
            }
        }
        out
    }
}

/// A non-owning back-reference held in a target state's in-list. Plain
/// transitions are identified by id alone; conditional sub-transitions
/// additionally by their value key, which is stable within the owning
/// transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InRef {
    Plain(TransId),
    Cond(TransId, CondVals),
}

impl InRef {
    pub fn trans(self) -> TransId {
        match self {
            InRef::Plain(t) => t,
            InRef::Cond(t, _) => t,
        }
    }
}

/// Epsilon push/pop bookkeeping on an NFA edge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NfaActions {
    pub push: ActionTable,
    pub pop: ActionTable,
    /// Ordering priorities used when NFA edges are collapsed.
    pub priors: PriorTable,
}

/// Phase-scoped scratch data. The three temporaries are never live at
/// the same time; the active variant is tracked explicitly rather than
/// by phase discipline alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Scratch {
    #[default]
    None,
    /// During graph duplication: the state representing this one in the
    /// copy.
    StateMap(StateId),
    /// During partition minimization: the partition the state is in.
    Partition(u32),
    /// During numbering, printing and stable minimization.
    Number(i32),
}

/// A state. Action tables on the state fire at entry/exit/EOF/error; the
/// out-carrier fields hold conditions and actions that will be pushed into
/// every future outgoing transition drawn from this state.
#[derive(Clone, Debug, Default)]
pub struct State {
    /// Out transitions, sorted by low key, pairwise disjoint.
    pub out: Vec<TransId>,
    /// In-transition references, plain and conditional.
    pub in_refs: Vec<InRef>,

    /// Number of in references from states other than this one. Start
    /// state status and entry points count as one reference each; this
    /// drives misfit accounting.
    pub foreign_in_refs: u32,

    /// Entry ids naming this state.
    pub entry_ids: SmallVec<[i32; 2]>,
    /// Pending epsilon transitions, by entry id.
    pub epsilon_ids: SmallVec<[i32; 2]>,
    /// Resolution worklist for pending epsilons: `(target, leaving)`.
    pub ept_vect: Vec<(StateId, bool)>,
    /// Which joined operand the state came from, for leaving detection.
    pub owning_graph: u32,

    pub eof_target: Option<StateId>,

    pub bits: u32,

    pub to_state_actions: ActionTable,
    pub from_state_actions: ActionTable,
    pub out_actions: ActionTable,
    pub out_priors: PriorTable,
    pub eof_actions: ActionTable,
    pub err_actions: ErrActionTable,

    /// Conditions pending transfer to future outgoing transitions.
    pub out_cond_space: Option<CondSpaceId>,
    pub out_cond_vals: Vec<CondVals>,

    /// Longest-match items that may be active in this state.
    pub lm_items: SmallVec<[LmPartId; 2]>,

    /// Priorities guarding inward NFA edges.
    pub guarded_in_priors: PriorTable,

    /// NFA epsilon edges out of and into this state.
    pub nfa_out: Vec<(StateId, NfaActions)>,
    pub nfa_in: Vec<StateId>,

    /// The set of states this one represents while it waits on the
    /// fill queue of a subset construction.
    pub dict_set: Option<Box<Vec<StateId>>>,

    pub scratch: Scratch,
}

impl State {
    pub fn is_final(&self) -> bool {
        self.bits & SB_ISFINAL != 0
    }

    pub fn is_marked(&self) -> bool {
        self.bits & SB_ISMARKED != 0
    }

    pub fn insert_entry_id(&mut self, id: i32) {
        if let Err(pos) = self.entry_ids.binary_search(&id) {
            self.entry_ids.insert(pos, id);
        }
    }

    pub fn remove_entry_id(&mut self, id: i32) {
        if let Ok(pos) = self.entry_ids.binary_search(&id) {
            self.entry_ids.remove(pos);
        }
    }

    pub fn insert_lm_item(&mut self, part: LmPartId) {
        if let Err(pos) = self.lm_items.binary_search(&part) {
            self.lm_items.insert(pos, part);
        }
    }

    /// Add an NFA edge record; the push/pop tables merge if the target is
    /// already present.
    pub fn insert_nfa_out(&mut self, to: StateId, actions: NfaActions) {
        match self.nfa_out.binary_search_by_key(&to, |el| el.0) {
            Ok(pos) => {
                self.nfa_out[pos].1.push.set_actions(&actions.push);
                self.nfa_out[pos].1.pop.set_actions(&actions.pop);
            }
            Err(pos) => self.nfa_out.insert(pos, (to, actions)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_ids_stay_sorted_and_unique() {
        let mut st = State::default();
        st.insert_entry_id(4);
        st.insert_entry_id(1);
        st.insert_entry_id(4);
        assert_eq!(st.entry_ids.as_slice(), &[1, 4]);
        st.remove_entry_id(4);
        assert_eq!(st.entry_ids.as_slice(), &[1]);
    }

    #[test]
    fn cond_lookup_by_vals() {
        let trans = Trans {
            from: StateId(0),
            low: Key(0),
            high: Key(0),
            body: TransBody::Cond {
                space: CondSpaceId(0),
                conds: smallvec::smallvec![
                    CondTarget {
                        vals: CondVals(0),
                        data: TransData {
                            to: Some(StateId(1)),
                            ..Default::default()
                        },
                    },
                    CondTarget {
                        vals: CondVals(1),
                        data: TransData::default(),
                    },
                ],
            },
        };
        assert_eq!(trans.cond(CondVals(0)).unwrap().to, Some(StateId(1)));
        assert!(trans.cond(CondVals(1)).unwrap().to.is_none());
        assert!(trans.cond(CondVals(2)).is_none());
        assert_eq!(trans.targets().as_slice(), &[StateId(1)]);
    }
}
