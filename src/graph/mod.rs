//! The FSM graph and its algebra.
//!
//! This module tree is the core of the compiler: the in-memory automaton
//! graph together with the operations that construct, combine,
//! determinize and minimize it. The key components are:
//!
//! - `key`: the ordered symbol algebra transitions are ranged over
//! - `act`: actions, action tables and the priority system
//! - `cond`: interned condition spaces and value vectors
//! - `ctx`: the shared context (dictionaries, key ops, limits)
//! - `state`: the state/transition data model
//! - `fsm`: the graph value and its housekeeping
//! - `rangeiter`: the range-pair and value-pair walkers
//! - `merge`: transition crossing and subset construction
//! - `ops`: primitive constructors and algebraic operators
//! - `nfa`: NFA-preserving union and repetition
//! - `minimize`: the three minimization strategies
//! - `prune`: reachability passes and integrity checks

mod act;
mod cond;
mod ctx;
mod fsm;
mod key;
mod merge;
mod minimize;
mod nfa;
mod ops;
mod prune;
mod rangeiter;
mod state;

#[cfg(test)]
mod tests;

pub use act::{
    compare_prior, Action, ActionId, ActionTable, ActionTableEl, ErrActionTable,
    ErrActionTableEl, InlineRef, InputLoc, LmActionTable, LmPartId, PriorDesc, PriorEl, PriorId,
    PriorTable,
};
pub use cond::{CondGuard, CondSet, CondSpace, CondSpaceId, CondVals};
pub use ctx::{FsmCtx, MinimizeLevel, MinimizeOpt};
pub use fsm::{Embedding, Fsm};
pub use key::{Key, KeyOps};
pub use nfa::{NfaRound, NfaRoundVect};
pub use rangeiter::{RangeEntry, RangePairIter, RangePairStep, ValEntry, ValPairIter, ValPairStep};
pub use state::{
    CondTarget, InRef, NfaActions, Scratch, State, StateId, Trans, TransBody, TransData, TransId,
    SB_BOTH, SB_GRAPH1, SB_GRAPH2, SB_ISFINAL, SB_ISMARKED, SB_NFA_REP, SB_ONLIST,
};
