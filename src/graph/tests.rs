//! End-to-end scenarios over the full operator pipeline.

use super::*;
use crate::FsmError;

fn ctx() -> FsmCtx {
    FsmCtx::new(KeyOps::unsigned_octet())
}

fn key(c: char) -> Key {
    Key::from_char(c)
}

fn keys(s: &str) -> Vec<Key> {
    s.chars().map(Key::from_char).collect()
}

/// Walk a determinized machine on a string. Only usable on machines
/// without condition spaces.
fn accepts(fsm: &Fsm, ctx: &FsmCtx, input: &str) -> bool {
    let Some(mut state) = fsm.start_state() else {
        return false;
    };
    'input: for c in input.chars() {
        let k = Key::from_char(c);
        for &tid in fsm.out_trans(state) {
            let (low, high) = fsm.trans_keys(tid);
            if ctx.key_ops.in_range(k, low, high) {
                match fsm.trans_body(tid) {
                    TransBody::Plain(data) => match data.to {
                        Some(to) => {
                            state = to;
                            continue 'input;
                        }
                        None => return false,
                    },
                    TransBody::Cond { .. } => panic!("cond trans in plain walk"),
                }
            }
        }
        return false;
    }
    fsm.is_final(state)
}

#[test]
fn test_case_insensitive_union() {
    let mut c = ctx();
    let ab = Fsm::concat_fsm_ci(&c, &keys("ab"));
    let ac = Fsm::concat_fsm_ci(&c, &keys("ac"));
    let mut m = ab;
    m.union_op(&mut c, ac).unwrap();
    // The subset construction shares the 'a'/'A' step: start, combined
    // middle, and the two original finals.
    assert_eq!(m.state_count(), 4);
    m.minimize_stable(&c);
    // The two finals are equivalent and fuse.
    assert_eq!(m.state_count(), 3);
    m.verify_integrity(&c);

    for good in ["ab", "aB", "Ab", "AB", "ac", "aC", "Ac", "AC"] {
        assert!(accepts(&m, &c, good), "should accept {}", good);
    }
    for bad in ["", "a", "b", "bc", "abc", "aa", "Ba"] {
        assert!(!accepts(&m, &c, bad), "should reject {}", bad);
    }
}

#[test]
fn test_range_star() {
    let mut c = ctx();
    let mut m = Fsm::range_fsm(&c, key('0'), key('9')).unwrap();
    m.star_op(&mut c).unwrap();
    assert_eq!(m.state_count(), 2);
    assert!(m.is_final(m.start_state().unwrap()));
    m.verify_integrity(&c);

    assert!(accepts(&m, &c, ""));
    assert!(accepts(&m, &c, "5"));
    assert!(accepts(&m, &c, "0123456789"));
    assert!(!accepts(&m, &c, "5a"));
}

#[test]
fn test_letter_ranges_union_approximate() {
    let mut c = ctx();
    let lower = Fsm::range_fsm(&c, key('a'), key('z')).unwrap();
    let upper = Fsm::range_fsm(&c, key('A'), key('Z')).unwrap();
    let mut m = lower;
    m.union_op(&mut c, upper).unwrap();
    m.minimize_approximate(&c);
    assert_eq!(m.state_count(), 2);
    m.verify_integrity(&c);

    let start = m.start_state().unwrap();
    let out = m.out_trans(start);
    assert_eq!(out.len(), 2);
    assert_eq!(m.trans_keys(out[0]), (key('A'), key('Z')));
    assert_eq!(m.trans_keys(out[1]), (key('a'), key('z')));

    assert!(accepts(&m, &c, "q"));
    assert!(accepts(&m, &c, "Q"));
    assert!(!accepts(&m, &c, "qq"));
    assert!(!accepts(&m, &c, "1"));
}

#[test]
fn test_intersection_of_disjoint_languages_is_empty() {
    let mut c = ctx();
    let ab = Fsm::concat_fsm(&c, &keys("ab"));
    let ac = Fsm::concat_fsm(&c, &keys("ac"));
    let mut m = ab;
    m.intersect_op(&mut c, ac).unwrap();
    // No final state survives; nothing is accepted.
    assert!(m.fin_states().is_empty());
    for probe in ["", "a", "ab", "ac"] {
        assert!(!accepts(&m, &c, probe));
    }
}

#[test]
fn test_subtract_self_is_empty() {
    let mut c = ctx();
    let mut m = Fsm::concat_fsm(&c, &keys("ab"));
    let other = m.duplicate();
    m.subtract_op(&mut c, other).unwrap();
    m.remove_unreachable_states();
    assert!(m.fin_states().is_empty());
    assert!(m.state_count() <= 1);
    for probe in ["", "a", "ab"] {
        assert!(!accepts(&m, &c, probe));
    }
}

#[test]
fn test_cond_cost_budget_respected_by_union() {
    // A budget of one admits the initial guard embeddings but not the
    // widening the union needs.
    let mut c = ctx();
    c.cond_cost_limit = 1;
    let g1 = c.add_action(InputLoc::default(), "g1", InlineRef(0));
    let g2 = c.add_action(InputLoc::default(), "g2", InlineRef(1));

    let mut m1 = Fsm::range_fsm(&c, key('a'), key('b')).unwrap();
    m1.all_trans_condition(&mut c, g1, true).unwrap();
    let mut m2 = Fsm::range_fsm(&c, key('a'), key('b')).unwrap();
    m2.all_trans_condition(&mut c, g2, true).unwrap();

    // Crossing the guarded ranges widens both condition spaces; the
    // zero budget rejects the expansion.
    match m1.union_op(&mut c, m2) {
        Err(FsmError::CondCostTooHigh(_)) => {}
        other => panic!("expected CondCostTooHigh, got {:?}", other),
    }
}

#[test]
fn test_state_limit_aborts_determinization() {
    let mut c = ctx();
    c.state_limit = 1;
    let m1 = Fsm::concat_fsm_char(&c, key('a'));
    let m2 = Fsm::concat_fsm_char(&c, key('a'));
    let mut m = m1;
    match m.union_op(&mut c, m2) {
        Err(FsmError::TooManyStates) => {}
        other => panic!("expected TooManyStates, got {:?}", other),
    }
}

#[test]
fn test_empty_range_is_trans_density() {
    let c = ctx();
    match Fsm::range_fsm(&c, key('z'), key('a')) {
        Err(FsmError::TransDensity) => {}
        other => panic!("expected TransDensity, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_repeat_laws() {
    let mut c = ctx();

    let mut zero = Fsm::concat_fsm(&c, &keys("ab"));
    zero.repeat_op(&mut c, 0).unwrap();
    assert!(accepts(&zero, &c, ""));
    assert!(!accepts(&zero, &c, "ab"));

    let mut neg = Fsm::concat_fsm(&c, &keys("ab"));
    assert_eq!(neg.repeat_op(&mut c, -1), Err(FsmError::Repetition));

    let mut three = Fsm::concat_fsm_char(&c, key('x'));
    three.repeat_op(&mut c, 3).unwrap();
    assert!(accepts(&three, &c, "xxx"));
    for bad in ["", "x", "xx", "xxxx"] {
        assert!(!accepts(&three, &c, bad));
    }

    let mut upto = Fsm::concat_fsm_char(&c, key('x'));
    upto.optional_repeat_op(&mut c, 2).unwrap();
    assert!(accepts(&upto, &c, ""));
    assert!(accepts(&upto, &c, "x"));
    assert!(accepts(&upto, &c, "xx"));
    assert!(!accepts(&upto, &c, "xxx"));
}

#[test]
fn test_union_with_self_is_identity() {
    let mut c = ctx();
    let mut a = Fsm::concat_fsm(&c, &keys("ab"));
    let mut m = a.duplicate();
    m.union_op(&mut c, a.duplicate()).unwrap();
    m.minimize_stable(&c);
    let mut base = a;
    base.minimize_stable(&c);
    assert_eq!(m.state_count(), base.state_count());
    for probe in ["", "a", "ab", "abb", "b"] {
        assert_eq!(accepts(&m, &c, probe), accepts(&base, &c, probe));
    }
}

#[test]
fn test_intersect_with_self_is_identity() {
    let mut c = ctx();
    let mut a = Fsm::concat_fsm(&c, &keys("ab"));
    let mut m = a.duplicate();
    m.intersect_op(&mut c, a.duplicate()).unwrap();
    m.minimize_stable(&c);
    let mut base = a;
    base.minimize_stable(&c);
    assert_eq!(m.state_count(), base.state_count());
    for probe in ["", "a", "ab", "abb"] {
        assert_eq!(accepts(&m, &c, probe), accepts(&base, &c, probe));
    }
}

#[test]
fn test_concat_with_lambda_is_identity() {
    let mut c = ctx();
    let mut m = Fsm::concat_fsm(&c, &keys("ab"));
    m.concat_op(&mut c, Fsm::lambda_fsm()).unwrap();
    assert!(accepts(&m, &c, "ab"));
    for bad in ["", "a", "aba"] {
        assert!(!accepts(&m, &c, bad));
    }
}

#[test]
fn test_star_is_idempotent() {
    let mut c = ctx();
    let mut once = Fsm::concat_fsm_char(&c, key('a'));
    once.star_op(&mut c).unwrap();
    let mut twice = once.duplicate();
    twice.star_op(&mut c).unwrap();
    once.minimize_stable(&c);
    twice.minimize_stable(&c);
    assert_eq!(once.state_count(), twice.state_count());
    for probe in ["", "a", "aaa", "b"] {
        assert_eq!(accepts(&once, &c, probe), accepts(&twice, &c, probe));
    }
}

#[test]
fn test_minimization_strategies_agree_on_language() {
    let mut c = ctx();
    let build = |c: &mut FsmCtx| {
        let ab = Fsm::concat_fsm(c, &keys("ab"));
        let cb = Fsm::concat_fsm(c, &keys("cb"));
        let mut m = ab;
        m.union_op(c, cb).unwrap();
        let mut tail = Fsm::range_fsm(c, key('0'), key('9')).unwrap();
        tail.star_op(c).unwrap();
        m.concat_op(c, tail).unwrap();
        m
    };
    let mut stable = build(&mut c);
    stable.minimize_stable(&c);
    let mut approx = build(&mut c);
    approx.minimize_approximate(&c);
    let mut part1 = build(&mut c);
    part1.minimize_partition1(&c);
    let mut part2 = build(&mut c);
    part2.minimize_partition2(&c);

    for probe in ["ab", "cb", "ab123", "cb007", "a", "b", "ab12x", ""] {
        let expect = accepts(&stable, &c, probe);
        assert_eq!(accepts(&approx, &c, probe), expect, "approx on {}", probe);
        assert_eq!(accepts(&part1, &c, probe), expect, "part1 on {}", probe);
        assert_eq!(accepts(&part2, &c, probe), expect, "part2 on {}", probe);
    }
    // Stable is minimal; no strategy beats it.
    assert!(approx.state_count() >= stable.state_count());
    assert!(part1.state_count() >= stable.state_count());
    assert!(part2.state_count() >= stable.state_count());
}

#[test]
fn test_priority_resolves_union_ambiguity() {
    let mut c = ctx();
    let act_hi = c.add_action(InputLoc::default(), "hi", InlineRef(0));
    let act_lo = c.add_action(InputLoc::default(), "lo", InlineRef(1));
    let hi = c.add_prior_desc(0, 1, 0);
    let lo = c.add_prior_desc(0, 0, 0);

    let mut m1 = Fsm::concat_fsm_char(&c, key('a'));
    m1.all_trans_action(&mut c, 0, act_hi);
    m1.all_trans_prior(&c, 0, hi);
    let mut m2 = Fsm::concat_fsm_char(&c, key('a'));
    m2.all_trans_action(&mut c, 1, act_lo);
    m2.all_trans_prior(&c, 1, lo);

    let mut m = m1;
    m.union_op(&mut c, m2).unwrap();
    // The higher priority wins the overlap outright; the low side's
    // action does not survive.
    let start = m.start_state().unwrap();
    assert_eq!(m.out_trans(start).len(), 1);
    let tid = m.out_trans(start)[0];
    match m.trans_body(tid) {
        TransBody::Plain(data) => {
            assert!(data.actions.has_action(act_hi));
            assert!(!data.actions.has_action(act_lo));
        }
        TransBody::Cond { .. } => panic!("expected plain trans"),
    }
}

#[test]
fn test_leave_actions_transfer_on_concat() {
    let mut c = ctx();
    let leave = c.add_action(InputLoc::default(), "leave", InlineRef(0));
    let mut m1 = Fsm::concat_fsm_char(&c, key('a'));
    m1.leave_fsm_action(&mut c, 0, leave);
    let m2 = Fsm::concat_fsm_char(&c, key('b'));
    m1.concat_op(&mut c, m2).unwrap();

    // The pending leave action landed on the transition drawn from the
    // old final state into the second machine.
    let start = m1.start_state().unwrap();
    let t_a = m1.out_trans(start)[0];
    let mid = match m1.trans_body(t_a) {
        TransBody::Plain(data) => data.to.unwrap(),
        TransBody::Cond { .. } => panic!(),
    };
    let t_b = m1.out_trans(mid)[0];
    match m1.trans_body(t_b) {
        TransBody::Plain(data) => assert!(data.actions.has_action(leave)),
        TransBody::Cond { .. } => panic!(),
    }
    assert!(accepts(&m1, &c, "ab"));
    assert!(!accepts(&m1, &c, "a"));
}

#[test]
fn test_epsilon_op_builds_loop() {
    let mut c = ctx();
    let mut m = Fsm::concat_fsm_char(&c, key('a'));
    let start = m.start_state().unwrap();
    m.set_entry(7, start);
    m.epsilon_trans(7);
    m.epsilon_op(&mut c).unwrap();
    m.verify_integrity(&c);

    assert!(accepts(&m, &c, "a"));
    assert!(accepts(&m, &c, "aaa"));
    assert!(!accepts(&m, &c, ""));
    assert!(!accepts(&m, &c, "ab"));
}

#[test]
fn test_join_over_entry_points() {
    let mut c = ctx();
    let mut a = Fsm::concat_fsm_char(&c, key('a'));
    let a_start = a.start_state().unwrap();
    a.set_entry(1, a_start);
    a.epsilon_trans(2);

    let mut b = Fsm::concat_fsm_char(&c, key('b'));
    let b_start = b.start_state().unwrap();
    let b_fin = b.fin_states()[0];
    b.set_entry(2, b_start);
    b.set_entry(3, b_fin);

    a.join_op(&mut c, 1, 3, vec![b]).unwrap();
    a.verify_integrity(&c);

    assert!(accepts(&a, &c, "ab"));
    for bad in ["", "a", "b", "ba", "abb"] {
        assert!(!accepts(&a, &c, bad), "should reject {}", bad);
    }
}

#[test]
fn test_glob_keeps_all_states() {
    let c = ctx();
    let a = Fsm::concat_fsm_char(&c, key('a'));
    let b = Fsm::concat_fsm_char(&c, key('b'));
    let mut m = a;
    m.glob_op(vec![b]);
    assert_eq!(m.state_count(), 4);
    assert_eq!(m.fin_states().len(), 2);
}

#[test]
fn test_or_fsm_matches_character_set() {
    let c = ctx();
    let mut m = Fsm::or_fsm(&c, &keys("xyz"));
    m.compress_transitions(&c);
    let start = m.start_state().unwrap();
    // The three adjacent single-key transitions compress to one range.
    assert_eq!(m.out_trans(start).len(), 1);
    for good in ["x", "y", "z"] {
        assert!(accepts(&m, &c, good));
    }
    assert!(!accepts(&m, &c, "w"));
}

#[test]
fn test_depth_first_ordering_and_numbering() {
    let mut c = ctx();
    let ab = Fsm::concat_fsm(&c, &keys("ab"));
    let cd = Fsm::concat_fsm(&c, &keys("cd"));
    let mut m = ab;
    m.union_op(&mut c, cd).unwrap();
    m.depth_first_ordering();
    m.set_state_numbers(0);
    let states = m.states();
    assert_eq!(states[0], m.start_state().unwrap());
    m.verify_integrity(&c);
    m.verify_reachability();
}

#[test]
fn test_start_action_embedding_isolates() {
    let mut c = ctx();
    let act = c.add_action(InputLoc::default(), "enter", InlineRef(0));
    let mut m = Fsm::concat_fsm_char(&c, key('a'));
    let start = m.start_state().unwrap();
    // Give the start an inbound path so the embedding has to isolate.
    let fin = m.fin_states()[0];
    m.attach_new_trans(c.key_ops, fin, Some(start), key('r'), key('r'));
    assert!(!m.is_start_state_isolated());
    m.start_fsm_action(&mut c, 0, act).unwrap();
    assert!(m.is_start_state_isolated());
    m.verify_integrity(&c);
    // The action sits on the new start's out transitions only.
    let new_start = m.start_state().unwrap();
    for &tid in m.out_trans(new_start) {
        match m.trans_body(tid) {
            TransBody::Plain(data) => assert!(data.actions.has_action(act)),
            TransBody::Cond { .. } => panic!(),
        }
    }
    assert!(accepts(&m, &c, "a"));
    assert!(accepts(&m, &c, "ara"));
}
