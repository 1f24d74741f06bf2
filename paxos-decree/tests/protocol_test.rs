use paxos_decree::paxos::{
    Accept, Accepted, Acceptor, AcceptedProposal, MessageHandler, MessageKind, PaxosMessage,
    PhaseProgress, Prepare, Promise, ProposalNumber, Proposer, ProposerState, RecordingLearner,
    Response, Role, RoundOutcome,
};
use paxos_decree::storage::{AcceptorRecord, MemoryStore, ProposerRecord};
use paxos_decree::PaxosError;

type TestAcceptor = Acceptor<MemoryStore<AcceptorRecord>>;
type TestProposer = Proposer<MemoryStore<ProposerRecord>>;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn acceptors() -> (TestAcceptor, TestAcceptor, TestAcceptor) {
    (
        Acceptor::new("acceptor-1", MemoryStore::new()),
        Acceptor::new("acceptor-2", MemoryStore::new()),
        Acceptor::new("acceptor-3", MemoryStore::new()),
    )
}

fn proposer(id: &str) -> TestProposer {
    Proposer::new(id, 3, MemoryStore::new()).unwrap()
}

/// Send `msg` through the generic handler and unwrap the reply.
fn reply(acceptor: &mut TestAcceptor, msg: impl Into<PaxosMessage>) -> PaxosMessage {
    match acceptor.handle_message(msg.into()).unwrap() {
        Response::Reply(reply) => reply,
        other => panic!("acceptor produced {:?} instead of a reply", other),
    }
}

fn deliver(proposer: &mut TestProposer, msg: PaxosMessage) -> Response {
    proposer.handle_message(msg).unwrap()
}

/// A second proposer that overlaps the first quorum must learn and keep the
/// value already chosen.
#[test]
fn later_proposer_converges_on_chosen_value_test() {
    init_logger();
    let (mut a1, mut a2, mut a3) = acceptors();
    let mut p1 = proposer("proposer-1");
    let mut p2 = proposer("proposer-2");

    p1.propose_value("foo").unwrap();
    let prepare = p1.get_prepare_message().unwrap();
    let promise1 = reply(&mut a1, prepare.clone());
    let promise2 = reply(&mut a2, prepare);
    deliver(&mut p1, promise1);
    assert_eq!(
        deliver(&mut p1, promise2),
        Response::Promises(PhaseProgress::QuorumReached)
    );

    let accept = p1.get_accept_message().unwrap();
    let accepted1 = reply(&mut a1, accept.clone());
    let accepted2 = reply(&mut a2, accept);
    deliver(&mut p1, accepted1);
    deliver(&mut p1, accepted2);
    assert_eq!(p1.chosen_value(), Some("foo"));

    p2.propose_value("bar").unwrap();
    let prepare = p2.get_prepare_message().unwrap();
    let promise2 = reply(&mut a2, prepare.clone());
    let promise3 = reply(&mut a3, prepare);
    deliver(&mut p2, promise2);
    deliver(&mut p2, promise3);

    let accept = p2.get_accept_message().unwrap();
    assert_eq!(accept.value, "foo", "P2 should adopt the value a2 accepted");
    let accepted2 = reply(&mut a2, accept.clone());
    let accepted3 = reply(&mut a3, accept);
    deliver(&mut p2, accepted2);
    assert_eq!(
        deliver(&mut p2, accepted3),
        Response::Round(RoundOutcome::Decided("foo".into()))
    );

    assert_eq!(p1.chosen_value(), Some("foo"));
    assert_eq!(p2.chosen_value(), Some("foo"));
    assert_eq!(p2.desired_value(), Some("bar"), "the client value is kept");
}

/// Interleaved rounds: P2 overtakes P1 at a2, so P1 is preempted while P2
/// decides. P1's next round adopts P2's value.
#[test]
fn interleaved_rounds_preempt_lower_proposal_test() {
    init_logger();
    let (mut a1, mut a2, mut a3) = acceptors();
    let mut p1 = proposer("proposer-1");
    let mut p2 = proposer("proposer-2");

    p1.propose_value("foo").unwrap();
    let p1_prepare = p1.get_prepare_message().unwrap();
    let promise = reply(&mut a1, p1_prepare.clone());
    deliver(&mut p1, promise);
    assert_eq!(p1.state(), ProposerState::AwaitingPromises);

    p2.propose_value("bar").unwrap();
    let p2_prepare = p2.get_prepare_message().unwrap();
    let promise2 = reply(&mut a2, p2_prepare.clone());
    let promise3 = reply(&mut a3, p2_prepare);
    deliver(&mut p2, promise2);
    deliver(&mut p2, promise3);
    let p2_accept = p2.get_accept_message().unwrap();
    assert_eq!(p2_accept.value, "bar");
    let p2_accepted3 = reply(&mut a3, p2_accept.clone());

    // a2's floor is already at P2's number.
    let promise = reply(&mut a2, p1_prepare);
    deliver(&mut p1, promise);
    let p1_accept = p1.get_accept_message().unwrap();
    let p1_accepted1 = reply(&mut a1, p1_accept.clone());
    let p1_accepted2 = reply(&mut a2, p1_accept);

    let p2_accepted2 = reply(&mut a2, p2_accept);
    deliver(&mut p2, p2_accepted2);
    deliver(&mut p2, p2_accepted3);
    assert_eq!(p2.chosen_value(), Some("bar"));

    deliver(&mut p1, p1_accepted1);
    let outcome = deliver(&mut p1, p1_accepted2);
    assert_eq!(
        outcome,
        Response::Round(RoundOutcome::Preempted {
            observed: ProposalNumber::new(1, "proposer-2")
        })
    );
    assert_eq!(p1.chosen_value(), None, "a preempted round decides nothing");
    assert_eq!(p1.state(), ProposerState::Rejected);

    // Retry against a1 and a2: the highest accepted proposal is P2's.
    let prepare = p1.get_prepare_message().unwrap();
    assert_eq!(prepare.proposal_number, ProposalNumber::new(2, "proposer-1"));
    let promise1 = reply(&mut a1, prepare.clone());
    let promise2 = reply(&mut a2, prepare);
    deliver(&mut p1, promise1);
    deliver(&mut p1, promise2);
    let accept = p1.get_accept_message().unwrap();
    assert_eq!(accept.value, "bar");
    let accepted1 = reply(&mut a1, accept.clone());
    let accepted2 = reply(&mut a2, accept);
    deliver(&mut p1, accepted1);
    deliver(&mut p1, accepted2);
    assert_eq!(p1.chosen_value(), Some("bar"));
}

/// Fewer than three acceptors is refused at construction.
#[test]
fn too_few_acceptors_test() {
    for n in 0..3 {
        let result = Proposer::new("p", n, MemoryStore::<ProposerRecord>::new());
        assert!(
            matches!(result, Err(PaxosError::PreconditionViolation(_))),
            "{} acceptors should be rejected",
            n
        );
    }
    let p = Proposer::new("p", 4, MemoryStore::<ProposerRecord>::new()).unwrap();
    assert_eq!(p.quorum_size(), 3);
}

#[test]
fn propose_value_twice_test() {
    let mut p = proposer("p1");
    p.propose_value("foo").unwrap();
    assert!(matches!(
        p.propose_value("bar"),
        Err(PaxosError::PreconditionViolation(_))
    ));
    assert_eq!(p.desired_value(), Some("foo"));
}

#[test]
fn accept_before_quorum_test() {
    let (mut a1, _, _) = acceptors();
    let mut p = proposer("p1");
    p.propose_value("foo").unwrap();
    assert!(matches!(
        p.get_accept_message(),
        Err(PaxosError::PreconditionViolation(_))
    ));

    let prepare = p.get_prepare_message().unwrap();
    let promise = reply(&mut a1, prepare);
    assert_eq!(
        deliver(&mut p, promise),
        Response::Promises(PhaseProgress::Waiting {
            received: 1,
            quorum: 2
        })
    );
    assert!(matches!(
        p.get_accept_message(),
        Err(PaxosError::PreconditionViolation(_))
    ));
}

/// A quorum of empty promises with no client value leaves nothing to send.
#[test]
fn no_value_to_propose_test() {
    let mut p = proposer("p1");
    let prepare = p.get_prepare_message().unwrap();
    let n = prepare.proposal_number;
    p.on_promise(Promise::new("a1", n.clone(), None)).unwrap();
    p.on_promise(Promise::new("a2", n, None)).unwrap();
    assert_eq!(p.state(), ProposerState::Accepting);
    assert!(matches!(
        p.get_accept_message(),
        Err(PaxosError::PreconditionViolation(_))
    ));
}

#[test]
fn unsupported_message_names_role_and_kind_test() {
    let (mut a1, _, _) = acceptors();
    let mut p = proposer("p1");

    let promise = PaxosMessage::from(Promise::new("a1", ProposalNumber::new(1, "p1"), None));
    let err = a1.handle_message(promise).unwrap_err();
    assert!(matches!(
        err,
        PaxosError::UnsupportedMessage {
            role: Role::Acceptor,
            kind: MessageKind::Promise
        }
    ));
    assert_eq!(
        err.to_string(),
        "Acceptor does not support messages of type Promise"
    );

    let accept = PaxosMessage::from(Accept {
        proposal_number: ProposalNumber::new(1, "p1"),
        value: "foo".into(),
    });
    let err = p.handle_message(accept).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Proposer does not support messages of type Accept"
    );
}

/// The highest accepted proposal among the promises wins, whatever order
/// they arrive in.
#[test]
fn adopts_highest_accepted_proposal_test() {
    let mut p = proposer("proposer-9");
    p.propose_value("mine").unwrap();
    let n = p.get_prepare_message().unwrap().proposal_number;

    let older = AcceptedProposal {
        proposal_number: ProposalNumber::new(0, "proposer-7"),
        value: "old".into(),
    };
    let newer = AcceptedProposal {
        proposal_number: ProposalNumber::new(0, "proposer-8"),
        value: "new".into(),
    };
    let mut p5: TestProposer = Proposer::new("proposer-9", 5, MemoryStore::new()).unwrap();
    p5.propose_value("mine").unwrap();
    let n5 = p5.get_prepare_message().unwrap().proposal_number;
    p5.on_promise(Promise::new("a1", n5.clone(), Some(newer))).unwrap();
    p5.on_promise(Promise::new("a2", n5.clone(), None)).unwrap();
    p5.on_promise(Promise::new("a3", n5, Some(older))).unwrap();
    assert_eq!(p5.get_accept_message().unwrap().value, "new");

    // Empty promises leave the client's value in place.
    p.on_promise(Promise::new("a1", n.clone(), None)).unwrap();
    p.on_promise(Promise::new("a2", n, None)).unwrap();
    assert_eq!(p.get_accept_message().unwrap().value, "mine");
}

/// Duplicate replies from one acceptor count once.
#[test]
fn duplicate_replies_are_idempotent_test() {
    let (mut a1, mut a2, _) = acceptors();
    let mut p = proposer("p1");
    p.propose_value("foo").unwrap();
    let prepare = p.get_prepare_message().unwrap();

    let promise = reply(&mut a1, prepare.clone());
    deliver(&mut p, promise.clone());
    deliver(&mut p, promise);
    assert_eq!(p.promise_count(), 1);
    assert_eq!(p.state(), ProposerState::AwaitingPromises);

    let promise = reply(&mut a2, prepare);
    deliver(&mut p, promise);
    let accept = p.get_accept_message().unwrap();

    let accepted = reply(&mut a1, accept.clone());
    let writes = a1.store().write_count();
    assert_eq!(
        reply(&mut a1, accept.clone()),
        accepted,
        "a repeated accept gets the same reply"
    );
    assert_eq!(a1.store().write_count(), writes, "and writes nothing");

    deliver(&mut p, accepted.clone());
    assert_eq!(
        deliver(&mut p, accepted),
        Response::Round(RoundOutcome::Waiting {
            received: 1,
            quorum: 2
        })
    );
    assert_eq!(p.chosen_value(), None);
}

/// Replies for an abandoned round do not count toward the new one.
#[test]
fn stale_round_replies_are_ignored_test() {
    let mut p = proposer("p1");
    p.propose_value("foo").unwrap();
    let round1 = p.get_prepare_message().unwrap().proposal_number;
    let round2 = p.get_prepare_message().unwrap().proposal_number;
    assert!(round2 > round1);

    let outcome = p
        .on_promise(Promise::new("a1", round1.clone(), None))
        .unwrap();
    assert_eq!(outcome, PhaseProgress::Ignored);
    assert_eq!(p.promise_count(), 0);

    p.on_promise(Promise::new("a1", round2.clone(), None)).unwrap();
    p.on_promise(Promise::new("a2", round2.clone(), None)).unwrap();
    p.get_accept_message().unwrap();

    let stale = Accepted {
        from_identity: "a3".into(),
        proposal_number: round1.clone(),
        min_proposal_number: round1.clone(),
    };
    assert_eq!(p.on_accepted(stale).unwrap(), RoundOutcome::Ignored);

    // A rejection of the old round whose floor already equals this round.
    let rejected = Accepted {
        from_identity: "a3".into(),
        proposal_number: round1,
        min_proposal_number: round2,
    };
    assert!(!rejected.is_accepted());
    assert_eq!(p.on_accepted(rejected).unwrap(), RoundOutcome::Ignored);
    assert_eq!(p.accepted_count(), 0);
}

/// An accept left over from an abandoned round is rejected by an acceptor
/// that already promised the new round. That rejection must not count as a
/// vote for the new round, or the proposer decides on a single real vote
/// while a rival decides something else.
#[test]
fn rejected_accept_from_abandoned_round_is_not_a_vote_test() {
    init_logger();
    let (mut a1, mut a2, mut a3) = acceptors();
    let mut p1 = proposer("p1");
    let mut p2 = proposer("p2");

    p1.propose_value("x").unwrap();
    let prepare = p1.get_prepare_message().unwrap();
    let promise1 = reply(&mut a1, prepare.clone());
    let promise2 = reply(&mut a2, prepare);
    deliver(&mut p1, promise1);
    deliver(&mut p1, promise2);
    let old_accept = p1.get_accept_message().unwrap();

    // P1 gives the round up and starts again on a2 and a3.
    let prepare = p1.get_prepare_message().unwrap();
    let promise2 = reply(&mut a2, prepare.clone());
    let promise3 = reply(&mut a3, prepare);
    deliver(&mut p1, promise2);
    deliver(&mut p1, promise3);
    let accept = p1.get_accept_message().unwrap();

    let stale = reply(&mut a3, old_accept);
    assert!(a3.accepted().is_none(), "a3 refuses the abandoned round");
    assert_eq!(deliver(&mut p1, stale), Response::Round(RoundOutcome::Ignored));
    let accepted2 = reply(&mut a2, accept.clone());
    assert_eq!(
        deliver(&mut p1, accepted2),
        Response::Round(RoundOutcome::Waiting {
            received: 1,
            quorum: 2
        })
    );
    assert_eq!(p1.chosen_value(), None, "one real vote is not a quorum");

    // A rival with a higher round on a1 and a3 finds nothing accepted.
    p2.propose_value("y").unwrap();
    for _ in 0..4 {
        p2.get_prepare_message().unwrap();
    }
    let prepare = p2.get_prepare_message().unwrap();
    assert_eq!(prepare.proposal_number, ProposalNumber::new(5, "p2"));
    let promise1 = reply(&mut a1, prepare.clone());
    let promise3 = reply(&mut a3, prepare);
    deliver(&mut p2, promise1);
    deliver(&mut p2, promise3);
    let rival_accept = p2.get_accept_message().unwrap();
    assert_eq!(rival_accept.value, "y");
    let accepted1 = reply(&mut a1, rival_accept.clone());
    let accepted3 = reply(&mut a3, rival_accept);
    deliver(&mut p2, accepted1);
    deliver(&mut p2, accepted3);
    assert_eq!(p2.chosen_value(), Some("y"));

    // P1's round reaches a3 too late and is preempted.
    let late = reply(&mut a3, accept);
    assert!(matches!(
        deliver(&mut p1, late),
        Response::Round(RoundOutcome::Preempted { .. })
    ));
    assert_eq!(p1.chosen_value(), None);

    // Its next round adopts the chosen value.
    let prepare = p1.get_prepare_message().unwrap();
    let promise1 = reply(&mut a1, prepare.clone());
    let promise2 = reply(&mut a2, prepare);
    deliver(&mut p1, promise1);
    deliver(&mut p1, promise2);
    let accept = p1.get_accept_message().unwrap();
    assert_eq!(accept.value, "y");
    let accepted1 = reply(&mut a1, accept.clone());
    let accepted2 = reply(&mut a2, accept);
    deliver(&mut p1, accepted1);
    deliver(&mut p1, accepted2);
    assert_eq!(p1.chosen_value(), p2.chosen_value(), "agreement");
}

/// Late promises after the quorum never change the value being proposed.
#[test]
fn late_promise_keeps_round_value_test() {
    let mut p = proposer("p1");
    p.propose_value("foo").unwrap();
    let n = p.get_prepare_message().unwrap().proposal_number;
    p.on_promise(Promise::new("a1", n.clone(), None)).unwrap();
    p.on_promise(Promise::new("a2", n.clone(), None)).unwrap();
    assert_eq!(p.get_accept_message().unwrap().value, "foo");

    let late = Promise::new(
        "a3",
        n,
        Some(AcceptedProposal {
            proposal_number: ProposalNumber::new(0, "p0"),
            value: "other".into(),
        }),
    );
    assert_eq!(p.on_promise(late).unwrap(), PhaseProgress::QuorumReached);
    assert_eq!(p.get_accept_message().unwrap().value, "foo");
}

/// Preemption leaves nothing chosen and lifts the next round above the
/// number that was observed.
#[test]
fn preemption_raises_round_counter_test() {
    let mut p = proposer("p1");
    p.propose_value("foo").unwrap();
    let n = p.get_prepare_message().unwrap().proposal_number;
    p.on_promise(Promise::new("a1", n.clone(), None)).unwrap();
    p.on_promise(Promise::new("a2", n.clone(), None)).unwrap();
    p.get_accept_message().unwrap();

    p.on_accepted(Accepted {
        from_identity: "a1".into(),
        proposal_number: n.clone(),
        min_proposal_number: n.clone(),
    })
    .unwrap();
    let outcome = p
        .on_accepted(Accepted {
            from_identity: "a2".into(),
            proposal_number: n,
            min_proposal_number: ProposalNumber::new(3, "p2"),
        })
        .unwrap();

    assert_eq!(
        outcome,
        RoundOutcome::Preempted {
            observed: ProposalNumber::new(3, "p2")
        }
    );
    assert_eq!(p.chosen_value(), None);
    assert_eq!(p.max_round_number(), 3);
    assert_eq!(p.store().snapshot().map(|r| r.max_round_number), Some(3));
    assert_eq!(
        p.get_prepare_message().unwrap().proposal_number,
        ProposalNumber::new(4, "p1")
    );
}

/// Rounds from different proposers never share a number, and each proposer
/// strictly increases its own.
#[test]
fn proposal_numbers_are_unique_test() {
    let mut p1 = proposer("proposer-1");
    let mut p2 = proposer("proposer-2");
    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..10 {
        for p in [&mut p1, &mut p2] {
            let n = p.get_prepare_message().unwrap().proposal_number;
            assert!(seen.insert(n.clone()), "{} issued twice", n);
        }
    }
    assert_eq!(seen.len(), 20);
}

/// Acceptor floors never move backwards, whatever order requests arrive in.
#[test]
fn acceptor_floor_is_monotonic_test() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(42);
    let mut a: TestAcceptor = Acceptor::new("a1", MemoryStore::new());
    let mut floor = a.min_proposal_number().clone();

    for _ in 0..500 {
        let n = ProposalNumber::new(
            rng.random_range(0..20),
            format!("p{}", rng.random_range(0..3)),
        );
        if rng.random_bool(0.5) {
            let promise = a.on_prepare(Prepare { proposal_number: n }).unwrap();
            assert_eq!(promise.min_proposal_number(), a.min_proposal_number());
        } else {
            let accepted = a
                .on_accept(Accept {
                    proposal_number: n.clone(),
                    value: format!("v{}", n.round()),
                })
                .unwrap();
            if n >= floor {
                assert_eq!(a.accepted().map(|x| &x.proposal_number), Some(&n));
            }
            assert_eq!(&accepted.min_proposal_number, a.min_proposal_number());
        }
        assert!(a.min_proposal_number() >= &floor, "floor moved backwards");
        floor = a.min_proposal_number().clone();
    }
}

#[test]
fn learner_hears_each_decision_once_test() {
    let learner = RecordingLearner::new();
    let mut p: TestProposer = Proposer::new("p1", 3, MemoryStore::new())
        .unwrap()
        .with_learner(learner.clone());
    p.propose_value("foo").unwrap();
    let n = p.get_prepare_message().unwrap().proposal_number;
    p.on_promise(Promise::new("a1", n.clone(), None)).unwrap();
    p.on_promise(Promise::new("a2", n.clone(), None)).unwrap();
    p.get_accept_message().unwrap();
    for from in ["a1", "a2", "a3"] {
        p.on_accepted(Accepted {
            from_identity: from.into(),
            proposal_number: n.clone(),
            min_proposal_number: n.clone(),
        })
        .unwrap();
    }

    let decisions = learner.decisions();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].value, "foo");
    assert_eq!(decisions[0].proposal_number, n);
    assert!(matches!(
        p.get_prepare_message(),
        Err(PaxosError::PreconditionViolation(_))
    ));
}
