mod common;

use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use switchboard::error::{ChannelError, NegotiationError, TransportError};
use switchboard::events::{CallEvent, CloseReason};
use switchboard::negotiation::{NegotiationPhase, NegotiatorConfig, NegotiatorEvent, SessionState, SessionUpdate};
use switchboard::protocol::{
    CandidateSignal, Envelope, EnvelopeKind, IceCandidate, SdpKind, SessionDescription,
};
use switchboard::relay::RelayEvent;
use switchboard::transport::{TrackKind, TransportEvent};
use switchboard::transport::mock::MockCall;
use switchboard::MessageChannel;

use common::{Endpoint, init_tracing, peer, settle};

const OFFERING: SessionState = SessionState::Negotiating(NegotiationPhase::Offering);
const ANSWERING: SessionState = SessionState::Negotiating(NegotiationPhase::Answering);

fn host_candidate(n: u32) -> CandidateSignal {
    CandidateSignal::Candidate(IceCandidate::new(format!(
        "candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"
    )))
}

/// Calls `b` from `a` and drives both sides until the channel is usable.
async fn connect_pair(a: &mut Endpoint, b: &mut Endpoint) -> MessageChannel {
    let channel = a.negotiator.start_call(b.id.clone()).expect("call starts");
    settle(&mut [&mut *a, &mut *b]).await;
    a.last_session().open_channel();
    b.last_session().connect();
    b.last_session().open_channel();
    settle(&mut [&mut *a, &mut *b]).await;
    assert!(channel.is_open(), "caller channel should be open");
    channel
}

#[test_timeout::tokio_timeout_test(10)]
async fn offer_and_answer_connect_both_sides() {
    init_tracing();
    let mut a = Endpoint::new("alice");
    let mut b = Endpoint::new("bob");
    let (alice, bob) = (a.id.clone(), b.id.clone());

    let channel = a.negotiator.start_call(bob.clone()).expect("call starts");
    assert_eq!(a.state_with(&bob), Some(OFFERING));
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(b.state_with(&alice), Some(ANSWERING));
    assert_eq!(a.state_with(&bob), Some(SessionState::Connected));
    assert_eq!(a.sent_kinds(), vec![EnvelopeKind::Offer]);
    assert_eq!(b.sent_kinds(), vec![EnvelopeKind::Answer]);
    assert!(b.saw(|event| matches!(event, CallEvent::CallIncoming { peer } if *peer == alice)));
    assert!(a.saw(|event| matches!(event, CallEvent::CallConnected { peer } if *peer == bob)));

    let a_session = a.last_session();
    let b_session = b.last_session();
    let offer = a.sent[0].session_description().unwrap();
    let answer = b.sent[0].session_description().unwrap();
    assert_eq!(b_session.remote_description(), Some(offer.clone()));
    assert_eq!(a_session.remote_description(), Some(answer));
    assert_eq!(
        a_session.calls()[..3],
        [
            MockCall::CreateOrderedChannel("chat".into()),
            MockCall::CreateLocalDescription(SdpKind::Offer),
            MockCall::SetLocalDescription(offer),
        ]
    );

    // Connected, but the transport has not opened the channel yet.
    assert_eq!(channel.send_text("too soon").await, Err(ChannelError::NotOpen));
    let data = a_session.open_channel();
    a_session.remote_track(TrackKind::Audio);
    settle(&mut [&mut a, &mut b]).await;
    assert!(a.saw(|event| matches!(event, CallEvent::ChannelReady { peer, .. } if *peer == bob)));
    assert!(a.saw(|event| matches!(event, CallEvent::RemoteTrack { peer, .. } if *peer == bob)));
    channel.send_text("hello bob").await.unwrap();
    assert_eq!(data.sent(), vec![Bytes::from_static(b"hello bob")]);

    // The callee becomes connected when the transport says so.
    b_session.connect();
    b_session.deliver("hello bob");
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(b.state_with(&alice), Some(SessionState::Connected));
    assert!(b.saw(|event| matches!(
        event,
        CallEvent::MessageReceived { peer, payload } if *peer == alice && &payload[..] == b"hello bob"
    )));
}

#[test_timeout::tokio_timeout_test(10)]
async fn candidates_before_offer_are_applied_in_order() {
    init_tracing();
    let mut b = Endpoint::new("bob");
    let (alice, bob) = (peer("alice"), b.id.clone());
    let early: Vec<CandidateSignal> = (1..=3).map(host_candidate).collect();

    for candidate in &early {
        b.deliver(Envelope::ice_candidate(bob.clone(), candidate).with_sender(alice.clone()));
    }
    assert_eq!(b.state_with(&alice), Some(SessionState::Idle));
    assert_eq!(b.negotiator.pending_candidates(&alice), early);
    assert!(b.factory.sessions().is_empty());

    let offer = SessionDescription::new(SdpKind::Offer, "v=0\r\ns=remote-offer\r\n");
    b.deliver(Envelope::offer(bob.clone(), &offer).with_sender(alice.clone()));
    assert_eq!(b.state_with(&alice), Some(ANSWERING));
    settle(&mut [&mut b]).await;

    let session = b.last_session();
    assert_eq!(session.applied_candidates(), early);
    let calls = session.calls();
    let remote_at = calls
        .iter()
        .position(|call| matches!(call, MockCall::SetRemoteDescription(_)))
        .expect("remote description applied");
    let first_candidate = calls
        .iter()
        .position(|call| matches!(call, MockCall::AddCandidate(_)))
        .expect("candidates applied");
    assert!(remote_at < first_candidate);
    assert!(b.negotiator.pending_candidates(&alice).is_empty());

    let late = host_candidate(4);
    b.deliver(Envelope::ice_candidate(bob.clone(), &late).with_sender(alice.clone()));
    b.deliver(Envelope::ice_candidate(bob, &CandidateSignal::EndOfCandidates).with_sender(alice));
    settle(&mut [&mut b]).await;
    let applied = session.applied_candidates();
    assert_eq!(applied.len(), 5);
    assert_eq!(applied[3], late);
    assert_eq!(applied[4], CandidateSignal::EndOfCandidates);
}

#[test_timeout::tokio_timeout_test(10)]
async fn answer_releases_candidates_buffered_while_offering() {
    init_tracing();
    let mut a = Endpoint::new("alice");
    let (alice, bob) = (a.id.clone(), peer("bob"));
    let early: Vec<CandidateSignal> = (1..=2).map(host_candidate).collect();

    a.negotiator.start_call(bob.clone()).unwrap();
    settle(&mut [&mut a]).await;
    assert_eq!(a.sent_kinds(), vec![EnvelopeKind::Offer]);

    for candidate in &early {
        a.deliver(Envelope::ice_candidate(alice.clone(), candidate).with_sender(bob.clone()));
    }
    settle(&mut [&mut a]).await;
    assert_eq!(a.state_with(&bob), Some(OFFERING));
    assert_eq!(a.negotiator.pending_candidates(&bob), early);
    let session = a.last_session();
    assert!(session.applied_candidates().is_empty());

    let answer = SessionDescription::new(SdpKind::Answer, "v=0\r\ns=remote-answer\r\n");
    a.deliver(Envelope::answer(alice, &answer).with_sender(bob.clone()));
    settle(&mut [&mut a]).await;

    assert_eq!(a.state_with(&bob), Some(SessionState::Connected));
    assert_eq!(session.applied_candidates(), early);
    assert!(a.negotiator.pending_candidates(&bob).is_empty());
    let calls = session.calls();
    let remote_at = calls
        .iter()
        .position(|call| *call == MockCall::SetRemoteDescription(answer.clone()))
        .expect("answer applied");
    let first_candidate = calls
        .iter()
        .position(|call| matches!(call, MockCall::AddCandidate(_)))
        .expect("candidates applied");
    assert!(remote_at < first_candidate);
}

#[test_timeout::tokio_timeout_test(10)]
async fn trailing_candidates_after_hang_up_stay_out_of_the_redial() {
    init_tracing();
    let config = NegotiatorConfig {
        negotiation_timeout: Duration::from_millis(300),
        ..NegotiatorConfig::default()
    };
    let mut a = Endpoint::new("alice");
    let mut b = Endpoint::with_config("bob", config);
    let (alice, bob) = (a.id.clone(), b.id.clone());

    a.negotiator.start_call(bob.clone()).unwrap();
    settle(&mut [&mut a, &mut b]).await;
    assert!(b.negotiator.teardown(&alice, CloseReason::HungUp));

    let trailing = host_candidate(9);
    b.deliver(Envelope::ice_candidate(bob.clone(), &trailing).with_sender(alice.clone()));
    assert_eq!(b.state_with(&alice), Some(SessionState::Closed));
    assert!(b.negotiator.pending_candidates(&alice).is_empty());
    assert_eq!(b.negotiator.live_sessions(), 0);

    // Candidates from peers that never send an offer expire with the negotiation timeout.
    let strangers: Vec<_> = (0..20).map(|n| peer(&format!("stranger-{n}"))).collect();
    for stranger in &strangers {
        b.deliver(Envelope::ice_candidate(bob.clone(), &host_candidate(1)).with_sender(stranger.clone()));
    }
    assert_eq!(b.state_with(&strangers[0]), Some(SessionState::Idle));
    assert_eq!(b.negotiator.live_sessions(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    settle(&mut [&mut a, &mut b]).await;
    assert!(strangers.iter().all(|stranger| b.state_with(stranger).is_none()));
    assert_eq!(b.state_with(&alice), Some(SessionState::Closed));

    a.negotiator.start_call(bob.clone()).unwrap();
    settle(&mut [&mut a, &mut b]).await;
    let redial = b.last_session();
    assert_eq!(b.factory.sessions().len(), 2);
    assert!(redial.remote_description().is_some());
    assert!(!redial.applied_candidates().contains(&trailing));
    assert!(redial.applied_candidates().is_empty());
}

#[test_timeout::tokio_timeout_test(10)]
async fn closed_sessions_are_released_after_retention() {
    init_tracing();
    let config = NegotiatorConfig {
        tombstone_retention: Duration::from_millis(50),
        ..NegotiatorConfig::default()
    };
    let mut a = Endpoint::with_config("alice", config);
    let bob = peer("bob");
    a.negotiator.start_call(bob.clone()).unwrap();
    let generation = a.negotiator.generation(&bob).unwrap();
    a.negotiator.teardown(&bob, CloseReason::HungUp);
    assert_eq!(a.state_with(&bob), Some(SessionState::Closed));

    tokio::time::sleep(Duration::from_millis(150)).await;
    settle(&mut [&mut a]).await;
    assert_eq!(a.state_with(&bob), None);

    // A completion that outlived its session finds nothing to touch.
    a.negotiator.handle(NegotiatorEvent::Session {
        peer: bob.clone(),
        generation,
        update: SessionUpdate::RemoteDescriptionApplied,
    });
    assert_eq!(a.state_with(&bob), None);
    assert!(a.factory.sessions().iter().all(|session| session.is_closed()));
}

#[test_timeout::tokio_timeout_test(10)]
async fn relay_loss_closes_connected_session() {
    init_tracing();
    let mut a = Endpoint::new("alice");
    let mut b = Endpoint::new("bob");
    let (alice, bob) = (a.id.clone(), b.id.clone());
    let channel = connect_pair(&mut a, &mut b).await;
    assert_eq!(a.state_with(&bob), Some(SessionState::Connected));
    let session = a.last_session();

    a.negotiator
        .handle(NegotiatorEvent::Relay(RelayEvent::Close { identity: alice }));
    settle(&mut [&mut a]).await;

    assert_eq!(a.state_with(&bob), Some(SessionState::Closed));
    assert_eq!(channel.send_text("anyone?").await, Err(ChannelError::NotOpen));
    assert_eq!(a.close_reasons(&bob), vec![CloseReason::RelayLost]);
    assert!(a.saw(|event| matches!(event, CallEvent::RelayDisconnected { .. })));
    assert!(session.is_closed());
    assert!(a.negotiator.local().is_none());
}

#[test_timeout::tokio_timeout_test(10)]
async fn redial_leaves_exactly_one_live_session() {
    init_tracing();
    let mut a = Endpoint::new("alice");
    let mut b = Endpoint::new("bob");
    let (alice, bob) = (a.id.clone(), b.id.clone());

    a.negotiator.start_call(bob.clone()).unwrap();
    settle(&mut [&mut a, &mut b]).await;
    let first = a.last_session();
    let first_generation = a.negotiator.generation(&bob);
    let old_channel = a.negotiator.channel(&bob).expect("live channel");

    a.negotiator.start_call(bob.clone()).unwrap();
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(a.negotiator.live_sessions(), 1);
    assert_eq!(a.factory.sessions().len(), 2);
    assert!(first.is_closed());
    assert!(!a.last_session().is_closed());
    assert_ne!(a.negotiator.generation(&bob), first_generation);
    assert_eq!(a.close_reasons(&bob), vec![CloseReason::Replaced]);
    assert_eq!(a.state_with(&bob), Some(SessionState::Connected));
    assert_eq!(old_channel.send_text("stale").await, Err(ChannelError::NotOpen));

    // The callee saw a second offer and replaced its own session too.
    let callee_sessions = b.factory.sessions();
    assert_eq!(callee_sessions.len(), 2);
    assert!(callee_sessions[0].is_closed());
    assert!(!callee_sessions[1].is_closed());
    assert_eq!(b.negotiator.live_sessions(), 1);
    assert_eq!(b.close_reasons(&alice), vec![CloseReason::Replaced]);
}

#[test_timeout::tokio_timeout_test(10)]
async fn unexpected_answers_leave_state_unchanged() {
    init_tracing();
    let mut a = Endpoint::new("alice");
    let (bob, carol) = (peer("bob"), peer("carol"));
    a.negotiator.start_call(bob.clone()).unwrap();
    settle(&mut [&mut a]).await;

    let description = SessionDescription::new(SdpKind::Answer, "v=0\r\ns=answer\r\n");
    let stray = Envelope::answer(a.id.clone(), &description).with_sender(carol.clone());
    assert_eq!(
        a.negotiator.receive_answer(&stray),
        Err(NegotiationError::UnexpectedAnswer(carol.clone()))
    );
    assert_eq!(a.state_with(&bob), Some(OFFERING));
    assert_eq!(a.state_with(&carol), None);
    settle(&mut [&mut a]).await;
    assert!(a.last_session().remote_description().is_none());
    assert!(a.close_reasons(&bob).is_empty());

    let genuine = Envelope::answer(a.id.clone(), &description).with_sender(bob.clone());
    a.negotiator.receive_answer(&genuine).unwrap();
    assert_eq!(a.state_with(&bob), Some(SessionState::Connected));
    assert_eq!(
        a.negotiator.receive_answer(&genuine),
        Err(NegotiationError::UnexpectedAnswer(bob.clone()))
    );
    assert_eq!(a.state_with(&bob), Some(SessionState::Connected));
    settle(&mut [&mut a]).await;
    assert!(a.close_reasons(&bob).is_empty());
}

#[test_timeout::tokio_timeout_test(10)]
async fn teardown_twice_matches_teardown_once() {
    init_tracing();
    let mut a = Endpoint::new("alice");
    let bob = peer("bob");
    a.negotiator.start_call(bob.clone()).unwrap();
    settle(&mut [&mut a]).await;
    let session = a.last_session();

    assert!(a.negotiator.teardown(&bob, CloseReason::HungUp));
    assert!(!a.negotiator.teardown(&bob, CloseReason::HungUp));
    settle(&mut [&mut a]).await;

    assert_eq!(a.state_with(&bob), Some(SessionState::Closed));
    assert_eq!(a.close_reasons(&bob), vec![CloseReason::HungUp]);
    assert_eq!(
        session
            .calls()
            .iter()
            .filter(|call| **call == MockCall::Close)
            .count(),
        1
    );
    assert!(a.negotiator.pending_candidates(&bob).is_empty());
    assert!(a.negotiator.channel(&bob).is_none());
    assert_eq!(a.negotiator.live_sessions(), 0);
}

#[test_timeout::tokio_timeout_test(10)]
async fn completion_after_teardown_is_discarded() {
    init_tracing();
    let mut a = Endpoint::new("alice");
    let bob = peer("bob");
    let gate = a.factory.gate_descriptions();

    a.negotiator.start_call(bob.clone()).unwrap();
    let generation = a.negotiator.generation(&bob).unwrap();
    settle(&mut [&mut a]).await;
    assert_eq!(a.factory.sessions().len(), 1);
    assert!(a.sent.is_empty(), "offer is still being created");

    a.negotiator.teardown(&bob, CloseReason::HungUp);
    gate.add_permits(1);
    settle(&mut [&mut a]).await;
    assert!(a.sent.is_empty());
    assert!(a.last_session().is_closed());

    let stale = || NegotiatorEvent::Session {
        peer: bob.clone(),
        generation,
        update: SessionUpdate::LocalDescriptionReady(SessionDescription::new(
            SdpKind::Offer,
            "v=0\r\ns=stale\r\n",
        )),
    };
    a.negotiator.handle(stale());
    settle(&mut [&mut a]).await;
    assert!(a.sent.is_empty());

    a.negotiator.start_call(bob.clone()).unwrap();
    a.negotiator.handle(stale());
    settle(&mut [&mut a]).await;
    assert_eq!(a.sent_kinds(), vec![EnvelopeKind::Offer]);
    let offer = a.sent[0].session_description().unwrap();
    assert!(offer.sdp.contains("mock-offer-2"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn stalled_negotiation_times_out() {
    init_tracing();
    let config = NegotiatorConfig {
        negotiation_timeout: Duration::from_millis(50),
        ..NegotiatorConfig::default()
    };
    let mut a = Endpoint::with_config("alice", config);
    let bob = peer("bob");
    a.negotiator.start_call(bob.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    settle(&mut [&mut a]).await;

    assert_eq!(a.state_with(&bob), Some(SessionState::Closed));
    assert_eq!(
        a.close_reasons(&bob),
        vec![CloseReason::Negotiation(NegotiationError::Timeout(bob.clone()))]
    );
    assert!(a.last_session().is_closed());
}

#[test_timeout::tokio_timeout_test(10)]
async fn connected_sessions_do_not_time_out() {
    init_tracing();
    let config = NegotiatorConfig {
        negotiation_timeout: Duration::from_millis(400),
        ..NegotiatorConfig::default()
    };
    let mut a = Endpoint::with_config("alice", config.clone());
    let mut b = Endpoint::with_config("bob", config);
    let (alice, bob) = (a.id.clone(), b.id.clone());
    connect_pair(&mut a, &mut b).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(a.state_with(&bob), Some(SessionState::Connected));
    assert_eq!(b.state_with(&alice), Some(SessionState::Connected));
}

#[test_timeout::tokio_timeout_test(10)]
async fn malformed_offer_is_dropped() {
    init_tracing();
    let mut b = Endpoint::new("bob");
    let alice = peer("alice");
    let envelope: Envelope = serde_json::from_value(json!({
        "type": "offer",
        "from": "alice",
        "to": "bob",
        "payload": "{not json"
    }))
    .unwrap();

    b.deliver(envelope);
    settle(&mut [&mut b]).await;
    assert_eq!(b.state_with(&alice), None);
    assert!(b.factory.sessions().is_empty());
    assert!(b.sent.is_empty());
}

#[test_timeout::tokio_timeout_test(10)]
async fn transport_failure_closes_only_that_session() {
    init_tracing();
    let mut a = Endpoint::new("alice");
    let mut b = Endpoint::new("bob");
    let mut c = Endpoint::new("carol");
    let (bob, carol) = (b.id.clone(), c.id.clone());

    a.negotiator.start_call(bob.clone()).unwrap();
    settle(&mut [&mut a, &mut b, &mut c]).await;
    let to_bob = a.last_session();
    a.negotiator.start_call(carol.clone()).unwrap();
    settle(&mut [&mut a, &mut b, &mut c]).await;
    let to_carol = a.last_session();
    assert_eq!(a.negotiator.live_sessions(), 2);

    to_bob.fail();
    settle(&mut [&mut a, &mut b, &mut c]).await;

    assert_eq!(a.state_with(&bob), Some(SessionState::Closed));
    assert_eq!(
        a.close_reasons(&bob),
        vec![CloseReason::Transport(TransportError::ConnectivityFailed)]
    );
    assert_eq!(a.state_with(&carol), Some(SessionState::Connected));
    assert!(to_bob.is_closed());
    assert!(!to_carol.is_closed());
}

#[test_timeout::tokio_timeout_test(10)]
async fn calling_ourselves_is_refused() {
    let mut a = Endpoint::new("alice");
    let alice = a.id.clone();
    assert_eq!(
        a.negotiator.start_call(alice.clone()).err(),
        Some(NegotiationError::SelfCall)
    );
    assert_eq!(a.state_with(&alice), None);
}

#[test_timeout::tokio_timeout_test(10)]
async fn peer_list_refreshes_the_directory() {
    let mut a = Endpoint::new("alice");
    a.deliver(Envelope::peer_list(&[peer("alice"), peer("bob"), peer("carol")]));
    settle(&mut [&mut a]).await;
    assert_eq!(a.directory.read().peers(), &[peer("bob"), peer("carol")]);
    assert!(a.saw(|event| matches!(event, CallEvent::PeersUpdated(list) if list.len() == 2)));
}

#[test_timeout::tokio_timeout_test(10)]
async fn messages_on_foreign_channels_are_ignored() {
    init_tracing();
    let mut a = Endpoint::new("alice");
    let mut b = Endpoint::new("bob");
    let alice = a.id.clone();
    connect_pair(&mut a, &mut b).await;

    let session = b.last_session();
    session.emit(TransportEvent::ChannelMessage {
        label: "control".into(),
        payload: Bytes::from_static(b"not for chat"),
    });
    session.deliver("for chat");
    settle(&mut [&mut a, &mut b]).await;

    let received: Vec<Bytes> = b
        .call_events
        .iter()
        .filter_map(|event| match event {
            CallEvent::MessageReceived { peer, payload } if *peer == alice => Some(payload.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![Bytes::from_static(b"for chat")]);
}

#[test_timeout::tokio_timeout_test(10)]
async fn reopened_channel_is_announced_again() {
    init_tracing();
    let mut a = Endpoint::new("alice");
    let mut b = Endpoint::new("bob");
    let bob = b.id.clone();
    let channel = connect_pair(&mut a, &mut b).await;
    let ready_count = |endpoint: &Endpoint| {
        endpoint
            .call_events
            .iter()
            .filter(|event| matches!(event, CallEvent::ChannelReady { peer, .. } if *peer == bob))
            .count()
    };
    assert_eq!(ready_count(&a), 1);

    let session = a.last_session();
    session.close_channel();
    settle(&mut [&mut a, &mut b]).await;
    assert!(!channel.is_open());
    assert_eq!(channel.send_text("gone").await, Err(ChannelError::NotOpen));
    assert_eq!(a.state_with(&bob), Some(SessionState::Connected));

    let reopened = session.open_channel();
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(ready_count(&a), 2);
    channel.send_text("back").await.unwrap();
    assert_eq!(reopened.sent(), vec![Bytes::from_static(b"back")]);
}
