//! Sequence establishment, close, termination and offer handling.

mod common;

use common::*;
use seqrelay::core::{ANONYMOUS_ADDRESS, FaultCode, MessageKind, SpecVersion};
use seqrelay::protocol::{Offer, ProtocolBody};
use seqrelay::storage::SequenceRepository;
use seqrelay::{
    JournalConfig, RmClient, RmError, SendOptions, SequenceOptions, SequenceState,
};
use serde_json::json;
use tempfile::tempdir;

async fn drive(engines: &[&Engine], rounds: usize) {
    for _ in 0..rounds {
        for engine in engines {
            engine.dispatch_due().await.unwrap();
        }
    }
}

#[tokio::test]
async fn round_trip_terminates_with_every_message_acknowledged() {
    let transport = Loopback::new();
    let received = Recorder::new();
    let server = engine_with(transport.clone(), Some(SERVER), received.clone(), quiet_policy()).await;
    let client = engine_with(transport.clone(), Some(CLIENT), Recorder::new(), quiet_policy()).await;
    transport.register(SERVER, server.clone()).await;
    transport.register(CLIENT, client.clone()).await;

    let rm = RmClient::new(client.clone());
    for n in 1..=3u64 {
        let options = if n == 3 {
            SendOptions::default().last()
        } else {
            SendOptions::default()
        };
        let ticket = rm
            .send_with("orders", SERVER, json!({ "order": n }), options)
            .await
            .unwrap();
        assert_eq!(ticket.message_number, n);
    }
    assert_eq!(
        rm.outgoing_report("orders").await.unwrap().state,
        SequenceState::CreatePending
    );

    drive(&[&client, &server], 4).await;

    let report = rm.outgoing_report("orders").await.unwrap();
    assert_eq!(report.state, SequenceState::Terminated);
    assert_eq!(report.ranges, "[1,3]");
    assert_eq!(report.completed_messages, 3);
    assert_eq!(report.pending_sends, 0);
    assert!(report.is_complete());
    assert_eq!(received.numbers(), vec![1, 2, 3]);

    let sequence_id = rm.sequence_id("orders").await.unwrap().unwrap();
    let inbound = RmClient::new(server.clone())
        .incoming_report(&sequence_id)
        .await
        .unwrap();
    assert_eq!(inbound.state, SequenceState::Terminated);
    assert_eq!(inbound.ranges, "[1,3]");
}

#[tokio::test]
async fn messages_wait_for_establishment_and_are_rebound() {
    let transport = CaptureTransport::new();
    let client = engine_with(transport.clone(), Some(CLIENT), Recorder::new(), quiet_policy()).await;
    let rm = RmClient::new(client.clone());

    rm.send("orders", SERVER, json!("a")).await.unwrap();
    rm.send("orders", SERVER, json!("b")).await.unwrap();
    client.dispatch_due().await.unwrap();
    assert!(transport.sent_of(MessageKind::Application).is_empty());

    let create = transport.last_of(MessageKind::CreateSequence).unwrap();
    client
        .deliver(create_response(&create, "urn:test:orders", None))
        .await
        .unwrap();
    assert_eq!(
        rm.sequence_id("orders").await.unwrap().as_deref(),
        Some("urn:test:orders")
    );

    client.dispatch_due().await.unwrap();
    let sent = transport.sent_of(MessageKind::Application);
    assert_eq!(sent.len(), 2);
    for envelope in &sent {
        let header = envelope.sequence.as_ref().unwrap();
        assert_eq!(header.sequence_id, "urn:test:orders");
    }
    let mut numbers: Vec<u64> = sent
        .iter()
        .map(|envelope| envelope.sequence.as_ref().unwrap().message_number)
        .collect();
    numbers.sort();
    assert_eq!(numbers, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_establishment_keeps_one_sequence() {
    let dir = tempdir().unwrap();
    let client = journal_engine(
        dir.path(),
        JournalConfig::default(),
        CaptureTransport::new(),
        Recorder::new(),
        CLIENT,
    )
    .await;
    let rm = RmClient::new(client.clone());

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let rm = rm.clone();
            tokio::spawn(async move {
                rm.create_sequence("shared", SERVER, SequenceOptions::default())
                    .await
            })
        })
        .collect();
    for attempt in attempts {
        assert_eq!(attempt.await.unwrap().unwrap().internal_id, "shared");
    }

    let tables = client.store().snapshot().await;
    assert_eq!(tables.sending_sequences().len(), 1);
    let creates = tables
        .sends
        .values()
        .filter(|send| send.kind == MessageKind::CreateSequence)
        .count();
    assert_eq!(creates, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_on_one_sequence_all_succeed() {
    let dir = tempdir().unwrap();
    let client = journal_engine(
        dir.path(),
        JournalConfig::default(),
        CaptureTransport::new(),
        Recorder::new(),
        CLIENT,
    )
    .await;
    let rm = RmClient::new(client.clone());
    rm.send("orders", SERVER, json!(0)).await.unwrap();

    let sends: Vec<_> = (1..=32)
        .map(|n| {
            let rm = rm.clone();
            tokio::spawn(async move { rm.send("orders", SERVER, json!(n)).await })
        })
        .collect();
    let mut numbers = Vec::new();
    for send in sends {
        numbers.push(send.await.unwrap().unwrap().message_number);
    }
    numbers.sort();
    assert_eq!(numbers, (2..=33).collect::<Vec<u64>>());

    let report = rm.outgoing_report("orders").await.unwrap();
    assert_eq!(report.last_message_number, None);
    assert_eq!(report.pending_sends, 34);
    assert_eq!(client.locks().active_keys(), 0);
}

#[tokio::test]
async fn closed_sequence_rejects_sends_and_terminates_once_acknowledged() {
    let transport = CaptureTransport::new();
    let client = engine_with(transport.clone(), Some(CLIENT), Recorder::new(), quiet_policy()).await;
    let rm = RmClient::new(client.clone());

    rm.send("orders", SERVER, json!(1)).await.unwrap();
    rm.send("orders", SERVER, json!(2)).await.unwrap();
    client.dispatch_due().await.unwrap();
    let create = transport.last_of(MessageKind::CreateSequence).unwrap();
    client
        .deliver(create_response(&create, "urn:test:closing", None))
        .await
        .unwrap();

    rm.close_sequence("orders").await.unwrap();
    let err = rm.send("orders", SERVER, json!(3)).await.unwrap_err();
    assert_eq!(err.fault_code(), Some(FaultCode::SequenceClosed));

    let report = rm.outgoing_report("orders").await.unwrap();
    assert_eq!(report.state, SequenceState::Closing);
    assert_eq!(report.last_message_number, Some(2));

    client.dispatch_due().await.unwrap();
    let close = transport.last_of(MessageKind::CloseSequence).unwrap();
    match close.body {
        ProtocolBody::CloseSequence {
            sequence_id,
            last_message_number,
        } => {
            assert_eq!(sequence_id, "urn:test:closing");
            assert_eq!(last_message_number, Some(2));
        }
        other => panic!("unexpected body {:?}", other),
    }

    client.deliver(ack("urn:test:closing", &[(1, 2)])).await.unwrap();
    assert_eq!(
        rm.outgoing_report("orders").await.unwrap().state,
        SequenceState::TerminatePending
    );

    client.dispatch_due().await.unwrap();
    assert!(transport.last_of(MessageKind::TerminateSequence).is_some());
    assert_eq!(
        rm.outgoing_report("orders").await.unwrap().state,
        SequenceState::Terminated
    );
}

#[tokio::test]
async fn peer_termination_discards_messages_stuck_behind_a_gap() {
    let received = Recorder::new();
    let server = engine_with(CaptureTransport::new(), Some(SERVER), received.clone(), quiet_policy()).await;
    let sequence_id = open_inbound(&server, CLIENT, None).await;

    server.deliver(sequence_message(&sequence_id, 1, false)).await.unwrap();
    server.deliver(sequence_message(&sequence_id, 3, false)).await.unwrap();
    assert_eq!(received.numbers(), vec![1]);

    let observer = RmClient::new(server.clone());
    assert_eq!(
        observer.incoming_report(&sequence_id).await.unwrap().queued_invocations,
        1
    );

    let terminate = seqrelay::Envelope::new(ProtocolBody::TerminateSequence {
        sequence_id: sequence_id.clone(),
        last_message_number: Some(3),
    })
    .with_reply_to(Some(CLIENT.to_string()));
    let response = server.deliver(terminate).await.unwrap().unwrap();
    assert_eq!(response.kind(), MessageKind::TerminateSequenceResponse);
    let final_ack = &response.acknowledgements[0];
    assert!(final_ack.final_ack);
    assert_eq!(final_ack.ranges.len(), 2);

    let report = observer.incoming_report(&sequence_id).await.unwrap();
    assert_eq!(report.state, SequenceState::Terminated);
    assert_eq!(report.queued_invocations, 0);

    let late = server
        .deliver(sequence_message(&sequence_id, 2, false))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fault_code(&late), Some(FaultCode::SequenceTerminated));
    assert_eq!(received.numbers(), vec![1]);
}

#[tokio::test]
async fn offers_are_evaluated_before_acceptance() {
    let server = engine_with(CaptureTransport::new(), Some(SERVER), Recorder::new(), quiet_policy()).await;

    let too_short = Offer {
        sequence_id: "x".into(),
        endpoint: Some(CLIENT.into()),
    };
    let refused = server
        .deliver(create_sequence(CLIENT, Some(too_short), SpecVersion::V1_1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fault_code(&refused), Some(FaultCode::CreateSequenceRefused));

    let anonymous = Offer {
        sequence_id: "urn:test:offer-anon".into(),
        endpoint: Some(ANONYMOUS_ADDRESS.into()),
    };
    let refused = server
        .deliver(create_sequence(CLIENT, Some(anonymous.clone()), SpecVersion::V1_1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fault_code(&refused), Some(FaultCode::CreateSequenceRefused));

    let accepted = server
        .deliver(create_sequence(CLIENT, Some(anonymous), SpecVersion::V1_0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.kind(), MessageKind::CreateSequenceResponse);

    let offer = Offer {
        sequence_id: "urn:test:offer-1".into(),
        endpoint: Some(CLIENT.into()),
    };
    let response = server
        .deliver(create_sequence(CLIENT, Some(offer.clone()), SpecVersion::V1_1))
        .await
        .unwrap()
        .unwrap();
    let inbound_id = match &response.body {
        ProtocolBody::CreateSequenceResponse {
            sequence_id,
            accept,
        } => {
            assert!(accept.is_some());
            sequence_id.clone()
        }
        other => panic!("unexpected body {:?}", other),
    };
    let reply = RmClient::new(server.clone())
        .outgoing_report(&format!("reply:{}", inbound_id))
        .await
        .unwrap();
    assert_eq!(reply.sequence_id.as_deref(), Some("urn:test:offer-1"));

    let reused = server
        .deliver(create_sequence(CLIENT, Some(offer), SpecVersion::V1_1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fault_code(&reused), Some(FaultCode::CreateSequenceRefused));
}

#[tokio::test]
async fn offered_id_length_counts_characters() {
    let server = engine_with(CaptureTransport::new(), Some(SERVER), Recorder::new(), quiet_policy()).await;
    let offer = |sequence_id: &str| Offer {
        sequence_id: sequence_id.into(),
        endpoint: Some(CLIENT.into()),
    };

    let single = server
        .deliver(create_sequence(CLIENT, Some(offer("\u{e9}")), SpecVersion::V1_1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fault_code(&single), Some(FaultCode::CreateSequenceRefused));

    let padded = server
        .deliver(create_sequence(CLIENT, Some(offer(" a ")), SpecVersion::V1_1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(padded.kind(), MessageKind::CreateSequenceResponse);
    let tables = server.store().snapshot().await;
    assert!(tables.sending_by_sequence_id(" a ").is_some());
}

#[tokio::test]
async fn colliding_responded_id_restarts_establishment() {
    let transport = CaptureTransport::new();
    let client = engine_with(transport.clone(), Some(CLIENT), Recorder::new(), quiet_policy()).await;
    let rm = RmClient::new(client.clone());
    rm.send("a", SERVER, json!(1)).await.unwrap();
    rm.send("b", SERVER, json!(2)).await.unwrap();
    client.dispatch_due().await.unwrap();

    let creates = transport.sent_of(MessageKind::CreateSequence);
    assert_eq!(creates.len(), 2);
    let tables = client.store().snapshot().await;
    let create_of = |internal_id: &str| {
        let create_id = tables
            .sending_by_internal_id(internal_id)
            .unwrap()
            .create_message_id
            .unwrap();
        creates
            .iter()
            .find(|create| create.message_id == create_id)
            .unwrap()
            .clone()
    };
    let first_b = create_of("b");

    client
        .deliver(create_response(&create_of("a"), "urn:dup", None))
        .await
        .unwrap();
    client
        .deliver(create_response(&first_b, "urn:dup", None))
        .await
        .unwrap();
    assert_eq!(rm.sequence_id("a").await.unwrap().as_deref(), Some("urn:dup"));
    assert_eq!(rm.sequence_id("b").await.unwrap(), None);
    assert_eq!(
        rm.outgoing_report("b").await.unwrap().state,
        SequenceState::CreatePending
    );

    client.dispatch_due().await.unwrap();
    let creates = transport.sent_of(MessageKind::CreateSequence);
    assert_eq!(creates.len(), 3);
    let retried = creates.last().unwrap();
    assert_ne!(retried.message_id, first_b.message_id);
    let b = client
        .store()
        .snapshot()
        .await
        .sending_by_internal_id("b")
        .unwrap();
    assert_eq!(b.create_message_id.as_deref(), Some(retried.message_id.as_str()));
}

#[tokio::test]
async fn refused_creation_fails_the_sequence_and_notifies() {
    let transport = CaptureTransport::new();
    let client = engine_with(transport.clone(), Some(CLIENT), Recorder::new(), quiet_policy()).await;
    let rm = RmClient::new(client.clone());
    let mut failures = rm.subscribe_failures();

    rm.send("orders", SERVER, json!(1)).await.unwrap();
    client.dispatch_due().await.unwrap();
    let create = transport.last_of(MessageKind::CreateSequence).unwrap();

    let refusal = seqrelay::Envelope::fault(seqrelay::ProtocolFault {
        code: FaultCode::CreateSequenceRefused,
        sequence_id: None,
        detail: "no capacity".into(),
    })
    .with_relates_to(create.message_id.clone());
    client.deliver(refusal).await.unwrap();

    let failure = failures.try_recv().unwrap();
    assert_eq!(failure.internal_id, "orders");
    assert!(failure.reason.contains("no capacity"));
    assert!(failures.try_recv().is_err());

    let err = rm.send("orders", SERVER, json!(2)).await.unwrap_err();
    assert!(matches!(err, RmError::DeliveryFailed(_, _)));
    let err = rm
        .wait_until_sequence_completed("orders", std::time::Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RmError::DeliveryFailed(_, _)));
}

#[tokio::test]
async fn explicit_terminate_before_establishment_ends_locally() {
    let transport = CaptureTransport::new();
    let client = engine_with(transport.clone(), Some(CLIENT), Recorder::new(), quiet_policy()).await;
    let rm = RmClient::new(client.clone());

    rm.create_sequence("orders", SERVER, SequenceOptions::default())
        .await
        .unwrap();
    rm.terminate_sequence("orders").await.unwrap();

    let report = rm.outgoing_report("orders").await.unwrap();
    assert_eq!(report.state, SequenceState::Terminated);
    assert_eq!(report.pending_sends, 0);

    client.dispatch_due().await.unwrap();
    assert_eq!(transport.attempts(), 0);
}
