//! Retries, give-up and dispatch claims.

mod common;

use common::*;
use seqrelay::core::MessageKind;
use seqrelay::storage::SendRepository;
use seqrelay::{RmClient, RmPolicy, SequenceState};
use serde_json::json;

fn retry_fast(max: Option<u32>) -> RmPolicy {
    quiet_policy()
        .retransmission_interval_ms(1)
        .exponential_backoff(false)
        .max_retransmissions(max)
}

#[tokio::test]
async fn unreachable_peer_fails_the_sequence_after_the_attempt_budget() {
    let transport = CaptureTransport::unreachable();
    let client = engine_with(transport.clone(), Some(CLIENT), Recorder::new(), retry_fast(Some(3))).await;
    let rm = RmClient::new(client.clone());
    let mut failures = rm.subscribe_failures();

    rm.send("orders", SERVER, json!(1)).await.unwrap();
    for _ in 0..6 {
        client.dispatch_due().await.unwrap();
        pause().await;
    }

    assert_eq!(transport.attempts(), 3);
    let failure = failures.try_recv().unwrap();
    assert_eq!(failure.internal_id, "orders");
    assert!(failures.try_recv().is_err());

    let report = rm.outgoing_report("orders").await.unwrap();
    assert_eq!(report.state, SequenceState::Failed);
    assert_eq!(report.pending_sends, 0);
    assert!(report.last_send_error.unwrap().contains("unreachable"));
    let (error, _at) = rm.last_send_error("orders").await.unwrap().unwrap();
    assert!(error.contains("unreachable"));

    let stats = client.stats();
    assert_eq!(stats.transmissions, 3);
    assert_eq!(stats.transport_failures, 3);
}

#[tokio::test]
async fn unacknowledged_message_is_resent_until_acknowledged() {
    let transport = CaptureTransport::new();
    let client = engine_with(transport.clone(), Some(CLIENT), Recorder::new(), retry_fast(None)).await;
    let rm = RmClient::new(client.clone());

    rm.send("orders", SERVER, json!("payload")).await.unwrap();
    client.dispatch_due().await.unwrap();
    let create = transport.last_of(MessageKind::CreateSequence).unwrap();
    client
        .deliver(create_response(&create, "urn:test:resend", None))
        .await
        .unwrap();

    client.dispatch_due().await.unwrap();
    pause().await;
    client.dispatch_due().await.unwrap();
    let sent = transport.sent_of(MessageKind::Application);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].message_id, sent[1].message_id);

    client.deliver(ack("urn:test:resend", &[(1, 1)])).await.unwrap();
    pause().await;
    client.dispatch_due().await.unwrap();
    assert_eq!(transport.sent_of(MessageKind::Application).len(), 2);
    assert_eq!(rm.outgoing_report("orders").await.unwrap().pending_sends, 0);
}

#[tokio::test]
async fn dropped_kind_uses_up_attempts_without_reaching_the_wire() {
    let transport = CaptureTransport::new();
    let policy = retry_fast(Some(2)).drop_message_kind(MessageKind::Application);
    let client = engine_with(transport.clone(), Some(CLIENT), Recorder::new(), policy).await;
    let rm = RmClient::new(client.clone());
    let mut failures = rm.subscribe_failures();

    rm.send("orders", SERVER, json!(1)).await.unwrap();
    client.dispatch_due().await.unwrap();
    let create = transport.last_of(MessageKind::CreateSequence).unwrap();
    client
        .deliver(create_response(&create, "urn:test:dropped", None))
        .await
        .unwrap();

    for _ in 0..4 {
        client.dispatch_due().await.unwrap();
        pause().await;
    }
    assert!(transport.sent_of(MessageKind::Application).is_empty());
    assert_eq!(failures.try_recv().unwrap().sequence_id.as_deref(), Some("urn:test:dropped"));
    assert_eq!(
        rm.outgoing_report("orders").await.unwrap().state,
        SequenceState::Failed
    );
}

#[tokio::test]
async fn claimed_record_is_not_dispatched_twice() {
    let transport = CaptureTransport::new();
    let client = engine_with(transport.clone(), Some(CLIENT), Recorder::new(), quiet_policy()).await;
    let rm = RmClient::new(client.clone());
    rm.send("orders", SERVER, json!(1)).await.unwrap();

    let due = client.store().snapshot().await.pending_before(i64::MAX);
    assert_eq!(due.len(), 1);
    let claim = client.locks().try_claim(due[0].work_id()).unwrap();
    assert!(client.locks().try_claim(due[0].work_id()).is_none());

    client.dispatch_due().await.unwrap();
    assert_eq!(transport.attempts(), 0);

    drop(claim);
    client.dispatch_due().await.unwrap();
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test]
async fn outbound_traffic_carries_pending_acknowledgements() {
    let transport = CaptureTransport::new();
    let policy = quiet_policy().acknowledgement_interval_ms(60_000);
    let server = engine_with(transport.clone(), Some(SERVER), Recorder::echoing(), policy).await;
    let offer = seqrelay::protocol::Offer {
        sequence_id: "urn:test:piggyback".into(),
        endpoint: Some(CLIENT.into()),
    };
    let sequence_id = open_inbound(&server, CLIENT, Some(offer)).await;

    server.deliver(sequence_message(&sequence_id, 1, false)).await.unwrap();
    server.dispatch_due().await.unwrap();

    let reply = transport.last_of(MessageKind::Application).unwrap();
    assert_eq!(reply.acknowledgements.len(), 1);
    assert_eq!(reply.acknowledgements[0].sequence_id, sequence_id);
    assert!(transport.sent_of(MessageKind::Acknowledgement).is_empty());

    let tables = server.store().snapshot().await;
    assert!(tables.pending_acks_for(&sequence_id).is_empty());
}

#[tokio::test]
async fn inactive_sequences_time_out() {
    let transport = CaptureTransport::new();
    let policy = quiet_policy().inactivity_timeout_ms(Some(1));
    let client = engine_with(transport, Some(CLIENT), Recorder::new(), policy).await;
    let rm = RmClient::new(client.clone());
    let mut failures = rm.subscribe_failures();

    rm.send("orders", SERVER, json!(1)).await.unwrap();
    pause().await;
    assert_eq!(client.sweep_inactive().await.unwrap(), 1);
    assert_eq!(failures.try_recv().unwrap().reason, "inactivity timeout");
    assert_eq!(
        rm.outgoing_report("orders").await.unwrap().state,
        SequenceState::Failed
    );
    assert_eq!(client.sweep_inactive().await.unwrap(), 0);
}
