//! Duplicate detection, ordering and fault answers on the receiving side.

mod common;

use common::*;
use seqrelay::core::{ANONYMOUS_ADDRESS, FaultCode, MessageKind};
use seqrelay::protocol::{Offer, ProtocolBody};
use seqrelay::{Envelope, RmClient, SequenceState};

#[tokio::test]
async fn gap_blocks_later_messages_until_filled() {
    let received = Recorder::new();
    let server = engine_with(CaptureTransport::new(), Some(SERVER), received.clone(), quiet_policy()).await;
    let sequence_id = open_inbound(&server, CLIENT, None).await;

    for n in [1, 3, 4] {
        server.deliver(sequence_message(&sequence_id, n, false)).await.unwrap();
    }
    assert_eq!(received.numbers(), vec![1]);

    server.deliver(sequence_message(&sequence_id, 2, false)).await.unwrap();
    assert_eq!(received.numbers(), vec![1, 2, 3, 4]);

    let report = RmClient::new(server.clone())
        .incoming_report(&sequence_id)
        .await
        .unwrap();
    assert_eq!(report.ranges, "[1,4]");
    assert_eq!(report.queued_invocations, 0);
}

#[tokio::test]
async fn forced_dispatch_delivers_past_a_gap() {
    let received = Recorder::new();
    let server = engine_with(CaptureTransport::new(), Some(SERVER), received.clone(), quiet_policy()).await;
    let sequence_id = open_inbound(&server, CLIENT, None).await;

    server.deliver(sequence_message(&sequence_id, 2, false)).await.unwrap();
    server.deliver(sequence_message(&sequence_id, 3, false)).await.unwrap();
    assert!(received.numbers().is_empty());
    assert_eq!(server.invoke_pending().await.unwrap(), 0);

    let observer = RmClient::new(server.clone());
    assert_eq!(observer.force_dispatch_of_inbound(&sequence_id).await.unwrap(), 2);
    assert_eq!(received.numbers(), vec![2, 3]);
    assert_eq!(
        observer.incoming_report(&sequence_id).await.unwrap().queued_invocations,
        0
    );

    assert!(observer.force_dispatch_of_inbound("urn:test:missing").await.is_err());
}

#[tokio::test]
async fn message_skipped_by_forced_dispatch_is_delivered_on_arrival() {
    let received = Recorder::new();
    let server = engine_with(CaptureTransport::new(), Some(SERVER), received.clone(), quiet_policy()).await;
    let sequence_id = open_inbound(&server, CLIENT, None).await;

    server.deliver(sequence_message(&sequence_id, 2, false)).await.unwrap();
    server.deliver(sequence_message(&sequence_id, 3, false)).await.unwrap();
    let observer = RmClient::new(server.clone());
    assert_eq!(observer.force_dispatch_of_inbound(&sequence_id).await.unwrap(), 2);

    server.deliver(sequence_message(&sequence_id, 1, false)).await.unwrap();
    for _ in 0..3 {
        assert_eq!(server.invoke_pending().await.unwrap(), 0);
    }
    assert_eq!(received.numbers(), vec![2, 3, 1]);
    let report = observer.incoming_report(&sequence_id).await.unwrap();
    assert_eq!(report.queued_invocations, 0);
    assert_eq!(report.ranges, "[1,3]");

    server.deliver(sequence_message(&sequence_id, 4, false)).await.unwrap();
    assert_eq!(received.numbers(), vec![2, 3, 1, 4]);
    assert_eq!(
        observer.incoming_report(&sequence_id).await.unwrap().queued_invocations,
        0
    );
}

#[tokio::test]
async fn unordered_mode_invokes_on_arrival() {
    let received = Recorder::new();
    let server = engine_with(
        CaptureTransport::new(),
        Some(SERVER),
        received.clone(),
        quiet_policy().in_order(false),
    )
    .await;
    let sequence_id = open_inbound(&server, CLIENT, None).await;

    server.deliver(sequence_message(&sequence_id, 3, false)).await.unwrap();
    server.deliver(sequence_message(&sequence_id, 1, false)).await.unwrap();
    assert_eq!(received.numbers(), vec![3, 1]);
}

#[tokio::test]
async fn duplicate_replays_the_recorded_reply_without_reinvoking() {
    let transport = CaptureTransport::new();
    let received = Recorder::echoing();
    let server = engine_with(transport.clone(), Some(SERVER), received.clone(), quiet_policy()).await;
    let offer = Offer {
        sequence_id: "urn:test:replies".into(),
        endpoint: Some(CLIENT.into()),
    };
    let sequence_id = open_inbound(&server, CLIENT, Some(offer)).await;

    let request = sequence_message(&sequence_id, 1, false);
    server.deliver(request.clone()).await.unwrap();
    server.dispatch_due().await.unwrap();
    let first = transport.sent_of(MessageKind::Application);
    assert_eq!(first.len(), 1);
    assert_eq!(
        first[0].sequence.as_ref().unwrap().sequence_id,
        "urn:test:replies"
    );

    let answer = server.deliver(request).await.unwrap();
    assert!(answer.is_none());
    assert_eq!(received.numbers(), vec![1]);
    assert_eq!(server.stats().duplicates, 1);

    server.dispatch_due().await.unwrap();
    let replies = transport.sent_of(MessageKind::Application);
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].message_id, replies[1].message_id);
}

#[tokio::test]
async fn anonymous_acks_to_is_acknowledged_inline() {
    let received = Recorder::new();
    let server = engine_with(CaptureTransport::new(), Some(SERVER), received.clone(), quiet_policy()).await;
    let sequence_id = open_inbound(&server, ANONYMOUS_ADDRESS, None).await;

    let request = sequence_message(&sequence_id, 1, false);
    let response = server.deliver(request.clone()).await.unwrap().unwrap();
    assert_eq!(response.kind(), MessageKind::Acknowledgement);
    assert_eq!(response.relates_to.as_deref(), Some(request.message_id.as_str()));
    assert_eq!(response.acknowledgements[0].sequence_id, sequence_id);
    assert_eq!(response.acknowledgements[0].ranges.len(), 1);

    let again = server.deliver(request).await.unwrap().unwrap();
    assert_eq!(again.acknowledgements[0].ranges, response.acknowledgements[0].ranges);
    assert_eq!(received.numbers(), vec![1]);
}

#[tokio::test]
async fn protocol_violations_are_answered_with_faults() {
    let server = engine_with(CaptureTransport::new(), Some(SERVER), Recorder::new(), quiet_policy()).await;
    let sequence_id = open_inbound(&server, CLIENT, None).await;

    let unknown = sequence_message("urn:test:nobody", 1, false);
    let fault = server.deliver(unknown.clone()).await.unwrap().unwrap();
    assert_eq!(fault_code(&fault), Some(FaultCode::UnknownSequence));
    assert_eq!(fault.relates_to.as_deref(), Some(unknown.message_id.as_str()));

    let zero = server.deliver(sequence_message(&sequence_id, 0, false)).await.unwrap().unwrap();
    assert_eq!(fault_code(&zero), Some(FaultCode::MessageNumberRollover));

    server.deliver(sequence_message(&sequence_id, 2, true)).await.unwrap();
    let beyond = server.deliver(sequence_message(&sequence_id, 3, false)).await.unwrap().unwrap();
    assert_eq!(fault_code(&beyond), Some(FaultCode::LastMessageNumberExceeded));

    let headerless = Envelope::application(serde_json::json!("no header"));
    let fault = server.deliver(headerless).await.unwrap().unwrap();
    assert_eq!(fault_code(&fault), Some(FaultCode::UnknownSequence));
    assert!(server.stats().faults_returned >= 4);
}

#[tokio::test]
async fn closed_sequence_refuses_new_numbers_but_absorbs_duplicates() {
    let received = Recorder::new();
    let server = engine_with(CaptureTransport::new(), Some(SERVER), received.clone(), quiet_policy()).await;
    let sequence_id = open_inbound(&server, CLIENT, None).await;
    let first = sequence_message(&sequence_id, 1, false);
    server.deliver(first.clone()).await.unwrap();

    let close = Envelope::new(ProtocolBody::CloseSequence {
        sequence_id: sequence_id.clone(),
        last_message_number: None,
    });
    let response = server.deliver(close).await.unwrap().unwrap();
    assert_eq!(response.kind(), MessageKind::CloseSequenceResponse);
    assert!(response.acknowledgements[0].final_ack);

    let refused = server.deliver(sequence_message(&sequence_id, 2, false)).await.unwrap().unwrap();
    assert_eq!(fault_code(&refused), Some(FaultCode::SequenceClosed));

    let duplicate = server.deliver(first).await.unwrap();
    assert!(duplicate.is_none());
    assert_eq!(received.numbers(), vec![1]);

    let report = RmClient::new(server.clone())
        .incoming_report(&sequence_id)
        .await
        .unwrap();
    assert_eq!(report.state, SequenceState::Established);
}

#[tokio::test]
async fn ack_request_is_answered_on_the_back_channel() {
    let server = engine_with(CaptureTransport::new(), Some(SERVER), Recorder::new(), quiet_policy()).await;
    let sequence_id = open_inbound(&server, CLIENT, None).await;
    server.deliver(sequence_message(&sequence_id, 1, false)).await.unwrap();
    server.deliver(sequence_message(&sequence_id, 2, false)).await.unwrap();

    let request = Envelope::ack_request(sequence_id.clone());
    let response = server.deliver(request).await.unwrap().unwrap();
    let ack = &response.acknowledgements[0];
    assert_eq!(ack.sequence_id, sequence_id);
    assert_eq!(ack.ranges.len(), 1);
    assert_eq!((ack.ranges[0].lower, ack.ranges[0].upper), (1, 2));
}

#[tokio::test]
async fn standalone_acknowledgements_are_coalesced() {
    let transport = CaptureTransport::new();
    let server = engine_with(transport.clone(), Some(SERVER), Recorder::new(), quiet_policy()).await;
    let sequence_id = open_inbound(&server, CLIENT, None).await;
    for n in 1..=3 {
        server.deliver(sequence_message(&sequence_id, n, false)).await.unwrap();
    }

    server.dispatch_due().await.unwrap();
    let acks = transport.sent_of(MessageKind::Acknowledgement);
    assert_eq!(acks.len(), 1);
    let ranges = &acks[0].acknowledgements[0].ranges;
    assert_eq!((ranges[0].lower, ranges[0].upper), (1, 3));
    assert_eq!(transport.sent()[0].0, CLIENT);
}
