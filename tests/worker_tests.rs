//! Background workers driving a full exchange without manual dispatch.

mod common;

use common::*;
use seqrelay::{RmClient, SendOptions, SequenceState, WorkerSet};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn workers_complete_a_sequence_end_to_end() {
    let policy = quiet_policy().worker_intervals_ms(20, 20);
    let loopback = Loopback::new();
    let received = Recorder::new();
    let server = engine_with(loopback.clone(), Some(SERVER), received.clone(), policy.clone()).await;
    let client = engine_with(loopback.clone(), Some(CLIENT), Recorder::new(), policy).await;
    loopback.register(SERVER, server.clone()).await;
    loopback.register(CLIENT, client.clone()).await;

    let server_workers = WorkerSet::start(server.clone(), 2);
    let client_workers = WorkerSet::start(client.clone(), 1);
    assert_eq!(server_workers.len(), 3);
    assert_eq!(client_workers.len(), 2);

    let rm = RmClient::new(client.clone());
    for n in 1..=3u64 {
        let options = if n == 3 {
            SendOptions::default().last()
        } else {
            SendOptions::default()
        };
        rm.send_with("batch", SERVER, json!(n), options).await.unwrap();
    }

    let report = rm
        .wait_until_sequence_completed("batch", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(report.ranges, "[1,3]");

    let mut state = report.state;
    for _ in 0..250 {
        if state == SequenceState::Terminated {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        state = rm.outgoing_report("batch").await.unwrap().state;
    }
    assert_eq!(state, SequenceState::Terminated);
    assert_eq!(received.numbers(), vec![1, 2, 3]);

    client_workers.stop().await.unwrap();
    server_workers.stop().await.unwrap();
}

#[tokio::test]
async fn waiting_on_an_unreachable_peer_reports_the_failure() {
    let policy = quiet_policy()
        .retransmission_interval_ms(5)
        .max_retransmission_interval_ms(5)
        .max_retransmissions(Some(2))
        .worker_intervals_ms(10, 10);
    let client = engine_with(CaptureTransport::unreachable(), Some(CLIENT), Recorder::new(), policy).await;
    let workers = WorkerSet::start(client.clone(), 1);

    let rm = RmClient::new(client.clone());
    rm.send("lost", SERVER, json!("anyone?")).await.unwrap();
    let outcome = rm
        .wait_until_sequence_completed("lost", Duration::from_secs(5))
        .await;
    assert!(outcome.is_err());
    assert_eq!(
        rm.outgoing_report("lost").await.unwrap().state,
        SequenceState::Failed
    );

    workers.stop().await.unwrap();
}
