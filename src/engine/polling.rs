// ============================================================================
// MakeConnection
// ============================================================================
//
// Server side: a poll selects the earliest parked record matching its
// address or sequence filter and returns it on the back channel, marking
// whether more are waiting.
//
// Client side: an anonymous engine periodically polls every peer it still
// expects acknowledgements or replies from.
//
// ============================================================================

use super::RmEngine;
use crate::core::{FaultCode, Result, RmError, is_anonymous, now_ms};
use crate::protocol::{Envelope, MakeConnection, MessagePending, ProtocolBody};
use crate::storage::{SendRepository, SequenceRepository, StorageBackend};
use std::collections::BTreeSet;
use tracing::{Level, event};

/// Upper bound on messages pulled from one peer in a single polling pass.
const MAX_PULLS_PER_PASS: usize = 16;

/// Attempts to serve one poll before answering empty.
const POLL_SELECTION_ATTEMPTS: usize = 3;

impl<B: StorageBackend> RmEngine<B> {
    pub(crate) async fn handle_make_connection(
        &self,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>> {
        let ProtocolBody::MakeConnection(poll) = &envelope.body else {
            return Ok(None);
        };
        if poll.address.is_none() && poll.sequence_id.is_none() {
            return Err(RmError::fault(
                FaultCode::MissingSelection,
                None,
                "MakeConnection names neither an address nor a sequence",
            ));
        }

        for _ in 0..POLL_SELECTION_ATTEMPTS {
            let candidates = self.store.snapshot().await.pollable(
                now_ms(),
                poll.address.as_deref(),
                poll.sequence_id.as_deref(),
            );
            let Some(chosen) = candidates.first() else {
                event!(Level::DEBUG, "poll answered empty");
                return Ok(None);
            };
            let pending = candidates.len() > 1;
            if let Some(mut message) = self.take_parked(chosen).await? {
                message.relates_to = Some(envelope.message_id.clone());
                message.message_pending = Some(MessagePending { pending });
                event!(
                    Level::DEBUG,
                    kind = %message.kind(),
                    pending,
                    "poll served"
                );
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Polls every peer this engine awaits traffic from. Returns the number of
    /// messages received.
    pub async fn poll_once(&self) -> Result<usize> {
        if !self.is_polling_endpoint() {
            return Ok(0);
        }
        let tables = self.store.snapshot().await;
        let mut destinations = BTreeSet::new();
        let mut requested = Vec::new();

        for record in tables.sending_sequences() {
            if !record.is_active() || !record.polling_mode || record.sequence_id.is_none() {
                continue;
            }
            let awaiting = !record.is_fully_acknowledged()
                || record.expected_replies > 0
                || record.poll_requested;
            if !awaiting {
                continue;
            }
            if let Some(to) = record.to_address.clone().filter(|to| !is_anonymous(Some(to))) {
                destinations.insert(to);
            }
            if record.poll_requested {
                requested.push(record.internal_id.clone());
            }
        }

        for record in tables.receiving_sequences() {
            if record.terminated || !record.polling_mode {
                continue;
            }
            let paired = record
                .paired_internal_id
                .as_deref()
                .and_then(|internal_id| tables.sending_by_internal_id(internal_id));
            if let Some(outbound) = paired.filter(|outbound| outbound.is_active()) {
                if let Some(to) = outbound.to_address.filter(|to| !is_anonymous(Some(to))) {
                    destinations.insert(to);
                }
            }
        }

        let mut received = 0;
        for destination in destinations {
            received += self.pull_from(&destination).await;
        }

        if !requested.is_empty() {
            self.store
                .transact("poll.clear_requests", |unit| {
                    for internal_id in &requested {
                        if let Some(mut record) = unit.sending_by_internal_id(internal_id) {
                            if record.poll_requested {
                                record.poll_requested = false;
                                unit.update_sequence(record)?;
                            }
                        }
                    }
                    Ok(())
                })
                .await?;
        }
        Ok(received)
    }

    async fn pull_from(&self, destination: &str) -> usize {
        let mut received = 0;
        for _ in 0..MAX_PULLS_PER_PASS {
            let poll = Envelope::new(ProtocolBody::MakeConnection(MakeConnection {
                address: Some(self.endpoint.clone()),
                sequence_id: None,
            }))
            .with_to(Some(destination.to_string()));

            let response = match self.transport.send(poll, destination).await {
                Ok(Some(response)) => response,
                Ok(None) => break,
                Err(err) => {
                    event!(Level::WARN, destination, error = %err, "poll failed");
                    break;
                }
            };
            let more = response.is_pending_more();
            received += 1;
            if let Err(err) = self.process(response, false).await {
                event!(Level::WARN, destination, error = %err, "polled message not processed");
            }
            if !more {
                break;
            }
        }
        received
    }
}
