// ============================================================================
// Retransmission engine
// ============================================================================
//
// Every queued message (CreateSequence, application, close, terminate,
// standalone acknowledgement) goes through the same path:
//
//   claim work id ──> prepare (re-validate, count attempt) ──> transmit
//                                                               │
//                      finalize (retire or reschedule) <────────┘
//
// The claim key is "<message id>@<time to send>", so a record rescheduled by
// another worker is a different unit of work. Records whose destination is
// anonymous are parked and only leave through MakeConnection.
//
// ============================================================================

use super::{DeliveryFailure, RmEngine};
use crate::core::{MessageKind, Result, RmError, is_anonymous, now_ms};
use crate::protocol::{Envelope, ProtocolBody};
use crate::storage::{
    InvokeRepository, SendRecord, SendRepository, SequenceRecord, SequenceRepository,
    SequenceSide, StorageBackend,
};
use crate::transaction::UnitOfWork;
use std::sync::atomic::Ordering;
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchMode {
    Timer,
    Poll,
}

/// What a single dispatch attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Sent,
    TransportError,
    Parked,
    Skipped,
    Failed,
}

pub(crate) enum Prepared {
    Skip,
    Parked,
    Failed(Option<DeliveryFailure>),
    Ready {
        record: SendRecord,
        envelope: Envelope,
    },
}

impl<B: StorageBackend> RmEngine<B> {
    /// Transmits every pushable record that is due. Records claimed by another
    /// worker are skipped. Returns the number of successful transmissions.
    pub async fn dispatch_due(&self) -> Result<usize> {
        let due = self.store.snapshot().await.pending_before(now_ms());
        let mut sent = 0;
        for record in due {
            let Some(_claim) = self.locks.try_claim(record.work_id()) else {
                continue;
            };
            match self.dispatch_claimed(&record).await {
                Ok(DispatchResult::Sent) => sent += 1,
                Ok(_) => {}
                Err(err) => {
                    event!(
                        Level::WARN,
                        message_id = %record.message_id,
                        error = %err,
                        "dispatch attempt failed"
                    );
                }
            }
        }
        Ok(sent)
    }

    async fn dispatch_claimed(&self, claimed: &SendRecord) -> Result<DispatchResult> {
        let sequence = self.lock_sequence(&claimed.internal_id).await;
        let prepared = self
            .store
            .transact("dispatch.prepare", |unit| {
                self.prepare_dispatch(
                    unit,
                    &claimed.message_id,
                    claimed.time_to_send_ms,
                    DispatchMode::Timer,
                )
            })
            .await;
        drop(sequence);
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(RmError::RetriesExhausted(reason)) => {
                self.fail_after_exhaustion(&claimed.internal_id, &reason)
                    .await;
                return Ok(DispatchResult::Failed);
            }
            Err(err) => return Err(err),
        };

        let (record, envelope) = match prepared {
            Prepared::Skip => return Ok(DispatchResult::Skipped),
            Prepared::Parked => return Ok(DispatchResult::Parked),
            Prepared::Failed(failure) => {
                if let Some(failure) = failure {
                    self.publish_failure(failure);
                }
                return Ok(DispatchResult::Failed);
            }
            Prepared::Ready { record, envelope } => (record, envelope),
        };
        let Some(destination) = record.destination.clone() else {
            return Ok(DispatchResult::Parked);
        };

        let span = info_span!(
            "rm.dispatch",
            kind = %record.kind,
            message_id = %record.message_id,
            attempt = record.sent_count
        );
        let result = self
            .transport
            .send(envelope, &destination)
            .instrument(span)
            .await;
        self.counters.transmissions.fetch_add(1, Ordering::Relaxed);

        let (outcome, response) = match result {
            Ok(response) => (Ok(()), response),
            Err(err) => {
                self.counters
                    .transport_failures
                    .fetch_add(1, Ordering::Relaxed);
                event!(
                    Level::WARN,
                    message_id = %record.message_id,
                    destination = %destination,
                    error = %err,
                    "transmission failed"
                );
                (Err(err.to_string()), None)
            }
        };
        let delivered = outcome.is_ok();

        let sequence = self.lock_sequence(&record.internal_id).await;
        let finalized = self
            .store
            .transact("dispatch.finalize", |unit| {
                self.finalize_dispatch(unit, &record.message_id, outcome.clone())
            })
            .await;
        drop(sequence);
        match finalized {
            Ok(Some(failure)) => self.publish_failure(failure),
            Ok(None) => {}
            Err(RmError::RetriesExhausted(reason)) => {
                self.fail_after_exhaustion(&record.internal_id, &reason)
                    .await;
            }
            Err(err) => return Err(err),
        }

        if let Some(response) = response {
            if let Err(err) = self.process(response, false).await {
                event!(Level::WARN, error = %err, "synchronous response not processed");
            }
        }
        Ok(if delivered {
            DispatchResult::Sent
        } else {
            DispatchResult::TransportError
        })
    }

    /// Re-validates a claimed record and counts the attempt.
    pub(crate) fn prepare_dispatch(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        message_id: &str,
        claimed_time_ms: i64,
        mode: DispatchMode,
    ) -> Result<Prepared> {
        let Some(mut record) = unit.send_by_message_id(message_id) else {
            return Ok(Prepared::Skip);
        };
        if record.time_to_send_ms != claimed_time_ms || !record.send {
            return Ok(Prepared::Skip);
        }
        if mode == DispatchMode::Timer && !record.transport_available {
            return Ok(Prepared::Skip);
        }

        let Some(owner) = self.owner_of(unit, &record) else {
            unit.retire_send(&record)?;
            return Ok(Prepared::Skip);
        };
        if !owner.is_active() {
            unit.retire_send(&record)?;
            return Ok(Prepared::Skip);
        }

        if mode == DispatchMode::Timer && is_anonymous(record.destination.as_deref()) {
            record.transport_available = false;
            unit.update_send(record)?;
            return Ok(Prepared::Parked);
        }

        if !self.policy.allows_attempt(record.sent_count) {
            let reason = format!(
                "no acknowledgement after {} transmissions",
                record.sent_count
            );
            return self.give_up(unit, &record, &owner, &reason);
        }

        let Some(stored) = unit.stored_message(&record.body_key) else {
            event!(Level::WARN, message_id, "send record without a stored body discarded");
            unit.delete_send(message_id)?;
            return Ok(Prepared::Skip);
        };

        record.sent_count += 1;
        if self.policy.drops(record.kind) {
            event!(
                Level::DEBUG,
                message_id,
                kind = %record.kind,
                "message kind dropped by policy"
            );
            if record.resend {
                record.time_to_send_ms = now_ms() + self.policy.retransmission_delay_ms(record.sent_count) as i64;
                unit.update_send(record)?;
            } else {
                unit.retire_send(&record)?;
            }
            return Ok(Prepared::Skip);
        }
        let record = unit.update_send(record)?;

        let mut envelope = stored.envelope;
        Self::bind_envelope(&record, &owner, &mut envelope);
        if record.kind != MessageKind::Acknowledgement {
            self.piggyback_acks(unit, &mut envelope, record.destination.as_deref())?;
        }
        if record.sent_count > 1 {
            event!(
                Level::DEBUG,
                message_id,
                attempt = record.sent_count,
                "retransmitting"
            );
        }
        Ok(Prepared::Ready { record, envelope })
    }

    fn give_up(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        record: &SendRecord,
        owner: &SequenceRecord,
        reason: &str,
    ) -> Result<Prepared> {
        if owner.side == SequenceSide::Sending {
            let failure = self.fail_sequence(unit, &owner.internal_id, reason, false)?;
            return Ok(Prepared::Failed(failure));
        }
        event!(
            Level::DEBUG,
            message_id = %record.message_id,
            "acknowledgement abandoned after retries"
        );
        unit.retire_send(record)?;
        Ok(Prepared::Skip)
    }

    /// Fills in parts that are only known at transmission time.
    fn bind_envelope(record: &SendRecord, owner: &SequenceRecord, envelope: &mut Envelope) {
        if let Some(sequence_id) = &record.sequence_id {
            if let Some(header) = envelope.sequence.as_mut() {
                header.sequence_id = sequence_id.clone();
            }
            match &mut envelope.body {
                ProtocolBody::CloseSequence {
                    sequence_id: body_id,
                    ..
                }
                | ProtocolBody::TerminateSequence {
                    sequence_id: body_id,
                    ..
                } if body_id.is_empty() => *body_id = sequence_id.clone(),
                _ => {}
            }
        }
        if record.kind == MessageKind::Acknowledgement {
            envelope.acknowledgements = vec![Self::acknowledgement_for(owner)];
        }
        envelope.to = record.destination.clone();
    }

    /// Attaches pending acknowledgements bound for the same destination and
    /// drops their standalone records.
    fn piggyback_acks(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        envelope: &mut Envelope,
        destination: Option<&str>,
    ) -> Result<()> {
        let Some(destination) = destination else {
            return Ok(());
        };
        for inbound in unit.receiving_sequences() {
            if inbound.terminated || inbound.acks_to.as_deref() != Some(destination) {
                continue;
            }
            let pending = unit.pending_acks_for(&inbound.internal_id);
            if pending.is_empty() {
                continue;
            }
            if !envelope
                .acknowledgements
                .iter()
                .any(|ack| ack.sequence_id == inbound.internal_id)
            {
                envelope
                    .acknowledgements
                    .push(Self::acknowledgement_for(&inbound));
            }
            for ack in pending {
                unit.retire_send(&ack)?;
            }
        }
        Ok(())
    }

    /// Retires or reschedules a record after an attempt.
    pub(crate) fn finalize_dispatch(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        message_id: &str,
        outcome: std::result::Result<(), String>,
    ) -> Result<Option<DeliveryFailure>> {
        let Some(mut record) = unit.send_by_message_id(message_id) else {
            return Ok(None);
        };
        let now = now_ms();
        match outcome {
            Ok(()) => {
                if record.kind == MessageKind::TerminateSequence {
                    self.terminate_sending_side(unit, &record.internal_id)?;
                    unit.retire_send(&record)?;
                    return Ok(None);
                }
                if !record.resend {
                    unit.retire_send(&record)?;
                    return Ok(None);
                }
                record.time_to_send_ms =
                    now + self.policy.retransmission_delay_ms(record.sent_count) as i64;
                unit.update_send(record)?;
                Ok(None)
            }
            Err(reason) => {
                let owner = unit.sending_by_internal_id(&record.internal_id);
                if let Some(mut owner) = owner.clone() {
                    owner.last_send_error = Some(reason.clone());
                    owner.last_send_error_ms = Some(now);
                    unit.update_sequence(owner)?;
                }
                if !self.policy.allows_attempt(record.sent_count) {
                    if owner.is_some() {
                        return self.fail_sequence(unit, &record.internal_id, &reason, false);
                    }
                    unit.retire_send(&record)?;
                    return Ok(None);
                }
                record.time_to_send_ms =
                    now + self.policy.retransmission_delay_ms(record.sent_count) as i64;
                unit.update_send(record)?;
                Ok(None)
            }
        }
    }

    /// Marks the owning sequence failed when its own bookkeeping kept conflicting.
    async fn fail_after_exhaustion(&self, internal_id: &str, reason: &str) {
        let sequence = self.lock_sequence(internal_id).await;
        let failed = self
            .store
            .transact("dispatch.fail", |unit| {
                self.fail_sequence(unit, internal_id, reason, false)
            })
            .await;
        drop(sequence);
        match failed {
            Ok(Some(failure)) => self.publish_failure(failure),
            Ok(None) => {}
            Err(err) => {
                event!(
                    Level::ERROR,
                    internal_id,
                    error = %err,
                    "sequence could not be marked failed"
                );
            }
        }
    }
}
