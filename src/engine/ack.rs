use super::RmEngine;
use crate::core::{FaultCode, MessageKind, Result, RmError, now_ms};
use crate::ledger::AckRange;
use crate::protocol::{Envelope, ProtocolBody, SequenceAcknowledgement};
use crate::storage::{
    SendRecord, SendRepository, SequenceRecord, SequenceRepository, SequenceSide, StorageBackend,
};
use crate::transaction::UnitOfWork;
use tracing::{Level, event};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckOutcome {
    pub newly_acknowledged: u64,
    pub terminate_scheduled: bool,
}

impl<B: StorageBackend> RmEngine<B> {
    /// Applies an incoming acknowledgement to the matching sending sequence.
    ///
    /// Ranges already covered are no-ops and cause no write. A range that
    /// names a number never sent fails the whole acknowledgement with
    /// `InvalidAcknowledgement`, leaving the ledger untouched.
    pub(crate) async fn process_acknowledgement(
        &self,
        ack: &SequenceAcknowledgement,
        envelope: &Envelope,
    ) -> Result<AckOutcome> {
        let sequence = self.lock_sending_by_wire_id(&ack.sequence_id).await;
        let outcome = self
            .store
            .transact("ack.process", |unit| self.apply_acknowledgement(unit, ack, envelope))
            .await?;
        drop(sequence);

        if outcome.newly_acknowledged > 0 {
            event!(
                Level::DEBUG,
                sequence_id = %ack.sequence_id,
                newly_acknowledged = outcome.newly_acknowledged,
                "acknowledgement applied"
            );
        }
        if outcome.terminate_scheduled {
            self.wake_sender();
        }
        Ok(outcome)
    }

    fn apply_acknowledgement(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        ack: &SequenceAcknowledgement,
        envelope: &Envelope,
    ) -> Result<AckOutcome> {
        let mut record = unit
            .sending_by_sequence_id(&ack.sequence_id)
            .ok_or_else(|| RmError::unknown_sequence(&ack.sequence_id))?;
        if let Some(token) = &record.security_token {
            self.security.verify_proof_of_possession(token, envelope)?;
        }
        if !ack.nacks.is_empty() {
            event!(
                Level::DEBUG,
                sequence_id = %ack.sequence_id,
                nacks = ack.nacks.len(),
                "negative acknowledgements ignored; retransmission timer covers them"
            );
        }

        let mut newly_acknowledged = 0;
        for range in &ack.ranges {
            if range.lower == 0 || range.lower > range.upper {
                return Err(invalid_ack(&record, format!("malformed range {}", range)));
            }
            if record.acked.covers(range) {
                continue;
            }
            for fresh in record.acked.insert(*range) {
                newly_acknowledged += self.retire_acknowledged(unit, &record, fresh)?;
            }
        }
        if newly_acknowledged == 0 {
            return Ok(AckOutcome::default());
        }

        record.last_activated_ms = now_ms();
        if record.polling_mode && record.offered_sequence_id.is_some() {
            record.poll_requested = true;
        }
        let record = unit.update_sequence(record)?;
        let record = self.check_and_terminate(unit, record)?;
        Ok(AckOutcome {
            newly_acknowledged,
            terminate_scheduled: record.terminate_added,
        })
    }

    /// Retires the send records covered by a newly acknowledged range.
    fn retire_acknowledged(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        record: &SequenceRecord,
        range: AckRange,
    ) -> Result<u64> {
        if range.upper >= record.next_message_number {
            return Err(invalid_ack(
                record,
                format!("message {} was never assigned", range.upper),
            ));
        }
        for number in range.numbers() {
            match unit.application_send(&record.internal_id, number) {
                Some(pending) if pending.sent_count == 0 => {
                    return Err(invalid_ack(
                        record,
                        format!("message {} was never transmitted", number),
                    ));
                }
                Some(pending) => unit.retire_send(&pending)?,
                None => {}
            }
        }
        Ok(range.len())
    }

    // ========================================================================
    // Auto-termination
    // ========================================================================

    /// Schedules termination once the last message is acknowledged, unless
    /// suppressed or replies are still expected on the offered sequence.
    pub(crate) fn check_and_terminate(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        record: SequenceRecord,
    ) -> Result<SequenceRecord> {
        if record.side != SequenceSide::Sending
            || !record.is_active()
            || record.terminate_added
            || record.auto_termination_suppressed
            || record.sequence_id.is_none()
            || !record.is_fully_acknowledged()
        {
            return Ok(record);
        }
        if Self::offer_pending(&record) {
            event!(
                Level::DEBUG,
                internal_id = %record.internal_id,
                expected_replies = record.expected_replies,
                "termination deferred until replies arrive"
            );
            return Ok(record);
        }
        self.add_terminate(unit, record)
    }

    fn offer_pending(record: &SequenceRecord) -> bool {
        record.offered_sequence_id.is_some() && record.expected_replies > 0
    }

    // ========================================================================
    // Outgoing acknowledgements
    // ========================================================================

    /// Replaces any queued standalone acknowledgement for `record` with one
    /// due at the earlier of its old time and `now + delay_ms`.
    pub(crate) fn schedule_ack(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        record: &SequenceRecord,
        delay_ms: u64,
    ) -> Result<SendRecord> {
        let mut time_to_send = now_ms() + delay_ms as i64;
        for queued in unit.pending_acks_for(&record.internal_id) {
            if queued.sent_count == 0 {
                time_to_send = time_to_send.min(queued.time_to_send_ms);
            }
            unit.retire_send(&queued)?;
        }

        let envelope = Envelope::acknowledgement(Self::acknowledgement_for(record))
            .with_to(record.acks_to.clone());
        let mut send = SendRecord::new(
            envelope.message_id.clone(),
            &record.internal_id,
            MessageKind::Acknowledgement,
            record.acks_to.clone(),
            time_to_send,
        );
        send.sequence_id = record.sequence_id.clone();
        self.enqueue(unit, send, envelope)
    }

    /// Answers AckRequested headers, inline when a back channel is free.
    pub(crate) async fn answer_ack_requests(
        &self,
        envelope: &Envelope,
        response: Option<Envelope>,
        back_channel: bool,
    ) -> Result<Option<Envelope>> {
        // Requests spanning several sequences stay optimistic.
        let sequence = match envelope.ack_requested.as_slice() {
            [only] => Some(self.lock_sequence(&only.sequence_id).await),
            _ => None,
        };
        let acks = self
            .store
            .transact("ack.requested", |unit| {
                let mut inline = Vec::new();
                for request in &envelope.ack_requested {
                    let record = unit
                        .receiving_by_sequence_id(&request.sequence_id)
                        .ok_or_else(|| RmError::unknown_sequence(&request.sequence_id))?;
                    if back_channel {
                        inline.push(Self::acknowledgement_for(&record));
                    } else {
                        self.schedule_ack(unit, &record, 0)?;
                    }
                }
                Ok(inline)
            })
            .await?;
        drop(sequence);

        if acks.is_empty() {
            if !back_channel {
                self.wake_sender();
            }
            return Ok(response);
        }
        let mut response = response.unwrap_or_else(|| {
            Envelope::new(ProtocolBody::Empty)
                .with_relates_to(envelope.message_id.clone())
                .with_to(envelope.reply_to.clone())
        });
        for ack in acks {
            if !response
                .acknowledgements
                .iter()
                .any(|existing| existing.sequence_id == ack.sequence_id)
            {
                response.acknowledgements.push(ack);
            }
        }
        Ok(Some(response))
    }

    /// Queues an AckRequested for a sending sequence.
    pub async fn request_acknowledgement(&self, internal_id: &str) -> Result<()> {
        let _sequence = self.lock_sequence(internal_id).await;
        self.store
            .transact("ack.request", |unit| {
                let record = unit
                    .sending_by_internal_id(internal_id)
                    .ok_or_else(|| RmError::SequenceNotFound(internal_id.to_string()))?;
                if !record.is_active() {
                    return Err(RmError::sequence_terminated(record.display_id()));
                }
                let Some(sequence_id) = record.sequence_id.clone() else {
                    return Err(RmError::fault(
                        FaultCode::UnknownSequence,
                        None,
                        format!("sequence '{}' is not established yet", internal_id),
                    ));
                };
                let envelope = Envelope::ack_request(sequence_id.clone())
                    .with_to(record.to_address.clone())
                    .with_reply_to(record.reply_to.clone())
                    .with_security_token(record.security_token.clone());
                let mut send = SendRecord::new(
                    envelope.message_id.clone(),
                    internal_id,
                    MessageKind::AckRequest,
                    record.to_address.clone(),
                    now_ms(),
                );
                send.sequence_id = Some(sequence_id);
                self.enqueue(unit, send, envelope)?;
                Ok(())
            })
            .await?;
        self.wake_sender();
        Ok(())
    }
}

fn invalid_ack(record: &SequenceRecord, detail: String) -> RmError {
    RmError::fault(
        FaultCode::InvalidAcknowledgement,
        Some(record.display_id()),
        detail,
    )
}
