// ============================================================================
// Inbound delivery
// ============================================================================
//
// Accepts sequence messages, detects duplicates, stores the message for the
// invoker and decides how the acknowledgement travels:
//
//   acks_to anonymous + back channel   ──> inline on the response
//   acks_to anonymous, no back channel ──> parked for MakeConnection
//   acks_to addressable                ──> coalesced standalone ack after
//                                          the acknowledgement interval
//
// ============================================================================

use super::RmEngine;
use super::sender::{DispatchMode, Prepared};
use crate::core::{
    FaultCode, MAX_MESSAGE_NUMBER, Result, RmError, is_anonymous, is_plain_anonymous, now_ms,
};
use crate::protocol::{Envelope, ProtocolBody, SequenceAcknowledgement};
use crate::storage::{
    InvokeRecord, SendRecord, SendRepository, SequenceRepository, StorageBackend, StoredMessage,
};
use std::sync::atomic::Ordering;
use tracing::{Level, event};

/// How an inbound sequence message was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundDisposition {
    /// Stored; `ready` when it may be invoked right away.
    Accepted {
        message_number: u64,
        ready: bool,
        inline_ack: Option<SequenceAcknowledgement>,
    },
    /// Already received; never invoked again.
    Duplicate {
        message_number: u64,
        inline_ack: Option<SequenceAcknowledgement>,
        replay: Option<SendRecord>,
    },
}

impl<B: StorageBackend> RmEngine<B> {
    pub(crate) async fn process_sequence_message(
        &self,
        envelope: &Envelope,
        back_channel: bool,
    ) -> Result<Option<Envelope>> {
        let header = envelope.sequence.clone().ok_or_else(|| {
            RmError::fault(
                FaultCode::UnknownSequence,
                None,
                "application message without a Sequence header",
            )
        })?;
        let sequence_id = header.sequence_id.clone();

        let sequence_lock = self.lock_sequence(&sequence_id).await;
        let disposition = self
            .store
            .transact("inbound.accept", |unit| {
                let mut record = unit
                    .receiving_by_sequence_id(&sequence_id)
                    .ok_or_else(|| RmError::unknown_sequence(&sequence_id))?;
                if record.terminated {
                    return Err(RmError::sequence_terminated(&sequence_id));
                }
                let number = header.message_number;
                if number == 0 || number > MAX_MESSAGE_NUMBER {
                    return Err(RmError::fault(
                        FaultCode::MessageNumberRollover,
                        Some(&sequence_id),
                        format!("message number {} is out of range", number),
                    ));
                }
                if let Some(token) = &record.security_token {
                    self.security.verify_proof_of_possession(token, envelope)?;
                }

                let inline = back_channel && is_plain_anonymous(record.acks_to.as_deref());
                if record.acked.contains(number) {
                    let replay = if self.policy.exactly_once {
                        unit.reply_for(&sequence_id, number)
                    } else {
                        None
                    };
                    let replay = match replay {
                        Some(mut reply) => {
                            reply.time_to_send_ms = now_ms();
                            Some(unit.update_send(reply)?)
                        }
                        None => None,
                    };
                    return Ok(InboundDisposition::Duplicate {
                        message_number: number,
                        inline_ack: inline.then(|| Self::acknowledgement_for(&record)),
                        replay,
                    });
                }

                if record.closed {
                    return Err(RmError::sequence_closed(&sequence_id));
                }
                if let Some(last) = record.last_message_number {
                    if number > last {
                        return Err(RmError::fault(
                            FaultCode::LastMessageNumberExceeded,
                            Some(&sequence_id),
                            format!("message {} is beyond last message {}", number, last),
                        ));
                    }
                }
                if header.last_message {
                    if record.highest_in_message_number > number {
                        return Err(RmError::fault(
                            FaultCode::LastMessageNumberExceeded,
                            Some(&sequence_id),
                            format!(
                                "message {} already received beyond last message {}",
                                record.highest_in_message_number, number
                            ),
                        ));
                    }
                    record.last_message_number = Some(number);
                }

                let now = now_ms();
                record.acked.insert_number(number);
                record.highest_in_message_number = record.highest_in_message_number.max(number);
                record.last_activated_ms = now;
                let record = unit.update_sequence(record)?;

                unit.put_message(StoredMessage {
                    key: envelope.message_id.clone(),
                    envelope: envelope.clone(),
                    stored_ms: now,
                })?;
                unit.put_invoke(InvokeRecord {
                    sequence_id: sequence_id.clone(),
                    message_number: number,
                    body_key: envelope.message_id.clone(),
                    received_ms: now,
                })?;

                if let Some(paired) = record.paired_internal_id.as_deref() {
                    if let Some(mut outbound) = unit.sending_by_internal_id(paired) {
                        if outbound.expected_replies > 0 {
                            outbound.expected_replies -= 1;
                            let outbound = unit.update_sequence(outbound)?;
                            self.check_and_terminate(unit, outbound)?;
                        }
                    }
                }

                if !inline {
                    let delay = if is_anonymous(record.acks_to.as_deref()) {
                        0
                    } else {
                        self.policy.acknowledgement_interval_ms
                    };
                    self.schedule_ack(unit, &record, delay)?;
                }

                Ok(InboundDisposition::Accepted {
                    message_number: number,
                    ready: !self.policy.in_order || number <= record.next_message_to_invoke,
                    inline_ack: inline.then(|| Self::acknowledgement_for(&record)),
                })
            })
            .await;
        drop(sequence_lock);
        let disposition = disposition?;

        match disposition {
            InboundDisposition::Accepted {
                message_number,
                ready,
                inline_ack,
            } => {
                event!(
                    Level::DEBUG,
                    sequence_id = %sequence_id,
                    message_number,
                    ready,
                    "sequence message accepted"
                );
                self.wake_sender();
                if ready {
                    self.invoke_after_accept(&sequence_id, message_number).await;
                } else {
                    self.wake_invoker();
                }
                Ok(inline_ack.map(|ack| Self::ack_response(envelope, ack)))
            }
            InboundDisposition::Duplicate {
                message_number,
                inline_ack,
                replay,
            } => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                event!(
                    Level::DEBUG,
                    sequence_id = %sequence_id,
                    message_number,
                    replay = replay.is_some(),
                    "duplicate sequence message absorbed"
                );
                let mut response = None;
                if let Some(reply) = replay {
                    if reply.transport_available {
                        self.wake_sender();
                    } else if back_channel && is_plain_anonymous(reply.destination.as_deref()) {
                        response = self.take_parked(&reply).await?;
                    }
                }
                match (response, inline_ack) {
                    (Some(mut reply), Some(ack)) => {
                        if !reply
                            .acknowledgements
                            .iter()
                            .any(|existing| existing.sequence_id == ack.sequence_id)
                        {
                            reply.acknowledgements.push(ack);
                        }
                        Ok(Some(reply))
                    }
                    (Some(reply), None) => Ok(Some(reply)),
                    (None, Some(ack)) => Ok(Some(Self::ack_response(envelope, ack))),
                    (None, None) => {
                        self.requeue_duplicate_ack(&sequence_id).await?;
                        Ok(None)
                    }
                }
            }
        }
    }

    fn ack_response(request: &Envelope, ack: SequenceAcknowledgement) -> Envelope {
        let mut response = Envelope::new(ProtocolBody::Empty)
            .with_relates_to(request.message_id.clone())
            .with_to(request.reply_to.clone());
        response.acknowledgements.push(ack);
        response
    }

    /// A resent message means the sender missed our acknowledgement.
    async fn requeue_duplicate_ack(&self, sequence_id: &str) -> Result<()> {
        let _sequence = self.lock_sequence(sequence_id).await;
        self.store
            .transact("inbound.reack", |unit| {
                if let Some(record) = unit.receiving_by_sequence_id(sequence_id) {
                    let delay = if is_anonymous(record.acks_to.as_deref()) {
                        0
                    } else {
                        self.policy.acknowledgement_interval_ms
                    };
                    self.schedule_ack(unit, &record, delay)?;
                }
                Ok(())
            })
            .await?;
        self.wake_sender();
        Ok(())
    }

    /// Hands a parked record to the caller through the poll path.
    pub(crate) async fn take_parked(&self, record: &SendRecord) -> Result<Option<Envelope>> {
        let _claim = self.locks.acquire(record.work_id()).await;
        let sequence = self.lock_sequence(&record.internal_id).await;
        let prepared = self
            .store
            .transact("dispatch.prepare_poll", |unit| {
                self.prepare_dispatch(
                    unit,
                    &record.message_id,
                    record.time_to_send_ms,
                    DispatchMode::Poll,
                )
            })
            .await?;
        match prepared {
            Prepared::Ready { record, envelope } => {
                let failure = self
                    .store
                    .transact("dispatch.finalize_poll", |unit| {
                        self.finalize_dispatch(unit, &record.message_id, Ok(()))
                    })
                    .await?;
                drop(sequence);
                if let Some(failure) = failure {
                    self.publish_failure(failure);
                }
                self.counters.polls_served.fetch_add(1, Ordering::Relaxed);
                Ok(Some(envelope))
            }
            Prepared::Failed(Some(failure)) => {
                self.publish_failure(failure);
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}
