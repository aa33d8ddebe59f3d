// ============================================================================
// Sequence lifecycle
// ============================================================================
//
// Sending side:
//   CreatePending ──CSR──> Established ──close──> Closing
//        │                     │                     │
//        └─────────────────────┴──terminate/acked────┴──> TerminatePending
//                                                              │
//                                                     sent ──> Terminated
//
// Any sending state may move to Failed on retry exhaustion, a peer fault or
// inactivity.
//
// ============================================================================

use super::{DeliveryFailure, RmEngine};
use crate::core::{
    FaultCode, MAX_MESSAGE_NUMBER, MessageKind, Result, RmError, SpecVersion, is_plain_anonymous,
    new_sequence_id, now_ms,
};
use crate::protocol::{Accept, Envelope, Offer, ProtocolBody, SequenceAcknowledgement, SequenceHeader};
use crate::storage::{
    InvokeRepository, ReplyCorrelation, SendRecord, SendRepository, SequenceRecord,
    SequenceRepository, StorageBackend,
};
use crate::transaction::UnitOfWork;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Level, event};

/// Options fixed when a sending sequence is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceOptions {
    /// Offer an inbound sequence for replies.
    pub offer: bool,
    pub security_token: Option<String>,
    /// Keep the sequence open after its last message is acknowledged.
    pub auto_termination_suppressed: bool,
    /// Overrides the policy's protocol version.
    pub spec_version: Option<SpecVersion>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    pub last_message: bool,
    pub expects_reply: bool,
    pub sequence: SequenceOptions,
}

impl SendOptions {
    pub fn last(mut self) -> Self {
        self.last_message = true;
        self
    }

    pub fn expecting_reply(mut self) -> Self {
        self.expects_reply = true;
        self
    }

    pub fn with_offer(mut self) -> Self {
        self.sequence.offer = true;
        self
    }
}

/// Identifies one queued application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTicket {
    pub internal_id: String,
    pub message_id: String,
    pub message_number: u64,
}

impl<B: StorageBackend> RmEngine<B> {
    // ========================================================================
    // Establishment
    // ========================================================================

    /// Returns the sending sequence for `internal_id`, creating it and queueing
    /// a CreateSequence on first use. Concurrent callers end up with one record.
    pub async fn establish_sending_sequence(
        &self,
        internal_id: &str,
        target: &str,
        options: &SequenceOptions,
    ) -> Result<SequenceRecord> {
        let _sequence = self.lock_sequence(internal_id).await;
        let record = self
            .store
            .transact("sequence.establish", |unit| {
                self.ensure_sending_sequence(unit, internal_id, target, options)
            })
            .await?;
        self.wake_sender();
        Ok(record)
    }

    fn ensure_sending_sequence(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        internal_id: &str,
        target: &str,
        options: &SequenceOptions,
    ) -> Result<SequenceRecord> {
        if let Some(existing) = unit.sending_by_internal_id(internal_id) {
            return Ok(existing);
        }

        let now = now_ms();
        let version = options.spec_version.unwrap_or(self.policy.spec_version);
        let endpoint = self.endpoint.clone();
        let mut record =
            SequenceRecord::new_sending(internal_id, Some(target.to_string()), version, now);
        record.acks_to = Some(endpoint.clone());
        record.reply_to = Some(endpoint.clone());
        record.security_token = options.security_token.clone();
        record.auto_termination_suppressed = options.auto_termination_suppressed;
        record.polling_mode = self.is_polling_endpoint();

        let offer = if options.offer {
            let offered = new_sequence_id();
            record.offered_sequence_id = Some(offered.clone());
            Some(Offer {
                sequence_id: offered,
                endpoint: Some(endpoint.clone()),
            })
        } else {
            None
        };

        let envelope = Envelope::new(ProtocolBody::CreateSequence {
            acks_to: Some(endpoint.clone()),
            offer,
            spec_version: version,
        })
        .with_to(Some(target.to_string()))
        .with_reply_to(Some(endpoint))
        .with_security_token(options.security_token.clone());
        record.create_message_id = Some(envelope.message_id.clone());

        let record = unit.insert_sequence(record)?;
        let create = SendRecord::new(
            envelope.message_id.clone(),
            internal_id,
            MessageKind::CreateSequence,
            Some(target.to_string()),
            now,
        );
        self.enqueue(unit, create, envelope)?;

        event!(
            Level::INFO,
            internal_id,
            target,
            offer = options.offer,
            "sending sequence created"
        );
        Ok(record)
    }

    /// Receiver side of CreateSequence. Returns the response envelope.
    pub(crate) async fn accept_create_sequence(&self, envelope: &Envelope) -> Result<Envelope> {
        let ProtocolBody::CreateSequence {
            acks_to,
            offer,
            spec_version,
        } = &envelope.body
        else {
            return Err(RmError::create_sequence_refused("not a CreateSequence message"));
        };

        let response = self
            .store
            .transact("sequence.accept_create", |unit| {
                if let Some(token) = &envelope.security_token {
                    self.security.verify_proof_of_possession(token, envelope)?;
                }
                if let Some(offer) = offer {
                    self.evaluate_offer(unit, offer, *spec_version)?;
                }

                let now = now_ms();
                let sequence_id = new_sequence_id();
                let mut inbound = SequenceRecord::new_receiving(&sequence_id, *spec_version, now);
                inbound.acks_to = acks_to.clone().or_else(|| envelope.reply_to.clone());
                inbound.reply_to = envelope.reply_to.clone();
                inbound.to_address = envelope.to.clone();
                inbound.security_token = envelope.security_token.clone();
                inbound.polling_mode = is_polling_address(inbound.acks_to.as_deref());

                let accept = match offer {
                    Some(offer) => {
                        let reply_internal = reply_internal_id(&sequence_id);
                        let destination = offer
                            .endpoint
                            .clone()
                            .or_else(|| envelope.reply_to.clone());
                        let mut outbound = SequenceRecord::new_sending(
                            &reply_internal,
                            destination.clone(),
                            *spec_version,
                            now,
                        );
                        outbound.sequence_id = Some(offer.sequence_id.clone());
                        outbound.acks_to = Some(self.endpoint.clone());
                        outbound.offered_sequence_id = Some(sequence_id.clone());
                        outbound.security_token = envelope.security_token.clone();
                        outbound.polling_mode = is_polling_address(destination.as_deref());
                        unit.insert_sequence(outbound)?;
                        inbound.paired_internal_id = Some(reply_internal);
                        Some(Accept {
                            acks_to: Some(self.endpoint.clone()),
                        })
                    }
                    None => None,
                };
                unit.insert_sequence(inbound)?;

                Ok(Envelope::new(ProtocolBody::CreateSequenceResponse {
                    sequence_id: sequence_id.clone(),
                    accept,
                })
                .with_relates_to(envelope.message_id.clone())
                .with_to(envelope.reply_to.clone()))
            })
            .await?;

        if let Some(sequence_id) = Self::body_sequence_id(&response) {
            event!(Level::INFO, sequence_id, offered = offer.is_some(), "inbound sequence accepted");
        }
        Ok(response)
    }

    fn evaluate_offer(
        &self,
        unit: &UnitOfWork<'_, B>,
        offer: &Offer,
        version: SpecVersion,
    ) -> Result<()> {
        if offer.sequence_id.chars().count() < 2 {
            return Err(RmError::create_sequence_refused(
                "offered sequence id is too short",
            ));
        }
        if unit.sequence_id_in_use(&offer.sequence_id) {
            return Err(RmError::create_sequence_refused(format!(
                "offered sequence id '{}' is already in use",
                offer.sequence_id
            )));
        }
        if version == SpecVersion::V1_1 && is_plain_anonymous(offer.endpoint.as_deref()) {
            return Err(RmError::create_sequence_refused(
                "offer endpoint must be addressable",
            ));
        }
        Ok(())
    }

    /// Binds the wire id from a CreateSequenceResponse and releases the
    /// messages queued while establishment was pending.
    pub(crate) async fn handle_create_sequence_response(&self, envelope: &Envelope) -> Result<()> {
        let ProtocolBody::CreateSequenceResponse {
            sequence_id,
            accept,
        } = &envelope.body
        else {
            return Ok(());
        };
        let Some(create_id) = envelope.relates_to.as_deref() else {
            event!(Level::WARN, sequence_id, "CreateSequenceResponse without RelatesTo ignored");
            return Ok(());
        };

        let owner = self
            .store
            .snapshot()
            .await
            .sending_by_create_message_id(create_id)
            .map(|record| record.internal_id);
        let _sequence = match owner.as_deref() {
            Some(internal_id) => Some(self.lock_sequence(internal_id).await),
            None => None,
        };
        let bound = self
            .store
            .transact("sequence.bind", |unit| {
                let Some(mut record) = unit.sending_by_create_message_id(create_id) else {
                    return Ok(None);
                };
                if record.sequence_id.is_some() || !record.is_active() {
                    return Ok(None);
                }
                if unit.sequence_id_in_use(sequence_id) {
                    event!(
                        Level::WARN,
                        sequence_id,
                        internal_id = %record.internal_id,
                        "responded sequence id collides; establishment will be retried"
                    );
                    self.restart_establishment(unit, record)?;
                    return Ok(None);
                }

                let now = now_ms();
                record.sequence_id = Some(sequence_id.clone());
                record.last_activated_ms = now;
                if let Some(create) = unit.send_by_message_id(create_id) {
                    unit.retire_send(&create)?;
                }

                match (accept, record.offered_sequence_id.clone()) {
                    (Some(accept), Some(offered)) => {
                        let mut inbound =
                            SequenceRecord::new_receiving(&offered, record.spec_version, now);
                        inbound.acks_to = accept.acks_to.clone();
                        inbound.reply_to = record.reply_to.clone();
                        inbound.to_address = record.to_address.clone();
                        inbound.paired_internal_id = Some(record.internal_id.clone());
                        inbound.security_token = record.security_token.clone();
                        inbound.polling_mode = record.polling_mode;
                        unit.insert_sequence(inbound)?;
                    }
                    (Some(_), None) => {
                        event!(Level::WARN, sequence_id, "Accept received without an offer; ignored");
                    }
                    (None, Some(offered)) => {
                        event!(Level::DEBUG, offered = %offered, "offer declined by peer");
                        record.offered_sequence_id = None;
                    }
                    (None, None) => {}
                }

                let record = unit.update_sequence(record)?;
                for mut queued in unit.sends_for_sequence(&record.internal_id) {
                    if queued.send {
                        continue;
                    }
                    queued.sequence_id = Some(sequence_id.clone());
                    queued.send = true;
                    unit.update_send(queued)?;
                }
                Ok(Some(record))
            })
            .await?;

        if let Some(record) = bound {
            event!(
                Level::INFO,
                internal_id = %record.internal_id,
                sequence_id,
                "sending sequence established"
            );
            self.wake_sender();
        }
        Ok(())
    }

    /// Replaces the pending CreateSequence with a fresh one.
    fn restart_establishment(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        mut record: SequenceRecord,
    ) -> Result<()> {
        let Some(create_id) = record.create_message_id.clone() else {
            return Ok(());
        };
        let Some(old) = unit.send_by_message_id(&create_id) else {
            return Ok(());
        };
        let Some(stored) = unit.stored_message(&old.body_key) else {
            return Ok(());
        };
        unit.retire_send(&old)?;

        let mut envelope = stored.envelope;
        envelope.message_id = crate::core::new_message_id();
        if let ProtocolBody::CreateSequence {
            offer: Some(offer), ..
        } = &mut envelope.body
        {
            offer.sequence_id = new_sequence_id();
            record.offered_sequence_id = Some(offer.sequence_id.clone());
        }
        record.create_message_id = Some(envelope.message_id.clone());
        unit.update_sequence(record.clone())?;

        let create = SendRecord::new(
            envelope.message_id.clone(),
            &record.internal_id,
            MessageKind::CreateSequence,
            old.destination.clone(),
            now_ms(),
        );
        self.enqueue(unit, create, envelope)?;
        Ok(())
    }

    // ========================================================================
    // Application messages
    // ========================================================================

    /// Assigns the next message number on the sequence (creating it on first
    /// use) and queues the message for transmission.
    pub async fn send_application(
        &self,
        internal_id: &str,
        target: &str,
        payload: Value,
        options: &SendOptions,
    ) -> Result<SendTicket> {
        let _sequence = self.lock_sequence(internal_id).await;
        let ticket = self
            .store
            .transact("sequence.send", |unit| {
                let record =
                    self.ensure_sending_sequence(unit, internal_id, target, &options.sequence)?;
                self.append_application(
                    unit,
                    record,
                    payload.clone(),
                    options.last_message,
                    options.expects_reply,
                    None,
                )
            })
            .await?;

        event!(
            Level::DEBUG,
            internal_id,
            message_number = ticket.message_number,
            "application message queued"
        );
        self.wake_sender();
        Ok(ticket)
    }

    pub(crate) fn append_application(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        mut record: SequenceRecord,
        payload: Value,
        last_message: bool,
        expects_reply: bool,
        in_reply_to: Option<ReplyCorrelation>,
    ) -> Result<SendTicket> {
        if record.failed {
            return Err(RmError::DeliveryFailed(
                record.internal_id.clone(),
                record
                    .last_send_error
                    .clone()
                    .unwrap_or_else(|| "sequence has failed".to_string()),
            ));
        }
        if record.terminated || record.terminate_added {
            return Err(RmError::sequence_terminated(record.display_id()));
        }
        if record.closed {
            return Err(RmError::sequence_closed(record.display_id()));
        }
        if let Some(last) = record.last_message_number {
            return Err(RmError::fault(
                FaultCode::LastMessageNumberExceeded,
                Some(record.display_id()),
                format!("message {} was already sent as the last message", last),
            ));
        }

        let number = record.next_message_number;
        if number > MAX_MESSAGE_NUMBER {
            return Err(RmError::fault(
                FaultCode::MessageNumberRollover,
                Some(record.display_id()),
                "message numbers exhausted",
            ));
        }
        let now = now_ms();
        record.next_message_number = number + 1;
        record.highest_out_message_number = number;
        record.last_activated_ms = now;
        if last_message {
            record.last_message_number = Some(number);
        }
        if expects_reply {
            record.expected_replies += 1;
        }
        let record = unit.update_sequence(record)?;

        let envelope = Envelope::application(payload)
            .with_to(record.to_address.clone())
            .with_reply_to(record.reply_to.clone())
            .with_security_token(record.security_token.clone())
            .with_sequence(SequenceHeader {
                sequence_id: record.sequence_id.clone().unwrap_or_default(),
                message_number: number,
                last_message,
            });

        let mut send = SendRecord::new(
            envelope.message_id.clone(),
            &record.internal_id,
            MessageKind::Application,
            record.to_address.clone(),
            now,
        );
        send.sequence_id = record.sequence_id.clone();
        send.send = record.sequence_id.is_some();
        send.message_number = Some(number);
        send.last_message = last_message;
        send.in_reply_to = in_reply_to;
        let message_id = envelope.message_id.clone();
        self.enqueue(unit, send, envelope)?;

        Ok(SendTicket {
            internal_id: record.internal_id.clone(),
            message_id,
            message_number: number,
        })
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Stops new application sends; the highest assigned number becomes the
    /// last message number and termination follows once it is acknowledged.
    pub async fn close_sequence(&self, internal_id: &str) -> Result<()> {
        let _sequence = self.lock_sequence(internal_id).await;
        self.store
            .transact("sequence.close", |unit| {
                let mut record = unit
                    .sending_by_internal_id(internal_id)
                    .ok_or_else(|| RmError::SequenceNotFound(internal_id.to_string()))?;
                if !record.is_active() || record.terminate_added {
                    return Err(RmError::sequence_terminated(record.display_id()));
                }
                if record.closed {
                    return Ok(());
                }

                record.closed = true;
                if record.last_message_number.is_none() {
                    record.last_message_number = Some(record.highest_out_message_number);
                }
                let record = unit.update_sequence(record)?;

                if record.spec_version.has_responses() {
                    let envelope = Envelope::new(ProtocolBody::CloseSequence {
                        sequence_id: record.sequence_id.clone().unwrap_or_default(),
                        last_message_number: record.last_message_number,
                    })
                    .with_to(record.to_address.clone())
                    .with_reply_to(record.reply_to.clone())
                    .with_security_token(record.security_token.clone());
                    let mut close = SendRecord::new(
                        envelope.message_id.clone(),
                        internal_id,
                        MessageKind::CloseSequence,
                        record.to_address.clone(),
                        now_ms(),
                    );
                    close.sequence_id = record.sequence_id.clone();
                    close.send = record.sequence_id.is_some();
                    self.enqueue(unit, close, envelope)?;
                }

                self.check_and_terminate(unit, record)?;
                Ok(())
            })
            .await?;
        event!(Level::INFO, internal_id, "sequence closed");
        self.wake_sender();
        Ok(())
    }

    /// Receiver side of CloseSequence.
    pub(crate) async fn accept_close(&self, envelope: &Envelope) -> Result<Option<Envelope>> {
        let ProtocolBody::CloseSequence {
            sequence_id,
            last_message_number,
        } = &envelope.body
        else {
            return Ok(None);
        };

        let _sequence = self.lock_sequence(sequence_id).await;
        let record = self
            .store
            .transact("sequence.accept_close", |unit| {
                let mut record = unit
                    .receiving_by_sequence_id(sequence_id)
                    .ok_or_else(|| RmError::unknown_sequence(sequence_id))?;
                if let Some(token) = &record.security_token {
                    self.security.verify_proof_of_possession(token, envelope)?;
                }
                if record.terminated {
                    return Err(RmError::sequence_terminated(sequence_id));
                }
                if record.closed {
                    return Ok(record);
                }
                record.closed = true;
                if record.last_message_number.is_none() {
                    record.last_message_number = *last_message_number;
                }
                record.last_activated_ms = now_ms();
                unit.update_sequence(record)
            })
            .await?;

        event!(Level::INFO, sequence_id, "inbound sequence closed by peer");
        let mut response = Envelope::new(ProtocolBody::CloseSequenceResponse {
            sequence_id: sequence_id.clone(),
        })
        .with_relates_to(envelope.message_id.clone())
        .with_to(envelope.reply_to.clone());
        response.acknowledgements.push(Self::acknowledgement_for(&record));
        Ok(Some(response))
    }

    pub(crate) async fn handle_close_response(&self, envelope: &Envelope) -> Result<()> {
        let Some(sequence_id) = Self::body_sequence_id(envelope) else {
            return Ok(());
        };
        let _sequence = self.lock_sending_by_wire_id(sequence_id).await;
        self.store
            .transact("sequence.close_response", |unit| {
                let Some(record) = unit.sending_by_sequence_id(sequence_id) else {
                    return Ok(());
                };
                for pending in unit.sends_for_sequence(&record.internal_id) {
                    if pending.kind == MessageKind::CloseSequence {
                        unit.retire_send(&pending)?;
                    }
                }
                Ok(())
            })
            .await
    }

    // ========================================================================
    // Terminate
    // ========================================================================

    /// Requests termination of a sending sequence regardless of acknowledgement state.
    pub async fn terminate_sequence(&self, internal_id: &str) -> Result<()> {
        let _sequence = self.lock_sequence(internal_id).await;
        self.store
            .transact("sequence.terminate", |unit| {
                let record = unit
                    .sending_by_internal_id(internal_id)
                    .ok_or_else(|| RmError::SequenceNotFound(internal_id.to_string()))?;
                if !record.is_active() || record.terminate_added {
                    return Ok(());
                }
                if record.sequence_id.is_none() {
                    self.terminate_sending_side(unit, internal_id)?;
                    return Ok(());
                }
                self.add_terminate(unit, record)?;
                Ok(())
            })
            .await?;
        self.wake_sender();
        Ok(())
    }

    /// Queues TerminateSequence after the configured delay.
    pub(crate) fn add_terminate(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        mut record: SequenceRecord,
    ) -> Result<SequenceRecord> {
        if record.terminate_added {
            return Ok(record);
        }
        record.terminate_added = true;
        if record.last_message_number.is_none() {
            record.last_message_number = Some(record.highest_out_message_number);
        }
        let record = unit.update_sequence(record)?;

        let envelope = Envelope::new(ProtocolBody::TerminateSequence {
            sequence_id: record.sequence_id.clone().unwrap_or_default(),
            last_message_number: record.last_message_number,
        })
        .with_to(record.to_address.clone())
        .with_reply_to(record.reply_to.clone())
        .with_security_token(record.security_token.clone());
        let mut terminate = SendRecord::new(
            envelope.message_id.clone(),
            &record.internal_id,
            MessageKind::TerminateSequence,
            record.to_address.clone(),
            now_ms() + self.policy.terminate_delay_ms as i64,
        );
        terminate.sequence_id = record.sequence_id.clone();
        self.enqueue(unit, terminate, envelope)?;

        event!(
            Level::DEBUG,
            internal_id = %record.internal_id,
            "terminate sequence scheduled"
        );
        Ok(record)
    }

    /// Marks the sending side terminated and drops its outstanding sends.
    pub(crate) fn terminate_sending_side(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        internal_id: &str,
    ) -> Result<()> {
        let Some(mut record) = unit.sending_by_internal_id(internal_id) else {
            return Ok(());
        };
        if record.terminated {
            return Ok(());
        }
        record.terminated = true;
        record.terminate_added = true;
        unit.update_sequence(record)?;
        for pending in unit.sends_for_sequence(internal_id) {
            unit.retire_send(&pending)?;
        }
        event!(Level::INFO, internal_id, "sending sequence terminated");
        Ok(())
    }

    /// Receiver side of TerminateSequence.
    pub(crate) async fn accept_terminate(&self, envelope: &Envelope) -> Result<Option<Envelope>> {
        let ProtocolBody::TerminateSequence {
            sequence_id,
            last_message_number,
        } = &envelope.body
        else {
            return Ok(None);
        };

        let _sequence = self.lock_sequence(sequence_id).await;
        let record = self
            .store
            .transact("sequence.accept_terminate", |unit| {
                let mut record = unit
                    .receiving_by_sequence_id(sequence_id)
                    .ok_or_else(|| RmError::unknown_sequence(sequence_id))?;
                if let Some(token) = &record.security_token {
                    self.security.verify_proof_of_possession(token, envelope)?;
                }
                if record.terminated {
                    return Ok(record);
                }

                record.terminated = true;
                record.closed = true;
                if record.last_message_number.is_none() {
                    record.last_message_number = *last_message_number;
                }
                record.last_activated_ms = now_ms();
                let record = unit.update_sequence(record)?;

                for ack in unit.pending_acks_for(&record.internal_id) {
                    unit.retire_send(&ack)?;
                }
                let discarded = self.discard_unreachable_invocations(unit, &record)?;
                if discarded > 0 {
                    event!(
                        Level::WARN,
                        sequence_id,
                        discarded,
                        "queued messages behind a gap discarded on termination"
                    );
                }
                self.finish_paired_outbound(unit, &record)?;
                Ok(record)
            })
            .await?;

        event!(Level::INFO, sequence_id, "inbound sequence terminated by peer");
        self.wake_sender();
        self.wake_invoker();

        if !record.spec_version.has_responses() {
            return Ok(None);
        }
        let mut response = Envelope::new(ProtocolBody::TerminateSequenceResponse {
            sequence_id: sequence_id.clone(),
        })
        .with_relates_to(envelope.message_id.clone())
        .with_to(envelope.reply_to.clone());
        response.acknowledgements.push(Self::acknowledgement_for(&record));
        Ok(Some(response))
    }

    /// Drops queued invocations that can no longer be delivered in order.
    fn discard_unreachable_invocations(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        record: &SequenceRecord,
    ) -> Result<usize> {
        if !self.policy.in_order {
            return Ok(0);
        }
        let mut reachable = record.next_message_to_invoke;
        let mut discarded = 0;
        for queued in unit.invokes_for_sequence(&record.internal_id) {
            if queued.message_number == reachable {
                reachable += 1;
                continue;
            }
            if queued.message_number > reachable {
                unit.delete_invoke(&queued.sequence_id, queued.message_number)?;
                unit.delete_message(&queued.body_key)?;
                discarded += 1;
            }
        }
        Ok(discarded)
    }

    /// Once the peer's request sequence is gone, the reply sequence paired
    /// with it gets no further messages and terminates when acknowledged.
    fn finish_paired_outbound(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        inbound: &SequenceRecord,
    ) -> Result<()> {
        let Some(paired) = inbound.paired_internal_id.as_deref() else {
            return Ok(());
        };
        let Some(mut outbound) = unit.sending_by_internal_id(paired) else {
            return Ok(());
        };
        if !outbound.is_active() || outbound.terminate_added || outbound.expected_replies > 0 {
            return Ok(());
        }
        if !unit.invokes_for_sequence(&inbound.internal_id).is_empty() {
            return Ok(());
        }
        if outbound.last_message_number.is_none() {
            outbound.last_message_number = Some(outbound.highest_out_message_number);
            outbound = unit.update_sequence(outbound)?;
        }
        self.check_and_terminate(unit, outbound)?;
        Ok(())
    }

    pub(crate) async fn handle_terminate_response(&self, envelope: &Envelope) -> Result<()> {
        let Some(sequence_id) = Self::body_sequence_id(envelope) else {
            return Ok(());
        };
        let _sequence = self.lock_sending_by_wire_id(sequence_id).await;
        self.store
            .transact("sequence.terminate_response", |unit| {
                match unit.sending_by_sequence_id(sequence_id) {
                    Some(record) => self.terminate_sending_side(unit, &record.internal_id),
                    None => Ok(()),
                }
            })
            .await
    }

    // ========================================================================
    // Failure and inactivity
    // ========================================================================

    /// Marks a sending sequence failed. Only the call that flips the flag
    /// returns a failure to publish.
    pub(crate) fn fail_sequence(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        internal_id: &str,
        reason: &str,
        timed_out: bool,
    ) -> Result<Option<DeliveryFailure>> {
        let Some(mut record) = unit.sending_by_internal_id(internal_id) else {
            return Ok(None);
        };
        if record.failed || record.terminated {
            return Ok(None);
        }
        let now = now_ms();
        record.failed = true;
        record.timed_out = timed_out;
        record.last_send_error = Some(reason.to_string());
        record.last_send_error_ms = Some(now);
        let record = unit.update_sequence(record)?;
        for pending in unit.sends_for_sequence(internal_id) {
            unit.retire_send(&pending)?;
        }
        Ok(Some(DeliveryFailure {
            internal_id: internal_id.to_string(),
            sequence_id: record.sequence_id.clone(),
            reason: reason.to_string(),
            failed_at_ms: now,
        }))
    }

    /// Times out sequences idle past the inactivity timeout. Returns how many
    /// sequences were closed out.
    pub async fn sweep_inactive(&self) -> Result<usize> {
        let Some(timeout) = self.policy.inactivity_timeout_ms else {
            return Ok(0);
        };
        let (failures, expired_inbound) = self
            .store
            .transact("sequence.sweep_inactive", |unit| {
                let cutoff = now_ms() - timeout as i64;
                let mut failures = Vec::new();
                for record in unit.sending_sequences() {
                    if record.is_active() && record.last_activated_ms < cutoff {
                        if let Some(failure) = self.fail_sequence(
                            unit,
                            &record.internal_id,
                            "inactivity timeout",
                            true,
                        )? {
                            failures.push(failure);
                        }
                    }
                }
                let mut expired_inbound = 0;
                for mut record in unit.receiving_sequences() {
                    if record.terminated || record.last_activated_ms >= cutoff {
                        continue;
                    }
                    record.terminated = true;
                    record.timed_out = true;
                    let record = unit.update_sequence(record)?;
                    for ack in unit.pending_acks_for(&record.internal_id) {
                        unit.retire_send(&ack)?;
                    }
                    expired_inbound += 1;
                }
                Ok((failures, expired_inbound))
            })
            .await?;

        let swept = failures.len() + expired_inbound;
        for failure in failures {
            self.publish_failure(failure);
        }
        if swept > 0 {
            event!(Level::INFO, swept, "inactive sequences timed out");
        }
        Ok(swept)
    }

    pub(crate) fn acknowledgement_for(record: &SequenceRecord) -> SequenceAcknowledgement {
        SequenceAcknowledgement::from_ranges(
            record.internal_id.clone(),
            &record.acked,
            record.closed || record.terminated,
        )
    }
}

/// Internal id of the sending sequence that carries replies for an accepted
/// inbound sequence.
pub(crate) fn reply_internal_id(inbound_sequence_id: &str) -> String {
    format!("reply:{}", inbound_sequence_id)
}

fn is_polling_address(address: Option<&str>) -> bool {
    crate::core::is_anonymous(address) && !is_plain_anonymous(address)
}
