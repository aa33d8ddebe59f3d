use super::RmEngine;
use super::lifecycle::reply_internal_id;
use crate::core::{Result, RmError};
use crate::storage::{
    InvokeRecord, InvokeRepository, ReplyCorrelation, SequenceRecord, SequenceRepository,
    StorageBackend,
};
use crate::transaction::UnitOfWork;
use serde_json::Value;
use std::sync::atomic::Ordering;
use tracing::{Level, event};

/// How a completed invocation moves the in-order cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Advance only if the message was the next expected one.
    Strict,
    /// Advance past the message even if earlier numbers are missing.
    SkipGaps,
    Untouched,
}

fn invoke_lock(sequence_id: &str) -> String {
    format!("invoke:{}", sequence_id)
}

impl<B: StorageBackend> RmEngine<B> {
    pub(crate) async fn invoke_after_accept(&self, sequence_id: &str, message_number: u64) {
        let result = if self.policy.in_order {
            self.invoke_ready(sequence_id).await.map(|_| ())
        } else {
            self.invoke_one(sequence_id, message_number).await.map(|_| ())
        };
        if let Err(err) = result {
            event!(
                Level::WARN,
                sequence_id,
                message_number,
                error = %err,
                "invocation deferred to the invoker"
            );
            self.wake_invoker();
        }
    }

    /// Invokes the contiguous run of stored messages starting at the
    /// sequence's next expected number. Messages that arrive after a forced
    /// dispatch skipped past them are invoked first, without moving the
    /// cursor. Returns how many were invoked.
    pub async fn invoke_ready(&self, sequence_id: &str) -> Result<usize> {
        let _guard = self.locks.acquire(invoke_lock(sequence_id)).await;
        let mut invoked = 0;
        let tables = self.store.snapshot().await;
        if let Some(record) = tables.receiving_by_sequence_id(sequence_id) {
            let skipped = tables
                .invokes_for_sequence(sequence_id)
                .into_iter()
                .filter(|queued| queued.message_number < record.next_message_to_invoke);
            for late in skipped {
                self.run_invocation(&late, Cursor::Untouched).await?;
                invoked += 1;
            }
        }
        loop {
            let tables = self.store.snapshot().await;
            let Some(record) = tables.receiving_by_sequence_id(sequence_id) else {
                break;
            };
            let Some(queued) = tables.invoke_record(sequence_id, record.next_message_to_invoke)
            else {
                break;
            };
            self.run_invocation(&queued, Cursor::Strict).await?;
            invoked += 1;
        }
        Ok(invoked)
    }

    /// Invokes one stored message without regard to order.
    pub async fn invoke_one(&self, sequence_id: &str, message_number: u64) -> Result<bool> {
        let _guard = self
            .locks
            .acquire(format!("{}#{}", invoke_lock(sequence_id), message_number))
            .await;
        let Some(queued) = self
            .store
            .snapshot()
            .await
            .invoke_record(sequence_id, message_number)
        else {
            return Ok(false);
        };
        self.run_invocation(&queued, Cursor::Untouched).await?;
        Ok(true)
    }

    /// Invokes every stored message of the sequence in number order, skipping
    /// over gaps. Used when the caller gives up waiting for missing messages.
    pub async fn force_dispatch(&self, sequence_id: &str) -> Result<usize> {
        let _guard = self.locks.acquire(invoke_lock(sequence_id)).await;
        let tables = self.store.snapshot().await;
        if tables.receiving_by_sequence_id(sequence_id).is_none() {
            return Err(RmError::SequenceNotFound(sequence_id.to_string()));
        }
        let queued = tables.invokes_for_sequence(sequence_id);
        let mut invoked = 0;
        for record in &queued {
            self.run_invocation(record, Cursor::SkipGaps).await?;
            invoked += 1;
        }
        if invoked > 0 {
            event!(Level::INFO, sequence_id, invoked, "inbound messages force-dispatched");
        }
        Ok(invoked)
    }

    /// One pass of the invoker over every receiving sequence.
    pub async fn invoke_pending(&self) -> Result<usize> {
        let tables = self.store.snapshot().await;
        let mut invoked = 0;
        for record in tables.receiving_sequences() {
            let queued = tables.invokes_for_sequence(&record.internal_id);
            if queued.is_empty() {
                continue;
            }
            if self.policy.in_order {
                invoked += self.invoke_ready(&record.internal_id).await?;
            } else {
                for item in queued {
                    if self
                        .invoke_one(&item.sequence_id, item.message_number)
                        .await?
                    {
                        invoked += 1;
                    }
                }
            }
        }
        Ok(invoked)
    }

    async fn run_invocation(&self, queued: &InvokeRecord, cursor: Cursor) -> Result<()> {
        let sequence_id = queued.sequence_id.as_str();
        let number = queued.message_number;
        let payload = self
            .store
            .snapshot()
            .await
            .stored_message(&queued.body_key)
            .and_then(|stored| stored.envelope.payload().cloned())
            .unwrap_or(Value::Null);

        let reply = self
            .application
            .invoke(sequence_id, number, payload)
            .await
            .map_err(|err| match err {
                RmError::Application(_) => err,
                other => RmError::Application(other.to_string()),
            })?;
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);

        let _sequence = self.lock_sequence(sequence_id).await;
        let replied = self
            .store
            .transact("invoke.complete", |unit| {
                unit.delete_invoke(sequence_id, number)?;
                unit.delete_message(&queued.body_key)?;
                let Some(mut record) = unit.receiving_by_sequence_id(sequence_id) else {
                    return Ok(false);
                };
                let advance = match cursor {
                    Cursor::Strict => record.next_message_to_invoke == number,
                    Cursor::SkipGaps => record.next_message_to_invoke <= number,
                    Cursor::Untouched => false,
                };
                if advance {
                    record.next_message_to_invoke = number + 1;
                    record = unit.update_sequence(record)?;
                }
                match &reply {
                    Some(payload) => self.queue_reply(unit, &record, number, payload.clone()),
                    None => Ok(false),
                }
            })
            .await?;

        event!(
            Level::DEBUG,
            sequence_id,
            message_number = number,
            replied,
            "message delivered to application"
        );
        if replied {
            self.wake_sender();
        }
        Ok(())
    }

    /// Sends an application reply on the sequence paired with `inbound`.
    fn queue_reply(
        &self,
        unit: &mut UnitOfWork<'_, B>,
        inbound: &SequenceRecord,
        message_number: u64,
        payload: Value,
    ) -> Result<bool> {
        let paired = reply_internal_id(&inbound.internal_id);
        if inbound.paired_internal_id.as_deref() != Some(paired.as_str()) {
            event!(
                Level::DEBUG,
                sequence_id = %inbound.internal_id,
                "reply discarded: no reply sequence was offered"
            );
            return Ok(false);
        }
        let paired = paired.as_str();
        let Some(outbound) = unit.sending_by_internal_id(paired) else {
            return Ok(false);
        };
        if !outbound.is_active() || outbound.closed || outbound.terminate_added {
            event!(
                Level::WARN,
                internal_id = paired,
                "reply discarded: paired sequence no longer accepts messages"
            );
            return Ok(false);
        }
        let last = inbound.last_message_number == Some(message_number);
        let ticket = self.append_application(
            unit,
            outbound,
            payload,
            last,
            false,
            Some(ReplyCorrelation {
                sequence_id: inbound.internal_id.clone(),
                message_number,
            }),
        )?;
        event!(
            Level::DEBUG,
            internal_id = paired,
            reply_number = ticket.message_number,
            "reply queued"
        );
        Ok(true)
    }
}
