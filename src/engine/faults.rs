use super::RmEngine;
use crate::core::{FaultCode, Result};
use crate::protocol::{Envelope, ProtocolBody};
use crate::storage::{SequenceRepository, StorageBackend};
use tracing::{Level, event};

impl<B: StorageBackend> RmEngine<B> {
    /// A fault from the peer about one of our sending sequences fails it.
    /// Faults about anything else are logged.
    pub(crate) async fn handle_peer_fault(&self, envelope: &Envelope) -> Result<()> {
        let ProtocolBody::Fault(fault) = &envelope.body else {
            return Ok(());
        };
        let reason = fault.to_string();

        let _sequence = match &fault.sequence_id {
            Some(sequence_id) => self.lock_sending_by_wire_id(sequence_id).await,
            None => None,
        };
        let failure = self
            .store
            .transact("fault.received", |unit| {
                let target = match (&fault.sequence_id, fault.code) {
                    (Some(sequence_id), _) => unit.sending_by_sequence_id(sequence_id),
                    (None, FaultCode::CreateSequenceRefused) => envelope
                        .relates_to
                        .as_deref()
                        .and_then(|create_id| unit.sending_by_create_message_id(create_id)),
                    (None, _) => None,
                };
                match target {
                    Some(record) => self.fail_sequence(unit, &record.internal_id, &reason, false),
                    None => Ok(None),
                }
            })
            .await?;

        match failure {
            Some(failure) => self.publish_failure(failure),
            None => {
                event!(Level::WARN, fault = %reason, "peer fault did not match a sending sequence");
            }
        }
        Ok(())
    }
}
