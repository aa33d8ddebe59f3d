pub mod error;
pub mod types;

pub use error::{FaultCode, ProtocolFault, Result, RmError};
pub use types::{
    ANONYMOUS_ADDRESS, MAX_MESSAGE_NUMBER, MessageKind, RM_ANONYMOUS_PREFIX, SpecVersion,
    is_anonymous, is_plain_anonymous, new_message_id, new_rm_anonymous_address,
    new_sequence_id, now_ms,
};
