// ============================================================================
// Protocol message model
// ============================================================================
//
// Logical shape of the reliable-messaging headers and bodies. Wire
// serialization belongs to the transport; the engine only reads and writes
// these parts.
//
// ============================================================================

pub mod message;

pub use message::{
    Accept, AckRequested, Envelope, MakeConnection, MessagePending, Offer, ProtocolBody,
    SequenceAcknowledgement, SequenceHeader,
};
