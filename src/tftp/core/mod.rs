//! TFTP core protocol implementation
//!
//! This module contains the stateless pieces of the protocol:
//! - `packet`: Packet serialization and deserialization
//! - `options`: Option extensions and negotiation bounds

pub mod options;
mod packet;

// Public core types
pub use options::{OptionType, OptionsProtocol, TransferOption};
pub use packet::{ErrorCode, InvalidPacket, OCTET_MODE, Opcode, Packet};
