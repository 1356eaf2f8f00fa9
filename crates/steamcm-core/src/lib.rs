//! steamcm-core: shared protocol library for the CM gateway.
//!
//! Provides message ids and result codes, fixed-layout header framing,
//! protobuf body definitions, client and GC envelopes with their decoder
//! registries, and Multi container splitting. Nothing here does I/O.

pub mod enums;
pub mod error;
pub mod gc;
pub mod header;
pub mod message;
pub mod multi;
pub mod protobufs;
pub mod steam_id;
pub mod structs;

// Re-export commonly used items at crate root.
pub use enums::{clear_proto_bit, is_proto, set_proto_bit, EMsg, EResult, PROTO_BIT};
pub use error::{CmError, CmResult};
pub use gc::{GcEnvelope, GcRegistry};
pub use header::{GcHeader, Header};
pub use message::{Body, BodyKey, CmBody, Envelope, FromCmBody};
pub use protobufs::JOB_ID_NONE;
pub use steam_id::SteamId;
