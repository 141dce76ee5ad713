//! Codec module - payload decoding.
//!
//! - [`JsonCodec`] - JSON text carried in `String` fields (`serde_json`)
//!
//! Codecs are marker structs with static methods rather than trait objects,
//! so the payload type is chosen at the call site.

mod json;

pub use json::JsonCodec;
