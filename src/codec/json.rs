//! JSON codec using `serde_json`.
//!
//! Response payloads travel as `String` fields holding JSON text. A payload
//! that fails to decode is a per-request failure: the frame around it was
//! well-formed, so the connection stays usable.
//!
//! # Example
//!
//! ```
//! use sockwire::codec::JsonCodec;
//! use serde_json::Value;
//!
//! let value: Value = JsonCodec::decode(r#"{"line": 3}"#).unwrap();
//! assert_eq!(value["line"], 3);
//!
//! let text = JsonCodec::encode(&value).unwrap();
//! assert_eq!(text, r#"{"line":3}"#);
//! ```

use crate::error::Result;

/// JSON codec for payload strings.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON text.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    /// Decode JSON text to a value.
    ///
    /// # Errors
    ///
    /// Returns `Decode` if the text is not valid JSON for type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
        Ok(serde_json::from_str(text)?)
    }
}
