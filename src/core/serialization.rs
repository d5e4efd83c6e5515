//! JSON helpers for configuration and tranche payloads.
//!
//! Engine configuration (`LossModelConfig`, `McConfig`), correlation inputs and tranche
//! definitions derive serde, so they can be persisted next to a pricing run and reloaded.
//!
//! # Examples
//! ```rust
//! use creditferric::core::{from_json, to_json_pretty};
//! use creditferric::credit::LossModelConfig;
//!
//! let cfg = LossModelConfig {
//!     grid_size: 800,
//!     ..LossModelConfig::default()
//! };
//! let json = to_json_pretty(&cfg).expect("json serialization");
//! let decoded: LossModelConfig = from_json(&json).expect("json deserialization");
//! assert_eq!(decoded, cfg);
//! ```

use serde::de::DeserializeOwned;

use super::CreditError;

/// Serialize a value to pretty JSON.
pub fn to_json_pretty<T: serde::Serialize>(value: &T) -> Result<String, CreditError> {
    serde_json::to_string_pretty(value).map_err(|e| CreditError::invalid(e.to_string()))
}

/// Deserialize a value from JSON.
pub fn from_json<T: DeserializeOwned>(payload: &str) -> Result<T, CreditError> {
    serde_json::from_str(payload).map_err(|e| CreditError::invalid(e.to_string()))
}
