//! Typed errors for the characteristic codec.
//!
//! Everything above the codec (transport adapter, sinks, binaries) reports
//! failures through `anyhow`; only decode failures get a dedicated type because
//! callers branch on them.

use thiserror::Error;

use crate::protocol::CharacteristicKind;

/// A characteristic payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes than the fixed field layout of `kind` requires.
    #[error("malformed {kind:?} payload: expected at least {expected} bytes, got {actual}")]
    MalformedPayload {
        kind: CharacteristicKind,
        expected: usize,
        actual: usize,
    },
}
