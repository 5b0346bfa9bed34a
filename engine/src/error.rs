use thiserror::Error;

use crate::entity::Entity;

/// Errors surfaced by fallible registration and execution APIs.
///
/// Invariant violations inside the engine are not represented here; those are
/// programmer errors and abort via panic with the offending condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A signature referenced an identifier that is not a registered
    /// component or declared family.
    #[error("unknown identifier `{0}`")]
    NotRegistered(String),

    /// A signature string failed to parse.
    #[error("invalid signature `{signature}`: {reason}")]
    Signature {
        /// The full signature as given.
        signature: String,
        /// What the lexer objected to.
        reason: String,
    },

    /// A system was run that never matched any table.
    #[error("system {0:?} matches no tables")]
    NoMatch(Entity),

    /// An operation referenced a handle the entity index does not know.
    #[error("entity {0:?} is not alive in this world")]
    InvalidEntity(Entity),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        // Given
        let err = Error::NotRegistered("Position".into());

        // Then
        assert_eq!(err.to_string(), "unknown identifier `Position`");

        // Given
        let err = Error::Signature {
            signature: "Position,".into(),
            reason: "empty column".into(),
        };

        // Then
        assert_eq!(
            err.to_string(),
            "invalid signature `Position,`: empty column"
        );
    }
}
