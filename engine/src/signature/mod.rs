//! Signature string lexing.
//!
//! A system signature is a comma-separated list of columns:
//!
//! ```text
//! column     := [oper] [source '.'] identifier ('|' [source '.'] identifier)*
//! oper       := '!' (Not) | '?' (Optional)
//! source     := 'SYSTEM' | 'CONTAINER' | 'ID'
//! identifier := [A-Za-z_][A-Za-z0-9_]*
//! ```
//!
//! An empty source means the column reads from the matched entity. Elements
//! joined by `|` form an Or group; the lexer reports each element separately
//! with [`Op::Or`] and the adapter folds consecutive Or elements into one
//! column.
//!
//! The lexer knows nothing about registered names: it drives a callback with
//! `(source, oper, identifier)` per element, in source order, and the caller
//! resolves identifiers. This keeps the grammar reusable for any column
//! consumer.

use crate::error::Error;

/// Where a column's data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The matched entity's own row (the default).
    Entity,
    /// A component of one of the matched family's components.
    Component,
    /// The system's own entity.
    System,
    /// No data; the system receives only the handle.
    Handle,
}

/// How a column participates in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// The component must be present.
    And,
    /// At least one member of the Or group must be present.
    Or,
    /// Present or not; never rejects a table.
    Optional,
    /// The component must be absent.
    Not,
}

/// Lex a signature, invoking `action` once per column element in source
/// order.
///
/// Errors use [`Error::Signature`] for malformed input; identifier
/// resolution failures are the callback's business.
pub fn parse(
    signature: &str,
    mut action: impl FnMut(Source, Op, &str) -> Result<(), Error>,
) -> Result<(), Error> {
    let malformed = |reason: &str| Error::Signature {
        signature: signature.to_owned(),
        reason: reason.to_owned(),
    };

    if signature.trim().is_empty() {
        return Err(malformed("signature has no columns"));
    }

    for raw_column in signature.split(',') {
        let mut column = raw_column.trim();
        if column.is_empty() {
            return Err(malformed("empty column"));
        }

        let op = match column.as_bytes()[0] {
            b'!' => {
                column = column[1..].trim_start();
                Op::Not
            }
            b'?' => {
                column = column[1..].trim_start();
                Op::Optional
            }
            _ => Op::And,
        };

        let elements: Vec<&str> = column.split('|').collect();
        let grouped = elements.len() > 1;
        if grouped && op != Op::And {
            return Err(malformed("`!` and `?` cannot prefix an OR group"));
        }

        for element in elements {
            let element = element.trim();
            let (source, identifier) = split_source(element);
            if !is_identifier(identifier) {
                return Err(malformed(&format!("bad identifier `{element}`")));
            }
            let op = if grouped { Op::Or } else { op };
            action(source, op, identifier)?;
        }
    }

    Ok(())
}

/// The number of column elements a signature would produce, without
/// resolving anything. Malformed signatures count 0.
pub fn columns_count(signature: &str) -> usize {
    let mut count = 0;
    if parse(signature, |_, _, _| {
        count += 1;
        Ok(())
    })
    .is_err()
    {
        return 0;
    }
    count
}

fn split_source(element: &str) -> (Source, &str) {
    if let Some(rest) = element.strip_prefix("SYSTEM.") {
        (Source::System, rest)
    } else if let Some(rest) = element.strip_prefix("CONTAINER.") {
        (Source::Component, rest)
    } else if let Some(rest) = element.strip_prefix("ID.") {
        (Source::Handle, rest)
    } else {
        (Source::Entity, element)
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(signature: &str) -> Result<Vec<(Source, Op, String)>, Error> {
        let mut out = Vec::new();
        parse(signature, |source, op, ident| {
            out.push((source, op, ident.to_owned()));
            Ok(())
        })?;
        Ok(out)
    }

    #[test]
    fn plain_columns_default_to_entity_and() {
        // When
        let columns = lex("Position, Speed").unwrap();

        // Then
        assert_eq!(
            columns,
            vec![
                (Source::Entity, Op::And, "Position".into()),
                (Source::Entity, Op::And, "Speed".into()),
            ]
        );
    }

    #[test]
    fn sources_and_opers_combine() {
        // When
        let columns = lex("!Frozen, ?Speed, SYSTEM.Counter, CONTAINER.Tag, ID.Marker").unwrap();

        // Then
        assert_eq!(
            columns,
            vec![
                (Source::Entity, Op::Not, "Frozen".into()),
                (Source::Entity, Op::Optional, "Speed".into()),
                (Source::System, Op::And, "Counter".into()),
                (Source::Component, Op::And, "Tag".into()),
                (Source::Handle, Op::And, "Marker".into()),
            ]
        );
    }

    #[test]
    fn or_groups_emit_one_element_each() {
        // When
        let columns = lex("Position, Walking|Running").unwrap();

        // Then
        assert_eq!(
            columns,
            vec![
                (Source::Entity, Op::And, "Position".into()),
                (Source::Entity, Op::Or, "Walking".into()),
                (Source::Entity, Op::Or, "Running".into()),
            ]
        );
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        assert!(lex("").is_err());
        assert!(lex("  ").is_err());
        assert!(lex("Position,").is_err());
        assert!(lex("Position,,Speed").is_err());
        assert!(lex("9Lives").is_err());
        assert!(lex("!Walking|Running").is_err());
        assert!(lex("?Walking|Running").is_err());
        assert!(lex("SYSTEM.").is_err());
    }

    #[test]
    fn callback_errors_propagate() {
        // Given - a callback that rejects one identifier
        let result = parse("Position, Speed", |_, _, ident| {
            if ident == "Speed" {
                Err(Error::NotRegistered(ident.to_owned()))
            } else {
                Ok(())
            }
        });

        // Then
        assert_eq!(result, Err(Error::NotRegistered("Speed".into())));
    }

    #[test]
    fn columns_count_counts_elements() {
        assert_eq!(columns_count("Position, Speed"), 2);
        assert_eq!(columns_count("Position, Walking|Running"), 3);
        assert_eq!(columns_count(""), 0);
    }
}
