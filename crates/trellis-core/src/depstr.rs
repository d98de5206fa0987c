//! The dependency-string language.
//!
//! Template input values may embed `${{ identifier.outputs.field }}` and
//! `${{ store.key }}` placeholders. Parsing splits a value into a `head`
//! plus an ordered run of [`Dependent`] slots, each carrying the literal
//! `tail` that follows it. Rendering concatenates head and filled slots
//! back into a concrete string.
//!
//! The parser is a hand-rolled scanner rather than a regex so that errors
//! can point at the byte offset of the offending placeholder.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved pseudo-identifier referring to the run-scoped store.
pub const STORE_IDENTIFIER: &str = "store";

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unterminated placeholder at offset {offset}")]
    Unterminated { offset: usize },
    #[error("empty placeholder at offset {offset}")]
    Empty { offset: usize },
    #[error("invalid placeholder '{content}' at offset {offset}: expected identifier.outputs.field or store.key")]
    Malformed { content: String, offset: usize },
    #[error("empty identifier in placeholder '{content}' at offset {offset}")]
    EmptyIdentifier { content: String, offset: usize },
    #[error("empty field in placeholder '{content}' at offset {offset}")]
    EmptyField { content: String, offset: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependent value is not set for: {identifier}.{field}")]
pub struct UnresolvedError {
    pub identifier: String,
    pub field: String,
}

/// One placeholder slot: which ancestor output (or store key) it refers to,
/// the literal text following it, and the resolved value once filled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependent {
    pub identifier: String,
    pub field: String,
    pub tail: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl Dependent {
    /// Whether this slot refers to the run-scoped store.
    pub fn is_store(&self) -> bool {
        self.identifier == STORE_IDENTIFIER
    }
}

/// A parsed template input value: `head` followed by ordered dependents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentString {
    pub head: String,
    pub dependents: BTreeMap<usize, Dependent>,
}

impl DependentString {
    /// Parse a template input value.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let mut head = String::new();
        let mut dependents = BTreeMap::new();
        let mut rest = input;
        let mut offset = 0usize;
        let mut index = 0usize;

        // Everything before the first opener is the head.
        match rest.find(OPEN) {
            None => {
                return Ok(Self {
                    head: input.to_string(),
                    dependents,
                })
            }
            Some(pos) => {
                head.push_str(&rest[..pos]);
                offset += pos;
                rest = &rest[pos..];
            }
        }

        while let Some(open_at) = rest.find(OPEN) {
            debug_assert_eq!(open_at, 0);
            let placeholder_offset = offset;
            let after_open = &rest[OPEN.len()..];
            let close_at = after_open
                .find(CLOSE)
                .ok_or(ParseError::Unterminated {
                    offset: placeholder_offset,
                })?;
            let content = &after_open[..close_at];
            let (identifier, field) = parse_ref(content, placeholder_offset)?;

            // The tail runs to the next opener (or end of input).
            let after_close = &after_open[close_at + CLOSE.len()..];
            let tail_len = after_close.find(OPEN).unwrap_or(after_close.len());
            let tail = &after_close[..tail_len];

            dependents.insert(
                index,
                Dependent {
                    identifier,
                    field,
                    tail: tail.to_string(),
                    value: None,
                },
            );
            index += 1;

            let consumed = OPEN.len() + close_at + CLOSE.len() + tail_len;
            offset += consumed;
            rest = &rest[consumed..];
        }

        Ok(Self { head, dependents })
    }

    /// Whether the value contains no placeholders at all.
    pub fn is_literal(&self) -> bool {
        self.dependents.is_empty()
    }

    /// Whether every slot has been filled.
    pub fn is_resolved(&self) -> bool {
        self.dependents.values().all(|d| d.value.is_some())
    }

    /// Unique `(identifier, field)` pairs referenced by this value, in
    /// slot order. Used by graph validation.
    pub fn identifier_fields(&self) -> Vec<(String, String)> {
        let mut seen = Vec::new();
        for dependent in self.dependents.values() {
            let pair = (dependent.identifier.clone(), dependent.field.clone());
            if !seen.contains(&pair) {
                seen.push(pair);
            }
        }
        seen
    }

    /// Fill every slot matching `(identifier, field)` with `value`.
    pub fn set_value(&mut self, identifier: &str, field: &str, value: &str) {
        for dependent in self.dependents.values_mut() {
            if dependent.identifier == identifier && dependent.field == field {
                dependent.value = Some(value.to_string());
            }
        }
    }

    /// Concatenate head and filled slots back into a concrete string.
    /// Fails on the first unfilled slot.
    pub fn render(&self) -> Result<String, UnresolvedError> {
        let mut out = self.head.clone();
        for dependent in self.dependents.values() {
            let value = dependent.value.as_ref().ok_or_else(|| UnresolvedError {
                identifier: dependent.identifier.clone(),
                field: dependent.field.clone(),
            })?;
            out.push_str(value);
            out.push_str(&dependent.tail);
        }
        Ok(out)
    }
}

fn parse_ref(content: &str, offset: usize) -> Result<(String, String), ParseError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty { offset });
    }

    let parts: Vec<&str> = trimmed.split('.').map(str::trim).collect();
    match parts.as_slice() {
        [identifier, key] if *identifier == STORE_IDENTIFIER => {
            if key.is_empty() {
                return Err(ParseError::EmptyField {
                    content: content.to_string(),
                    offset,
                });
            }
            Ok((STORE_IDENTIFIER.to_string(), (*key).to_string()))
        }
        [identifier, outputs, field] if *outputs == "outputs" => {
            if identifier.is_empty() {
                return Err(ParseError::EmptyIdentifier {
                    content: content.to_string(),
                    offset,
                });
            }
            if field.is_empty() {
                return Err(ParseError::EmptyField {
                    content: content.to_string(),
                    offset,
                });
            }
            Ok(((*identifier).to_string(), (*field).to_string()))
        }
        _ => Err(ParseError::Malformed {
            content: content.to_string(),
            offset,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_string_has_no_dependents() {
        let parsed = DependentString::parse("plain value").unwrap();
        assert_eq!(parsed.head, "plain value");
        assert!(parsed.is_literal());
        assert_eq!(parsed.render().unwrap(), "plain value");
    }

    #[test]
    fn parses_single_output_placeholder() {
        let parsed = DependentString::parse("hi ${{ a.outputs.msg }}!").unwrap();
        assert_eq!(parsed.head, "hi ");
        assert_eq!(parsed.dependents.len(), 1);
        let dependent = &parsed.dependents[&0];
        assert_eq!(dependent.identifier, "a");
        assert_eq!(dependent.field, "msg");
        assert_eq!(dependent.tail, "!");
        assert_eq!(dependent.value, None);
    }

    #[test]
    fn parses_store_placeholder() {
        let parsed = DependentString::parse("prefix_${{store.config_key}}_suffix").unwrap();
        assert_eq!(parsed.head, "prefix_");
        let dependent = &parsed.dependents[&0];
        assert!(dependent.is_store());
        assert_eq!(dependent.field, "config_key");
        assert_eq!(dependent.tail, "_suffix");
    }

    #[test]
    fn parses_multiple_placeholders_in_order() {
        let parsed =
            DependentString::parse("${{a.outputs.x}}-${{b.outputs.y}}-${{store.k}}").unwrap();
        assert_eq!(parsed.head, "");
        assert_eq!(parsed.dependents.len(), 3);
        assert_eq!(parsed.dependents[&0].identifier, "a");
        assert_eq!(parsed.dependents[&0].tail, "-");
        assert_eq!(parsed.dependents[&1].identifier, "b");
        assert_eq!(parsed.dependents[&2].identifier, "store");
        assert_eq!(parsed.dependents[&2].tail, "");
    }

    #[test]
    fn render_fails_on_unfilled_slot() {
        let parsed = DependentString::parse("x ${{ a.outputs.f }}").unwrap();
        let err = parsed.render().unwrap_err();
        assert_eq!(err.identifier, "a");
        assert_eq!(err.field, "f");
    }

    #[test]
    fn set_value_fills_every_matching_slot() {
        let mut parsed =
            DependentString::parse("${{a.outputs.f}} and ${{a.outputs.f}} again").unwrap();
        assert!(!parsed.is_resolved());
        parsed.set_value("a", "f", "V");
        assert!(parsed.is_resolved());
        assert_eq!(parsed.render().unwrap(), "V and V again");
    }

    #[test]
    fn identifier_fields_deduplicates() {
        let parsed =
            DependentString::parse("${{a.outputs.f}}${{b.outputs.g}}${{a.outputs.f}}").unwrap();
        assert_eq!(
            parsed.identifier_fields(),
            vec![
                ("a".to_string(), "f".to_string()),
                ("b".to_string(), "g".to_string())
            ]
        );
    }

    #[test]
    fn unterminated_placeholder_reports_offset() {
        let err = DependentString::parse("abc${{a.outputs.f").unwrap_err();
        assert_eq!(err, ParseError::Unterminated { offset: 3 });
    }

    #[test]
    fn malformed_placeholder_reports_content_and_offset() {
        let err = DependentString::parse("x${{ a.f }}").unwrap_err();
        match err {
            ParseError::Malformed { content, offset } => {
                assert_eq!(content, " a.f ");
                assert_eq!(offset, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_outputs_keyword_is_malformed() {
        assert!(matches!(
            DependentString::parse("${{a.inputs.f}}").unwrap_err(),
            ParseError::Malformed { .. }
        ));
    }

    #[test]
    fn empty_identifier_and_field_are_rejected() {
        assert!(matches!(
            DependentString::parse("${{ .outputs.f }}").unwrap_err(),
            ParseError::EmptyIdentifier { .. }
        ));
        assert!(matches!(
            DependentString::parse("${{ a.outputs. }}").unwrap_err(),
            ParseError::EmptyField { .. }
        ));
        assert!(matches!(
            DependentString::parse("${{  }}").unwrap_err(),
            ParseError::Empty { offset: 0 }
        ));
    }

    #[test]
    fn rendered_string_reparses_to_equivalent_structure() {
        let mut parsed = DependentString::parse("a ${{ n.outputs.f }} b ${{ store.k }} c").unwrap();
        parsed.set_value("n", "f", "1");
        parsed.set_value(STORE_IDENTIFIER, "k", "2");
        let rendered = parsed.render().unwrap();
        assert_eq!(rendered, "a 1 b 2 c");

        // A fully-filled render contains no placeholders; re-parsing yields
        // a literal with the same concrete value.
        let reparsed = DependentString::parse(&rendered).unwrap();
        assert!(reparsed.is_literal());
        assert_eq!(reparsed.render().unwrap(), rendered);
    }
}
