//! Schema registry types shared between storage and the core (`§4.2`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// An entity type name, e.g. `"invoice"` or `"person"`. Not a closed enum —
/// the registry is the catalog, not the compiler.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::invalid(format!("invalid entity type: {name:?}")));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotone, additive-only version of an entity type's field set.
///
/// `schema_version` orders as `(major, minor)`; `update_schema_incremental`
/// always bumps `minor` and never touches `major` (`§4.7`).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const INITIAL: SchemaVersion = SchemaVersion { major: 1, minor: 0 };

    pub fn next_minor(&self) -> SchemaVersion {
        SchemaVersion {
            major: self.major,
            minor: self.minor + 1,
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl fmt::Debug for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for SchemaVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| Error::invalid(format!("malformed schema version: {s:?}")))?;
        let major = major
            .parse()
            .map_err(|_| Error::invalid(format!("malformed schema version: {s:?}")))?;
        let minor = minor
            .parse()
            .map_err(|_| Error::invalid(format!("malformed schema version: {s:?}")))?;
        Ok(SchemaVersion { major, minor })
    }
}

/// Inferred or declared primitive type of a field's values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    DateTime,
    Uuid,
    Email,
    /// A set of scalar values; only valid with `MergePolicy::Union` or
    /// `MergePolicy::ConcatDistinct`.
    Set,
}

/// Per-field merge policy used by the reducer (`§4.5`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Pick the field from the first observation in the total order that
    /// carries it.
    LastWriterWins,
    Max,
    Min,
    /// Set semantics: dedup, output in ascending lexicographic order.
    Union,
    /// Dedup, but ordered by first appearance in the total order.
    ConcatDistinct,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub value_type: FieldType,
    pub required: bool,
    /// Optional regex the field's string representation must match.
    pub validation: Option<String>,
    pub merge_policy: MergePolicy,
    /// Decimal places a `FieldType::Number` value is normalized to before
    /// the reducer writes it into a snapshot (`§4.5`). Ignored for other
    /// field types.
    #[serde(default)]
    pub precision: Option<u32>,
}

/// How a schema assigns entity identity from candidate fields (`§4.6`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityResolutionKey {
    /// Concatenation of the named fields' raw values is the lookup key.
    Natural { fields: Vec<String> },
    /// SHA-256 over the named fields' canonicalized values.
    ContentHash { fields: Vec<String> },
    /// No resolution: every observation mints its own entity.
    Identity,
}

/// How `canonical_name` is derived from a snapshot's reduced fields
/// (`§4.5`, design note (b): deliberately the single extension point).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CanonicalizationRule {
    pub source_field: String,
    #[serde(default)]
    pub lowercase: bool,
    #[serde(default)]
    pub strip_diacritics: bool,
    #[serde(default)]
    pub collapse_whitespace: bool,
}

impl CanonicalizationRule {
    pub fn apply(&self, raw: &str) -> String {
        let mut value = raw.to_string();
        if self.strip_diacritics {
            value = unicode_normalization::UnicodeNormalization::nfd(value.as_str())
                .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
                .collect();
        }
        if self.collapse_whitespace {
            value = value.split_whitespace().collect::<Vec<_>>().join(" ");
        }
        if self.lowercase {
            value = value.to_lowercase();
        }
        value
    }
}

/// Numeric precision used when normalizing a field to its canonical decimal
/// string representation (`§4.5`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub entity_type: EntityType,
    pub schema_version: SchemaVersion,
    pub fields: Vec<FieldDefinition>,
    pub canonicalization_rule: Option<CanonicalizationRule>,
    pub entity_resolution_key: EntityResolutionKey,
    /// Extraction hints surfaced to callers; the core does not interpret
    /// these beyond passing them through `get_schema`.
    #[serde(default)]
    pub extraction_rules: BTreeMap<String, String>,
}

impl SchemaDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Schema evolution invariant check (`§8`): `fields(S_v) ⊆
    /// fields(S_{v+1})` and every required field in the successor is also
    /// required in `self`.
    pub fn is_additive_successor(&self, next: &SchemaDefinition) -> bool {
        if next.entity_type != self.entity_type {
            return false;
        }
        if next.schema_version <= self.schema_version {
            return false;
        }
        let self_names: std::collections::BTreeSet<&str> =
            self.fields.iter().map(|f| f.name.as_str()).collect();
        if !self_names
            .iter()
            .all(|name| next.fields.iter().any(|f| f.name == *name))
        {
            return false;
        }
        for f in &next.fields {
            if f.required && !self.fields.iter().any(|sf| sf.name == f.name && sf.required) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_schema() -> SchemaDefinition {
        SchemaDefinition {
            entity_type: EntityType::new("invoice").unwrap(),
            schema_version: SchemaVersion::INITIAL,
            fields: vec![FieldDefinition {
                name: "status".into(),
                value_type: FieldType::String,
                required: true,
                validation: None,
                merge_policy: MergePolicy::LastWriterWins,
                precision: None,
            }],
            canonicalization_rule: None,
            entity_resolution_key: EntityResolutionKey::Natural {
                fields: vec!["external_id".into()],
            },
            extraction_rules: Default::default(),
        }
    }

    #[test]
    fn additive_successor_accepts_superset() {
        let base = base_schema();
        let mut next = base.clone();
        next.schema_version = base.schema_version.next_minor();
        next.fields.push(FieldDefinition {
            name: "purchase_order".into(),
            value_type: FieldType::String,
            required: false,
            validation: None,
            merge_policy: MergePolicy::LastWriterWins,
            precision: None,
        });
        assert!(base.is_additive_successor(&next));
    }

    #[test]
    fn additive_successor_rejects_dropped_field() {
        let base = base_schema();
        let mut next = base.clone();
        next.schema_version = base.schema_version.next_minor();
        next.fields.clear();
        assert!(!base.is_additive_successor(&next));
    }

    #[test]
    fn additive_successor_rejects_new_required_field() {
        let base = base_schema();
        let mut next = base.clone();
        next.schema_version = base.schema_version.next_minor();
        next.fields.push(FieldDefinition {
            name: "purchase_order".into(),
            value_type: FieldType::String,
            required: true,
            validation: None,
            merge_policy: MergePolicy::LastWriterWins,
            precision: None,
        });
        assert!(!base.is_additive_successor(&next));
    }

    #[test]
    fn canonicalization_collapses_and_lowercases() {
        let rule = CanonicalizationRule {
            source_field: "name".into(),
            lowercase: true,
            strip_diacritics: true,
            collapse_whitespace: true,
        };
        assert_eq!(rule.apply("  José   García "), "jose garcia");
    }
}
