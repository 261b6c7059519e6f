//! Entity model
//!
//! An [`Entity`] is one typed record of the BI platform. Entities point at
//! each other by stable UUID through kind-specific payload fields; this
//! module is the single place that knows which field holds which reference.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Environment-local numeric address of an entity.
pub type Handle = u64;

/// Value persisted in place of a secret field.
pub const SECRET_MASK: &str = "XXXXXXXXXX";

/// The four asset kinds, declared in apply precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Connection,
    Table,
    Visualization,
    Dashboard,
}

/// Where a kind keeps its outgoing reference.
#[derive(Debug, Clone, Copy)]
struct ReferenceRule {
    field: &'static str,
    handle_field: &'static str,
    target: EntityKind,
    many: bool,
}

impl EntityKind {
    /// All kinds in precedence order
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Connection,
        EntityKind::Table,
        EntityKind::Visualization,
        EntityKind::Dashboard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Table => "table",
            Self::Visualization => "visualization",
            Self::Dashboard => "dashboard",
        }
    }

    /// Directory holding this kind inside a bundle
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Connection => "connections",
            Self::Table => "tables",
            Self::Visualization => "visualizations",
            Self::Dashboard => "dashboards",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.dir_name() == name)
    }

    /// Tie-break rank when several entities are ready to apply
    pub fn precedence(&self) -> u8 {
        *self as u8
    }

    /// Payload fields that must never be persisted in plaintext
    pub fn secret_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Connection => &["password"],
            _ => &[],
        }
    }

    /// Payload fields that must be present regardless of references
    fn required_string_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Connection => &["uri"],
            _ => &[],
        }
    }

    fn reference_rule(&self) -> Option<ReferenceRule> {
        match self {
            Self::Connection => None,
            Self::Table => Some(ReferenceRule {
                field: "connection_uuid",
                handle_field: "connection_id",
                target: Self::Connection,
                many: false,
            }),
            Self::Visualization => Some(ReferenceRule {
                field: "source_table_uuid",
                handle_field: "source_table_id",
                target: Self::Table,
                many: false,
            }),
            Self::Dashboard => Some(ReferenceRule {
                field: "visualization_uuids",
                handle_field: "visualization_ids",
                target: Self::Visualization,
                many: true,
            }),
        }
    }

    /// Kinds reachable from this kind by following references, nearest first
    pub fn dependency_kinds(&self) -> Vec<EntityKind> {
        let mut kinds = Vec::new();
        let mut current = *self;
        while let Some(rule) = current.reference_rule() {
            kinds.push(rule.target);
            current = rule.target;
        }
        kinds
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        // Accept the platform's own vocabulary too
        match lower.as_str() {
            "connection" | "connections" | "database" | "databases" => Ok(Self::Connection),
            "table" | "tables" | "dataset" | "datasets" => Ok(Self::Table),
            "visualization" | "visualizations" | "chart" | "charts" => Ok(Self::Visualization),
            "dashboard" | "dashboards" => Ok(Self::Dashboard),
            _ => Err(format!("unknown entity kind: {s}")),
        }
    }
}

/// A typed pointer to another entity by stable identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub kind: EntityKind,
    pub uuid: Uuid,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.uuid)
    }
}

/// One record of the BI platform.
///
/// `uuid` is portable across environments; `handle` is whatever the
/// environment the entity was read from uses to address it, and is never
/// written into a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub uuid: Uuid,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
    pub name: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Entity {
    /// Create an entity with a fresh stable identifier
    pub fn new(kind: EntityKind, name: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self::with_uuid(Uuid::new_v4(), kind, name, payload)
    }

    pub fn with_uuid(
        uuid: Uuid,
        kind: EntityKind,
        name: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            uuid,
            kind,
            handle: None,
            name: name.into(),
            payload,
        }
    }

    /// See [`references_of`]
    pub fn references(&self) -> Result<BTreeSet<Reference>> {
        references_of(self)
    }

    /// Replace every secret field that is present with [`SECRET_MASK`]
    pub fn mask_secrets(&mut self) {
        for field in self.kind.secret_fields() {
            if let Some(value) = self.payload.get_mut(*field)
                && !value.is_null()
            {
                *value = Value::String(SECRET_MASK.to_string());
            }
        }
    }

    /// Secret fields still holding the mask
    pub fn masked_secret_fields(&self) -> Vec<&'static str> {
        self.kind
            .secret_fields()
            .iter()
            .copied()
            .filter(|f| self.payload.get(*f).and_then(Value::as_str) == Some(SECRET_MASK))
            .collect()
    }

    pub fn reference(&self) -> Reference {
        Reference {
            kind: self.kind,
            uuid: self.uuid,
        }
    }
}

/// Enumerate the references held in an entity's payload.
///
/// Fails with `MalformedPayload` when a kind-specific required field is
/// missing, has the wrong shape, or does not hold a UUID.
pub fn references_of(entity: &Entity) -> Result<BTreeSet<Reference>> {
    for field in entity.kind.required_string_fields() {
        match entity.payload.get(*field) {
            Some(Value::String(_)) => {}
            Some(_) => {
                return Err(Error::malformed(
                    entity.kind,
                    entity.uuid,
                    format!("field `{field}` must be a string"),
                ));
            }
            None => {
                return Err(Error::malformed(
                    entity.kind,
                    entity.uuid,
                    format!("missing required field `{field}`"),
                ));
            }
        }
    }

    let Some(rule) = entity.kind.reference_rule() else {
        return Ok(BTreeSet::new());
    };

    let value = entity.payload.get(rule.field).ok_or_else(|| {
        Error::malformed(
            entity.kind,
            entity.uuid,
            format!("missing required field `{}`", rule.field),
        )
    })?;

    let raw: Vec<&Value> = if rule.many {
        value
            .as_array()
            .ok_or_else(|| {
                Error::malformed(
                    entity.kind,
                    entity.uuid,
                    format!("field `{}` must be a list", rule.field),
                )
            })?
            .iter()
            .collect()
    } else {
        vec![value]
    };

    raw.into_iter()
        .map(|v| {
            let text = v.as_str().ok_or_else(|| {
                Error::malformed(
                    entity.kind,
                    entity.uuid,
                    format!("field `{}` must hold UUID strings", rule.field),
                )
            })?;
            let uuid = Uuid::parse_str(text).map_err(|e| {
                Error::malformed(
                    entity.kind,
                    entity.uuid,
                    format!("field `{}` holds an invalid UUID `{text}`: {e}", rule.field),
                )
            })?;
            Ok(Reference {
                kind: rule.target,
                uuid,
            })
        })
        .collect()
}

/// Write target-local handles next to the UUID reference fields.
///
/// Returns the first reference that has no handle in `handles`.
pub fn rewrite_references(
    entity: &mut Entity,
    handles: &HashMap<Uuid, Handle>,
) -> std::result::Result<(), Reference> {
    let Some(rule) = entity.kind.reference_rule() else {
        return Ok(());
    };

    let uuids: Vec<Uuid> = match entity.payload.get(rule.field) {
        Some(Value::String(s)) => Uuid::parse_str(s).into_iter().collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect(),
        _ => Vec::new(),
    };

    let mut resolved = Vec::with_capacity(uuids.len());
    for uuid in uuids {
        let handle = handles.get(&uuid).copied().ok_or(Reference {
            kind: rule.target,
            uuid,
        })?;
        resolved.push(Value::from(handle));
    }

    let value = if rule.many {
        Value::Array(resolved)
    } else {
        resolved.into_iter().next().unwrap_or(Value::Null)
    };
    entity.payload.insert(rule.handle_field.to_string(), value);
    Ok(())
}
