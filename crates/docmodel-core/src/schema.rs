//! Schema metadata: property kinds, property definitions, and indexes.
//!
//! A model's schema is a declarative map of property name to
//! [`PropertyDef`]. Relation resolution synthesizes additional foreign-key
//! properties into these maps at registration time; synthesized columns are
//! always nullable strings since they only ever hold an opaque id.

use crate::error::{Error, RegistrationErrorKind, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Uppercase the first character (`foo` -> `Foo`).
#[must_use]
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Lowercase the first character (`Foo` -> `foo`).
#[must_use]
pub fn lcfirst(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// The primitive type of a schema property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    /// UTF-8 text.
    String,
    /// Double-precision number.
    Number,
    /// Boolean.
    Bool,
    /// A timestamp, stored as an ISO-8601 string or an epoch number.
    Date,
    /// A geographic point, stored as `{type: "Point", coordinates: [x, y]}`.
    Point,
    /// An arbitrary JSON object.
    Object,
    /// A homogeneous array of the inner kind.
    Array(Box<PropertyKind>),
}

impl PropertyKind {
    /// Human-readable kind name for error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Point => "point",
            Self::Object => "object",
            Self::Array(_) => "array",
        }
    }

    /// Coerce a single scalar value to this kind.
    fn coerce_scalar(&self, property: &str, value: &Value) -> Result<Value> {
        match self {
            Self::String => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(Error::coercion(property, "string", other)),
            },
            Self::Number => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) => s
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| Error::coercion(property, "number", value)),
                other => Err(Error::coercion(property, "number", other)),
            },
            Self::Bool => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) if s == "true" => Ok(Value::Bool(true)),
                Value::String(s) if s == "false" => Ok(Value::Bool(false)),
                other => Err(Error::coercion(property, "bool", other)),
            },
            Self::Date => match value {
                // ISO strings and epoch numbers both pass through; the
                // driver owns any richer time representation.
                Value::String(_) | Value::Number(_) => Ok(value.clone()),
                other => Err(Error::coercion(property, "date", other)),
            },
            Self::Point => coerce_point(property, value),
            Self::Object => match value {
                Value::Object(_) => Ok(value.clone()),
                other => Err(Error::coercion(property, "object", other)),
            },
            Self::Array(_) => Err(Error::coercion(property, "array", value)),
        }
    }
}

/// Normalize a point payload into `{type: "Point", coordinates: [x, y]}`.
///
/// Accepts a bare `[x, y]` pair or a GeoJSON-style object (with or without
/// the wire-protocol geometry tag).
pub fn coerce_point(property: &str, value: &Value) -> Result<Value> {
    let coords = match value {
        Value::Array(items) if items.len() == 2 => Some(items.clone()),
        Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("Point") => {
            map.get("coordinates").and_then(Value::as_array).cloned()
        }
        _ => None,
    };
    match coords {
        Some(pair) if pair.len() == 2 && pair.iter().all(Value::is_number) => Ok(json!({
            "type": "Point",
            "coordinates": pair,
        })),
        _ => Err(Error::coercion(property, "point", value)),
    }
}

/// One entry in a model's schema map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Property name.
    pub name: String,
    /// Primitive kind.
    pub kind: PropertyKind,
    /// Whether null/absent is legal.
    pub allow_null: bool,
    /// Default applied when the value is absent on assign.
    pub default: Option<Value>,
    /// Whether the property is backed by a uniqueness side table.
    pub unique: bool,
    /// Whether the property is omitted from public serialization.
    pub private: bool,
    /// True for foreign-key columns synthesized by relation resolution.
    pub synthesized: bool,
}

impl PropertyDef {
    /// Create a definition with the given name and kind.
    ///
    /// This is the "bare type shorthand" normalization point: a caller with
    /// only a kind in hand gets a full definition with defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            allow_null: false,
            default: None,
            unique: false,
            private: false,
            synthesized: false,
        }
    }

    /// Create a synthesized foreign-key column.
    ///
    /// Relation-synthesized columns are deliberately weakly typed: nullable
    /// strings holding an opaque id.
    #[must_use]
    pub fn foreign_key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::String,
            allow_null: true,
            default: None,
            unique: false,
            private: false,
            synthesized: true,
        }
    }

    /// Permit null/absent values.
    #[must_use]
    pub fn allow_null(mut self, value: bool) -> Self {
        self.allow_null = value;
        self
    }

    /// Set the default value applied on assign when absent.
    #[must_use]
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Mark the property as unique.
    #[must_use]
    pub fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    /// Mark the property as private (excluded from serialization).
    #[must_use]
    pub fn private(mut self, value: bool) -> Self {
        self.private = value;
        self
    }

    /// Coerce a raw value (possibly absent) for this property.
    ///
    /// Rules, in order: an absent `Date` defaults to null; an absent value
    /// takes the declared default; nullable absent/null short-circuits to
    /// null; array kinds coerce element-wise; otherwise the scalar coercer
    /// runs.
    pub fn coerce(&self, raw: Option<&Value>) -> Result<Value> {
        match raw {
            None | Some(Value::Null) => {
                if matches!(self.kind, PropertyKind::Date) && self.default.is_none() {
                    return Ok(Value::Null);
                }
                if let Some(default) = &self.default {
                    return Ok(default.clone());
                }
                if self.allow_null {
                    return Ok(Value::Null);
                }
                Err(Error::coercion(&self.name, self.kind.name(), &Value::Null))
            }
            Some(value) => match &self.kind {
                PropertyKind::Array(inner) => match value {
                    Value::Array(items) => {
                        let coerced = items
                            .iter()
                            .map(|item| inner.coerce_scalar(&self.name, item))
                            .collect::<Result<Vec<_>>>()?;
                        Ok(Value::Array(coerced))
                    }
                    other => Err(Error::coercion(&self.name, "array", other)),
                },
                kind => kind.coerce_scalar(&self.name, value),
            },
        }
    }
}

/// A secondary index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Explicit index name. Required for nested or compound indexes.
    pub name: Option<String>,
    /// Indexed property paths (dotted paths allowed for nested values).
    pub properties: Vec<String>,
    /// Multi-index flag (index each element of an array value).
    pub multi: bool,
    /// Geospatial index flag.
    pub geo: bool,
}

impl IndexDef {
    /// Single-property index; the name defaults to the property.
    #[must_use]
    pub fn on(property: impl Into<String>) -> Self {
        Self {
            name: None,
            properties: vec![property.into()],
            multi: false,
            geo: false,
        }
    }

    /// Compound index over several properties. Requires a name.
    #[must_use]
    pub fn compound(name: impl Into<String>, properties: &[&str]) -> Self {
        Self {
            name: Some(name.into()),
            properties: properties.iter().map(|&p| p.to_string()).collect(),
            multi: false,
            geo: false,
        }
    }

    /// Set the explicit name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the multi-index flag.
    #[must_use]
    pub fn multi(mut self, value: bool) -> Self {
        self.multi = value;
        self
    }

    /// Set the geospatial flag.
    #[must_use]
    pub fn geo(mut self, value: bool) -> Self {
        self.geo = value;
        self
    }

    /// Resolve the effective index name.
    ///
    /// A single non-nested property names itself; anything else must carry
    /// an explicit name.
    pub fn effective_name(&self, table: &str) -> Result<String> {
        if let Some(name) = &self.name {
            return Ok(name.clone());
        }
        if self.properties.len() == 1 && !self.properties[0].contains('.') {
            return Ok(self.properties[0].clone());
        }
        let reason = if self.properties.len() == 1 {
            format!(
                "index name missing for nested property {} on {table}",
                self.properties[0]
            )
        } else {
            format!(
                "index name missing for compound index on properties {:?} on {table}",
                self.properties
            )
        };
        Err(Error::registration(table, RegistrationErrorKind::UnnamedIndex, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capitalize_and_lcfirst() {
        assert_eq!(capitalize("weapon"), "Weapon");
        assert_eq!(lcfirst("Character"), "character");
        assert_eq!(capitalize(""), "");
        assert_eq!(lcfirst(""), "");
    }

    #[test]
    fn absent_date_defaults_to_null() {
        let def = PropertyDef::new("deleted", PropertyKind::Date);
        assert_eq!(def.coerce(None).unwrap(), Value::Null);
    }

    #[test]
    fn nullable_absent_short_circuits_to_null() {
        let def = PropertyDef::new("nickname", PropertyKind::String).allow_null(true);
        assert_eq!(def.coerce(None).unwrap(), Value::Null);
        assert_eq!(def.coerce(Some(&Value::Null)).unwrap(), Value::Null);
    }

    #[test]
    fn absent_takes_declared_default() {
        let def = PropertyDef::new("age", PropertyKind::Number).default_value(json!(0));
        assert_eq!(def.coerce(None).unwrap(), json!(0));
    }

    #[test]
    fn required_absent_is_an_error() {
        let def = PropertyDef::new("name", PropertyKind::String);
        assert!(def.coerce(None).is_err());
    }

    #[test]
    fn array_kind_coerces_element_wise() {
        let def = PropertyDef::new(
            "scores",
            PropertyKind::Array(Box::new(PropertyKind::Number)),
        );
        let coerced = def.coerce(Some(&json!(["1.5", 2, 3]))).unwrap();
        assert_eq!(coerced, json!([1.5, 2, 3]));
    }

    #[test]
    fn number_coercion_parses_strings() {
        let def = PropertyDef::new("age", PropertyKind::Number);
        assert_eq!(def.coerce(Some(&json!("42"))).unwrap(), json!(42.0));
        assert!(def.coerce(Some(&json!("not a number"))).is_err());
    }

    #[test]
    fn point_accepts_pair_and_geojson() {
        let def = PropertyDef::new("location", PropertyKind::Point);
        let from_pair = def.coerce(Some(&json!([1.0, 2.0]))).unwrap();
        let from_geojson = def
            .coerce(Some(&json!({"type": "Point", "coordinates": [1.0, 2.0]})))
            .unwrap();
        assert_eq!(from_pair, from_geojson);
        assert!(def.coerce(Some(&json!([1.0]))).is_err());
    }

    #[test]
    fn single_property_index_names_itself() {
        let index = IndexDef::on("assetId");
        assert_eq!(index.effective_name("Quote").unwrap(), "assetId");
    }

    #[test]
    fn nested_property_index_requires_a_name() {
        let index = IndexDef::on("profile.email");
        assert!(index.effective_name("User").is_err());
        assert_eq!(
            index.named("profileEmail").effective_name("User").unwrap(),
            "profileEmail"
        );
    }

    #[test]
    fn compound_index_requires_a_name() {
        let unnamed = IndexDef {
            name: None,
            properties: vec!["a".to_string(), "b".to_string()],
            multi: false,
            geo: false,
        };
        assert!(unnamed.effective_name("T").is_err());
        assert_eq!(
            IndexDef::compound("ab", &["a", "b"]).effective_name("T").unwrap(),
            "ab"
        );
    }

    #[test]
    fn foreign_key_columns_are_nullable_strings() {
        let def = PropertyDef::foreign_key("assetId");
        assert!(def.allow_null);
        assert!(def.synthesized);
        assert_eq!(def.kind, PropertyKind::String);
    }
}
