use crate::value::{DataType, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised while validating an aspect definition.
///
/// Definition errors are fatal for the load that produced them; the engine
/// never registers a partially-valid definition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("aspect definition requires a non-empty name")]
    EmptyName,
    #[error("{kind} aspect '{name}' requires non-empty {what}")]
    MissingSupplemental {
        name: String,
        kind: AspectKind,
        what: &'static str,
    },
    #[error("line collection '{0}' requires at least one property definition")]
    EmptySchema(String),
    #[error("line schema property '{0}' must be direct, formula or reference")]
    InvalidSchemaProperty(String),
}

/// The kind of aspect a definition produces.
///
/// LineProperty and LinePropertyValue aspects are never defined directly;
/// the engine derives them from a line collection's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectKind {
    Direct,
    Formula,
    Reference,
    LineCollection,
    LineFilter,
}

impl std::fmt::Display for AspectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AspectKind::Direct => "direct",
            AspectKind::Formula => "formula",
            AspectKind::Reference => "reference",
            AspectKind::LineCollection => "line-collection",
            AspectKind::LineFilter => "line-filter",
        };
        f.write_str(name)
    }
}

/// Kind-specific payload of an aspect definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Supplemental {
    /// Direct aspects carry no payload.
    None,
    /// Formula or reference text.
    Text(String),
    /// Ordered property schema of a line collection.
    Schema(LineSchema),
    /// Backing collection and predicate of a line filter.
    Filter(LineFilterDef),
}

/// Ordered set of property definitions for a line collection.
///
/// Property order is preserved; re-adding a name replaces the earlier entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineSchema {
    properties: Vec<AspectDef>,
}

impl LineSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a property definition.
    pub fn add_property(&mut self, def: AspectDef) {
        if let Some(existing) = self.properties.iter_mut().find(|p| p.name == def.name) {
            *existing = def;
            return;
        }
        self.properties.push(def);
    }

    pub fn properties(&self) -> &[AspectDef] {
        &self.properties
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn property(&self, name: &str) -> Option<&AspectDef> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Backing collection plus predicate formula of a line filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineFilterDef {
    pub collection: String,
    pub predicate: String,
}

/// One aspect definition, typically derived from markup by the (external)
/// binding layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectDef {
    pub name: String,
    pub kind: AspectKind,
    pub supplemental: Supplemental,
    pub default_value: Option<Value>,
    pub data_type: DataType,
}

impl AspectDef {
    fn new(name: impl Into<String>, kind: AspectKind, supplemental: Supplemental) -> Self {
        Self {
            name: name.into(),
            kind,
            supplemental,
            default_value: None,
            data_type: DataType::Unset,
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(name, AspectKind::Direct, Supplemental::None)
    }

    pub fn formula(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, AspectKind::Formula, Supplemental::Text(text.into()))
    }

    pub fn reference(name: impl Into<String>, target_slot: impl Into<String>) -> Self {
        Self::new(
            name,
            AspectKind::Reference,
            Supplemental::Text(target_slot.into()),
        )
    }

    pub fn collection(name: impl Into<String>, schema: LineSchema) -> Self {
        Self::new(name, AspectKind::LineCollection, Supplemental::Schema(schema))
    }

    pub fn filter(
        name: impl Into<String>,
        collection: impl Into<String>,
        predicate: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            AspectKind::LineFilter,
            Supplemental::Filter(LineFilterDef {
                collection: collection.into(),
                predicate: predicate.into(),
            }),
        )
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// Effective data type: an unset type with a numeric-looking default is
    /// treated as numeric, mirroring how sheet markup omits types.
    pub fn effective_data_type(&self) -> DataType {
        if self.data_type == DataType::Unset {
            if let Some(default) = &self.default_value {
                if default.as_number().is_some() {
                    return DataType::Numeric;
                }
            }
        }
        self.data_type
    }

    /// Validate that the definition's payload matches its kind.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        let missing = |what| DefinitionError::MissingSupplemental {
            name: self.name.clone(),
            kind: self.kind,
            what,
        };
        match (&self.kind, &self.supplemental) {
            (AspectKind::Direct, Supplemental::None) => Ok(()),
            (AspectKind::Formula, Supplemental::Text(text))
            | (AspectKind::Reference, Supplemental::Text(text)) => {
                if text.trim().is_empty() {
                    Err(missing("formula text"))
                } else {
                    Ok(())
                }
            }
            (AspectKind::Formula, _) | (AspectKind::Reference, _) => Err(missing("formula text")),
            (AspectKind::LineCollection, Supplemental::Schema(schema)) => {
                if schema.is_empty() {
                    return Err(DefinitionError::EmptySchema(self.name.clone()));
                }
                for prop in schema.properties() {
                    match prop.kind {
                        AspectKind::Direct | AspectKind::Formula | AspectKind::Reference => {
                            prop.validate()?;
                        }
                        _ => {
                            return Err(DefinitionError::InvalidSchemaProperty(prop.name.clone()))
                        }
                    }
                }
                Ok(())
            }
            (AspectKind::LineCollection, _) => Err(missing("property schema")),
            (AspectKind::LineFilter, Supplemental::Filter(filter)) => {
                if filter.collection.trim().is_empty() || filter.predicate.trim().is_empty() {
                    Err(missing("collection name and predicate"))
                } else {
                    Ok(())
                }
            }
            (AspectKind::LineFilter, _) => Err(missing("collection name and predicate")),
            (AspectKind::Direct, _) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formula_without_text_is_rejected() {
        let def = AspectDef::formula("total", "  ");
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::MissingSupplemental { .. })
        ));
    }

    #[test]
    fn collection_requires_properties() {
        let def = AspectDef::collection("items", LineSchema::new());
        assert_eq!(def.validate(), Err(DefinitionError::EmptySchema("items".into())));
    }

    #[test]
    fn numeric_default_infers_numeric_type() {
        let def = AspectDef::direct("str").with_default(12.0);
        assert_eq!(def.effective_data_type(), DataType::Numeric);
    }

    #[test]
    fn schema_replaces_duplicate_property_names() {
        let mut schema = LineSchema::new();
        schema.add_property(AspectDef::direct("qty").with_default(1.0));
        schema.add_property(AspectDef::direct("qty").with_default(2.0));
        assert_eq!(schema.properties().len(), 1);
        assert_eq!(schema.properties()[0].default_value, Some(Value::Number(2.0)));
    }
}
