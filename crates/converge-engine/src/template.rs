//! Declarative templates and their name-level dependency graphs.
//!
//! A template maps resource names to definitions. Resource `a` depends on
//! resource `b` when `a` lists `b` in `depends_on`, or when `a`'s properties
//! contain `{"get_resource": "b"}` or `{"get_attr": ["b", ...]}` at any depth.
//!
//! Template parsing and validation beyond those references is left to the
//! caller; the engine only needs the dependency order and the resource types.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use converge_core::TemplateId;

use crate::dag::Dag;
use crate::error::{Error, Result};

/// Intrinsic function naming a resource directly.
const GET_RESOURCE: &str = "get_resource";
/// Intrinsic function reading an attribute of a resource.
const GET_ATTR: &str = "get_attr";

/// One resource's definition inside a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Plugin type name, resolved through the resource registry.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Plugin-specific properties; may contain intrinsic references.
    #[serde(default)]
    pub properties: Value,
    /// Explicit ordering dependencies.
    #[serde(default, deserialize_with = "one_or_many")]
    pub depends_on: Vec<String>,
}

impl ResourceDefinition {
    /// Creates a definition with no properties or explicit dependencies.
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            properties: Value::Null,
            depends_on: Vec::new(),
        }
    }

    /// Sets the properties document.
    #[must_use]
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Every resource name this definition refers to, explicit or intrinsic.
    #[must_use]
    pub fn references(&self) -> BTreeSet<String> {
        let mut refs: BTreeSet<String> = self.depends_on.iter().cloned().collect();
        collect_references(&self.properties, &mut refs);
        refs
    }
}

fn collect_references(value: &Value, refs: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(name)) = map.get(GET_RESOURCE) {
                    refs.insert(name.clone());
                    return;
                }
                if let Some(Value::Array(args)) = map.get(GET_ATTR) {
                    if let Some(Value::String(name)) = args.first() {
                        refs.insert(name.clone());
                    }
                    for arg in args.iter().skip(1) {
                        collect_references(arg, refs);
                    }
                    return;
                }
            }
            for nested in map.values() {
                collect_references(nested, refs);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, refs);
            }
        }
        _ => {}
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(name)) => vec![name],
        Some(OneOrMany::Many(names)) => names,
        None => Vec::new(),
    })
}

/// A stored template version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Identity of this version.
    pub id: TemplateId,
    /// Resource definitions keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceDefinition>,
}

impl Default for Template {
    fn default() -> Self {
        Self::empty()
    }
}

impl Template {
    /// Creates a template version from its resources.
    #[must_use]
    pub fn new(resources: BTreeMap<String, ResourceDefinition>) -> Self {
        Self {
            id: TemplateId::generate(),
            resources,
        }
    }

    /// Creates a template with no resources (used for delete and failed-create rollback).
    #[must_use]
    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    /// Adds a resource definition.
    #[must_use]
    pub fn with_resource(mut self, name: impl Into<String>, definition: ResourceDefinition) -> Self {
        self.resources.insert(name.into(), definition);
        self
    }

    /// Returns true if the template defines no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Looks up a resource definition by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceDefinition> {
        self.resources.get(name)
    }

    /// Distinct plugin types used by this template.
    #[must_use]
    pub fn resource_types(&self) -> BTreeSet<&str> {
        self.resources
            .values()
            .map(|def| def.type_name.as_str())
            .collect()
    }

    /// Builds the name-level dependency graph.
    ///
    /// Every resource is a node (in name order); an edge `a -> b` means `a`
    /// references `b`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTemplate`] for references to undefined resources
    /// and [`Error::CycleDetected`] for circular references.
    pub(crate) fn dependencies(&self) -> Result<Dag<String>> {
        let mut dag = Dag::new();
        for name in self.resources.keys() {
            dag.add_node(name.clone());
        }
        for (name, definition) in &self.resources {
            for reference in definition.references() {
                if !self.resources.contains_key(&reference) {
                    return Err(Error::invalid_template(format!(
                        "resource '{name}' references undefined resource '{reference}'"
                    )));
                }
                if reference == *name {
                    return Err(Error::CycleDetected {
                        cycle: vec![name.clone(), reference],
                    });
                }
                dag.add_requirement(name.clone(), reference);
            }
        }
        dag.dispatch_order()?;
        Ok(dag)
    }
}
