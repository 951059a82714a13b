//! A scriptable resource plugin.
//!
//! [`TestPlugin`] records every call it receives and performs no real work.
//! Tests script it to fail a given operation on a given resource, or to ask
//! for replacement on the next update.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use converge_core::ResourceId;
use converge_engine::error::{Error, Result};
use converge_engine::plugin::{
    Capabilities, OperationOutcome, ResourceContext, ResourceOperation, ResourcePlugin,
};

/// One recorded plugin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCall {
    /// Logical resource name.
    pub resource: String,
    /// Row the call acted on.
    pub resource_id: ResourceId,
    /// Operation requested.
    pub operation: ResourceOperation,
}

#[derive(Debug, Default)]
struct PluginState {
    capabilities: Capabilities,
    calls: Vec<PluginCall>,
    failures: HashMap<(String, ResourceOperation), String>,
    replace_next_update: BTreeSet<String>,
    next_physical_id: u64,
}

/// Plugin double with call recording and failure injection.
#[derive(Debug, Default)]
pub struct TestPlugin {
    state: Mutex<PluginState>,
}

impl TestPlugin {
    /// Creates a plugin that succeeds at everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the advertised capabilities.
    pub fn set_capabilities(&self, capabilities: Capabilities) {
        self.state.lock().unwrap().capabilities = capabilities;
    }

    /// Makes `operation` on `resource` fail with `message` until cleared.
    pub fn fail(&self, resource: &str, operation: ResourceOperation, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((resource.to_string(), operation), message.to_string());
    }

    /// Removes every scripted failure.
    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Makes the next update of `resource` ask for replacement.
    pub fn replace_on_next_update(&self, resource: &str) {
        self.state
            .lock()
            .unwrap()
            .replace_next_update
            .insert(resource.to_string());
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<PluginCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Names of the resources `operation` was called on, in call order.
    pub fn resources_for(&self, operation: ResourceOperation) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.resource.clone())
            .collect()
    }

    /// Operations called on `resource`, in call order.
    pub fn operations_on(&self, resource: &str) -> Vec<ResourceOperation> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.resource == resource)
            .map(|c| c.operation)
            .collect()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

/// Names of the update predecessors in `ctx`'s input data.
fn input_names(ctx: &ResourceContext<'_>) -> Vec<String> {
    ctx.input_data
        .iter()
        .filter(|(sender, _)| sender.is_update)
        .filter_map(|(_, data)| data.get("name").and_then(Value::as_str).map(str::to_string))
        .collect()
}

#[async_trait]
impl ResourcePlugin for TestPlugin {
    fn capabilities(&self) -> Capabilities {
        self.state.lock().unwrap().capabilities
    }

    async fn handle(
        &self,
        operation: ResourceOperation,
        ctx: ResourceContext<'_>,
    ) -> Result<OperationOutcome> {
        let name = ctx.resource.name.clone();
        let mut state = self.state.lock().unwrap();
        state.calls.push(PluginCall {
            resource: name.clone(),
            resource_id: ctx.resource.id,
            operation,
        });

        if let Some(message) = state.failures.get(&(name.clone(), operation)) {
            return Err(Error::ResourceFailed {
                resource_name: name,
                message: message.clone(),
            });
        }

        let properties = ctx
            .definition
            .map_or(Value::Null, |definition| definition.properties.clone());
        let outcome = match operation {
            ResourceOperation::Update if state.replace_next_update.remove(&name) => {
                OperationOutcome::Replace
            }
            ResourceOperation::Create | ResourceOperation::Adopt => {
                state.next_physical_id += 1;
                OperationOutcome::Complete {
                    physical_id: Some(format!("{name}-{}", state.next_physical_id)),
                    attributes: json!({
                        "properties": properties,
                        "inputs": input_names(&ctx),
                    }),
                }
            }
            ResourceOperation::Update => OperationOutcome::Complete {
                physical_id: ctx.resource.physical_id.clone(),
                attributes: json!({
                    "properties": properties,
                    "inputs": input_names(&ctx),
                }),
            },
            ResourceOperation::Delete => OperationOutcome::Complete {
                physical_id: None,
                attributes: Value::Null,
            },
            _ => OperationOutcome::unchanged(ctx.resource),
        };
        drop(state);
        Ok(outcome)
    }
}
