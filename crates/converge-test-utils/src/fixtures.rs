//! Pre-built templates and configuration for common test scenarios.

use std::time::Duration;

use serde_json::json;

use converge_core::retry::RetryPolicy;
use converge_engine::config::EngineConfig;
use converge_engine::template::{ResourceDefinition, Template};

/// Type name the [`TestPlugin`](crate::plugin::TestPlugin) is registered under.
pub const TEST_RESOURCE_TYPE: &str = "test.resource";

/// Engine configuration for tests: immediate retries, short liveness probes.
#[must_use]
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        liveness_timeout: Duration::from_millis(50),
        sync_retry: RetryPolicy::immediate(64),
        ..EngineConfig::default()
    }
}

/// A resource of the test type referencing `deps` through `get_resource`.
#[must_use]
pub fn resource(value: &str, deps: &[&str]) -> ResourceDefinition {
    let refs: Vec<_> = deps
        .iter()
        .map(|name| json!({ "get_resource": name }))
        .collect();
    ResourceDefinition::new(TEST_RESOURCE_TYPE).with_properties(json!({
        "value": value,
        "refs": refs,
    }))
}

/// Five resources: `A` and `B` depend on `C`, which depends on `D` and `E`.
///
/// ```text
///   A   B
///    \ /
///     C
///    / \
///   D   E
/// ```
#[must_use]
pub fn five_resource_template() -> Template {
    Template::empty()
        .with_resource("A", resource("a", &["C"]))
        .with_resource("B", resource("b", &["C"]))
        .with_resource("C", resource("c", &["D", "E"]))
        .with_resource("D", resource("d", &[]))
        .with_resource("E", resource("e", &[]))
}

/// An update of [`five_resource_template`]: `E` is dropped, `C` changes and
/// now depends on `D` and `B`, and `F`, `G`, `H` are added on top of `C`.
///
/// ```text
///   A  F  G  H
///    \  \ | /
///        C
///       / \
///      D   B
/// ```
#[must_use]
pub fn five_resource_update_template() -> Template {
    Template::empty()
        .with_resource("A", resource("a", &["C"]))
        .with_resource("B", resource("b", &[]))
        .with_resource("C", resource("c2", &["D", "B"]))
        .with_resource("D", resource("d", &[]))
        .with_resource("F", resource("f", &["C"]))
        .with_resource("G", resource("g", &["C"]))
        .with_resource("H", resource("h", &["C"]))
}

/// A chain `first -> ... -> last`, each resource depending on the next.
#[must_use]
pub fn chain_template(names: &[&str]) -> Template {
    let mut template = Template::empty();
    for (i, name) in names.iter().enumerate() {
        let deps: Vec<&str> = names.get(i + 1).copied().into_iter().collect();
        template = template.with_resource(*name, resource(name, &deps));
    }
    template
}

/// Independent resources with no references between them.
#[must_use]
pub fn flat_template(names: &[&str]) -> Template {
    names.iter().fold(Template::empty(), |template, name| {
        template.with_resource(*name, resource(name, &[]))
    })
}
