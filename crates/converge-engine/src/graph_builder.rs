//! Builds the convergence graph of a traversal.
//!
//! Inputs are the stack's existing resource rows (as stored before the
//! traversal starts) and the desired template. The output has two parts:
//!
//! - **update nodes** `(id, true)`, one per template resource, linked in the
//!   template's reference order;
//! - **cleanup nodes** `(id, false)`, one per existing row, linked in the
//!   reverse of the order recorded in each row's `requires`, so dependants
//!   are cleaned up before what they depended on. A cleanup node also waits
//!   for the update node of the same row, and for the cleanup of the row it
//!   replaced.
//!
//! Everything here is a pure function of its inputs; the same inputs always
//! give the same graph.

use std::collections::BTreeMap;

use converge_core::{ResourceId, TemplateId};

use crate::error::{Error, Result};
use crate::graph::{Dependencies, GraphKey};
use crate::resource::Resource;
use crate::template::Template;

/// Picks the row to reuse for a resource name.
///
/// Preference, scanning candidates in ascending id order:
///
/// 1. a row already converged to `new_template` (an interrupted traversal
///    being resumed);
/// 2. a row converged to `prev_template`;
/// 3. the first row at all (data from before the previous template).
pub fn best_existing_resource<'a, I>(
    candidates: I,
    new_template: TemplateId,
    prev_template: Option<TemplateId>,
) -> Option<&'a Resource>
where
    I: IntoIterator<Item = &'a Resource>,
{
    let mut sorted: Vec<&Resource> = candidates.into_iter().collect();
    sorted.sort_by_key(|r| r.id);

    let mut candidate: Option<&Resource> = None;
    let mut candidate_is_prev = false;
    for resource in sorted {
        if resource.current_template_id == Some(new_template) {
            return Some(resource);
        }
        let is_prev = prev_template.is_some() && resource.current_template_id == prev_template;
        if candidate.is_none() || (is_prev && !candidate_is_prev) {
            candidate = Some(resource);
            candidate_is_prev = is_prev;
        }
    }
    candidate
}

/// The row chosen for each template resource name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedResources {
    /// Names with an existing row to reuse.
    pub current: BTreeMap<String, ResourceId>,
    /// Names that need a new row, in name order.
    pub missing: Vec<String>,
}

/// Resolves every template resource name to an existing row where possible.
#[must_use]
pub fn resolve_current_resources(
    template: &Template,
    existing: &BTreeMap<ResourceId, Resource>,
    prev_template: Option<TemplateId>,
) -> ResolvedResources {
    let mut resolved = ResolvedResources::default();
    for name in template.resources.keys() {
        let candidates = existing.values().filter(|r| r.name == *name);
        match best_existing_resource(candidates, template.id, prev_template) {
            Some(resource) => {
                resolved.current.insert(name.clone(), resource.id);
            }
            None => resolved.missing.push(name.clone()),
        }
    }
    resolved
}

/// Computes the convergence graph.
///
/// `current` must map every template resource name to a row id; `existing`
/// holds the rows as they were before this traversal created any new ones.
///
/// # Errors
///
/// Returns a template error for undefined references or cycles, and
/// [`Error::InvalidTemplate`] if a name has no row in `current`.
pub fn compute_dependencies(
    template: &Template,
    current: &BTreeMap<String, ResourceId>,
    existing: &BTreeMap<ResourceId, Resource>,
) -> Result<Dependencies> {
    let lookup = |name: &String| -> Result<GraphKey> {
        current
            .get(name)
            .map(|&id| GraphKey::update(id))
            .ok_or_else(|| Error::invalid_template(format!("resource '{name}' has no row")))
    };

    let template_graph = template.dependencies()?;
    let mut deps = Dependencies::new();
    for name in template_graph.nodes() {
        deps.add_node(lookup(&name)?);
    }
    for (requirer, required) in template_graph.edges() {
        deps.add_requirement(lookup(&requirer)?, lookup(&required)?);
    }

    for (&id, resource) in existing {
        let cleanup = GraphKey::cleanup(id);
        deps.add_node(cleanup);

        for requirement in &resource.requires {
            if existing.contains_key(requirement) {
                deps.add_requirement(GraphKey::cleanup(*requirement), cleanup);
            }
        }
        if let Some(replaces) = resource.replaces {
            if existing.contains_key(&replaces) {
                deps.add_requirement(GraphKey::cleanup(replaces), cleanup);
            }
        }
        let update = GraphKey::update(id);
        if deps.contains(&update) {
            deps.add_requirement(cleanup, update);
        }
    }

    deps.validate()?;
    Ok(deps)
}
