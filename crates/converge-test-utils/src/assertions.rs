//! Custom assertion helpers for integration tests.

use std::collections::BTreeSet;

use converge_engine::dispatch::CheckResourceRequest;
use converge_engine::graph::{Dependencies, GraphKey};
use converge_engine::stack::{Stack, StackAction, StackStatus};

/// Asserts a stack's `(action, status)`.
///
/// # Panics
///
/// Panics with the status reason if the state differs.
pub fn assert_stack_state(stack: &Stack, action: StackAction, status: StackStatus) {
    assert_eq!(
        (stack.action(), stack.status()),
        (action, status),
        "expected {action}_{status}, stack is {} ({})",
        stack.state_label(),
        stack.status_reason()
    );
}

/// Asserts the graph has exactly `expected` as its requirement edges.
///
/// # Panics
///
/// Panics listing missing and unexpected edges.
pub fn assert_edges(deps: &Dependencies, expected: &[(GraphKey, GraphKey)]) {
    let actual: BTreeSet<(GraphKey, GraphKey)> = deps.edges().into_iter().collect();
    let expected: BTreeSet<(GraphKey, GraphKey)> = expected.iter().copied().collect();
    let missing: Vec<_> = expected.difference(&actual).collect();
    let unexpected: Vec<_> = actual.difference(&expected).collect();
    assert!(
        missing.is_empty() && unexpected.is_empty(),
        "graph edges differ\n  missing: {missing:?}\n  unexpected: {unexpected:?}"
    );
}

/// Asserts every request for `first` was dispatched before any for `second`.
///
/// # Panics
///
/// Panics if either node was never dispatched or the order is wrong.
pub fn assert_dispatched_before(
    history: &[CheckResourceRequest],
    first: GraphKey,
    second: GraphKey,
) {
    let position = |key: GraphKey| history.iter().position(|r| r.graph_key() == key);
    let first_at = position(first).unwrap_or_else(|| panic!("{first} was never dispatched"));
    let second_at = position(second).unwrap_or_else(|| panic!("{second} was never dispatched"));
    assert!(
        first_at < second_at,
        "{first} (#{first_at}) dispatched after {second} (#{second_at})"
    );
}

/// Asserts no node was dispatched twice within one traversal.
///
/// # Panics
///
/// Panics naming the first duplicate.
pub fn assert_dispatched_once(history: &[CheckResourceRequest]) {
    let mut seen = BTreeSet::new();
    for request in history {
        assert!(
            seen.insert((request.traversal_id, request.graph_key())),
            "{} dispatched twice in traversal {}",
            request.graph_key(),
            request.traversal_id
        );
    }
}
