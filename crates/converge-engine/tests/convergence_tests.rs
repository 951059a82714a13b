//! End-to-end convergence tests.
//!
//! Each test drives an engine through a [`SimulatedCluster`]: requests are
//! delivered one at a time in a seeded random order, so a failure can be
//! replayed from its seed.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::json;

use converge_core::TraversalId;
use converge_engine::config::EngineConfig;
use converge_engine::error::Error;
use converge_engine::graph::{Dependencies, GraphKey};
use converge_engine::plugin::{Capabilities, ResourceOperation};
use converge_engine::resource::{ResourceAction, ResourceStatus};
use converge_engine::stack::{StackAction, StackOptions, StackStatus};
use converge_engine::template::{ResourceDefinition, Template};
use converge_test_utils::{
    FaultConfig, SimulatedCluster, assert_dispatched_once, assert_stack_state, chain_template,
    five_resource_template, five_resource_update_template, flat_template, init_test_logging,
    resource, test_engine_config,
};

fn names(cluster: &SimulatedCluster, stack_id: converge_core::StackId) -> BTreeSet<String> {
    cluster
        .active_resources(stack_id)
        .into_iter()
        .map(|row| row.name)
        .collect()
}

fn name_set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(ToString::to_string).collect()
}

// ============================================================================
// Create / update / delete
// ============================================================================

#[tokio::test]
async fn create_completes_in_any_delivery_order() {
    init_test_logging();

    for seed in 0..16 {
        let cluster = SimulatedCluster::with_seed(seed);
        let stack = cluster
            .create_stack("web", five_resource_template())
            .await
            .unwrap();
        cluster.run_until_idle().await.unwrap();

        let stack = cluster.stack(stack.id).await;
        assert_stack_state(&stack, StackAction::Create, StackStatus::Complete);
        assert_eq!(stack.status_reason(), "Stack CREATE completed successfully");
        assert_dispatched_once(&cluster.delivered());

        for row in cluster.active_resources(stack.id) {
            assert_eq!(row.action, ResourceAction::Create, "seed {seed}: {}", row.name);
            assert_eq!(row.status, ResourceStatus::Complete);
            assert_eq!(row.current_template_id, Some(stack.raw_template_id));
            assert!(row.physical_id.is_some());
        }
        assert_eq!(cluster.plugin().resources_for(ResourceOperation::Create).len(), 5);
        assert_eq!(cluster.store().sync_point_count(&stack.id).unwrap(), 0);
        assert_eq!(cluster.store().template_count().unwrap(), 1);
    }
}

#[tokio::test]
async fn nodes_wait_for_every_predecessor() {
    let cluster = SimulatedCluster::with_seed(21);
    let stack = cluster
        .create_stack("web", five_resource_template())
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();
    cluster
        .engine()
        .update_stack(stack.id, five_resource_update_template())
        .await
        .unwrap();

    let deps = Dependencies::from_persisted(&cluster.stack(stack.id).await.current_deps).unwrap();
    let mut completed: BTreeSet<GraphKey> = BTreeSet::new();
    loop {
        let wave = cluster.take_pending();
        if wave.is_empty() {
            break;
        }
        for request in &wave {
            let key = request.graph_key();
            let required: BTreeSet<GraphKey> = deps.requires(&key).unwrap().into_iter().collect();
            assert!(
                required.is_subset(&completed),
                "{key} dispatched before {:?} completed",
                required.difference(&completed).collect::<Vec<_>>()
            );
            let senders: BTreeSet<GraphKey> = request.input_data.senders().copied().collect();
            assert_eq!(senders, required, "{key} carries its predecessors' outputs");
        }
        // Deliver the wave backwards to shake out ordering assumptions.
        for request in wave.into_iter().rev() {
            let key = request.graph_key();
            cluster.deliver(request).await.unwrap();
            completed.insert(key);
        }
    }
    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Update,
        StackStatus::Complete,
    );
}

#[tokio::test]
async fn outputs_flow_to_dependants() {
    let cluster = SimulatedCluster::with_seed(2);
    let stack = cluster
        .create_stack("web", five_resource_template())
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();

    let c = cluster.resource(stack.id, "C");
    let inputs: BTreeSet<String> = c.attributes["inputs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(inputs, name_set(&["D", "E"]));
    assert_eq!(c.attributes["properties"]["value"], json!("c"));
    assert_eq!(
        c.requires,
        BTreeSet::from([
            cluster.resource(stack.id, "D").id,
            cluster.resource(stack.id, "E").id
        ])
    );
}

#[tokio::test]
async fn update_of_converged_resources_is_a_no_op_for_unchanged_template() {
    let cluster = SimulatedCluster::new();
    let template = chain_template(&["app", "db"]);
    let stack = cluster.create_stack("web", template.clone()).await.unwrap();
    cluster.run_until_idle().await.unwrap();
    cluster.plugin().clear_calls();

    cluster.engine().update_stack(stack.id, template).await.unwrap();
    cluster.run_until_idle().await.unwrap();

    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Update,
        StackStatus::Complete,
    );
    assert!(
        cluster.plugin().calls().is_empty(),
        "rows already on the template are not touched"
    );
}

#[tokio::test]
async fn update_supersedes_traversal_in_flight() {
    for seed in 0..8 {
        let cluster = SimulatedCluster::with_seed(seed);
        let stack = cluster
            .create_stack("web", five_resource_template())
            .await
            .unwrap();
        let create_traversal = cluster.stack(stack.id).await.current_traversal.unwrap();
        cluster.step().await.unwrap();

        let update_traversal = cluster
            .engine()
            .update_stack(stack.id, five_resource_update_template())
            .await
            .unwrap();
        assert_ne!(create_traversal, update_traversal);
        cluster.run_until_idle().await.unwrap();

        let stack = cluster.stack(stack.id).await;
        assert_stack_state(&stack, StackAction::Update, StackStatus::Complete);
        assert_eq!(
            names(&cluster, stack.id),
            name_set(&["A", "B", "C", "D", "F", "G", "H"])
        );
        for row in cluster.active_resources(stack.id) {
            assert_eq!(row.current_template_id, Some(stack.raw_template_id), "seed {seed}");
            assert_eq!(row.status, ResourceStatus::Complete);
        }
        assert_eq!(cluster.store().sync_point_count(&stack.id).unwrap(), 0);
    }
}

#[tokio::test]
async fn delete_removes_stack_rows_and_templates() {
    let cluster = SimulatedCluster::with_seed(9);
    let stack = cluster
        .create_stack("web", five_resource_template())
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();

    cluster.engine().delete_stack(stack.id).await.unwrap();
    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Delete,
        StackStatus::InProgress,
    );
    cluster.run_until_idle().await.unwrap();

    assert!(cluster.find_stack(stack.id).await.is_none());
    assert!(cluster.store().all_resources(&stack.id).unwrap().is_empty());
    assert_eq!(cluster.store().sync_point_count(&stack.id).unwrap(), 0);
    assert_eq!(cluster.store().template_count().unwrap(), 0);
    assert_eq!(
        cluster
            .plugin()
            .resources_for(ResourceOperation::Delete)
            .into_iter()
            .collect::<BTreeSet<_>>(),
        name_set(&["A", "B", "C", "D", "E"])
    );
}

#[tokio::test]
async fn credential_failure_leaves_stack_delete_failed() {
    let cluster = SimulatedCluster::new();
    let stack = cluster
        .create_stack("web", flat_template(&["a", "b"]))
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();

    cluster.store().fail_credential_deletion(true);
    cluster.engine().delete_stack(stack.id).await.unwrap();
    cluster.run_until_idle().await.unwrap();

    let failed = cluster.stack(stack.id).await;
    assert_stack_state(&failed, StackAction::Delete, StackStatus::Failed);
    assert!(
        failed.status_reason().starts_with("Error deleting credentials"),
        "{}",
        failed.status_reason()
    );
    assert!(cluster.active_resources(stack.id).is_empty());

    // Deleting again once credentials can be removed finishes the job.
    cluster.store().fail_credential_deletion(false);
    cluster.engine().delete_stack(stack.id).await.unwrap();
    cluster.run_until_idle().await.unwrap();
    assert!(cluster.find_stack(stack.id).await.is_none());
}

#[tokio::test]
async fn nested_stack_delete_leaves_credentials_to_parent() {
    let cluster = SimulatedCluster::new();
    let parent = cluster
        .create_stack("parent", Template::empty())
        .await
        .unwrap();
    let child = cluster
        .engine()
        .create_stack(
            "child",
            flat_template(&["a"]),
            StackOptions {
                owner_id: Some(parent.id),
                ..StackOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(cluster.take_pending().iter().all(|r| r.is_nested));
    cluster.engine().delete_stack(child.id).await.unwrap();

    cluster.store().fail_credential_deletion(true);
    cluster.run_until_idle().await.unwrap();
    assert!(cluster.find_stack(child.id).await.is_none());
}

// ============================================================================
// Failure, rollback and timeout
// ============================================================================

#[tokio::test]
async fn failed_create_rolls_back_to_nothing() {
    let cluster = SimulatedCluster::with_seed(4);
    cluster
        .plugin()
        .fail("C", ResourceOperation::Create, "quota exceeded");
    let stack = cluster
        .create_stack("web", five_resource_template())
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();

    let stack = cluster.stack(stack.id).await;
    assert_stack_state(&stack, StackAction::Rollback, StackStatus::Complete);
    assert!(cluster.active_resources(stack.id).is_empty());
    assert_eq!(
        cluster
            .plugin()
            .resources_for(ResourceOperation::Delete)
            .into_iter()
            .collect::<BTreeSet<_>>(),
        name_set(&["D", "E"]),
        "only what was created is deleted"
    );
    assert!(cluster.plugin().resources_for(ResourceOperation::Create).iter().all(|n| n != "A"));
    assert_eq!(cluster.store().template_count().unwrap(), 1);
}

#[tokio::test]
async fn failed_update_rolls_back_to_previous_template() {
    for seed in 0..6 {
        let cluster = SimulatedCluster::with_seed(seed);
        let stack = cluster
            .create_stack("web", five_resource_template())
            .await
            .unwrap();
        cluster.run_until_idle().await.unwrap();
        let original = cluster.stack(stack.id).await.raw_template_id;

        cluster
            .plugin()
            .fail("F", ResourceOperation::Create, "bad image");
        cluster
            .engine()
            .update_stack(stack.id, five_resource_update_template())
            .await
            .unwrap();
        cluster.run_until_idle().await.unwrap();

        let stack = cluster.stack(stack.id).await;
        assert_stack_state(&stack, StackAction::Rollback, StackStatus::Complete);
        assert_eq!(stack.raw_template_id, original, "seed {seed}");
        assert_eq!(stack.prev_raw_template_id, None);
        assert_eq!(names(&cluster, stack.id), name_set(&["A", "B", "C", "D", "E"]));
        for row in cluster.active_resources(stack.id) {
            assert_eq!(row.current_template_id, Some(original), "seed {seed}: {}", row.name);
        }
        assert_eq!(
            cluster.resource(stack.id, "C").requires,
            BTreeSet::from([
                cluster.resource(stack.id, "D").id,
                cluster.resource(stack.id, "E").id
            ])
        );
    }
}

#[tokio::test]
async fn disabled_rollback_leaves_stack_failed() {
    let cluster = SimulatedCluster::new();
    cluster.plugin().fail("C", ResourceOperation::Create, "boom");
    let stack = cluster
        .engine()
        .create_stack(
            "web",
            five_resource_template(),
            StackOptions {
                disable_rollback: true,
                ..StackOptions::default()
            },
        )
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();

    let failed = cluster.stack(stack.id).await;
    assert_stack_state(&failed, StackAction::Create, StackStatus::Failed);
    assert_eq!(failed.status_reason(), "Resource C failed: boom");
    assert_eq!(failed.current_traversal, None);
    assert_eq!(cluster.resource(stack.id, "C").status, ResourceStatus::Failed);
    assert_eq!(cluster.resource(stack.id, "D").action, ResourceAction::Create);

    // A failed stack can be updated once the cause is fixed.
    cluster.plugin().clear_failures();
    cluster
        .engine()
        .update_stack(stack.id, five_resource_template())
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();
    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Update,
        StackStatus::Complete,
    );
    assert_eq!(cluster.resource(stack.id, "C").status, ResourceStatus::Complete);
}

#[tokio::test]
async fn engine_wide_rollback_switch() {
    let config = EngineConfig {
        disable_rollback: true,
        ..test_engine_config()
    };
    let cluster = SimulatedCluster::with_config(0, config, FaultConfig::no_faults());
    cluster.plugin().fail("db", ResourceOperation::Create, "boom");
    let stack = cluster
        .create_stack("web", chain_template(&["app", "db"]))
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();

    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Create,
        StackStatus::Failed,
    );
}

#[tokio::test]
async fn timed_out_create_rolls_back() {
    let cluster = SimulatedCluster::new();
    let stack = cluster
        .engine()
        .create_stack(
            "web",
            five_resource_template(),
            StackOptions {
                timeout: Some(Duration::from_secs(60)),
                ..StackOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(!cluster.check_timeout(stack.id).await.unwrap());
    cluster.clock().advance(Duration::from_secs(120));
    assert!(cluster.check_timeout(stack.id).await.unwrap());

    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Rollback,
        StackStatus::InProgress,
    );
    cluster.run_until_idle().await.unwrap();

    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Rollback,
        StackStatus::Complete,
    );
    assert!(
        cluster.plugin().calls().is_empty(),
        "requests of the timed-out traversal are dropped"
    );
}

#[tokio::test]
async fn timed_out_update_without_rollback_fails() {
    let cluster = SimulatedCluster::new();
    let stack = cluster
        .engine()
        .create_stack(
            "web",
            flat_template(&["a"]),
            StackOptions {
                timeout: Some(Duration::from_secs(60)),
                disable_rollback: true,
                ..StackOptions::default()
            },
        )
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();
    cluster
        .engine()
        .update_stack(stack.id, flat_template(&["a", "b"]))
        .await
        .unwrap();

    cluster.clock().advance(Duration::from_secs(61));
    assert!(cluster.check_timeout(stack.id).await.unwrap());
    let failed = cluster.stack(stack.id).await;
    assert_stack_state(&failed, StackAction::Update, StackStatus::Failed);
    assert_eq!(failed.status_reason(), "Timed out");

    cluster.run_until_idle().await.unwrap();
    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Update,
        StackStatus::Failed,
    );
}

// ============================================================================
// Replacement
// ============================================================================

#[tokio::test]
async fn replacement_takes_over_the_original_node() {
    for seed in 0..6 {
        let cluster = SimulatedCluster::with_seed(seed);
        let stack = cluster
            .create_stack("web", five_resource_template())
            .await
            .unwrap();
        cluster.run_until_idle().await.unwrap();
        let original = cluster.resource(stack.id, "C");

        cluster.plugin().replace_on_next_update("C");
        cluster
            .engine()
            .update_stack(stack.id, five_resource_template())
            .await
            .unwrap();
        cluster.run_until_idle().await.unwrap();

        assert_stack_state(
            &cluster.stack(stack.id).await,
            StackAction::Update,
            StackStatus::Complete,
        );
        let replacement = cluster.resource(stack.id, "C");
        assert_ne!(replacement.id, original.id, "seed {seed}");
        assert_eq!(replacement.replaces, None, "link cleared once the original is gone");
        assert_eq!(replacement.action, ResourceAction::Create);
        assert_ne!(replacement.physical_id, original.physical_id);
        assert_eq!(
            cluster.plugin().operations_on("C"),
            vec![
                ResourceOperation::Create,
                ResourceOperation::Update,
                ResourceOperation::Create,
                ResourceOperation::Delete,
            ]
        );
        for dependant in ["A", "B"] {
            assert!(
                cluster.resource(stack.id, dependant).requires.contains(&replacement.id),
                "{dependant} depends on the replacement"
            );
        }
        assert!(
            cluster
                .store()
                .all_resources(&stack.id)
                .unwrap()
                .iter()
                .all(|row| row.id != original.id),
            "original row purged"
        );
    }
}

#[tokio::test]
async fn rollback_after_replacement_keeps_the_original() {
    for seed in 0..6 {
        let cluster = SimulatedCluster::with_seed(seed);
        let stack = cluster
            .create_stack("web", five_resource_template())
            .await
            .unwrap();
        cluster.run_until_idle().await.unwrap();
        let original = cluster.resource(stack.id, "C");

        cluster.plugin().replace_on_next_update("C");
        cluster.plugin().fail("A", ResourceOperation::Update, "boom");
        cluster
            .engine()
            .update_stack(stack.id, five_resource_template())
            .await
            .unwrap();
        cluster.run_until_idle().await.unwrap();

        assert_stack_state(
            &cluster.stack(stack.id).await,
            StackAction::Rollback,
            StackStatus::Complete,
        );
        let rows: Vec<_> = cluster
            .active_resources(stack.id)
            .into_iter()
            .filter(|row| row.name == "C")
            .collect();
        assert_eq!(rows.len(), 1, "seed {seed}: one live row per name");
        let kept = rows.first().unwrap();
        assert_eq!(kept.id, original.id);
        assert_eq!(kept.physical_id, original.physical_id);
        assert_eq!(kept.replaced_by, None);
        assert_eq!(
            cluster.plugin().operations_on("C"),
            vec![
                ResourceOperation::Create,
                ResourceOperation::Update,
                ResourceOperation::Create,
                ResourceOperation::Delete,
            ],
            "seed {seed}: the replacement is deleted, the original left alone"
        );
        for dependant in ["A", "B"] {
            assert!(
                cluster.resource(stack.id, dependant).requires.contains(&original.id),
                "seed {seed}: {dependant} depends on the original again"
            );
        }
    }
}

#[tokio::test]
async fn replacement_for_finished_traversal_is_ignored() {
    let cluster = SimulatedCluster::new();
    let stack = cluster.create_stack("web", flat_template(&["a"])).await.unwrap();
    cluster.run_until_idle().await.unwrap();
    let row = cluster.resource(stack.id, "a");
    let traversal_id = cluster.stack(stack.id).await.current_traversal.unwrap();

    let request = converge_engine::dispatch::CheckResourceRequest {
        stack_id: stack.id,
        resource_id: row.id,
        traversal_id,
        input_data: converge_engine::sync_point::InputData::new(),
        is_update: true,
        adopt_stack_data: None,
        is_nested: false,
    };
    assert_eq!(cluster.engine().make_replacement(&request).await.unwrap(), None);
    assert_eq!(cluster.active_resources(stack.id).len(), 1);
}

// ============================================================================
// Stale callbacks and redelivery
// ============================================================================

#[tokio::test]
async fn stale_callbacks_change_nothing() {
    let cluster = SimulatedCluster::new();
    let stack = cluster
        .create_stack("web", five_resource_template())
        .await
        .unwrap();
    let d = cluster.resource(stack.id, "D");
    let before = cluster.stack(stack.id).await;
    let rows_before = cluster.store().all_resources(&stack.id).unwrap();
    let points_before = cluster.store().sync_point_count(&stack.id).unwrap();
    let pending_before = cluster.pending_len();

    let stale = TraversalId::generate();
    let engine = cluster.engine();
    engine
        .node_complete(stack.id, stale, GraphKey::update(d.id), json!({}))
        .await
        .unwrap();
    assert!(!engine.node_failed(stack.id, stale, d.id, "late").await.unwrap());
    assert!(
        !engine
            .state_set(stack.id, stale, StackAction::Create, StackStatus::Failed, "late")
            .await
            .unwrap()
    );
    assert!(!engine.mark_complete(stack.id, stale).await.unwrap());

    assert_eq!(cluster.stack(stack.id).await, before);
    assert_eq!(cluster.store().all_resources(&stack.id).unwrap(), rows_before);
    assert_eq!(cluster.store().sync_point_count(&stack.id).unwrap(), points_before);
    assert_eq!(cluster.pending_len(), pending_before);
}

#[tokio::test]
async fn superseded_requests_do_not_run() {
    let cluster = SimulatedCluster::new();
    let stack = cluster
        .create_stack("web", flat_template(&["a", "b"]))
        .await
        .unwrap();
    let stale_requests = cluster.take_pending();

    cluster
        .engine()
        .update_stack(stack.id, flat_template(&["a", "b"]))
        .await
        .unwrap();
    for request in stale_requests {
        cluster.deliver(request).await.unwrap();
    }
    assert!(cluster.plugin().calls().is_empty());

    cluster.run_until_idle().await.unwrap();
    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Update,
        StackStatus::Complete,
    );
    assert_eq!(cluster.plugin().resources_for(ResourceOperation::Create).len(), 2);
}

#[tokio::test]
async fn redelivered_requests_are_harmless() {
    for seed in 0..6 {
        let cluster =
            SimulatedCluster::with_config(seed, test_engine_config(), FaultConfig::always_redeliver());
        let stack = cluster
            .create_stack("web", five_resource_template())
            .await
            .unwrap();
        cluster.run_until_idle().await.unwrap();
        assert_stack_state(
            &cluster.stack(stack.id).await,
            StackAction::Create,
            StackStatus::Complete,
        );
        assert_eq!(
            cluster.plugin().resources_for(ResourceOperation::Create).len(),
            5,
            "seed {seed}: each resource created once"
        );

        cluster
            .engine()
            .update_stack(stack.id, five_resource_update_template())
            .await
            .unwrap();
        cluster.run_until_idle().await.unwrap();
        assert_stack_state(
            &cluster.stack(stack.id).await,
            StackAction::Update,
            StackStatus::Complete,
        );

        cluster.engine().delete_stack(stack.id).await.unwrap();
        cluster.run_until_idle().await.unwrap();
        assert!(cluster.find_stack(stack.id).await.is_none());
        assert_eq!(
            cluster.plugin().resources_for(ResourceOperation::Delete).len(),
            8,
            "seed {seed}: E on update, then the seven survivors"
        );
    }
}

// ============================================================================
// Stack-wide actions
// ============================================================================

#[tokio::test]
async fn suspend_and_resume() {
    let cluster = SimulatedCluster::with_seed(1);
    let stack = cluster
        .create_stack("web", five_resource_template())
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();
    let engine = cluster.engine();

    engine
        .stack_action(stack.id, StackAction::Suspend)
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();
    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Suspend,
        StackStatus::Complete,
    );
    assert_eq!(cluster.plugin().resources_for(ResourceOperation::Suspend).len(), 5);
    assert!(
        cluster
            .active_resources(stack.id)
            .iter()
            .all(|row| row.action == ResourceAction::Suspend)
    );

    let err = engine
        .update_stack(stack.id, five_resource_update_template())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }), "{err}");

    engine
        .stack_action(stack.id, StackAction::Resume)
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();
    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Resume,
        StackStatus::Complete,
    );
    assert_eq!(cluster.plugin().resources_for(ResourceOperation::Resume).len(), 5);
    assert_eq!(
        names(&cluster, stack.id),
        name_set(&["A", "B", "C", "D", "E"]),
        "stack-wide actions never delete"
    );
}

#[tokio::test]
async fn stack_action_rejects_invalid_requests() {
    let cluster = SimulatedCluster::new();
    let stack = cluster.create_stack("web", flat_template(&["a"])).await.unwrap();
    cluster.run_until_idle().await.unwrap();
    let engine = cluster.engine();

    for action in [StackAction::Resume, StackAction::Create, StackAction::Delete] {
        let err = engine.stack_action(stack.id, action).await.unwrap_err();
        assert!(
            matches!(err, Error::InvalidStateTransition { .. }),
            "{action}: {err}"
        );
    }

    engine.delete_stack(stack.id).await.unwrap();
    let err = engine
        .update_stack(stack.id, flat_template(&["a"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }), "{err}");
}

#[tokio::test]
async fn snapshot_and_check_respect_capabilities() {
    let cluster = SimulatedCluster::new();
    let stack = cluster
        .create_stack("web", flat_template(&["a", "b"]))
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();
    let engine = cluster.engine();

    for action in [StackAction::Snapshot, StackAction::Check] {
        engine.stack_action(stack.id, action).await.unwrap();
        cluster.run_until_idle().await.unwrap();
        assert_stack_state(&cluster.stack(stack.id).await, action, StackStatus::Complete);
    }
    assert!(cluster.plugin().resources_for(ResourceOperation::Snapshot).is_empty());
    assert!(cluster.plugin().resources_for(ResourceOperation::Check).is_empty());

    cluster.plugin().set_capabilities(Capabilities {
        supports_snapshot: true,
        supports_live_state: true,
    });
    for action in [StackAction::Snapshot, StackAction::Restore, StackAction::Check] {
        engine.stack_action(stack.id, action).await.unwrap();
        cluster.run_until_idle().await.unwrap();
        assert_stack_state(&cluster.stack(stack.id).await, action, StackStatus::Complete);
    }
    assert_eq!(cluster.plugin().resources_for(ResourceOperation::Snapshot).len(), 2);
    assert_eq!(cluster.plugin().resources_for(ResourceOperation::Restore).len(), 2);
    assert_eq!(cluster.plugin().resources_for(ResourceOperation::Check).len(), 2);
}

#[tokio::test]
async fn failed_check_does_not_roll_back() {
    let cluster = SimulatedCluster::new();
    cluster.plugin().set_capabilities(Capabilities {
        supports_snapshot: false,
        supports_live_state: true,
    });
    let stack = cluster
        .create_stack("web", flat_template(&["a", "b"]))
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();

    cluster
        .plugin()
        .fail("b", ResourceOperation::Check, "drifted");
    cluster
        .engine()
        .stack_action(stack.id, StackAction::Check)
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();

    let stack = cluster.stack(stack.id).await;
    assert_stack_state(&stack, StackAction::Check, StackStatus::Failed);
    assert_eq!(stack.status_reason(), "Resource b failed: drifted");
    assert_eq!(names(&cluster, stack.id), name_set(&["a", "b"]));
}

#[tokio::test]
async fn periodic_check_runs_only_on_idle_stacks() {
    let cluster = SimulatedCluster::new();
    let stack = cluster
        .create_stack("web", flat_template(&["a"]))
        .await
        .unwrap();
    let engine = cluster.engine();

    assert!(!engine.periodic_check(stack.id).await.unwrap(), "create in progress");
    assert_eq!(engine.stack_lock(stack.id).get_engine_id().await.unwrap(), None);
    cluster.run_until_idle().await.unwrap();

    let peer = cluster.peer_engine();
    let peer_lock = peer.stack_lock(stack.id);
    peer_lock.acquire(true).await.unwrap();
    assert!(!engine.periodic_check(stack.id).await.unwrap(), "locked by a peer");
    assert_eq!(peer_lock.get_engine_id().await.unwrap(), Some(peer.engine_id()));
    peer_lock.release().await.unwrap();

    assert!(engine.periodic_check(stack.id).await.unwrap());
    cluster.run_until_idle().await.unwrap();
    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Check,
        StackStatus::Complete,
    );
}

#[tokio::test]
async fn adopt_takes_over_existing_resources() {
    let cluster = SimulatedCluster::with_seed(8);
    let adopt_data = json!({ "resources": { "A": { "resource_id": "a-1" } } });
    let stack = cluster
        .engine()
        .create_stack(
            "adopted",
            five_resource_template(),
            StackOptions {
                adopt_stack_data: Some(adopt_data.clone()),
                ..StackOptions::default()
            },
        )
        .await
        .unwrap();
    assert_stack_state(&stack, StackAction::Adopt, StackStatus::InProgress);
    cluster.run_until_idle().await.unwrap();

    assert_stack_state(
        &cluster.stack(stack.id).await,
        StackAction::Adopt,
        StackStatus::Complete,
    );
    assert!(
        cluster
            .delivered()
            .iter()
            .all(|r| r.adopt_stack_data.as_ref() == Some(&adopt_data))
    );
    assert_eq!(cluster.plugin().resources_for(ResourceOperation::Adopt).len(), 5);
    assert!(cluster.plugin().resources_for(ResourceOperation::Create).is_empty());
    assert!(
        cluster
            .active_resources(stack.id)
            .iter()
            .all(|row| row.action == ResourceAction::Adopt)
    );
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn invalid_templates_are_rejected_before_anything_is_stored() {
    let cluster = SimulatedCluster::new();

    let dangling = Template::empty().with_resource("app", resource("app", &["missing"]));
    let err = cluster.create_stack("web", dangling).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTemplate { .. }), "{err}");

    let cyclic = Template::empty()
        .with_resource("a", resource("a", &["b"]))
        .with_resource("b", resource("b", &["a"]));
    let err = cluster.create_stack("web", cyclic).await.unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }), "{err}");

    let unknown = Template::empty().with_resource("x", ResourceDefinition::new("other.type"));
    let err = cluster.create_stack("web", unknown).await.unwrap_err();
    assert!(matches!(err, Error::UnknownResourceType { .. }), "{err}");

    assert_eq!(cluster.store().template_count().unwrap(), 0);
    assert_eq!(cluster.pending_len(), 0);
}

#[tokio::test]
async fn operations_on_missing_stack_fail() {
    let cluster = SimulatedCluster::new();
    let missing = converge_core::StackId::generate();
    let err = cluster
        .engine()
        .update_stack(missing, flat_template(&["a"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StackNotFound { .. }), "{err}");
    let err = cluster.engine().delete_stack(missing).await.unwrap_err();
    assert!(matches!(err, Error::StackNotFound { .. }), "{err}");
}
