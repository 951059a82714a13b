//! Simulation harness checks: seeded replay and plugin scripting.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use converge_engine::plugin::ResourceOperation;
use converge_test_utils::{
    FaultConfig, SimulatedCluster, five_resource_template, flat_template, test_engine_config,
};

async fn delivery_order(seed: u64) -> Vec<String> {
    let cluster = SimulatedCluster::with_seed(seed);
    let stack = cluster
        .create_stack("replay", five_resource_template())
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();
    assert_eq!(cluster.stack(stack.id).await.state_label(), "CREATE_COMPLETE");
    cluster.plugin().resources_for(ResourceOperation::Create)
}

#[tokio::test]
async fn same_seed_replays_same_order() {
    for seed in [0, 7, 42] {
        assert_eq!(delivery_order(seed).await, delivery_order(seed).await);
    }
}

#[tokio::test]
async fn fifo_delivery_follows_submission_order() {
    let faults = FaultConfig {
        fifo: true,
        ..FaultConfig::no_faults()
    };
    let cluster = SimulatedCluster::with_config(0, test_engine_config(), faults);
    cluster
        .create_stack("fifo", flat_template(&["a", "b", "c"]))
        .await
        .unwrap();
    let submitted: Vec<_> = {
        let pending = cluster.take_pending();
        let ids = pending.iter().map(|r| r.resource_id).collect();
        for request in pending {
            cluster.deliver(request).await.unwrap();
        }
        ids
    };
    let delivered: Vec<_> = cluster.delivered().iter().map(|r| r.resource_id).collect();
    assert_eq!(delivered, submitted);
}

#[tokio::test]
async fn redelivery_is_recorded() {
    let cluster =
        SimulatedCluster::with_config(3, test_engine_config(), FaultConfig::always_redeliver());
    cluster
        .create_stack("dup", flat_template(&["a"]))
        .await
        .unwrap();
    assert_eq!(cluster.run_until_idle().await.unwrap(), 1);
    assert_eq!(cluster.delivered().len(), 2);
    assert_eq!(cluster.plugin().resources_for(ResourceOperation::Create), vec!["a"]);
}

#[tokio::test]
async fn scripted_failures_can_be_cleared() {
    let cluster = SimulatedCluster::new();
    cluster.plugin().fail("a", ResourceOperation::Create, "nope");
    cluster.plugin().clear_failures();
    let stack = cluster
        .create_stack("ok", flat_template(&["a"]))
        .await
        .unwrap();
    cluster.run_until_idle().await.unwrap();
    assert_eq!(cluster.stack(stack.id).await.state_label(), "CREATE_COMPLETE");
    assert_eq!(cluster.resource(stack.id, "a").physical_id.as_deref(), Some("a-1"));
}
