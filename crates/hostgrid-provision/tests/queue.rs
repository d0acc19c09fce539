mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use hostgrid_core::config::FailurePolicy;
use hostgrid_provision::sim::ops;
use hostgrid_provision::{conflict, ConsumerOutcome, ProvisioningQueue, QueueConsumer};
use hostgrid_state::InstanceStatus;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn duplicate_delivery_provisions_once() {
    let h = harness();
    let created = h
        .orchestrator
        .create(request("owner-1", "acme", "pro"))
        .await
        .unwrap();
    let consumer = QueueConsumer::new(h.orchestrator.clone());
    let cancel = CancellationToken::new();

    assert_eq!(consumer.handle(created.id, &cancel).await, ConsumerOutcome::Provisioned);
    assert_eq!(
        consumer.handle(created.id, &cancel).await,
        ConsumerOutcome::Skipped(InstanceStatus::Running)
    );
    assert_eq!(h.sim.call_count(ops::CREATE_NETWORK), 1);
}

#[tokio::test]
async fn concurrent_duplicate_deliveries_run_one_pipeline() {
    let h = harness();
    h.sim.delay(ops::CREATE_NETWORK, Duration::from_millis(50));
    let created = h
        .orchestrator
        .create(request("owner-1", "acme", "pro"))
        .await
        .unwrap();
    let consumer = QueueConsumer::new(h.orchestrator.clone());
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        consumer.handle(created.id, &cancel),
        consumer.handle(created.id, &cancel)
    );
    let mut outcomes = [a, b];
    outcomes.sort_by_key(|o| matches!(o, ConsumerOutcome::Provisioned));
    assert_eq!(
        outcomes,
        [
            ConsumerOutcome::Skipped(InstanceStatus::Provisioning),
            ConsumerOutcome::Provisioned
        ]
    );
    assert_eq!(h.sim.call_count(ops::CREATE_NETWORK), 1);
}

#[tokio::test]
async fn stale_delivery_for_destroyed_instance_is_skipped() {
    let h = harness();
    let instance = h.running("acme").await;
    let cancel = CancellationToken::new();
    h.orchestrator.destroy(instance.id, &cancel).await.unwrap();

    let consumer = QueueConsumer::new(h.orchestrator.clone());
    assert_eq!(
        consumer.handle(instance.id, &cancel).await,
        ConsumerOutcome::Skipped(InstanceStatus::Destroyed)
    );
}

#[tokio::test]
async fn unknown_id_is_an_error_outcome() {
    let h = harness();
    let consumer = QueueConsumer::new(h.orchestrator.clone());
    assert_eq!(
        consumer.handle(7, &CancellationToken::new()).await,
        ConsumerOutcome::Errored
    );
}

#[tokio::test]
async fn failure_policy_decides_what_happens_to_failed_instances() {
    let cancel = CancellationToken::new();

    let h = harness();
    h.sim.fail(ops::CREATE_BUCKET);
    let created = h
        .orchestrator
        .create(request("owner-1", "acme", "pro"))
        .await
        .unwrap();
    let leave = QueueConsumer::new(h.orchestrator.clone()).with_policy(FailurePolicy::Leave);
    assert_eq!(leave.handle(created.id, &cancel).await, ConsumerOutcome::Failed);
    assert_eq!(
        h.store.get_instance(created.id).unwrap().unwrap().status,
        InstanceStatus::Failed
    );

    let h = harness();
    h.sim.fail(ops::CREATE_BUCKET);
    let created = h
        .orchestrator
        .create(request("owner-1", "acme", "pro"))
        .await
        .unwrap();
    let destroy = QueueConsumer::new(h.orchestrator.clone()).with_policy(FailurePolicy::Destroy);
    assert_eq!(
        destroy.handle(created.id, &cancel).await,
        ConsumerOutcome::FailedAndDestroyed
    );
    assert_eq!(
        h.store.get_instance(created.id).unwrap().unwrap().status,
        InstanceStatus::Destroyed
    );
    let infra = h.store.get_infrastructure(created.id).unwrap().unwrap();
    assert!(infra.network_id.is_none());
    assert!(!infra.holds_secrets());
}

#[tokio::test]
async fn recover_re_enqueues_pending_instances() {
    let h = harness();
    let a = h
        .orchestrator
        .create(request("owner-1", "alpha", "pro"))
        .await
        .unwrap();
    let b = h
        .orchestrator
        .create(request("owner-1", "beta", "pro"))
        .await
        .unwrap();
    h.running("gamma").await;
    // Drain what create enqueued, as if the messages were lost.
    for _ in 0..3 {
        h.queue.dequeue().await.unwrap();
    }

    let consumer = QueueConsumer::new(h.orchestrator.clone());
    assert_eq!(consumer.recover().await.unwrap(), 2);
    let mut recovered = vec![h.queue.dequeue().await.unwrap(), h.queue.dequeue().await.unwrap()];
    recovered.sort();
    assert_eq!(recovered, vec![a.id, b.id]);
}

#[tokio::test]
async fn run_loop_provisions_until_shutdown() {
    let h = harness();
    let consumer = Arc::new(QueueConsumer::new(h.orchestrator.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    let created = h
        .orchestrator
        .create(request("owner-1", "acme", "pro"))
        .await
        .unwrap();
    let store = h.store.clone();
    assert!(
        eventually(|| {
            store.get_instance(created.id).unwrap().unwrap().status == InstanceStatus::Running
        })
        .await
    );

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_cancels_in_flight_provisioning() {
    let h = harness();
    h.sim.delay(ops::CREATE_DATABASE, Duration::from_secs(30));
    let consumer = Arc::new(QueueConsumer::new(h.orchestrator.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(consumer.run(shutdown_rx));

    let created = h
        .orchestrator
        .create(request("owner-1", "acme", "pro"))
        .await
        .unwrap();
    let sim = h.sim.clone();
    assert!(eventually(|| sim.call_count(ops::CREATE_DATABASE) == 1).await);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        h.store.get_instance(created.id).unwrap().unwrap().status,
        InstanceStatus::Failed
    );

    // What the interrupted run created is on record and can be released.
    let network_id = h
        .store
        .get_infrastructure(created.id)
        .unwrap()
        .unwrap()
        .network_id
        .unwrap();
    let destroyed = h
        .orchestrator
        .destroy(created.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(destroyed.status, InstanceStatus::Destroyed);
    assert!(!h.sim.has_network(&network_id));
    let after = h.store.get_infrastructure(created.id).unwrap().unwrap();
    assert!(!after.holds_secrets());
    assert!(after.network_id.is_none());
}

#[tokio::test]
async fn racing_destroys_have_exactly_one_winner() {
    let h = harness();
    let instance = h.running("acme").await;
    h.sim.delay(ops::STOP_CONTAINER, Duration::from_millis(50));

    let first = CancellationToken::new();
    let second = CancellationToken::new();
    let (a, b) = tokio::join!(
        h.orchestrator.destroy(instance.id, &first),
        h.orchestrator.destroy(instance.id, &second)
    );

    let results = [a, b];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(loser.conflict_code(), Some(conflict::CONCURRENT_MODIFICATION));

    let err = h
        .orchestrator
        .destroy(instance.id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(conflict::INSTANCE_DESTROYED));
    assert!(h.store.get_worker_id(instance.worker_id.unwrap()).unwrap().is_tombstoned);
}

#[tokio::test]
async fn concurrent_creates_for_one_subdomain_have_one_winner() {
    let h = harness();
    let (a, b) = tokio::join!(
        h.orchestrator.create(request("owner-1", "acme", "pro")),
        h.orchestrator.create(request("owner-2", "acme", "pro"))
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(loser.conflict_code(), Some(conflict::SUBDOMAIN_TAKEN));
}
