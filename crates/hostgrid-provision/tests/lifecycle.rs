mod common;

use std::time::Duration;

use common::*;
use hostgrid_provision::sim::ops;
use hostgrid_provision::{conflict, OrchestratorError, DESTRUCTION_STEPS};
use hostgrid_state::{EventStatus, InstanceStatus};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn destroy_releases_everything_and_tombstones_the_worker_id() {
    let h = harness();
    let instance = h.running("acme").await;
    let before = h.store.get_infrastructure(instance.id).unwrap().unwrap();

    let destroyed = h
        .orchestrator
        .destroy(instance.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(destroyed.status, InstanceStatus::Destroyed);
    assert!(destroyed.deleted_at.is_some());

    assert!(!h.sim.has_container(before.container_id.as_deref().unwrap()));
    assert!(!h.sim.has_network(before.network_id.as_deref().unwrap()));
    assert!(!h.sim.has_bucket(before.storage_bucket.as_deref().unwrap()));
    assert!(!h.sim.has_dns_record(before.dns_record_id.as_deref().unwrap()));
    assert!(!h.sim.has_route(before.proxy_route_id.as_deref().unwrap()));
    // Tenant data survives until dropped explicitly.
    assert!(h.sim.has_database(before.database_name.as_deref().unwrap()));

    let after = h.store.get_infrastructure(instance.id).unwrap().unwrap();
    assert!(!after.holds_secrets());
    assert!(after.container_id.is_none());
    assert!(after.storage_access_key.is_none());

    let entry = h.store.get_worker_id(instance.worker_id.unwrap()).unwrap();
    assert!(entry.is_tombstoned);
    assert_eq!(h.store.domain_owner("acme.tenants.test").unwrap(), None);

    let destroy_steps: Vec<String> = h
        .store
        .list_events(instance.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.phase == hostgrid_state::EventPhase::Destroy && e.status == EventStatus::Succeeded)
        .map(|e| e.step_name)
        .collect();
    assert_eq!(destroy_steps, DESTRUCTION_STEPS.map(String::from).to_vec());
}

#[tokio::test]
async fn destroy_is_best_effort_for_every_step() {
    let faults = [
        (ops::STOP_CONTAINER, "stop_container"),
        (ops::DELETE_ROUTE, "remove_proxy_route"),
        (ops::DELETE_A_RECORD, "remove_dns_record"),
        (ops::REMOVE_CONTAINER, "remove_container"),
        (ops::REMOVE_NETWORK, "remove_network"),
        (ops::DELETE_BUCKET, "delete_storage_bucket"),
    ];
    let all_ops = [
        ops::STOP_CONTAINER,
        ops::DELETE_ROUTE,
        ops::DELETE_A_RECORD,
        ops::REMOVE_CONTAINER,
        ops::REMOVE_NETWORK,
        ops::DELETE_BUCKET,
    ];

    for (op, step) in faults {
        let h = harness();
        let instance = h.running("acme").await;
        h.sim.fail(op);

        let destroyed = h
            .orchestrator
            .destroy(instance.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(destroyed.status, InstanceStatus::Destroyed, "{step}");
        assert_eq!(h.failed_steps(instance.id), vec![step.to_string()]);
        for other in all_ops {
            assert_eq!(h.sim.call_count(other), 1, "{step}: {other}");
        }
        assert!(
            !h.store
                .get_infrastructure(instance.id)
                .unwrap()
                .unwrap()
                .holds_secrets(),
            "{step}"
        );
    }
}

#[tokio::test]
async fn failed_teardown_leaves_the_handle_for_the_reconciler() {
    let h = harness();
    let instance = h.running("acme").await;
    h.sim.fail(ops::DELETE_BUCKET);
    h.orchestrator
        .destroy(instance.id, &CancellationToken::new())
        .await
        .unwrap();

    let infra = h.store.get_infrastructure(instance.id).unwrap().unwrap();
    assert!(infra.storage_bucket.is_some());
    assert!(infra.holds_resources());
}

#[tokio::test]
async fn destroying_twice_reports_already_destroyed() {
    let h = harness();
    let instance = h.running("acme").await;
    let cancel = CancellationToken::new();
    h.orchestrator.destroy(instance.id, &cancel).await.unwrap();
    let calls = h.sim.calls().len();

    let err = h.orchestrator.destroy(instance.id, &cancel).await.unwrap_err();
    assert_eq!(err.conflict_code(), Some(conflict::INSTANCE_DESTROYED));
    assert_eq!(h.sim.calls().len(), calls);
}

#[tokio::test]
async fn destroy_of_unknown_instance_is_not_found() {
    let h = harness();
    let err = h
        .orchestrator
        .destroy(42, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn failed_instance_can_be_destroyed() {
    let h = harness();
    h.sim.fail(ops::START_CONTAINER);
    let created = h
        .orchestrator
        .create(request("owner-1", "acme", "pro"))
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    h.orchestrator.provision(created.id, &cancel).await.unwrap_err();

    let destroyed = h.orchestrator.destroy(created.id, &cancel).await.unwrap();
    assert_eq!(destroyed.status, InstanceStatus::Destroyed);
    // No container was ever recorded, so nothing tried to stop one.
    assert_eq!(h.sim.call_count(ops::STOP_CONTAINER), 0);
    assert_eq!(h.sim.call_count(ops::REMOVE_NETWORK), 1);
}

#[tokio::test]
async fn subdomain_is_reusable_after_destroy() {
    let h = harness();
    let first = h.running("acme").await;
    h.orchestrator
        .destroy(first.id, &CancellationToken::new())
        .await
        .unwrap();

    let second = h.running("acme").await;
    assert_ne!(second.id, first.id);
    assert_eq!(second.status, InstanceStatus::Running);
    assert_ne!(second.worker_id, first.worker_id);
}

#[tokio::test]
async fn destroyed_instances_do_not_count_against_quota() {
    let h = harness();
    let cancel = CancellationToken::new();
    let first = h
        .orchestrator
        .create(request("owner-1", "first", "free"))
        .await
        .unwrap();
    h.orchestrator.provision(first.id, &cancel).await.unwrap();
    h.orchestrator.destroy(first.id, &cancel).await.unwrap();

    let second = h
        .orchestrator
        .create(request("owner-1", "second", "free"))
        .await
        .unwrap();
    h.orchestrator.provision(second.id, &cancel).await.unwrap();
}

#[tokio::test]
async fn cancelled_destroy_does_not_finalize() {
    let h = harness();
    let instance = h.running("acme").await;
    h.sim.delay(ops::STOP_CONTAINER, Duration::from_secs(5));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .orchestrator
        .destroy(instance.id, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));
    let current = h.store.get_instance(instance.id).unwrap().unwrap();
    assert_eq!(current.status, InstanceStatus::Running);
    assert!(!h.store.get_worker_id(instance.worker_id.unwrap()).unwrap().is_tombstoned);
    assert!(h.store.get_infrastructure(instance.id).unwrap().unwrap().holds_secrets());
    assert_eq!(h.sim.call_count(ops::STOP_CONTAINER), 0);
}

#[tokio::test]
async fn destroy_is_refused_while_a_pipeline_owns_the_instance() {
    let h = harness();
    h.sim.delay(ops::CREATE_DATABASE, Duration::from_millis(300));
    let created = h
        .orchestrator
        .create(request("owner-1", "acme", "pro"))
        .await
        .unwrap();
    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .provision(created.id, &CancellationToken::new())
            .await
    });
    let sim = h.sim.clone();
    assert!(eventually(|| sim.call_count(ops::CREATE_DATABASE) == 1).await);

    let err = h
        .orchestrator
        .destroy(created.id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(conflict::INVALID_STATE));

    run.await.unwrap().unwrap();
    let instance = h.store.get_instance(created.id).unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert!(!h.store.get_worker_id(instance.worker_id.unwrap()).unwrap().is_tombstoned);
    assert_eq!(h.store.domain_owner("acme.tenants.test").unwrap(), Some(created.id));
    for op in [ops::STOP_CONTAINER, ops::REMOVE_NETWORK, ops::DELETE_BUCKET] {
        assert_eq!(h.sim.call_count(op), 0, "{op}");
    }

    // Once the run is over the instance can be destroyed as usual.
    let destroyed = h
        .orchestrator
        .destroy(created.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(destroyed.status, InstanceStatus::Destroyed);
}

#[tokio::test]
async fn drop_database_only_after_destroy() {
    let h = harness();
    let instance = h.running("acme").await;
    let cancel = CancellationToken::new();
    let name = h
        .store
        .get_infrastructure(instance.id)
        .unwrap()
        .unwrap()
        .database_name
        .unwrap();

    let err = h
        .orchestrator
        .drop_database(instance.id, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(conflict::INVALID_STATE));

    h.orchestrator.destroy(instance.id, &cancel).await.unwrap();
    h.orchestrator.drop_database(instance.id, &cancel).await.unwrap();
    assert!(!h.sim.has_database(&name));
    let infra = h.store.get_infrastructure(instance.id).unwrap().unwrap();
    assert!(infra.database_name.is_none());
    assert!(!infra.holds_resources());

    // A second drop has nothing left to do.
    h.orchestrator.drop_database(instance.id, &cancel).await.unwrap();
    assert_eq!(h.sim.call_count(ops::DROP_DATABASE), 1);
}

#[tokio::test]
async fn suspend_notifies_waits_and_stops() {
    let h = harness();
    let instance = h.running("acme").await;
    let container = h
        .store
        .get_infrastructure(instance.id)
        .unwrap()
        .unwrap()
        .container_id
        .unwrap();

    let suspended = h
        .orchestrator
        .suspend(instance.id, "billing overdue", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(suspended.status, InstanceStatus::Suspended);
    assert_eq!(
        h.sim.notices(),
        vec![("acme.tenants.test".to_string(), "billing overdue".to_string())]
    );
    assert!(h.sim.has_container(&container));
    assert!(!h.sim.container_running(&container));

    let calls = h.sim.calls();
    let notice = calls.iter().position(|c| c == ops::NOTIFY_SHUTTING_DOWN).unwrap();
    let stop = calls.iter().position(|c| c == ops::STOP_CONTAINER).unwrap();
    assert!(notice < stop);
}

#[tokio::test]
async fn suspend_proceeds_when_the_notice_cannot_be_delivered() {
    let h = harness();
    let instance = h.running("acme").await;
    h.sim.fail(ops::NOTIFY_SHUTTING_DOWN);
    let suspended = h
        .orchestrator
        .suspend(instance.id, "maintenance", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(suspended.status, InstanceStatus::Suspended);
}

#[tokio::test]
async fn suspend_cancelled_during_grace_keeps_running() {
    let mut config = test_config();
    config.provisioning.suspend_grace = "5s".to_string();
    let h = harness_with(config);
    let instance = h.running("acme").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = h
        .orchestrator
        .suspend(instance.id, "maintenance", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));
    assert_eq!(h.sim.call_count(ops::STOP_CONTAINER), 0);
    assert_eq!(
        h.store.get_instance(instance.id).unwrap().unwrap().status,
        InstanceStatus::Running
    );
}

#[tokio::test]
async fn resume_starts_a_fresh_container_with_the_same_credentials() {
    let h = harness();
    let instance = h.running("acme").await;
    let cancel = CancellationToken::new();
    let old = h
        .store
        .get_infrastructure(instance.id)
        .unwrap()
        .unwrap()
        .container_id
        .unwrap();
    let old_env = h.sim.container_env(&old).unwrap();

    h.orchestrator
        .suspend(instance.id, "maintenance", &cancel)
        .await
        .unwrap();
    let resumed = h.orchestrator.resume(instance.id, &cancel).await.unwrap();
    assert_eq!(resumed.status, InstanceStatus::Running);

    let new = h
        .store
        .get_infrastructure(instance.id)
        .unwrap()
        .unwrap()
        .container_id
        .unwrap();
    assert_ne!(new, old);
    assert!(!h.sim.has_container(&old));
    assert!(h.sim.container_running(&new));

    let env = h.sim.container_env(&new).unwrap();
    assert_eq!(env["DATABASE_PASSWORD"], old_env["DATABASE_PASSWORD"]);
    assert_eq!(env["STORAGE_SECRET_KEY"], old_env["STORAGE_SECRET_KEY"]);
    assert_eq!(env["HOSTGRID_WORKER_ID"], old_env["HOSTGRID_WORKER_ID"]);
    assert!(!env.contains_key("BOOTSTRAP_TOKEN"));
    assert!(h.sim.serves("acme.tenants.test"));
}

#[tokio::test]
async fn lifecycle_operations_check_the_current_status() {
    let h = harness();
    let instance = h.running("acme").await;
    let cancel = CancellationToken::new();

    let err = h.orchestrator.resume(instance.id, &cancel).await.unwrap_err();
    assert_eq!(err.conflict_code(), Some(conflict::INVALID_STATE));

    h.orchestrator.destroy(instance.id, &cancel).await.unwrap();
    let err = h
        .orchestrator
        .suspend(instance.id, "late", &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(conflict::INSTANCE_DESTROYED));
    assert!(h.sim.notices().is_empty());
}

#[tokio::test]
async fn suspended_instance_can_be_destroyed() {
    let h = harness();
    let instance = h.running("acme").await;
    let cancel = CancellationToken::new();
    h.orchestrator
        .suspend(instance.id, "maintenance", &cancel)
        .await
        .unwrap();
    let destroyed = h.orchestrator.destroy(instance.id, &cancel).await.unwrap();
    assert_eq!(destroyed.status, InstanceStatus::Destroyed);
}
