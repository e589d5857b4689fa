//! Unit tests for the top-level machine reconciler

#[cfg(test)]
mod tests {
    use crate::error::{ControllerError, ErrorKind};
    use crate::events::reasons;
    use crate::reconcile_helpers::{ReconcileOutcome, TRANSIENT_ERROR_INTERVAL, WAIT_FOR_DEPENDENCY_INTERVAL};
    use crate::reconciler::Reconciler;
    use crate::session::SessionCache;
    use crate::test_utils::*;
    use crds::{
        MachineState, NetworkDeviceSpec, OperationKind, VSphereMachine, BOOTSTRAP_DATA_KEY,
        IPAM_CONFIG_SECRET_KEY, IPAM_MANAGED_ANNOTATION, VSPHERE_MACHINE_FINALIZER,
    };
    use ipam_client::{MockAgentFactory, MockIpamAgent, NetworkType};
    use kube::ResourceExt;
    use kube_runtime::controller::Action;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use vsphere_client::{MockCall, VirtualMachinePowerState};

    struct Harness {
        fixture: VCenterFixture,
        store: Arc<MockMachineStore>,
        events: Arc<RecordingEventPublisher>,
        agent: MockIpamAgent,
        reconciler: Reconciler,
    }

    impl Harness {
        fn new() -> Self {
            let fixture = VCenterFixture::new();
            let store = Arc::new(MockMachineStore::default());
            store.add_cluster(&test_cluster());
            store.add_secret(
                NAMESPACE,
                IPAM_SECRET,
                &[(IPAM_CONFIG_SECRET_KEY, br#"{"url": "http://ipam.lab:8080"}"#.as_slice())],
            );
            store.add_secret(
                NAMESPACE,
                &bootstrap_secret("m1"),
                &[(BOOTSTRAP_DATA_KEY, b"#cloud-config\n".as_slice())],
            );
            let events = Arc::new(RecordingEventPublisher::default());
            let agent = MockIpamAgent::new();
            let reconciler = Reconciler::new(
                store.clone(),
                Arc::new(SessionCache::new(Arc::new(fixture.connector.clone()))),
                Arc::new(MockAgentFactory::new(agent.clone())),
                Arc::new(ScriptedShellFactory::default()),
                events.clone(),
                USERNAME,
                PASSWORD,
            );
            Self {
                fixture,
                store,
                events,
                agent,
                reconciler,
            }
        }

        /// Machine as the next watch event would deliver it
        fn current(&self) -> VSphereMachine {
            self.store.machine(NAMESPACE, "m1")
        }

        async fn pass(&self) -> Result<ReconcileOutcome, ControllerError> {
            self.reconciler.reconcile(&self.current()).await
        }
    }

    fn mark_deleted(machine: &mut VSphereMachine) {
        machine.metadata.deletion_timestamp =
            Some(serde_json::from_value(json!("2026-10-01T00:00:00Z")).unwrap());
    }

    fn with_finalizer(mut machine: VSphereMachine) -> VSphereMachine {
        machine
            .finalizers_mut()
            .push(VSPHERE_MACHINE_FINALIZER.to_string());
        machine
    }

    #[tokio::test]
    async fn first_pass_adds_finalizer_and_submits_clone() {
        let h = Harness::new();
        h.store.add_machine(&test_machine("m1"));

        let outcome = h.pass().await.unwrap();

        assert!(matches!(outcome, ReconcileOutcome::RetryAfter(_)));
        let stored = h.current();
        assert_eq!(stored.finalizers(), [VSPHERE_MACHINE_FINALIZER.to_string()]);
        let status = stored.status.unwrap();
        assert_eq!(status.task_kind, Some(OperationKind::Clone));
        assert_eq!(status.state, MachineState::Pending);
        assert!(status.last_reconciled.is_some());
        assert!(h
            .fixture
            .vcenter
            .calls()
            .iter()
            .any(|call| matches!(call, MockCall::Clone { name, .. } if name == "m1")));
        assert_eq!(h.events.reasons(), vec![reasons::CLONE_SUBMITTED]);
    }

    #[tokio::test]
    async fn missing_cluster_waits() {
        let h = Harness::new();
        let mut machine = test_machine("m1");
        machine.spec.cluster_name = "other".to_string();
        h.store.add_machine(&machine);

        let outcome = h.pass().await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::RetryAfter(WAIT_FOR_DEPENDENCY_INTERVAL));
        assert!(h.fixture.vcenter.calls().is_empty());
        assert_eq!(h.fixture.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn missing_bootstrap_secret_waits_without_cloning() {
        let h = Harness::new();
        let mut machine = test_machine("m1");
        machine.spec.bootstrap_data_secret = Some("not-yet".to_string());
        h.store.add_machine(&machine);

        let outcome = h.pass().await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::RetryAfter(WAIT_FOR_DEPENDENCY_INTERVAL));
        assert!(h.fixture.vcenter.calls().is_empty());
    }

    #[tokio::test]
    async fn validation_failure_is_recorded_and_not_requeued() {
        let h = Harness::new();
        let mut machine = test_machine("m1");
        machine.spec.disks = vec![crds::DiskSpec {
            label: "Hard disk 1".to_string(),
            size_gib: 5,
        }];
        h.store.add_machine(&machine);

        let err = h.pass().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().starts_with("machine default/m1: "));
        let status = h.current().status.unwrap();
        assert_eq!(status.failure_reason.as_deref(), Some("ValidationFailed"));
        assert_eq!(status.state, MachineState::Failed);
        assert!(!status.ready);
        assert_eq!(h.events.warnings(), vec![reasons::RECONCILE_FAILED]);
        assert_eq!(h.reconciler.error_action(&h.current(), &err), Action::await_change());
    }

    #[tokio::test]
    async fn external_failures_back_off() {
        let h = Harness::new();
        h.store.add_machine(&test_machine("m1"));
        h.fixture.vcenter.fail_next("clone_vm", "Insufficient resources");

        let err = h.pass().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::External);
        let status = h.current().status.unwrap();
        assert_eq!(status.failure_reason.as_deref(), Some("VSphereError"));
        assert_ne!(status.state, MachineState::Failed);

        let machine = h.current();
        let delays: Vec<Action> = (0..3).map(|_| h.reconciler.error_action(&machine, &err)).collect();
        assert_eq!(
            delays,
            vec![
                Action::requeue(Duration::from_secs(60)),
                Action::requeue(Duration::from_secs(60)),
                Action::requeue(Duration::from_secs(120)),
            ]
        );

        // A successful pass resets the sequence.
        h.pass().await.unwrap();
        assert_eq!(
            h.reconciler.error_action(&machine, &err),
            Action::requeue(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_retried_quietly() {
        let h = Harness::new();
        let mut cluster = test_cluster();
        cluster.metadata.name = Some("remote".to_string());
        cluster.spec.server = "vcenter.unreachable".to_string();
        h.store.add_cluster(&cluster);
        let mut machine = test_machine("m1");
        machine.spec.cluster_name = "remote".to_string();
        h.store.add_machine(&machine);

        let outcome = h.pass().await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::RetryAfter(TRANSIENT_ERROR_INTERVAL));
        let status = h.current().status.unwrap();
        assert!(status.failure_reason.is_none());
        assert!(h.events.warnings().is_empty());
    }

    #[tokio::test]
    async fn credentials_come_from_the_cluster_secret() {
        let h = Harness::new();
        h.fixture.connector.require_credentials(SERVER, "svc-capv", "hunter2");
        let mut cluster = test_cluster();
        cluster.spec.credentials_secret = Some("vc-creds".to_string());
        h.store.add_cluster(&cluster);
        h.store.add_machine(&test_machine("m1"));

        let err = h.pass().await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Machine { ref source, .. } if matches!(**source, ControllerError::InvalidConfig(_))
        ));

        h.store.add_secret(
            NAMESPACE,
            "vc-creds",
            &[("username", b"svc-capv".as_slice()), ("password", b"hunter2".as_slice())],
        );
        h.pass().await.unwrap();
        assert_eq!(h.fixture.connector.connect_count(), 1);
        assert_eq!(
            h.current().status.unwrap().task_kind,
            Some(OperationKind::Clone)
        );
    }

    #[tokio::test]
    async fn cluster_thumbprint_pins_the_connection() {
        let h = Harness::new();
        let mut cluster = test_cluster();
        cluster.spec.thumbprint = Some("3F:22:9C:01:AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99".to_string());
        h.store.add_cluster(&cluster);
        h.store.add_machine(&test_machine("m1"));

        h.pass().await.unwrap();

        let attempts = h.fixture.connector.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(
            attempts[0].thumbprint.as_deref(),
            Some("3F:22:9C:01:AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99")
        );
    }

    #[tokio::test]
    async fn leased_addresses_and_macs_are_written_back() {
        let h = Harness::new();
        h.store.add_machine(&test_machine_with_devices(
            "m1",
            vec![NetworkDeviceSpec {
                network_name: "VM Network".to_string(),
                ..Default::default()
            }],
        ));

        h.pass().await.unwrap();
        assert_eq!(h.agent.leased(NetworkType::Workload), vec!["10.2.0.10/24"]);
        let device = &h.current().spec.network.devices[0];
        assert_eq!(device.ip_addrs, vec!["10.2.0.10/24"]);
        assert!(device.mac_addr.is_none());

        // Once the clone exists the generated MAC lands in the spec.
        h.fixture.complete_last_task();
        h.pass().await.unwrap();
        let stored = h.current();
        let mac = stored.spec.network.devices[0].mac_addr.clone().unwrap();
        assert!(mac.starts_with("00:50:56:"));
        assert_eq!(stored.status.unwrap().network[0].mac_addr, mac);
        assert!(h
            .store
            .patches()
            .iter()
            .any(|patch| patch["spec"]["network"]["devices"][0]["macAddr"] == json!(mac)));
        assert_eq!(h.agent.leased(NetworkType::Workload).len(), 1);
    }

    #[tokio::test]
    async fn deletion_removes_vm_leases_and_finalizer() {
        let h = Harness::new();
        let mut props = template_props(
            &h.fixture.datastore,
            &h.fixture.network,
            &h.fixture.host,
            &h.fixture.root_pool,
        );
        props.instance_uuid = Some(MACHINE_UID.to_string());
        props.power_state = Some(VirtualMachinePowerState::PoweredOn);
        let vm = h.fixture.vcenter.add_vm(DATACENTER, "m1", props);

        let mut machine = with_finalizer(test_machine("m1"));
        machine.annotations_mut().insert(
            IPAM_MANAGED_ANNOTATION.to_string(),
            r#"{"workload":["10.2.0.7/24"]}"#.to_string(),
        );
        machine.status = Some(crds::VSphereMachineStatus {
            machine_ref: Some(vm.value.clone()),
            ..Default::default()
        });
        mark_deleted(&mut machine);
        h.store.add_machine(&machine);

        let outcome = h.pass().await.unwrap();
        assert!(!outcome.is_done());
        assert_eq!(h.current().status.unwrap().state, MachineState::Deleting);
        assert_eq!(h.current().finalizers(), [VSPHERE_MACHINE_FINALIZER.to_string()]);

        h.fixture.complete_last_task();
        h.pass().await.unwrap();
        h.fixture.complete_last_task();
        let outcome = h.pass().await.unwrap();

        assert!(outcome.is_done());
        assert_eq!(
            h.fixture.vcenter.calls(),
            vec![MockCall::PowerOff(vm.clone()), MockCall::Destroy(vm.clone())]
        );
        assert!(h.fixture.vcenter.vm(&vm).is_none());
        assert_eq!(
            h.agent.releases(),
            vec![(NetworkType::Workload, vec!["10.2.0.7/24".to_string()])]
        );
        let stored = h.current();
        assert!(stored.finalizers().is_empty());
        assert!(!stored.annotations().contains_key(IPAM_MANAGED_ANNOTATION));
    }

    #[tokio::test]
    async fn deletion_without_vm_releases_the_finalizer_at_once() {
        let h = Harness::new();
        let mut machine = with_finalizer(test_machine("m1"));
        mark_deleted(&mut machine);
        h.store.add_machine(&machine);

        let outcome = h.pass().await.unwrap();

        assert!(outcome.is_done());
        assert!(h.current().finalizers().is_empty());
        assert_eq!(h.fixture.connector.connect_count(), 0);
        assert!(h.store.status_patches().is_empty());
    }

    #[tokio::test]
    async fn deletion_without_finalizer_is_a_noop() {
        let h = Harness::new();
        let mut machine = test_machine("m1");
        mark_deleted(&mut machine);
        h.store.add_machine(&machine);

        assert!(h.pass().await.unwrap().is_done());
        assert!(h.store.patches().is_empty());
    }

    #[tokio::test]
    async fn deletion_waits_for_a_vanished_cluster() {
        let h = Harness::new();
        let mut machine = with_finalizer(test_machine("m1"));
        machine.spec.cluster_name = "gone".to_string();
        machine.status = Some(crds::VSphereMachineStatus {
            machine_ref: Some("vm-42".to_string()),
            ..Default::default()
        });
        mark_deleted(&mut machine);
        h.store.add_machine(&machine);

        let outcome = h.pass().await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::RetryAfter(WAIT_FOR_DEPENDENCY_INTERVAL));
        assert_eq!(h.current().finalizers(), [VSPHERE_MACHINE_FINALIZER.to_string()]);
    }

    #[tokio::test]
    async fn unchanged_status_is_not_rewritten() {
        let h = Harness::new();
        let mut machine = test_machine("m1");
        machine.spec.bootstrap_data_secret = Some("not-yet".to_string());
        h.store.add_machine(&machine);

        h.pass().await.unwrap();
        h.pass().await.unwrap();

        assert_eq!(h.store.status_patches().len(), 1);
    }

    #[tokio::test]
    async fn failed_clone_task_holds_until_the_machine_is_edited() {
        let h = Harness::new();
        h.store.add_machine(&test_machine("m1"));
        let clones = || {
            h.fixture
                .vcenter
                .calls()
                .iter()
                .filter(|call| matches!(call, MockCall::Clone { .. }))
                .count()
        };

        h.pass().await.unwrap();
        let task = h.fixture.vcenter.last_task().unwrap();
        h.fixture.vcenter.fail_task(&task, "Cannot complete the operation due to an incorrect request.");

        let err = h.pass().await.unwrap_err();
        assert_eq!(err.reason(), "TaskFailed");
        assert_eq!(h.reconciler.error_action(&h.current(), &err), Action::await_change());
        let status = h.current().status.unwrap();
        assert_eq!(status.failure_reason.as_deref(), Some("TaskFailed"));
        assert_eq!(status.state, MachineState::Failed);
        assert_eq!(status.failed_generation, Some(1));

        // Watch events caused by the status write must not resubmit the clone.
        let writes = h.store.status_patches().len();
        for _ in 0..2 {
            assert_eq!(h.pass().await.unwrap(), ReconcileOutcome::AwaitChange);
        }
        assert_eq!(clones(), 1);
        assert_eq!(h.store.status_patches().len(), writes);
        assert_eq!(
            h.current().status.unwrap().failure_reason.as_deref(),
            Some("TaskFailed")
        );

        let mut edited = h.current();
        edited.metadata.generation = Some(2);
        h.store.add_machine(&edited);
        assert!(matches!(h.pass().await.unwrap(), ReconcileOutcome::RetryAfter(_)));
        assert_eq!(clones(), 2);
        assert!(h.current().status.unwrap().failed_generation.is_none());
    }
}
