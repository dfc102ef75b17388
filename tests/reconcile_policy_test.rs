//! Behaviour of the public reconcile helpers, seen from outside the crate

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hetzner_k8s::controller::action::{ActionResult, Backoff, ReconcileOutcome};
use hetzner_k8s::controller::events::{EventType, MemoryEventSink, Recorder};
use hetzner_k8s::controller::failure_domain::{resolve_failure_domain, select_failure_domain};
use hetzner_k8s::crd::{ErrorType, FailureDomainSpec};
use hetzner_k8s::ssh::remove_useless_lines_from_cloud_init_output;
use k8s_openapi::api::core::v1::ObjectReference;

#[test]
fn backoff_stays_within_half_and_full_base() {
    let backoff = Backoff::from_entropy();
    for count in -2..15 {
        let base = Backoff::base(count);
        for _ in 0..20 {
            let delay = backoff.calculate(count);
            assert!(delay <= base, "count {count}: {delay:?} > {base:?}");
            assert!(delay > base / 2, "count {count}: {delay:?} <= half of {base:?}");
        }
    }
    assert_eq!(Backoff::base(0), Duration::from_secs(60));
    assert_eq!(Backoff::base(9), Backoff::base(40));
}

#[test]
fn seeded_backoff_is_reproducible() {
    let a = Backoff::seeded(7);
    let b = Backoff::seeded(7);
    for count in 0..5 {
        assert_eq!(a.calculate(count), b.calculate(count));
    }
}

#[test]
fn failed_action_requeues_with_backoff() {
    let backoff = Backoff::seeded(1);
    let outcome = ActionResult::failed(ErrorType::SshRebootTriggered, 3)
        .into_outcome(&backoff)
        .unwrap();
    let delay = outcome.requeue_after.unwrap();
    assert!(delay <= Duration::from_secs(480) && delay > Duration::from_secs(240));

    assert_eq!(
        ActionResult::Complete.into_outcome(&backoff).unwrap(),
        ReconcileOutcome::now()
    );
    assert_eq!(
        ActionResult::Stop.into_outcome(&backoff).unwrap(),
        ReconcileOutcome::done()
    );
}

fn domains() -> BTreeMap<String, FailureDomainSpec> {
    [("fsn1", true), ("hel1", false), ("nbg1", true)]
        .into_iter()
        .map(|(name, cp)| (name.to_string(), FailureDomainSpec { control_plane: cp }))
        .collect()
}

#[test]
fn control_planes_only_land_in_control_plane_domains() {
    let set = domains();
    for i in 0..50 {
        let name = format!("cp-{i}");
        let domain = select_failure_domain(&set, &name, true).unwrap();
        assert_ne!(domain, "hel1");
        assert_eq!(select_failure_domain(&set, &name, true).unwrap(), domain);
    }
}

#[test]
fn explicit_failure_domain_wins() {
    let set = domains();
    assert_eq!(
        resolve_failure_domain(Some("hel1"), &set, "cp-0", true).unwrap(),
        "hel1"
    );
    assert!(resolve_failure_domain(None, &BTreeMap::new(), "worker-0", false).is_err());
}

#[test]
fn cloud_init_noise_is_filtered() {
    let log = "Cloud-init v. 23.1 running 'init'\n\
               Setting up kubelet (1.30.1-1.1) ...\n\
               Unpacking kubectl (1.30.1-1.1) ...\n\
               [kubelet-start] Starting the kubelet";
    assert_eq!(
        remove_useless_lines_from_cloud_init_output(log),
        "Cloud-init v. 23.1 running 'init'\n[kubelet-start] Starting the kubelet"
    );
}

#[test]
fn recorder_collects_events_in_order() {
    let sink = Arc::new(MemoryEventSink::new());
    let recorder = Recorder::new(
        sink.clone(),
        ObjectReference {
            kind: Some("HetznerBareMetalHost".into()),
            name: Some("bm-1".into()),
            ..Default::default()
        },
    );

    tokio_test::block_on(async {
        recorder.normal("ServerRebooted", "rebooted").await;
        recorder.warn("FailedRebootServer", "boom").await;
    });

    let events = sink.events();
    assert_eq!(sink.reasons(), vec!["ServerRebooted", "FailedRebootServer"]);
    assert_eq!(events[1].type_, EventType::Warning);
    assert_eq!(events[0].object.name.as_deref(), Some("bm-1"));
}
