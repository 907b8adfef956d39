use std::{sync::Mutex, time::Duration};

use pretty_assertions::assert_eq;

use crate::{
    capability::{CertificateArn, Fault, IotCapability, Operation},
    endpoint::EndpointResolver,
    memory::InMemoryIot,
    observe::{Event, LogObserver, Observer},
    provision::{ProvisioningError, ProvisioningPipeline},
    step::StepName,
    teardown::{StepOutcome, TeardownPipeline},
};

const POLICY: &str = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":"iot:*","Resource":"*"}]}"#;

/// Remembers step events so tests can check ordering.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn compensated(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("undo ").map(str::to_owned))
            .collect()
    }
}

impl Observer for Recorder {
    fn observe(&self, event: &Event<'_>) {
        let line = match event {
            Event::StepSucceeded { step } => format!("done {step}"),
            Event::StepFailed { step, .. } => format!("fail {step}"),
            Event::StepAlreadyAbsent { step, .. } => format!("absent {step}"),
            Event::Compensated { step } => format!("undo {step}"),
            Event::CompensationFailed { step, .. } => format!("undo failed {step}"),
            Event::CertificateCreated { fingerprint, .. } => format!("certificate {fingerprint}"),
            Event::PrincipalDetached { principal, .. } => format!("detached principal {principal}"),
            Event::PolicyDetached { policy_name, .. } => format!("detached policy {policy_name}"),
            Event::ItemAlreadyAbsent { item, .. } => format!("already absent {item}"),
            _ => return,
        };
        self.events.lock().unwrap().push(line);
    }
}

#[tokio::test]
async fn provisions_sensor_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();
    let iot = InMemoryIot::default();
    let observer = LogObserver::new("sensor-test");

    let result = ProvisioningPipeline::new(&iot, &observer)
        .run("sensor-01", POLICY)
        .await
        .unwrap();

    assert_eq!("sensor-01-cfn_created", result.policy_name);
    assert_eq!(
        "arn:aws:iot:us-east-1:123456789012:thing/sensor-01",
        result.thing_arn
    );
    assert_eq!(
        "a1b2c3d4e5f6g7-ats.iot.us-east-1.amazonaws.com",
        result.endpoint_data_ats
    );
    assert!(!result.private_key_pem.is_empty());
    assert!(iot.has_thing("sensor-01"));
    assert!(iot.has_certificate(&result.certificate_arn));
    assert_eq!(
        vec![result.certificate_arn.to_string()],
        iot.thing_principals("sensor-01")
    );
    assert_eq!(
        vec![result.certificate_arn.to_string()],
        iot.policy_targets("sensor-01-cfn_created")
    );
}

#[tokio::test]
async fn a_failure_at_any_step_leaves_nothing_behind() {
    let cases = [
        (Operation::CreateThing, StepName::CreateThing, 0),
        (Operation::CreateCertificateAndKey, StepName::CreateCertificate, 1),
        (Operation::CreatePolicy, StepName::CreatePolicy, 2),
        (Operation::AttachPolicy, StepName::AttachPolicy, 3),
        (Operation::AttachThingPrincipal, StepName::AttachThingPrincipal, 4),
    ];
    for (operation, step, completed) in cases {
        let iot = InMemoryIot::default();
        iot.fail(operation, Fault::Other);
        let observer = Recorder::default();

        let err = ProvisioningPipeline::new(&iot, &observer)
            .run("sensor-01", POLICY)
            .await
            .unwrap_err();

        assert_eq!(Some(step), err.failed_step(), "{operation}");
        let ProvisioningError::Step { rollback, .. } = &err else {
            panic!("expected a step failure, saw {err}");
        };
        assert!(rollback.is_clean(), "{operation}: {rollback}");
        assert_eq!(completed, rollback.compensated.len(), "{operation}");
        assert!(iot.is_empty(), "{operation} left resources behind");
        assert_eq!(0, iot.call_count(Operation::DescribeEndpoint));
    }
}

#[tokio::test]
async fn compensation_runs_in_reverse() {
    let iot = InMemoryIot::default();
    iot.fail(Operation::AttachThingPrincipal, Fault::Throttled);
    let observer = Recorder::default();

    ProvisioningPipeline::new(&iot, &observer)
        .run("sensor-01", POLICY)
        .await
        .unwrap_err();

    assert_eq!(
        vec![
            "attach policy",
            "create policy",
            "create certificate",
            "create thing",
        ],
        observer.compensated()
    );
    // certificates are only ever identified by fingerprint
    assert!(observer
        .events()
        .iter()
        .any(|e| e.strip_prefix("certificate ").is_some_and(|f| f.len() == 64)));
}

#[tokio::test]
async fn failed_compensation_is_reported_and_the_rest_still_runs() {
    let iot = InMemoryIot::default();
    iot.fail(Operation::AttachPolicy, Fault::Other);
    iot.fail(Operation::DeletePolicy, Fault::Other);
    let observer = Recorder::default();

    let err = ProvisioningPipeline::new(&iot, &observer)
        .run("sensor-01", POLICY)
        .await
        .unwrap_err();

    let ProvisioningError::Step { rollback, .. } = err else {
        panic!("expected a step failure");
    };
    assert_eq!(
        vec![StepName::CreatePolicy],
        rollback.failed.iter().map(|f| f.step).collect::<Vec<_>>()
    );
    assert_eq!(
        vec![StepName::CreateCertificate, StepName::CreateThing],
        rollback.compensated
    );
    assert!(iot.has_policy("sensor-01-cfn_created"));
    assert!(!iot.has_thing("sensor-01"));
}

#[tokio::test(start_paused = true)]
async fn unresolvable_endpoint_tears_down_the_new_resources() {
    let iot = InMemoryIot::default();
    iot.fail(Operation::DescribeEndpoint, Fault::Other);
    let observer = LogObserver::new("endpoint-test");

    let err = ProvisioningPipeline::new(&iot, &observer)
        .with_resolver(
            EndpointResolver::new(&observer)
                .with_interval(Duration::from_millis(50))
                .with_max_attempts(Some(3)),
        )
        .run("sensor-01", POLICY)
        .await
        .unwrap_err();

    let ProvisioningError::Endpoint { teardown, .. } = err else {
        panic!("expected an endpoint failure");
    };
    assert!(teardown.succeeded(), "{teardown}");
    assert_eq!(3, iot.call_count(Operation::DescribeEndpoint));
    assert!(iot.is_empty());
}

#[tokio::test]
async fn teardown_detaches_every_principal() {
    let iot = InMemoryIot::default();
    let observer = Recorder::default();
    let result = ProvisioningPipeline::new(&iot, &observer)
        .run("sensor-01", POLICY)
        .await
        .unwrap();

    // attached by someone else after provisioning
    let stranger = iot.create_certificate_and_key().await.unwrap();
    iot.attach_thing_principal("sensor-01", stranger.certificate_arn.as_str())
        .await
        .unwrap();
    assert_eq!(2, iot.thing_principals("sensor-01").len());

    let report = TeardownPipeline::new(&iot, &observer)
        .run("sensor-01", &result.certificate_arn, &result.policy_name)
        .await;

    assert!(report.succeeded(), "{report}");
    assert_eq!(2, iot.call_count(Operation::DetachThingPrincipal));
    assert!(!iot.has_thing("sensor-01"));
    assert!(!iot.has_policy(&result.policy_name));
    assert!(!iot.has_certificate(&result.certificate_arn));
    assert!(iot.has_certificate(&stranger.certificate_arn));
    let events = observer.events();
    for principal in [&result.certificate_arn, &stranger.certificate_arn] {
        assert!(
            events.contains(&format!("detached principal {principal}")),
            "{events:?}"
        );
    }
}

#[tokio::test]
async fn a_vanished_policy_does_not_hide_the_certificates_other_policies() {
    let iot = InMemoryIot::default();
    let observer = Recorder::default();
    let result = ProvisioningPipeline::new(&iot, &observer)
        .run("sensor-01", POLICY)
        .await
        .unwrap();
    // listed before ours, and gone by the time it is detached
    iot.create_policy("aaa-other", "{}").await.unwrap();
    iot.attach_policy("aaa-other", result.certificate_arn.as_str())
        .await
        .unwrap();
    iot.fail_times(Operation::DetachPolicy, 1, Fault::NotFound);

    let report = TeardownPipeline::new(&iot, &observer)
        .run("sensor-01", &result.certificate_arn, &result.policy_name)
        .await;

    assert_eq!(2, iot.call_count(Operation::DetachPolicy));
    let detach = report
        .outcomes
        .iter()
        .find(|outcome| outcome.step() == StepName::DetachCertificatePolicies)
        .unwrap();
    assert!(matches!(detach, StepOutcome::Succeeded(_)), "{detach:?}");
    assert!(!iot.has_policy(&result.policy_name));
    // the in-memory registry still holds the foreign attachment
    assert_eq!(vec![StepName::DeleteCertificate], report.failed_steps());

    let events = observer.events();
    assert!(events.contains(&"already absent aaa-other".to_owned()), "{events:?}");
    assert!(
        events.contains(&"detached policy sensor-01-cfn_created".to_owned()),
        "{events:?}"
    );
}

#[tokio::test]
async fn teardown_of_missing_resources_succeeds() {
    let iot = InMemoryIot::default();
    let observer = Recorder::default();

    let report = TeardownPipeline::new(&iot, &observer)
        .run(
            "ghost",
            &CertificateArn::new("arn:aws:iot:us-east-1:123456789012:cert/feed"),
            "ghost-cfn_created",
        )
        .await;

    assert!(report.succeeded(), "{report}");
    let absent = report
        .outcomes
        .iter()
        .filter(|outcome| matches!(outcome, StepOutcome::AlreadyAbsent(_)))
        .map(StepOutcome::step)
        .collect::<Vec<_>>();
    assert_eq!(
        vec![
            StepName::DetachThingPrincipals,
            StepName::DeletePolicy,
            StepName::DeleteCertificate,
            StepName::DeleteThing,
        ],
        absent
    );
}

#[tokio::test]
async fn teardown_keeps_going_after_a_failure() {
    let iot = InMemoryIot::default();
    let observer = Recorder::default();
    let result = ProvisioningPipeline::new(&iot, &observer)
        .run("sensor-01", POLICY)
        .await
        .unwrap();
    iot.fail(Operation::DeletePolicy, Fault::Throttled);

    let report = TeardownPipeline::new(&iot, &observer)
        .run("sensor-01", &result.certificate_arn, &result.policy_name)
        .await;

    assert!(!report.succeeded());
    assert_eq!(vec![StepName::DeletePolicy], report.failed_steps());
    assert_eq!(5, report.outcomes.len());
    assert!(!iot.has_thing("sensor-01"));
    assert!(!iot.has_certificate(&result.certificate_arn));
    assert!(observer
        .events()
        .contains(&"fail delete policy".to_owned()));
}
