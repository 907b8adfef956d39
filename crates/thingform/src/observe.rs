//! Observing pipeline progress.
//!
//! Pipelines, steps and the endpoint resolver are handed an [`Observer`]
//! instead of logging through a global. [`LogObserver`] is the one used in
//! production; it stamps every record with the id of the invocation that
//! produced it.
use crate::{
    capability::{CapabilityError, CertificateArn, EndpointKind},
    step::StepName,
    teardown::TeardownReport,
};

/// Something that happened while running a pipeline.
#[derive(Debug)]
pub enum Event<'a> {
    ProvisioningStarted {
        thing_name: &'a str,
    },
    /// All five creation steps succeeded.
    StepsCompleted {
        thing_name: &'a str,
    },
    RollingBack {
        thing_name: &'a str,
        step: StepName,
        completed: usize,
    },
    TeardownStarted {
        thing_name: &'a str,
        certificate: &'a CertificateArn,
        policy_name: &'a str,
    },
    TeardownFinished {
        thing_name: &'a str,
        report: &'a TeardownReport,
    },

    StepStarted {
        step: StepName,
    },
    StepSucceeded {
        step: StepName,
    },
    StepFailed {
        step: StepName,
        error: &'a CapabilityError,
    },
    /// A teardown step found its resource already gone.
    StepAlreadyAbsent {
        step: StepName,
        error: &'a CapabilityError,
    },
    Compensated {
        step: StepName,
    },
    CompensationFailed {
        step: StepName,
        error: &'a CapabilityError,
    },

    ThingCreated {
        thing_name: &'a str,
        arn: &'a str,
    },
    CertificateCreated {
        certificate: &'a CertificateArn,
        /// Hex sha256 of the certificate PEM.
        fingerprint: &'a str,
    },
    PolicyCreated {
        policy_name: &'a str,
    },
    PolicyAttached {
        policy_name: &'a str,
        principal: &'a str,
    },
    PrincipalAttached {
        thing_name: &'a str,
        principal: &'a str,
    },
    PolicyDetached {
        policy_name: &'a str,
        principal: &'a str,
    },
    PrincipalDetached {
        thing_name: &'a str,
        principal: &'a str,
    },
    /// One item of an enumerated detach was already gone.
    ItemAlreadyAbsent {
        step: StepName,
        item: &'a str,
        error: &'a CapabilityError,
    },
    /// One item of an enumerated detach failed; the rest are still tried.
    ItemFailed {
        step: StepName,
        item: &'a str,
        error: &'a CapabilityError,
    },
    /// Principals were still attached when the thing was about to be deleted.
    StragglersDetached {
        thing_name: &'a str,
        count: usize,
    },
    CertificateDeactivated {
        certificate_id: &'a str,
    },
    CertificateDeleted {
        certificate_id: &'a str,
    },
    PolicyDeleted {
        policy_name: &'a str,
    },
    ThingDeleted {
        thing_name: &'a str,
    },

    EndpointAttemptFailed {
        kind: EndpointKind,
        attempt: u32,
        error: &'a CapabilityError,
    },
    EndpointResolved {
        kind: EndpointKind,
        attempts: u32,
    },
}

pub trait Observer {
    fn observe(&self, event: &Event<'_>);
}

/// Writes events to the `log` facade, prefixed with a correlation id.
#[derive(Clone, Debug)]
pub struct LogObserver {
    correlation_id: String,
}

impl LogObserver {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Observer for LogObserver {
    fn observe(&self, event: &Event<'_>) {
        let id = &self.correlation_id;
        match event {
            Event::ProvisioningStarted { thing_name } => {
                log::info!("[{id}] provisioning thing {thing_name}")
            }
            Event::StepsCompleted { thing_name } => {
                log::info!("[{id}] thing {thing_name} created, resolving endpoint")
            }
            Event::RollingBack {
                thing_name,
                step,
                completed,
            } => log::error!(
                "[{id}] provisioning thing {thing_name} failed at '{step}', \
                 rolling back {completed} step(s)"
            ),
            Event::TeardownStarted {
                thing_name,
                certificate,
                policy_name,
            } => log::info!(
                "[{id}] tearing down thing {thing_name}, certificate {certificate}, \
                 policy {policy_name}"
            ),
            Event::TeardownFinished { thing_name, report } => {
                if report.succeeded() {
                    log::info!("[{id}] teardown of thing {thing_name} complete")
                } else {
                    log::error!("[{id}] teardown of thing {thing_name} incomplete: {report}")
                }
            }
            Event::StepStarted { step } => log::debug!("[{id}] {step}:"),
            Event::StepSucceeded { step } => log::info!("[{id}] {step}: success"),
            Event::StepFailed { step, error } => log::error!("[{id}] {step}: {error}"),
            Event::StepAlreadyAbsent { step, error } => {
                log::warn!("[{id}] {step}: already absent ({error})")
            }
            Event::Compensated { step } => log::info!("[{id}] undo {step}: success"),
            Event::CompensationFailed { step, error } => {
                log::error!("[{id}] undo {step}: {error}")
            }
            Event::ThingCreated { thing_name, arn } => {
                log::info!("[{id}] created thing {thing_name} ({arn})")
            }
            Event::CertificateCreated {
                certificate,
                fingerprint,
            } => log::info!("[{id}] created certificate {certificate} (sha256 {fingerprint})"),
            Event::PolicyCreated { policy_name } => {
                log::info!("[{id}] created policy {policy_name}")
            }
            Event::PolicyAttached {
                policy_name,
                principal,
            } => log::info!("[{id}] attached policy {policy_name} to principal {principal}"),
            Event::PrincipalAttached {
                thing_name,
                principal,
            } => log::info!("[{id}] attached principal {principal} to thing {thing_name}"),
            Event::PolicyDetached {
                policy_name,
                principal,
            } => log::info!("[{id}] detached policy {policy_name} from principal {principal}"),
            Event::PrincipalDetached {
                thing_name,
                principal,
            } => log::info!("[{id}] detached principal {principal} from thing {thing_name}"),
            Event::ItemAlreadyAbsent { step, item, error } => {
                log::warn!("[{id}] {step}: {item} already absent ({error})")
            }
            Event::ItemFailed { step, item, error } => {
                log::error!("[{id}] {step}: {item}: {error}")
            }
            Event::StragglersDetached { thing_name, count } => log::warn!(
                "[{id}] {count} principal(s) were still attached to thing {thing_name}"
            ),
            Event::CertificateDeactivated { certificate_id } => {
                log::debug!("[{id}] deactivated certificate {certificate_id}")
            }
            Event::CertificateDeleted { certificate_id } => {
                log::info!("[{id}] deleted certificate {certificate_id}")
            }
            Event::PolicyDeleted { policy_name } => {
                log::info!("[{id}] deleted policy {policy_name}")
            }
            Event::ThingDeleted { thing_name } => log::info!("[{id}] deleted thing {thing_name}"),
            Event::EndpointAttemptFailed {
                kind,
                attempt,
                error,
            } => log::warn!("[{id}] describe {kind} endpoint, attempt {attempt}: {error}"),
            Event::EndpointResolved { kind, attempts } => {
                log::info!("[{id}] resolved {kind} endpoint after {attempts} attempt(s)")
            }
        }
    }
}
