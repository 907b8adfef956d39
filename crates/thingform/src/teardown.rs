//! The best-effort teardown pipeline.
//!
//! Teardown is the mirror image of provisioning, but it never stops early and
//! never tries to recreate anything: every step is attempted and the report
//! says which ones failed.
use crate::{
    capability::{CertificateArn, IotCapability},
    observe::{Event, Observer},
    step::{
        DeleteCertificate, DeletePolicy, DeleteThing, DetachCertificatePolicies,
        DetachThingPrincipals, ResourceStep, StepFailure, StepName,
    },
};

/// How a single teardown step ended.
#[derive(Debug)]
pub enum StepOutcome {
    Succeeded(StepName),
    /// The resource was already gone, which is as good as deleting it.
    AlreadyAbsent(StepName),
    Failed(StepFailure),
}

impl StepOutcome {
    pub fn step(&self) -> StepName {
        match self {
            StepOutcome::Succeeded(step) | StepOutcome::AlreadyAbsent(step) => *step,
            StepOutcome::Failed(failure) => failure.step,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

/// Every teardown step, in the order attempted.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub outcomes: Vec<StepOutcome>,
}

impl TeardownReport {
    /// Whether every step reported success.
    pub fn succeeded(&self) -> bool {
        !self.outcomes.iter().any(StepOutcome::is_failure)
    }

    pub fn failed_steps(&self) -> Vec<StepName> {
        self.failures().map(|failure| failure.step).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepFailure> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            StepOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }
}

impl core::fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let failed = self.failed_steps();
        if failed.is_empty() {
            return write!(f, "all {} teardown step(s) succeeded", self.outcomes.len());
        }
        let names = failed
            .iter()
            .map(|step| step.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "{} of {} teardown step(s) failed: {names}",
            failed.len(),
            self.outcomes.len()
        )
    }
}

pub struct TeardownPipeline<'a, C> {
    iot: &'a C,
    observer: &'a dyn Observer,
}

impl<'a, C: IotCapability> TeardownPipeline<'a, C> {
    pub fn new(iot: &'a C, observer: &'a dyn Observer) -> Self {
        Self { iot, observer }
    }

    /// Detaches and deletes the thing, certificate and policy.
    ///
    /// Every attachment found is removed, including ones made outside of
    /// provisioning. Steps run in order and each is attempted regardless of
    /// how the previous ones went.
    pub async fn run(
        &self,
        thing_name: &str,
        certificate: &CertificateArn,
        policy_name: &str,
    ) -> TeardownReport {
        self.observer.observe(&Event::TeardownStarted {
            thing_name,
            certificate,
            policy_name,
        });
        let mut report = TeardownReport::default();
        report.outcomes.push(
            self.attempt(DetachThingPrincipals {
                thing_name: thing_name.to_owned(),
            })
            .await,
        );
        report.outcomes.push(
            self.attempt(DetachCertificatePolicies {
                certificate: certificate.clone(),
            })
            .await,
        );
        report.outcomes.push(
            self.attempt(DeletePolicy {
                policy_name: policy_name.to_owned(),
            })
            .await,
        );
        report.outcomes.push(
            self.attempt(DeleteCertificate {
                certificate: certificate.clone(),
            })
            .await,
        );
        report.outcomes.push(
            self.attempt(DeleteThing {
                thing_name: thing_name.to_owned(),
            })
            .await,
        );
        self.observer.observe(&Event::TeardownFinished {
            thing_name,
            report: &report,
        });
        report
    }

    async fn attempt<S: ResourceStep>(&self, step: S) -> StepOutcome {
        let name = step.name();
        self.observer.observe(&Event::StepStarted { step: name });
        match step.perform(self.iot, self.observer).await {
            Ok(_) => {
                self.observer.observe(&Event::StepSucceeded { step: name });
                StepOutcome::Succeeded(name)
            }
            // Enumerated detaches absorb per-item NotFound, so one reaching
            // here means the thing, certificate or policy itself is gone.
            Err(error) if error.is_not_found() => {
                self.observer.observe(&Event::StepAlreadyAbsent {
                    step: name,
                    error: &error,
                });
                StepOutcome::AlreadyAbsent(name)
            }
            Err(error) => {
                self.observer.observe(&Event::StepFailed {
                    step: name,
                    error: &error,
                });
                StepOutcome::Failed(StepFailure { step: name, error })
            }
        }
    }
}
