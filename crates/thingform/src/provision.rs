//! The all-or-nothing provisioning pipeline.
//!
//! Creates, in order:
//!
//! 1. the thing
//! 2. a certificate and private key
//! 3. the thing's policy, named by [`policy_name_for`]
//! 4. the policy → certificate attachment
//! 5. the certificate → thing attachment
//!
//! and then resolves the `iot:Data-ATS` endpoint.
//!
//! Every step that succeeds is pushed onto a journal together with its
//! compensation. If a later step fails the journal is unwound last-in
//! first-out before the failure is returned, so a failed run leaves nothing
//! behind.
use std::{future::Future, pin::Pin};

use snafu::prelude::*;

use crate::{
    capability::{CapabilityError, CertificateArn, EndpointKind, IotCapability, PrivateKeyPem},
    endpoint::{EndpointResolver, ResolveError},
    observe::{Event, Observer},
    step::{
        policy_name_for, AttachPolicy, AttachThingPrincipal, CreateCertificate, CreatePolicy,
        CreateThing, ResourceStep, StepFailure, StepName,
    },
    teardown::{TeardownPipeline, TeardownReport},
};

#[derive(Debug, Snafu)]
pub enum ProvisioningError {
    #[snafu(display("Could not provision thing '{thing_name}', '{step}' failed ({rollback}): {source}"))]
    Step {
        thing_name: String,
        step: StepName,
        source: CapabilityError,
        rollback: RollbackReport,
    },

    #[snafu(display(
        "Provisioned thing '{thing_name}' but could not resolve its endpoint, \
         resources were torn down ({teardown}): {source}"
    ))]
    Endpoint {
        thing_name: String,
        source: ResolveError,
        teardown: TeardownReport,
    },
}

impl ProvisioningError {
    /// The step whose failure aborted the run, if a step failed.
    pub fn failed_step(&self) -> Option<StepName> {
        match self {
            ProvisioningError::Step { step, .. } => Some(*step),
            ProvisioningError::Endpoint { .. } => None,
        }
    }
}

/// What happened while unwinding a failed run.
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Steps undone, in the order they were undone.
    pub compensated: Vec<StepName>,
    /// Steps whose undo failed. Their resources may still exist.
    pub failed: Vec<StepFailure>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl core::fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.compensated.is_empty() && self.failed.is_empty() {
            return f.write_str("nothing to roll back");
        }
        write!(f, "rolled back {} step(s)", self.compensated.len())?;
        if !self.failed.is_empty() {
            let failed = self
                .failed
                .iter()
                .map(|failure| failure.step.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, ", could not undo: {failed}")?;
        }
        Ok(())
    }
}

/// Everything the five provisioning steps produced.
#[derive(Clone, Debug, PartialEq)]
pub struct Provisioned {
    pub thing_name: String,
    pub thing_arn: String,
    pub certificate_arn: CertificateArn,
    pub certificate_pem: String,
    pub private_key_pem: PrivateKeyPem,
    pub policy_name: String,
}

/// A fully provisioned thing, including its data endpoint.
///
/// Handed to the caller to persist; nothing here is retained.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisioningResult {
    pub thing_arn: String,
    pub certificate_arn: CertificateArn,
    pub certificate_pem: String,
    pub private_key_pem: PrivateKeyPem,
    pub policy_name: String,
    pub endpoint_data_ats: String,
}

type CompensateFuture<'a> = Pin<Box<dyn Future<Output = Result<(), CapabilityError>> + 'a>>;

type CompensateFn<'a> = Box<dyn FnOnce() -> CompensateFuture<'a> + 'a>;

/// A step that has run, and how to undo it.
struct Completed<'a> {
    step: StepName,
    compensate: CompensateFn<'a>,
}

pub struct ProvisioningPipeline<'a, C> {
    iot: &'a C,
    observer: &'a dyn Observer,
    resolver: EndpointResolver<'a>,
}

impl<'a, C: IotCapability> ProvisioningPipeline<'a, C> {
    pub fn new(iot: &'a C, observer: &'a dyn Observer) -> Self {
        Self {
            iot,
            observer,
            resolver: EndpointResolver::new(observer),
        }
    }

    /// Replaces the default endpoint resolver.
    pub fn with_resolver(mut self, resolver: EndpointResolver<'a>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Runs the five provisioning steps and resolves the data endpoint.
    ///
    /// If the resolver gives up (only possible with an attempt ceiling) the
    /// new resources are torn down before the error is returned.
    pub async fn run(
        &self,
        thing_name: &str,
        policy_document: &str,
    ) -> Result<ProvisioningResult, ProvisioningError> {
        let provisioned = self.run_steps(thing_name, policy_document).await?;
        self.observer.observe(&Event::StepsCompleted { thing_name });
        match self.resolver.resolve(self.iot, EndpointKind::DataAts).await {
            Ok(endpoint_data_ats) => Ok(ProvisioningResult {
                thing_arn: provisioned.thing_arn,
                certificate_arn: provisioned.certificate_arn,
                certificate_pem: provisioned.certificate_pem,
                private_key_pem: provisioned.private_key_pem,
                policy_name: provisioned.policy_name,
                endpoint_data_ats,
            }),
            Err(source) => {
                let teardown = TeardownPipeline::new(self.iot, self.observer)
                    .run(
                        thing_name,
                        &provisioned.certificate_arn,
                        &provisioned.policy_name,
                    )
                    .await;
                Err(source).context(EndpointSnafu {
                    thing_name,
                    teardown,
                })
            }
        }
    }

    /// Runs the five provisioning steps, without resolving the endpoint.
    pub async fn run_steps(
        &self,
        thing_name: &str,
        policy_document: &str,
    ) -> Result<Provisioned, ProvisioningError> {
        self.observer.observe(&Event::ProvisioningStarted { thing_name });
        let mut journal = vec![];
        let forward = self.forward(&mut journal, thing_name, policy_document).await;
        match forward {
            Ok(provisioned) => Ok(provisioned),
            Err(StepFailure { step, error }) => {
                self.observer.observe(&Event::RollingBack {
                    thing_name,
                    step,
                    completed: journal.len(),
                });
                let rollback = self.unwind(journal).await;
                Err(error).context(StepSnafu {
                    thing_name,
                    step,
                    rollback,
                })
            }
        }
    }

    async fn forward(
        &self,
        journal: &mut Vec<Completed<'a>>,
        thing_name: &str,
        policy_document: &str,
    ) -> Result<Provisioned, StepFailure> {
        let thing_arn = self
            .run_step(
                journal,
                CreateThing {
                    thing_name: thing_name.to_owned(),
                },
            )
            .await?;
        let keys = self.run_step(journal, CreateCertificate).await?;
        let policy_name = policy_name_for(thing_name);
        self.run_step(
            journal,
            CreatePolicy {
                policy_name: policy_name.clone(),
                document: policy_document.to_owned(),
            },
        )
        .await?;
        self.run_step(
            journal,
            AttachPolicy {
                policy_name: policy_name.clone(),
                principal: keys.certificate_arn.clone(),
            },
        )
        .await?;
        self.run_step(
            journal,
            AttachThingPrincipal {
                thing_name: thing_name.to_owned(),
                principal: keys.certificate_arn.clone(),
            },
        )
        .await?;

        Ok(Provisioned {
            thing_name: thing_name.to_owned(),
            thing_arn,
            certificate_arn: keys.certificate_arn,
            certificate_pem: keys.certificate_pem,
            private_key_pem: keys.private_key_pem,
            policy_name,
        })
    }

    async fn run_step<S>(
        &self,
        journal: &mut Vec<Completed<'a>>,
        step: S,
    ) -> Result<S::Output, StepFailure>
    where
        S: ResourceStep + 'a,
    {
        let name = step.name();
        self.observer.observe(&Event::StepStarted { step: name });
        match step.perform(self.iot, self.observer).await {
            Ok(output) => {
                self.observer.observe(&Event::StepSucceeded { step: name });
                let iot = self.iot;
                let observer = self.observer;
                let performed = output.clone();
                journal.push(Completed {
                    step: name,
                    compensate: Box::new(move || {
                        Box::pin(async move { step.compensate(iot, observer, &performed).await })
                            as CompensateFuture<'a>
                    }),
                });
                Ok(output)
            }
            Err(error) => {
                self.observer.observe(&Event::StepFailed {
                    step: name,
                    error: &error,
                });
                Err(StepFailure { step: name, error })
            }
        }
    }

    /// Compensates every completed step, most recent first.
    ///
    /// Failures are recorded and logged, never raised: the run has already
    /// failed and every remaining step still gets its chance to undo.
    async fn unwind(&self, journal: Vec<Completed<'a>>) -> RollbackReport {
        let mut report = RollbackReport::default();
        for Completed { step, compensate } in journal.into_iter().rev() {
            match compensate().await {
                Ok(()) => {
                    self.observer.observe(&Event::Compensated { step });
                    report.compensated.push(step);
                }
                Err(error) => {
                    self.observer
                        .observe(&Event::CompensationFailed { step, error: &error });
                    report.failed.push(StepFailure { step, error });
                }
            }
        }
        report
    }
}
