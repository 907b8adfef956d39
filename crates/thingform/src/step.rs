//! Reversible units of work.
//!
//! A [`ResourceStep`] pairs one forward action against the registry with the
//! action that undoes it. Steps capture only the identifiers they need at
//! construction; anything produced by the forward action is handed back to
//! [`ResourceStep::compensate`] as the step's output.
use std::future::Future;

use crate::{
    capability::{CapabilityError, CertificateArn, CertificateKeyPair, IotCapability},
    observe::{Event, Observer},
};

/// Appended to a thing name to derive the name of its policy.
pub const POLICY_NAME_SUFFIX: &str = "-cfn_created";

/// Derives the policy name owned by the given thing.
pub fn policy_name_for(thing_name: &str) -> String {
    format!("{thing_name}{POLICY_NAME_SUFFIX}")
}

/// Names every step of both pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepName {
    CreateThing,
    CreateCertificate,
    CreatePolicy,
    AttachPolicy,
    AttachThingPrincipal,
    DetachThingPrincipals,
    DetachCertificatePolicies,
    DeletePolicy,
    DeleteCertificate,
    DeleteThing,
}

impl core::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StepName::CreateThing => "create thing",
            StepName::CreateCertificate => "create certificate",
            StepName::CreatePolicy => "create policy",
            StepName::AttachPolicy => "attach policy",
            StepName::AttachThingPrincipal => "attach thing principal",
            StepName::DetachThingPrincipals => "detach thing principals",
            StepName::DetachCertificatePolicies => "detach certificate policies",
            StepName::DeletePolicy => "delete policy",
            StepName::DeleteCertificate => "delete certificate",
            StepName::DeleteThing => "delete thing",
        })
    }
}

/// A step that failed, along with why.
#[derive(Debug)]
pub struct StepFailure {
    pub step: StepName,
    pub error: CapabilityError,
}

impl core::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

/// One forward action and its exact compensation.
pub trait ResourceStep {
    /// What the forward action produces.
    type Output: Clone + 'static;

    fn name(&self) -> StepName;

    /// Runs the forward action.
    fn perform<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
    ) -> impl Future<Output = Result<Self::Output, CapabilityError>>;

    /// Undoes a successful [`ResourceStep::perform`].
    ///
    /// Deletions have nothing to undo, so the default does nothing.
    fn compensate<C: IotCapability>(
        &self,
        _iot: &C,
        _observer: &dyn Observer,
        _output: &Self::Output,
    ) -> impl Future<Output = Result<(), CapabilityError>> {
        async { Ok(()) }
    }
}

/// Deactivates and then deletes a certificate. Active certificates cannot be
/// deleted.
async fn retire_certificate<C: IotCapability>(
    iot: &C,
    observer: &dyn Observer,
    certificate: &CertificateArn,
) -> Result<(), CapabilityError> {
    let certificate_id = certificate.certificate_id();
    iot.deactivate_certificate(certificate_id).await?;
    observer.observe(&Event::CertificateDeactivated { certificate_id });
    iot.delete_certificate(certificate_id).await?;
    observer.observe(&Event::CertificateDeleted { certificate_id });
    Ok(())
}

/// Tracks an enumerated detach: items that are already gone count as
/// detached, other failures are held until every item has been tried.
struct DetachTally<'o> {
    step: StepName,
    observer: &'o dyn Observer,
    detached: Vec<String>,
    first_error: Option<CapabilityError>,
}

impl<'o> DetachTally<'o> {
    fn new(step: StepName, observer: &'o dyn Observer) -> Self {
        Self {
            step,
            observer,
            detached: vec![],
            first_error: None,
        }
    }

    /// Records the result of detaching `item`, returning whether it was detached.
    fn record(&mut self, item: String, result: Result<(), CapabilityError>) -> bool {
        match result {
            Ok(()) => {
                self.detached.push(item);
                true
            }
            Err(error) if error.is_not_found() => {
                self.observer.observe(&Event::ItemAlreadyAbsent {
                    step: self.step,
                    item: &item,
                    error: &error,
                });
                false
            }
            Err(error) => {
                self.observer.observe(&Event::ItemFailed {
                    step: self.step,
                    item: &item,
                    error: &error,
                });
                if self.first_error.is_none() {
                    self.first_error = Some(error);
                }
                false
            }
        }
    }

    fn finish(self) -> Result<Vec<String>, CapabilityError> {
        match self.first_error {
            Some(error) => Err(error),
            None => Ok(self.detached),
        }
    }
}

/// Detaches every principal currently attached to the thing, returning the
/// ones this call detached.
async fn detach_all_principals<C: IotCapability>(
    iot: &C,
    observer: &dyn Observer,
    step: StepName,
    thing_name: &str,
) -> Result<Vec<String>, CapabilityError> {
    let principals = iot.list_thing_principals(thing_name).await?;
    let mut tally = DetachTally::new(step, observer);
    for principal in principals {
        let result = iot.detach_thing_principal(thing_name, &principal).await;
        if tally.record(principal.clone(), result) {
            observer.observe(&Event::PrincipalDetached {
                thing_name,
                principal: &principal,
            });
        }
    }
    tally.finish()
}

/// Creates the thing.
pub struct CreateThing {
    pub thing_name: String,
}

impl ResourceStep for CreateThing {
    type Output = String;

    fn name(&self) -> StepName {
        StepName::CreateThing
    }

    async fn perform<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
    ) -> Result<String, CapabilityError> {
        let arn = iot.create_thing(&self.thing_name).await?;
        observer.observe(&Event::ThingCreated {
            thing_name: &self.thing_name,
            arn: &arn,
        });
        Ok(arn)
    }

    async fn compensate<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
        _arn: &String,
    ) -> Result<(), CapabilityError> {
        // Nothing else can be attached yet: the thing principal is attached by
        // the last step, which is compensated first.
        iot.delete_thing(&self.thing_name).await?;
        observer.observe(&Event::ThingDeleted {
            thing_name: &self.thing_name,
        });
        Ok(())
    }
}

/// Generates an active certificate and its private key.
pub struct CreateCertificate;

impl ResourceStep for CreateCertificate {
    type Output = CertificateKeyPair;

    fn name(&self) -> StepName {
        StepName::CreateCertificate
    }

    async fn perform<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
    ) -> Result<CertificateKeyPair, CapabilityError> {
        let pair = iot.create_certificate_and_key().await?;
        let fingerprint = crate::utils::sha256_fingerprint(pair.certificate_pem.as_bytes());
        observer.observe(&Event::CertificateCreated {
            certificate: &pair.certificate_arn,
            fingerprint: &fingerprint,
        });
        Ok(pair)
    }

    async fn compensate<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
        pair: &CertificateKeyPair,
    ) -> Result<(), CapabilityError> {
        retire_certificate(iot, observer, &pair.certificate_arn).await
    }
}

/// Creates the thing's policy.
pub struct CreatePolicy {
    pub policy_name: String,
    /// Passed through to the registry untouched.
    pub document: String,
}

impl ResourceStep for CreatePolicy {
    type Output = String;

    fn name(&self) -> StepName {
        StepName::CreatePolicy
    }

    async fn perform<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
    ) -> Result<String, CapabilityError> {
        let name = iot.create_policy(&self.policy_name, &self.document).await?;
        observer.observe(&Event::PolicyCreated { policy_name: &name });
        Ok(name)
    }

    async fn compensate<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
        _name: &String,
    ) -> Result<(), CapabilityError> {
        iot.delete_policy(&self.policy_name).await?;
        observer.observe(&Event::PolicyDeleted {
            policy_name: &self.policy_name,
        });
        Ok(())
    }
}

/// Attaches the policy to the certificate.
pub struct AttachPolicy {
    pub policy_name: String,
    pub principal: CertificateArn,
}

impl ResourceStep for AttachPolicy {
    type Output = ();

    fn name(&self) -> StepName {
        StepName::AttachPolicy
    }

    async fn perform<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
    ) -> Result<(), CapabilityError> {
        iot.attach_policy(&self.policy_name, self.principal.as_str())
            .await?;
        observer.observe(&Event::PolicyAttached {
            policy_name: &self.policy_name,
            principal: self.principal.as_str(),
        });
        Ok(())
    }

    async fn compensate<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
        _: &(),
    ) -> Result<(), CapabilityError> {
        iot.detach_policy(&self.policy_name, self.principal.as_str())
            .await?;
        observer.observe(&Event::PolicyDetached {
            policy_name: &self.policy_name,
            principal: self.principal.as_str(),
        });
        Ok(())
    }
}

/// Attaches the certificate to the thing.
pub struct AttachThingPrincipal {
    pub thing_name: String,
    pub principal: CertificateArn,
}

impl ResourceStep for AttachThingPrincipal {
    type Output = ();

    fn name(&self) -> StepName {
        StepName::AttachThingPrincipal
    }

    async fn perform<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
    ) -> Result<(), CapabilityError> {
        iot.attach_thing_principal(&self.thing_name, self.principal.as_str())
            .await?;
        observer.observe(&Event::PrincipalAttached {
            thing_name: &self.thing_name,
            principal: self.principal.as_str(),
        });
        Ok(())
    }

    async fn compensate<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
        _: &(),
    ) -> Result<(), CapabilityError> {
        iot.detach_thing_principal(&self.thing_name, self.principal.as_str())
            .await?;
        observer.observe(&Event::PrincipalDetached {
            thing_name: &self.thing_name,
            principal: self.principal.as_str(),
        });
        Ok(())
    }
}

/// Detaches every principal from a thing, not only the ones we attached.
pub struct DetachThingPrincipals {
    pub thing_name: String,
}

impl ResourceStep for DetachThingPrincipals {
    type Output = Vec<String>;

    fn name(&self) -> StepName {
        StepName::DetachThingPrincipals
    }

    async fn perform<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
    ) -> Result<Vec<String>, CapabilityError> {
        detach_all_principals(iot, observer, self.name(), &self.thing_name).await
    }
}

/// Detaches every policy from a certificate.
pub struct DetachCertificatePolicies {
    pub certificate: CertificateArn,
}

impl ResourceStep for DetachCertificatePolicies {
    type Output = Vec<String>;

    fn name(&self) -> StepName {
        StepName::DetachCertificatePolicies
    }

    async fn perform<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
    ) -> Result<Vec<String>, CapabilityError> {
        let principal = self.certificate.as_str();
        let policies = iot.list_attached_policies(principal).await?;
        let mut tally = DetachTally::new(self.name(), observer);
        for policy in policies {
            let result = iot.detach_policy(&policy, principal).await;
            if tally.record(policy.clone(), result) {
                observer.observe(&Event::PolicyDetached {
                    policy_name: &policy,
                    principal,
                });
            }
        }
        tally.finish()
    }
}

/// Deletes a policy that nothing is attached to.
pub struct DeletePolicy {
    pub policy_name: String,
}

impl ResourceStep for DeletePolicy {
    type Output = ();

    fn name(&self) -> StepName {
        StepName::DeletePolicy
    }

    async fn perform<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
    ) -> Result<(), CapabilityError> {
        iot.delete_policy(&self.policy_name).await?;
        observer.observe(&Event::PolicyDeleted {
            policy_name: &self.policy_name,
        });
        Ok(())
    }
}

/// Deactivates and deletes a detached certificate.
pub struct DeleteCertificate {
    pub certificate: CertificateArn,
}

impl ResourceStep for DeleteCertificate {
    type Output = ();

    fn name(&self) -> StepName {
        StepName::DeleteCertificate
    }

    async fn perform<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
    ) -> Result<(), CapabilityError> {
        retire_certificate(iot, observer, &self.certificate).await
    }
}

/// Detaches whatever is still attached to the thing, then deletes it.
pub struct DeleteThing {
    pub thing_name: String,
}

impl ResourceStep for DeleteThing {
    /// Principals that were found still attached.
    type Output = Vec<String>;

    fn name(&self) -> StepName {
        StepName::DeleteThing
    }

    async fn perform<C: IotCapability>(
        &self,
        iot: &C,
        observer: &dyn Observer,
    ) -> Result<Vec<String>, CapabilityError> {
        let stragglers =
            detach_all_principals(iot, observer, self.name(), &self.thing_name).await?;
        if !stragglers.is_empty() {
            observer.observe(&Event::StragglersDetached {
                thing_name: &self.thing_name,
                count: stragglers.len(),
            });
        }
        iot.delete_thing(&self.thing_name).await?;
        observer.observe(&Event::ThingDeleted {
            thing_name: &self.thing_name,
        });
        Ok(stragglers)
    }
}
