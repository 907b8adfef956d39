//! # Thingform
//!
//! Thingform provisions an AWS IoT identity, made of a thing, an X.509
//! certificate with its private key, and a policy, as one all-or-nothing
//! unit, and tears it down again without leaving anything behind.
//!
//! ## Concepts
//!
//! - **Resource steps**: every remote action is a [`step::ResourceStep`], a
//!   forward action paired with the action that undoes it.
//! - **Provisioning**: [`provision::ProvisioningPipeline`] runs the creation
//!   steps in order, journalling each one. If any step fails, the journal is
//!   unwound in reverse so a failed run leaves the registry as it found it.
//! - **Teardown**: [`teardown::TeardownPipeline`] detaches and deletes
//!   everything, attempting every step and reporting which ones failed.
//!   Resources that are already gone count as deleted.
//! - **Endpoints**: [`endpoint::EndpointResolver`] polls the registry for the
//!   account's data endpoint until it answers.
//!
//! The registry is reached through [`capability::IotCapability`].
//! [`aws::AwsIot`] talks to the real control plane; [`memory::InMemoryIot`]
//! keeps an in-process registry with the same ordering rules, for tests.
//!
//! ## Lifecycle requests
//!
//! [`handler::LifecycleHandler`] answers create/update/delete requests from a
//! deployment controller, persisting what it provisions to a
//! [`handler::ParameterStore`] under the stack's namespace so a later delete
//! can find it.
//!
//! ## Error Handling
//!
//! Each layer has its own error enum. Remote failures are
//! [`capability::CapabilityError`]s, classified by [`capability::Fault`];
//! the pipelines wrap them with the step that failed and a typed report of
//! what was rolled back or torn down.
pub mod aws;
pub mod capability;
pub mod config;
pub mod endpoint;
pub mod handler;
pub mod memory;
pub mod observe;
pub mod provision;
pub mod step;
pub mod teardown;
#[cfg(test)]
mod test;
pub mod utils;

pub use capability::{CapabilityError, CertificateArn, EndpointKind, IotCapability};
pub use config::Config;
pub use observe::{LogObserver, Observer};
pub use provision::{ProvisioningError, ProvisioningPipeline, ProvisioningResult};
pub use teardown::{TeardownPipeline, TeardownReport};
