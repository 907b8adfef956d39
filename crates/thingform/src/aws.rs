//! Bindings to the AWS IoT control plane and SSM Parameter Store.
use aws_config::{retry::RetryConfig, BehaviorVersion, SdkConfig};
use aws_sdk_iot::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    types::CertificateStatus,
};
use aws_sdk_ssm::types::ParameterType;

use crate::{
    capability::{
        CapabilityError, CertificateArn, CertificateKeyPair, EndpointKind, Fault, IotCapability,
        Operation, PrivateKeyPem,
    },
    config::TransportSettings,
    handler::ParameterStore,
};

/// Loads the shared SDK config from the environment, with the transport's
/// retry ceiling applied to every client built from it.
pub async fn sdk_config(transport: &TransportSettings) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .retry_config(RetryConfig::standard().with_max_attempts(transport.max_attempts))
        .load()
        .await
}

fn classify(code: Option<&str>) -> Fault {
    match code {
        Some("ResourceNotFoundException" | "ParameterNotFound") => Fault::NotFound,
        Some(
            "ResourceAlreadyExistsException"
            | "DeleteConflictException"
            | "CertificateStateException"
            | "ParameterAlreadyExists",
        ) => Fault::Conflict,
        Some("ThrottlingException" | "TooManyUpdates") => Fault::Throttled,
        _ => Fault::Other,
    }
}

fn sdk_error<E, R>(operation: Operation, error: SdkError<E, R>) -> CapabilityError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let fault = classify(error.code());
    let message = DisplayErrorContext(&error).to_string();
    log::trace!("{operation} returned {fault}: {message}");
    CapabilityError::new(operation, fault, anyhow::Error::msg(message))
}

/// The registry, through `aws-sdk-iot`.
#[derive(Clone, Debug)]
pub struct AwsIot {
    client: aws_sdk_iot::Client,
}

impl AwsIot {
    pub fn new(cfg: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_iot::Client::new(cfg),
        }
    }
}

impl IotCapability for AwsIot {
    async fn create_thing(&self, name: &str) -> Result<String, CapabilityError> {
        let op = Operation::CreateThing;
        let out = self
            .client
            .create_thing()
            .thing_name(name)
            .send()
            .await
            .map_err(|e| sdk_error(op, e))?;
        out.thing_arn
            .ok_or_else(|| CapabilityError::missing(op, "thing arn"))
    }

    async fn delete_thing(&self, name: &str) -> Result<(), CapabilityError> {
        self.client
            .delete_thing()
            .thing_name(name)
            .send()
            .await
            .map_err(|e| sdk_error(Operation::DeleteThing, e))?;
        Ok(())
    }

    async fn list_thing_principals(&self, name: &str) -> Result<Vec<String>, CapabilityError> {
        let mut principals = vec![];
        let mut next_token = None;
        loop {
            let out = self
                .client
                .list_thing_principals()
                .thing_name(name)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| sdk_error(Operation::ListThingPrincipals, e))?;
            principals.extend(out.principals().iter().cloned());
            match out.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_owned()),
                _ => return Ok(principals),
            }
        }
    }

    async fn attach_thing_principal(
        &self,
        name: &str,
        principal: &str,
    ) -> Result<(), CapabilityError> {
        self.client
            .attach_thing_principal()
            .thing_name(name)
            .principal(principal)
            .send()
            .await
            .map_err(|e| sdk_error(Operation::AttachThingPrincipal, e))?;
        Ok(())
    }

    async fn detach_thing_principal(
        &self,
        name: &str,
        principal: &str,
    ) -> Result<(), CapabilityError> {
        self.client
            .detach_thing_principal()
            .thing_name(name)
            .principal(principal)
            .send()
            .await
            .map_err(|e| sdk_error(Operation::DetachThingPrincipal, e))?;
        Ok(())
    }

    async fn create_certificate_and_key(&self) -> Result<CertificateKeyPair, CapabilityError> {
        let op = Operation::CreateCertificateAndKey;
        let out = self
            .client
            .create_keys_and_certificate()
            .set_as_active(true)
            .send()
            .await
            .map_err(|e| sdk_error(op, e))?;
        let certificate_arn = out
            .certificate_arn()
            .ok_or_else(|| CapabilityError::missing(op, "certificate arn"))?;
        let certificate_pem = out
            .certificate_pem()
            .ok_or_else(|| CapabilityError::missing(op, "certificate pem"))?;
        let private_key = out
            .key_pair()
            .and_then(|pair| pair.private_key())
            .ok_or_else(|| CapabilityError::missing(op, "private key"))?;
        Ok(CertificateKeyPair {
            certificate_arn: CertificateArn::new(certificate_arn),
            certificate_pem: certificate_pem.to_owned(),
            private_key_pem: PrivateKeyPem::new(private_key),
        })
    }

    async fn deactivate_certificate(&self, certificate_id: &str) -> Result<(), CapabilityError> {
        self.client
            .update_certificate()
            .certificate_id(certificate_id)
            .new_status(CertificateStatus::Inactive)
            .send()
            .await
            .map_err(|e| sdk_error(Operation::DeactivateCertificate, e))?;
        Ok(())
    }

    async fn delete_certificate(&self, certificate_id: &str) -> Result<(), CapabilityError> {
        self.client
            .delete_certificate()
            .certificate_id(certificate_id)
            .send()
            .await
            .map_err(|e| sdk_error(Operation::DeleteCertificate, e))?;
        Ok(())
    }

    async fn create_policy(&self, name: &str, document: &str) -> Result<String, CapabilityError> {
        let op = Operation::CreatePolicy;
        let out = self
            .client
            .create_policy()
            .policy_name(name)
            .policy_document(document)
            .send()
            .await
            .map_err(|e| sdk_error(op, e))?;
        out.policy_name
            .ok_or_else(|| CapabilityError::missing(op, "policy name"))
    }

    async fn delete_policy(&self, name: &str) -> Result<(), CapabilityError> {
        self.client
            .delete_policy()
            .policy_name(name)
            .send()
            .await
            .map_err(|e| sdk_error(Operation::DeletePolicy, e))?;
        Ok(())
    }

    async fn list_attached_policies(&self, principal: &str) -> Result<Vec<String>, CapabilityError> {
        let mut names = vec![];
        let mut marker = None;
        loop {
            let out = self
                .client
                .list_attached_policies()
                .target(principal)
                .recursive(false)
                .set_marker(marker)
                .send()
                .await
                .map_err(|e| sdk_error(Operation::ListAttachedPolicies, e))?;
            names.extend(
                out.policies()
                    .iter()
                    .filter_map(|policy| policy.policy_name().map(str::to_owned)),
            );
            match out.next_marker() {
                Some(next) if !next.is_empty() => marker = Some(next.to_owned()),
                _ => return Ok(names),
            }
        }
    }

    async fn attach_policy(&self, name: &str, principal: &str) -> Result<(), CapabilityError> {
        self.client
            .attach_policy()
            .policy_name(name)
            .target(principal)
            .send()
            .await
            .map_err(|e| sdk_error(Operation::AttachPolicy, e))?;
        Ok(())
    }

    async fn detach_policy(&self, name: &str, principal: &str) -> Result<(), CapabilityError> {
        self.client
            .detach_policy()
            .policy_name(name)
            .target(principal)
            .send()
            .await
            .map_err(|e| sdk_error(Operation::DetachPolicy, e))?;
        Ok(())
    }

    async fn describe_endpoint(&self, kind: EndpointKind) -> Result<String, CapabilityError> {
        let op = Operation::DescribeEndpoint;
        let out = self
            .client
            .describe_endpoint()
            .endpoint_type(kind.as_str())
            .send()
            .await
            .map_err(|e| sdk_error(op, e))?;
        out.endpoint_address
            .ok_or_else(|| CapabilityError::missing(op, "endpoint address"))
    }
}

/// Parameters, through `aws-sdk-ssm`. Secrets are stored as `SecureString`.
#[derive(Clone, Debug)]
pub struct SsmParameters {
    client: aws_sdk_ssm::Client,
}

impl SsmParameters {
    pub fn new(cfg: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_ssm::Client::new(cfg),
        }
    }

    async fn names_under(&self, path: &str) -> Result<Vec<String>, CapabilityError> {
        let mut names = vec![];
        let mut next_token = None;
        loop {
            let out = self
                .client
                .get_parameters_by_path()
                .path(path)
                .recursive(true)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| sdk_error(Operation::ListParameters, e))?;
            names.extend(
                out.parameters()
                    .iter()
                    .filter_map(|param| param.name().map(str::to_owned)),
            );
            match out.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_owned()),
                _ => return Ok(names),
            }
        }
    }
}

impl ParameterStore for SsmParameters {
    async fn put(&self, name: &str, value: &str, secret: bool) -> Result<(), CapabilityError> {
        self.client
            .put_parameter()
            .name(name)
            .value(value)
            .r#type(if secret {
                ParameterType::SecureString
            } else {
                ParameterType::String
            })
            .overwrite(true)
            .send()
            .await
            .map_err(|e| sdk_error(Operation::PutParameter, e))?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<String>, CapabilityError> {
        let result = self
            .client
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await
            .map_err(|e| sdk_error(Operation::GetParameter, e));
        match result {
            Ok(out) => Ok(out
                .parameter()
                .and_then(|param| param.value())
                .map(str::to_owned)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_path(&self, path: &str) -> Result<usize, CapabilityError> {
        let names = self.names_under(path).await?;
        for name in names.iter() {
            self.client
                .delete_parameter()
                .name(name)
                .send()
                .await
                .map_err(|e| sdk_error(Operation::DeleteParameter, e))?;
            log::debug!("deleted parameter {name}");
        }
        Ok(names.len())
    }
}
