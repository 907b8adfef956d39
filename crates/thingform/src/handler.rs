//! Handling resource lifecycle requests.
//!
//! A deployment controller (CloudFormation, for custom resources) sends a
//! request to create, update or delete "the thing". Create provisions and
//! persists the results to a parameter store under the stack's namespace;
//! delete reads them back and tears everything down. Update is a no-op.
//!
//! Responses never carry error detail: failures are logged under the request
//! id and reported with a generic reason.
use std::{collections::BTreeMap, future::Future};

use serde::Deserialize;
use snafu::prelude::*;

use crate::{
    capability::{CapabilityError, CertificateArn, IotCapability},
    config::Config,
    observe::LogObserver,
    provision::{ProvisioningError, ProvisioningPipeline, ProvisioningResult},
    teardown::{TeardownPipeline, TeardownReport},
};

/// The reason given for every failure.
pub const FAILURE_REASON: &str = "See the logs for details";

/// Key/value storage for provisioned identifiers and secrets.
pub trait ParameterStore {
    /// Writes (or overwrites) a parameter. Secrets are stored encrypted.
    fn put(
        &self,
        name: &str,
        value: &str,
        secret: bool,
    ) -> impl Future<Output = Result<(), CapabilityError>>;

    /// Reads a parameter, decrypting it if needed.
    fn get(&self, name: &str) -> impl Future<Output = Result<Option<String>, CapabilityError>>;

    /// Deletes every parameter beneath `path`, returning how many were removed.
    fn delete_path(&self, path: &str) -> impl Future<Output = Result<usize, CapabilityError>>;
}

#[derive(Debug, Snafu)]
pub enum HandlerError {
    #[snafu(display("Create failure requested"))]
    FailCreateRequested,

    #[snafu(display("Missing resource property '{name}'"))]
    MissingProperty { name: &'static str },

    #[snafu(display("Could not derive a stack name from stack id '{stack_id}'"))]
    StackName { stack_id: String },

    #[snafu(display("{source}"))]
    Provision { source: ProvisioningError },

    #[snafu(display("Could not persist parameter '{name}', resources were torn down ({teardown}): {source}"))]
    Persist {
        name: String,
        source: CapabilityError,
        teardown: TeardownReport,
    },

    #[snafu(display("Could not read parameter '{name}': {source}"))]
    ReadParameter {
        name: String,
        source: CapabilityError,
    },

    #[snafu(display("Parameter '{name}' is not set, cannot tear down"))]
    MissingParameter { name: String },

    #[snafu(display("Teardown incomplete: {report}"))]
    TeardownIncomplete { report: TeardownReport },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

impl core::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RequestType::Create => "create",
            RequestType::Update => "update",
            RequestType::Delete => "delete",
        })
    }
}

/// Accepts `true`/`false` as JSON booleans or as strings, since the
/// controller stringifies property values.
fn flag<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected 'true' or 'false', saw '{other}'"
            ))),
        },
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceProperties {
    pub iot_thing_name: String,
    /// JSON policy document, passed through untouched.
    #[serde(default)]
    pub iot_policy: Option<String>,
    #[serde(default)]
    pub physical_id: Option<String>,
    /// Fail a create immediately, without touching the registry.
    #[serde(default, deserialize_with = "flag")]
    pub fail_create: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleRequest {
    pub request_type: RequestType,
    #[serde(default)]
    pub request_id: String,
    pub stack_id: String,
    #[serde(default)]
    pub logical_resource_id: String,
    #[serde(default)]
    pub physical_resource_id: Option<String>,
    pub resource_properties: ResourceProperties,
}

impl LifecycleRequest {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The id reported back: the `PhysicalId` property, then the request's
    /// physical resource id, then the thing name.
    pub fn physical_id(&self) -> &str {
        self.resource_properties
            .physical_id
            .as_deref()
            .or(self.physical_resource_id.as_deref())
            .unwrap_or(&self.resource_properties.iot_thing_name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Success,
    Failed,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleResponse {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub physical_resource_id: String,
    pub stack_id: String,
    pub request_id: String,
    pub logical_resource_id: String,
    pub data: BTreeMap<String, String>,
}

/// Extracts the stack name from a stack id such as
/// `arn:aws:cloudformation:us-east-1:123456789012:stack/my-stack/<guid>`.
pub fn stack_name(stack_id: &str) -> Option<&str> {
    let resource = stack_id.rsplit(':').next()?;
    let name = resource.split('/').nth(1)?;
    (!name.is_empty()).then_some(name)
}

/// Parameter names under a stack's namespace.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterKeys {
    root: String,
}

impl ParameterKeys {
    pub fn new(stack_name: &str) -> Self {
        Self {
            root: format!("/{stack_name}"),
        }
    }

    /// The namespace itself.
    pub fn path(&self) -> &str {
        &self.root
    }

    fn key(&self, leaf: &str) -> String {
        format!("{}/{leaf}", self.root)
    }

    pub fn certificate_arn(&self) -> String {
        self.key("certificate_arn")
    }

    pub fn policy_name(&self) -> String {
        self.key("policy_name")
    }

    pub fn certificate_pem(&self) -> String {
        self.key("certificate_pem")
    }

    pub fn private_key_pem(&self) -> String {
        self.key("privatekey_pem")
    }

    pub fn thing_arn(&self) -> String {
        self.key("thing_arn")
    }

    pub fn endpoint_data_ats(&self) -> String {
        self.key("endpoint_data_ats")
    }
}

pub struct LifecycleHandler<'a, C, P> {
    iot: &'a C,
    parameters: &'a P,
    config: &'a Config,
}

impl<'a, C: IotCapability, P: ParameterStore> LifecycleHandler<'a, C, P> {
    pub fn new(iot: &'a C, parameters: &'a P, config: &'a Config) -> Self {
        Self {
            iot,
            parameters,
            config,
        }
    }

    /// Handles one request. Never fails: errors become a FAILED response.
    pub async fn handle(&self, request: &LifecycleRequest) -> LifecycleResponse {
        let observer = LogObserver::new(request.request_id.clone());
        let id = observer.correlation_id();
        log::info!(
            "[{id}] {} request for thing {}",
            request.request_type,
            request.resource_properties.iot_thing_name
        );

        let (status, reason, data) = match self.dispatch(request, &observer).await {
            Ok(data) => {
                log::info!("[{id}] {} succeeded", request.request_type);
                (Status::Success, None, data)
            }
            Err(err) => {
                log::error!("[{id}] {} failed: {err}", request.request_type);
                (
                    Status::Failed,
                    Some(FAILURE_REASON.to_owned()),
                    BTreeMap::new(),
                )
            }
        };

        LifecycleResponse {
            status,
            reason,
            physical_resource_id: request.physical_id().to_owned(),
            stack_id: request.stack_id.clone(),
            request_id: request.request_id.clone(),
            logical_resource_id: request.logical_resource_id.clone(),
            data,
        }
    }

    async fn dispatch(
        &self,
        request: &LifecycleRequest,
        observer: &LogObserver,
    ) -> Result<BTreeMap<String, String>, HandlerError> {
        match request.request_type {
            RequestType::Create => self.create(request, observer).await,
            RequestType::Update => {
                log::info!("[{}] update requires no changes", observer.correlation_id());
                Ok(BTreeMap::new())
            }
            RequestType::Delete => self.delete(request, observer).await,
        }
    }

    fn keys(request: &LifecycleRequest) -> Result<ParameterKeys, HandlerError> {
        let stack = stack_name(&request.stack_id).context(StackNameSnafu {
            stack_id: &request.stack_id,
        })?;
        Ok(ParameterKeys::new(stack))
    }

    async fn create(
        &self,
        request: &LifecycleRequest,
        observer: &LogObserver,
    ) -> Result<BTreeMap<String, String>, HandlerError> {
        let properties = &request.resource_properties;
        ensure!(!properties.fail_create, FailCreateRequestedSnafu);
        let document = properties
            .iot_policy
            .as_deref()
            .context(MissingPropertySnafu { name: "IotPolicy" })?;
        let keys = Self::keys(request)?;
        let thing_name = properties.iot_thing_name.as_str();

        let result = ProvisioningPipeline::new(self.iot, observer)
            .with_resolver(self.config.endpoint.resolver(observer))
            .run(thing_name, document)
            .await
            .context(ProvisionSnafu)?;

        if let Err((name, source)) = self.persist(observer, &keys, &result).await {
            let teardown = TeardownPipeline::new(self.iot, observer)
                .run(thing_name, &result.certificate_arn, &result.policy_name)
                .await;
            if let Err(e) = self.parameters.delete_path(keys.path()).await {
                log::warn!(
                    "[{}] could not clear parameters under {}: {e}",
                    observer.correlation_id(),
                    keys.path()
                );
            }
            return Err(source).context(PersistSnafu { name, teardown });
        }

        Ok(BTreeMap::from([
            ("thingArn".to_owned(), result.thing_arn),
            ("certificateArn".to_owned(), result.certificate_arn.to_string()),
        ]))
    }

    async fn persist(
        &self,
        observer: &LogObserver,
        keys: &ParameterKeys,
        result: &ProvisioningResult,
    ) -> Result<(), (String, CapabilityError)> {
        let entries = [
            (keys.certificate_arn(), result.certificate_arn.as_str(), false),
            (keys.policy_name(), result.policy_name.as_str(), false),
            (keys.certificate_pem(), result.certificate_pem.as_str(), false),
            (keys.private_key_pem(), result.private_key_pem.expose(), true),
            (keys.thing_arn(), result.thing_arn.as_str(), false),
            (
                keys.endpoint_data_ats(),
                result.endpoint_data_ats.as_str(),
                false,
            ),
        ];
        for (name, value, secret) in entries {
            if let Err(e) = self.parameters.put(&name, value, secret).await {
                return Err((name, e));
            }
            log::debug!("[{}] stored parameter {name}", observer.correlation_id());
        }
        Ok(())
    }

    async fn required_parameter(&self, name: String) -> Result<String, HandlerError> {
        let value = self
            .parameters
            .get(&name)
            .await
            .context(ReadParameterSnafu { name: &name })?;
        value.context(MissingParameterSnafu { name })
    }

    async fn delete(
        &self,
        request: &LifecycleRequest,
        observer: &LogObserver,
    ) -> Result<BTreeMap<String, String>, HandlerError> {
        let keys = Self::keys(request)?;
        let certificate = self.required_parameter(keys.certificate_arn()).await?;
        let policy_name = self.required_parameter(keys.policy_name()).await?;
        let thing_name = &request.resource_properties.iot_thing_name;

        let report = TeardownPipeline::new(self.iot, observer)
            .run(thing_name, &CertificateArn::new(certificate), &policy_name)
            .await;
        ensure!(report.succeeded(), TeardownIncompleteSnafu { report });

        let id = observer.correlation_id();
        match self.parameters.delete_path(keys.path()).await {
            Ok(count) => log::info!("[{id}] deleted {count} parameter(s) under {}", keys.path()),
            Err(e) => log::warn!("[{id}] could not clear parameters under {}: {e}", keys.path()),
        }
        Ok(BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::memory::{InMemoryIot, InMemoryParameters};

    const STACK_ID: &str =
        "arn:aws:cloudformation:us-east-1:123456789012:stack/gg-accel/4a8f5c10-0e1b-11ea-9d7e-0a5b0c1b2c3d";

    fn request(request_type: RequestType, properties: serde_json::Value) -> LifecycleRequest {
        serde_json::from_value(serde_json::json!({
            "RequestType": request_type,
            "RequestId": "req-1",
            "StackId": STACK_ID,
            "LogicalResourceId": "IotThingCertPolicy",
            "ResponseURL": "https://example.invalid/response",
            "ResourceProperties": properties,
        }))
        .unwrap()
    }

    fn create_properties() -> serde_json::Value {
        serde_json::json!({
            "ServiceToken": "arn:aws:lambda:us-east-1:123456789012:function:cr",
            "IotThingName": "core-01",
            "IotPolicy": r#"{"Version":"2012-10-17","Statement":[]}"#,
            "PhysicalId": "cr-function",
        })
    }

    #[test]
    fn stack_name_from_stack_id() {
        assert_eq!(Some("gg-accel"), stack_name(STACK_ID));
        assert_eq!(None, stack_name("not-an-arn"));
        assert_eq!(None, stack_name("arn:aws:cloudformation:r:a:stack//guid"));
    }

    #[test]
    fn fail_create_accepts_bools_and_strings() {
        for (value, expected) in [
            (serde_json::json!(true), true),
            (serde_json::json!("true"), true),
            (serde_json::json!("True"), true),
            (serde_json::json!(false), false),
            (serde_json::json!("false"), false),
        ] {
            let properties: ResourceProperties = serde_json::from_value(serde_json::json!({
                "IotThingName": "t",
                "FailCreate": value,
            }))
            .unwrap();
            assert_eq!(expected, properties.fail_create, "{value}");
        }
        let properties: ResourceProperties =
            serde_json::from_value(serde_json::json!({ "IotThingName": "t" })).unwrap();
        assert!(!properties.fail_create);
        assert!(serde_json::from_value::<ResourceProperties>(
            serde_json::json!({ "IotThingName": "t", "FailCreate": "maybe" })
        )
        .is_err());
    }

    #[test]
    fn response_uses_controller_field_names() {
        let response = LifecycleResponse {
            status: Status::Failed,
            reason: Some(FAILURE_REASON.to_owned()),
            physical_resource_id: "p".into(),
            stack_id: "s".into(),
            request_id: "r".into(),
            logical_resource_id: "l".into(),
            data: BTreeMap::new(),
        };
        assert_eq!(
            serde_json::json!({
                "Status": "FAILED",
                "Reason": FAILURE_REASON,
                "PhysicalResourceId": "p",
                "StackId": "s",
                "RequestId": "r",
                "LogicalResourceId": "l",
                "Data": {},
            }),
            serde_json::to_value(&response).unwrap()
        );
    }

    #[tokio::test]
    async fn create_persists_parameters_and_returns_arns() {
        let _ = env_logger::builder().is_test(true).try_init();
        let iot = InMemoryIot::default();
        let params = InMemoryParameters::default();
        let config = Config::default();
        let handler = LifecycleHandler::new(&iot, &params, &config);

        let response = handler
            .handle(&request(RequestType::Create, create_properties()))
            .await;
        assert_eq!(Status::Success, response.status);
        assert_eq!("cr-function", response.physical_resource_id);
        assert_eq!(
            vec!["certificateArn".to_owned(), "thingArn".to_owned()],
            response.data.keys().cloned().collect::<Vec<_>>()
        );

        let keys = ParameterKeys::new("gg-accel");
        assert_eq!(
            Some("core-01-cfn_created".to_owned()),
            params.value(&keys.policy_name())
        );
        assert_eq!(
            response.data.get("certificateArn").cloned(),
            params.value(&keys.certificate_arn())
        );
        assert!(params.is_secret(&keys.private_key_pem()));
        assert!(!params.is_secret(&keys.certificate_pem()));
        assert!(params.value(&keys.endpoint_data_ats()).is_some());
        assert_eq!(6, params.names().len());
    }

    #[tokio::test]
    async fn fail_create_touches_nothing() {
        let iot = InMemoryIot::default();
        let params = InMemoryParameters::default();
        let config = Config::default();
        let handler = LifecycleHandler::new(&iot, &params, &config);

        let mut properties = create_properties();
        properties["FailCreate"] = serde_json::json!("true");
        let response = handler
            .handle(&request(RequestType::Create, properties))
            .await;

        assert_eq!(Status::Failed, response.status);
        assert_eq!(Some(FAILURE_REASON.to_owned()), response.reason);
        assert!(response.data.is_empty());
        assert!(iot.calls().is_empty());
        assert!(params.names().is_empty());
    }

    #[tokio::test]
    async fn failed_persist_tears_resources_down() {
        let iot = InMemoryIot::default();
        let params = InMemoryParameters::default();
        params.fail(
            crate::capability::Operation::PutParameter,
            crate::capability::Fault::Throttled,
        );
        let config = Config::default();
        let handler = LifecycleHandler::new(&iot, &params, &config);

        let response = handler
            .handle(&request(RequestType::Create, create_properties()))
            .await;
        assert_eq!(Status::Failed, response.status);
        assert!(iot.is_empty());
    }

    #[tokio::test]
    async fn update_is_a_no_op() {
        let iot = InMemoryIot::default();
        let params = InMemoryParameters::default();
        let config = Config::default();
        let handler = LifecycleHandler::new(&iot, &params, &config);

        let response = handler
            .handle(&request(RequestType::Update, create_properties()))
            .await;
        assert_eq!(Status::Success, response.status);
        assert!(iot.calls().is_empty());
    }

    #[tokio::test]
    async fn delete_tears_down_and_clears_the_namespace() {
        let iot = InMemoryIot::default();
        let params = InMemoryParameters::default();
        params.put("/other-stack/keep", "1", false).await.unwrap();
        let config = Config::default();
        let handler = LifecycleHandler::new(&iot, &params, &config);

        let created = handler
            .handle(&request(RequestType::Create, create_properties()))
            .await;
        assert_eq!(Status::Success, created.status);

        let deleted = handler
            .handle(&request(RequestType::Delete, create_properties()))
            .await;
        assert_eq!(Status::Success, deleted.status);
        assert!(iot.is_empty());
        assert_eq!(vec!["/other-stack/keep".to_owned()], params.names());
    }

    #[tokio::test]
    async fn delete_without_stored_identifiers_fails_before_teardown() {
        let iot = InMemoryIot::default();
        let params = InMemoryParameters::default();
        let config = Config::default();
        let handler = LifecycleHandler::new(&iot, &params, &config);

        let response = handler
            .handle(&request(RequestType::Delete, create_properties()))
            .await;
        assert_eq!(Status::Failed, response.status);
        assert!(iot.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_teardown_keeps_the_parameters() {
        let iot = InMemoryIot::default();
        let params = InMemoryParameters::default();
        let config = Config::default();
        let handler = LifecycleHandler::new(&iot, &params, &config);

        handler
            .handle(&request(RequestType::Create, create_properties()))
            .await;
        iot.fail(
            crate::capability::Operation::DeletePolicy,
            crate::capability::Fault::Other,
        );
        let response = handler
            .handle(&request(RequestType::Delete, create_properties()))
            .await;

        assert_eq!(Status::Failed, response.status);
        assert_eq!(6, params.names().len());
        assert!(iot.has_policy("core-01-cfn_created"));
    }
}
