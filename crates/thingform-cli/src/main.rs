//! Command line access to thingform, using the AWS credentials and region
//! from the environment.
//!
//! ```sh
//! thingform -v provision sensor-01 --policy-file policy.json --out-dir ./sensor-01
//! thingform teardown sensor-01 --certificate-arn arn:aws:iot:...:cert/...
//! thingform endpoint --kind iot:Data-ATS
//! thingform handle event.json
//! ```
use std::{
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use thingform::{
    aws::{sdk_config, AwsIot, SsmParameters},
    handler::{LifecycleHandler, LifecycleRequest},
    step::policy_name_for,
    utils::sha256_fingerprint,
    CertificateArn, Config, EndpointKind, LogObserver, ProvisioningPipeline, TeardownPipeline,
};

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the verbosity level
    #[clap(short, action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Path to a TOML config file. Defaults apply when omitted.
    #[clap(long, env = "THINGFORM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a thing, its certificate and its policy, all or nothing.
    Provision {
        thing_name: String,
        /// JSON policy document for the thing's certificate.
        #[clap(long)]
        policy_file: PathBuf,
        /// Where to write certificate.pem and private.key.
        #[clap(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Detach and delete a thing, its certificate and its policy.
    Teardown {
        thing_name: String,
        #[clap(long)]
        certificate_arn: String,
        /// Defaults to the name provisioning derives from the thing name.
        #[clap(long)]
        policy_name: Option<String>,
    },
    /// Print the account's endpoint address.
    Endpoint {
        #[clap(long, default_value = "iot:Data-ATS")]
        kind: EndpointKind,
    },
    /// Answer a lifecycle request read from a file, or stdin.
    Handle { event: Option<PathBuf> },
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("could not restrict permissions of {path:?}"))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

fn write_file(path: &Path, contents: &str, private: bool) -> anyhow::Result<()> {
    std::fs::write(path, contents).with_context(|| format!("could not write {path:?}"))?;
    if private {
        restrict_permissions(path)?;
    }
    log::info!("wrote {path:?}");
    Ok(())
}

fn read_event(event: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    if let Some(path) = event {
        return std::fs::read(path).with_context(|| format!("could not read {path:?}"));
    }
    let mut bytes = vec![];
    std::io::stdin()
        .read_to_end(&mut bytes)
        .context("could not read stdin")?;
    Ok(bytes)
}

#[::tokio::main]
async fn main() -> anyhow::Result<()> {
    let Cli {
        verbosity,
        config,
        command,
    } = Cli::parse();

    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("thingform", level)
        .init();

    let config = match config {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };
    log::debug!("config: {config:?}");

    let sdk_cfg = sdk_config(&config.transport).await;
    let iot = AwsIot::new(&sdk_cfg);
    let observer = LogObserver::new(format!("cli-{}", std::process::id()));

    match command {
        Command::Provision {
            thing_name,
            policy_file,
            out_dir,
        } => {
            let policy = std::fs::read_to_string(&policy_file)
                .with_context(|| format!("could not read policy {policy_file:?}"))?;
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("could not create {out_dir:?}"))?;

            let result = ProvisioningPipeline::new(&iot, &observer)
                .with_resolver(config.endpoint.resolver(&observer))
                .run(&thing_name, &policy)
                .await?;

            write_file(
                &out_dir.join("certificate.pem"),
                &result.certificate_pem,
                false,
            )?;
            write_file(
                &out_dir.join("private.key"),
                result.private_key_pem.expose(),
                true,
            )?;
            let summary = serde_json::json!({
                "thingArn": result.thing_arn,
                "certificateArn": result.certificate_arn,
                "certificateFingerprint": sha256_fingerprint(result.certificate_pem.as_bytes()),
                "policyName": result.policy_name,
                "endpointDataAts": result.endpoint_data_ats,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Teardown {
            thing_name,
            certificate_arn,
            policy_name,
        } => {
            let policy_name = policy_name.unwrap_or_else(|| policy_name_for(&thing_name));
            let report = TeardownPipeline::new(&iot, &observer)
                .run(
                    &thing_name,
                    &CertificateArn::new(certificate_arn),
                    &policy_name,
                )
                .await;
            println!("{report}");
            anyhow::ensure!(report.succeeded(), "teardown of {thing_name} is incomplete");
        }
        Command::Endpoint { kind } => {
            let address = config.endpoint.resolver(&observer).resolve(&iot, kind).await?;
            println!("{address}");
        }
        Command::Handle { event } => {
            let bytes = read_event(event.as_deref())?;
            let request = LifecycleRequest::from_json(&bytes).context("malformed request")?;
            let parameters = SsmParameters::new(&sdk_cfg);
            let response = LifecycleHandler::new(&iot, &parameters, &config)
                .handle(&request)
                .await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}
