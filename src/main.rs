//! Binary entry point for the `emc-blockdevice` CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use emc_blockdevice::connector::Connector;
use emc_blockdevice::{ArrayConfig, BlockDeviceError, BlockDeviceId, ConfigError, DatasetId, Profile};

mod cli;

use cli::{AttachCommand, Cli, CreateCommand, ResizeCommand, VolumeArgs};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Volume(#[from] BlockDeviceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(value) => match write_json(io::stdout(), &value) {
            Ok(()) => 0,
            Err(err) => {
                write_error(io::stderr(), &err);
                1
            }
        },
        Err(err) => {
            write_error(io::stderr(), &err);
            1
        }
    };
    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<serde_json::Value, CliError> {
    let config = ArrayConfig::load_without_cli_args()?;
    match cli {
        Cli::AllocationUnit => Ok(json!(config.family()?.allocation_unit())),
        Cli::InstanceId => {
            let instance = config
                .connector()?
                .instance_id()
                .await
                .map_err(|err| BlockDeviceError::connector("compute instance id", err))?;
            Ok(json!(instance))
        }
        Cli::Create(command) => create(&config, &command).await,
        Cli::Destroy(VolumeArgs { id }) => {
            let volume_id = BlockDeviceId::new(id);
            config.connect().await?.destroy_volume(&volume_id).await?;
            Ok(json!({ "blockdevice_id": volume_id }))
        }
        Cli::Attach(AttachCommand { id, host }) => {
            let api = config.connect().await?;
            to_json(&api.attach_volume(&BlockDeviceId::new(id), &host).await?)
        }
        Cli::Detach(VolumeArgs { id }) => {
            let volume_id = BlockDeviceId::new(id);
            config.connect().await?.detach_volume(&volume_id).await?;
            Ok(json!({ "blockdevice_id": volume_id }))
        }
        Cli::Resize(ResizeCommand { id, size }) => {
            let api = config.connect().await?;
            to_json(&api.resize_volume(&BlockDeviceId::new(id), size).await?)
        }
        Cli::List => to_json(&config.connect().await?.list_volumes().await?),
        Cli::DevicePath(VolumeArgs { id }) => {
            let api = config.connect().await?;
            let path = api.get_device_path(&BlockDeviceId::new(id)).await?;
            Ok(json!(path))
        }
    }
}

async fn create(config: &ArrayConfig, command: &CreateCommand) -> Result<serde_json::Value, CliError> {
    let dataset = parse_dataset(&command.dataset_id)?;
    let profile = match command.profile.as_deref() {
        Some(raw) => Some(raw.parse::<Profile>()?),
        None => config.default_profile()?,
    };
    let api = config.connect().await?;
    to_json(
        &api.create_volume_with_profile(dataset, command.size, profile)
            .await?,
    )
}

fn parse_dataset(raw: &str) -> Result<DatasetId, CliError> {
    Uuid::parse_str(raw.trim())
        .map(DatasetId::new)
        .map_err(|err| CliError::InvalidArgument(format!("dataset id '{raw}': {err}")))
}

fn to_json(value: &impl Serialize) -> Result<serde_json::Value, CliError> {
    serde_json::to_value(value).map_err(|err| CliError::Output(err.to_string()))
}

fn write_json(mut target: impl Write, value: &serde_json::Value) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(target, "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["emc-blockdevice", "list"])]
    #[case(&["emc-blockdevice", "allocation-unit"])]
    #[case(&["emc-blockdevice", "destroy", "block-1"])]
    #[case(&["emc-blockdevice", "attach", "block-1", "--host", "node-a"])]
    #[case(&["emc-blockdevice", "resize", "block-1", "--size", "1073741824"])]
    #[case(&["emc-blockdevice", "device-path", "block-1"])]
    fn subcommands_parse(#[case] argv: &[&str]) {
        if let Err(err) = Cli::try_parse_from(argv) {
            panic!("{argv:?} should parse: {err}");
        }
    }

    #[test]
    fn create_takes_dataset_size_and_profile() {
        let cli = Cli::try_parse_from([
            "emc-blockdevice",
            "create",
            "--dataset-id",
            "0f6c9c3e-8a41-4f7e-9a53-2b7d1c2e4f10",
            "--size",
            "1024",
            "--profile",
            "gold",
        ])
        .unwrap_or_else(|err| panic!("create should parse: {err}"));
        let Cli::Create(command) = cli else {
            panic!("expected the create subcommand");
        };
        assert_eq!(command.size, 1024);
        assert_eq!(command.profile.as_deref(), Some("gold"));
    }

    #[test]
    fn attach_requires_host() {
        assert!(Cli::try_parse_from(["emc-blockdevice", "attach", "block-1"]).is_err());
    }

    #[test]
    fn malformed_dataset_id_is_rejected() {
        let err = parse_dataset("not-a-uuid").err();
        assert!(
            matches!(err, Some(CliError::InvalidArgument(ref message)) if message.contains("not-a-uuid")),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn json_output_ends_with_newline() {
        let mut buffer = Vec::new();
        write_json(&mut buffer, &json!({ "blockdevice_id": "block-1" }))
            .unwrap_or_else(|err| panic!("write: {err}"));
        let rendered = String::from_utf8(buffer).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert!(rendered.ends_with("}\n"), "rendered: {rendered}");
        assert!(rendered.contains("\"blockdevice_id\": \"block-1\""));
    }

    #[test]
    fn errors_are_written_as_one_line() {
        let mut buffer = Vec::new();
        write_error(
            &mut buffer,
            &CliError::InvalidArgument(String::from("dataset id 'x'")),
        );
        assert_eq!(
            String::from_utf8_lossy(&buffer),
            "invalid argument: dataset id 'x'\n"
        );
    }
}
