//! Command-line interface definitions for the `emc-blockdevice` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `emc-blockdevice` binary.
#[derive(Debug, Parser)]
#[command(
    name = "emc-blockdevice",
    about = "Manage block devices on EMC storage arrays",
    long_about = "Manage block devices on EMC storage arrays.\n\n\
                  The array is configured through EMC_* environment variables or \
                  emc-blockdevice.toml. Results are printed as JSON on stdout.",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Print the sizing granularity of the configured array in bytes.
    #[command(name = "allocation-unit")]
    AllocationUnit,
    /// Print the name this host registers under on the array.
    #[command(name = "instance-id")]
    InstanceId,
    /// Create an unattached volume for a dataset.
    #[command(name = "create")]
    Create(CreateCommand),
    /// Destroy an unattached volume.
    #[command(name = "destroy")]
    Destroy(VolumeArgs),
    /// Map a volume to a compute instance.
    #[command(name = "attach")]
    Attach(AttachCommand),
    /// Remove a volume's host mapping.
    #[command(name = "detach")]
    Detach(VolumeArgs),
    /// Grow an unattached volume.
    #[command(name = "resize")]
    Resize(ResizeCommand),
    /// List every volume of the configured cluster.
    #[command(name = "list")]
    List,
    /// Print the local device node of an attached volume.
    #[command(name = "device-path")]
    DevicePath(VolumeArgs),
}

/// Arguments for `emc-blockdevice create`.
#[derive(Debug, Args)]
pub(crate) struct CreateCommand {
    /// Dataset UUID the volume is created for.
    #[arg(long, value_name = "UUID")]
    pub(crate) dataset_id: String,
    /// Requested size in bytes; rounded up to the allocation unit.
    #[arg(long, value_name = "BYTES")]
    pub(crate) size: u64,
    /// Service profile (BRONZE, SILVER or GOLD); overrides the configured one.
    #[arg(long, value_name = "PROFILE")]
    pub(crate) profile: Option<String>,
}

/// Volume identifier argument shared by several subcommands.
#[derive(Debug, Args)]
pub(crate) struct VolumeArgs {
    /// Block device identifier as printed by `create` or `list`.
    #[arg(value_name = "ID")]
    pub(crate) id: String,
}

/// Arguments for `emc-blockdevice attach`.
#[derive(Debug, Args)]
pub(crate) struct AttachCommand {
    /// Block device identifier as printed by `create` or `list`.
    #[arg(value_name = "ID")]
    pub(crate) id: String,
    /// Compute instance id to map the volume to.
    #[arg(long, value_name = "HOST")]
    pub(crate) host: String,
}

/// Arguments for `emc-blockdevice resize`.
#[derive(Debug, Args)]
pub(crate) struct ResizeCommand {
    /// Block device identifier as printed by `create` or `list`.
    #[arg(value_name = "ID")]
    pub(crate) id: String,
    /// New size in bytes; rounded up to the allocation unit.
    #[arg(long, value_name = "BYTES")]
    pub(crate) size: u64,
}
