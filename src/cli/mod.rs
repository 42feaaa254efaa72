//! Command-line interface definitions for the `hcloud-csi-controller` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, ValueEnum};

/// Top-level CLI for the `hcloud-csi-controller` binary.
///
/// Provider credentials and endpoints are read from the environment (see
/// `HCLOUD_*` and `CSI_*` variables); the flags only shape process behaviour.
#[derive(Debug, Parser)]
#[command(
    name = "hcloud-csi-controller",
    version,
    about = "CSI controller plugin provisioning Hetzner Cloud volumes"
)]
pub(crate) struct Cli {
    /// Output format for log records.
    #[arg(long, value_enum, env = "LOG_FORMAT", default_value_t = LogFormat::Text)]
    pub(crate) log_format: LogFormat,
}

/// Supported log record encodings.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum LogFormat {
    /// Human readable single-line records.
    Text,
    /// One JSON object per record.
    Json,
}
