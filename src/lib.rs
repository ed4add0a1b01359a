//! SPDX-License-Identifier: GPL-3.0-or-later

pub mod provision;

pub use provision::events::{EventSink, JsonLinesSink, LogSink, ProvisionEvent, Reporter};
pub use provision::fetch::{Fetcher, HttpFetcher};
pub use provision::runner::{exit_code_of, CommandFailed, CommandRunner, CommandSpec, DryRunRunner, SystemRunner};
pub use provision::stages::{DockerState, RepoAction, Stage};
pub use provision::types::{DeployConfig, SudoMode};
pub use provision::{deploy, public_ip, render_banner, DeployOutcome, Deployer};
