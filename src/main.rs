//! SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::Result;
use backend_deploy::provision::env_file::EnvFile;
use backend_deploy::{
  deploy, exit_code_of, public_ip, render_banner, CommandRunner, DeployConfig, Deployer, DryRunRunner, EventSink,
  HttpFetcher, JsonLinesSink, LogSink, Reporter, SystemRunner,
};
use docopt::Docopt;
use serde::Deserialize;
use std::path::Path;

const USAGE: &str = r#"
Provisions this host for the backend: system packages, Docker, repository,
env file, image build and container restart.

Usage:
  backend-deploy [--config FILE] [--dry-run] [--json-events]
  backend-deploy (--help | -h)
  backend-deploy (--version | -v)

Options:
  --config FILE     TOML file overriding the built-in deploy settings.
  --dry-run         Print mutating commands instead of running them.
  --json-events     Emit progress as JSON lines on stdout.
  --version, -v     Show tool version.
  --help, -h        Show this screen.

Environment:
  DEPLOY_DATABASE_URL   Replaces the database URL written to the env file.
  DEPLOY_COOKIES_STR    Written as COOKIES_STR instead of the blank placeholder.
  RUST_LOG              Log filter, info when unset.
"#;

#[derive(Debug, Deserialize)]
struct Args {
  flag_config: Option<String>,
  flag_dry_run: bool,
  flag_json_events: bool,
}

fn main() {
  let version = format!("{}, version: {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

  let args: Args = Docopt::new(USAGE)
    .map(|d| d.help(true))
    .map(|d| d.version(Some(version)))
    .and_then(|d| d.deserialize())
    .unwrap_or_else(|e| e.exit());

  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  if let Err(e) = run(&args) {
    log::error!("{e:#}");
    std::process::exit(exit_code_of(&e).filter(|c| *c != 0).unwrap_or(1));
  }
}

fn run(args: &Args) -> Result<()> {
  let cfg = match &args.flag_config {
    Some(path) => DeployConfig::from_file(Path::new(path))?,
    None => DeployConfig::default(),
  }
  .with_env_overrides();
  // bad env values fail here, before any stage runs
  EnvFile::from_config(&cfg)?;

  let sink: Box<dyn EventSink> = if args.flag_json_events { Box::new(JsonLinesSink::stdout()) } else { Box::new(LogSink) };
  let reporter = Reporter::new(sink);
  let fetcher = HttpFetcher::new(cfg.http_timeout_secs, concat!("backend-deploy/", env!("CARGO_PKG_VERSION")))?;

  let dry = DryRunRunner::new(SystemRunner);
  let runner: &dyn CommandRunner = if args.flag_dry_run { &dry } else { &SystemRunner };

  let d = Deployer::new(runner, &fetcher, &reporter, &cfg, args.flag_dry_run);
  let outcome = deploy(&d)?;

  let ip = public_ip(&d);
  let banner = render_banner(&outcome, &cfg, ip);
  if args.flag_json_events {
    // keep stdout machine readable
    eprint!("{banner}");
  } else {
    print!("{banner}");
  }
  Ok(())
}
