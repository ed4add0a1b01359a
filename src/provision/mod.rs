//! SPDX-License-Identifier: GPL-3.0-or-later
//! Single-host deploy of the backend: packages, Docker, repo sync, env file, image, container.
pub mod env_file;
pub mod events;
pub mod fetch;
pub mod runner;
pub mod stages;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use crate::provision::events::Reporter;
use crate::provision::fetch::Fetcher;
use crate::provision::runner::{CommandRunner, CommandSpec};
use crate::provision::stages::{DockerState, RepoAction, Stage};
use crate::provision::types::{DeployConfig, SudoMode};
use anyhow::Result;
use std::net::IpAddr;
use std::path::PathBuf;
use uuid::Uuid;

/// Everything a stage needs to act on the host.
pub struct Deployer<'a> {
  pub runner: &'a dyn CommandRunner,
  pub fetcher: &'a dyn Fetcher,
  pub reporter: &'a Reporter,
  pub cfg: &'a DeployConfig,
  pub dry_run: bool,
  use_sudo: bool,
}

impl<'a> Deployer<'a> {
  pub fn new(
    runner: &'a dyn CommandRunner,
    fetcher: &'a dyn Fetcher,
    reporter: &'a Reporter,
    cfg: &'a DeployConfig,
    dry_run: bool,
  ) -> Self {
    let use_sudo = needs_sudo(runner, reporter, cfg.sudo);
    Self { runner, fetcher, reporter, cfg, dry_run, use_sudo }
  }

  /// Adds `sudo` for commands that touch system state, if this run needs it.
  pub fn privileged(&self, cmd: CommandSpec) -> CommandSpec {
    if self.use_sudo {
      cmd.with_sudo()
    } else {
      cmd
    }
  }
}

fn needs_sudo(runner: &dyn CommandRunner, reporter: &Reporter, mode: SudoMode) -> bool {
  match mode {
    SudoMode::Always => true,
    SudoMode::Never => false,
    SudoMode::Auto => match runner.output(&CommandSpec::new("id").arg("-u")) {
      Ok(uid) => uid != "0",
      Err(e) => {
        reporter.log_line("warn", None, format!("could not determine uid ({e:#}); using sudo"));
        true
      }
    },
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployOutcome {
  pub run_id: Uuid,
  pub docker: DockerState,
  pub repo: RepoAction,
  pub repo_dir: PathBuf,
  pub env_file: PathBuf,
  pub image_tag: String,
  pub container_name: String,
}

fn run_stage<T>(d: &Deployer, stage: Stage, f: impl FnOnce(&Deployer) -> Result<T>) -> Result<T> {
  d.reporter.step_start(stage.id(), stage.title());
  match f(d) {
    Ok(v) => {
      d.reporter.step_ok(stage.id());
      Ok(v)
    }
    Err(e) => {
      d.reporter.step_error(stage.id(), format!("{e:#}"));
      Err(e.context(format!("{} failed", stage.title())))
    }
  }
}

/// Runs every stage in order and stops at the first failure.
pub fn run_deploy(d: &Deployer) -> Result<DeployOutcome> {
  run_stage(d, Stage::Packages, stages::install_packages)?;
  let docker = run_stage(d, Stage::Docker, stages::install_docker)?;
  let repo = run_stage(d, Stage::Repository, stages::sync_repository)?;
  let env_file = run_stage(d, Stage::EnvFile, stages::write_env_file)?;
  run_stage(d, Stage::Image, stages::build_image)?;
  run_stage(d, Stage::Container, stages::restart_container)?;

  Ok(DeployOutcome {
    run_id: d.reporter.run_id(),
    docker,
    repo,
    repo_dir: d.cfg.repo_dir(),
    env_file,
    image_tag: d.cfg.image_tag.clone(),
    container_name: d.cfg.container_name.clone(),
  })
}

/// Like [`run_deploy`] but also closes the run with a `done` event.
pub fn deploy(d: &Deployer) -> Result<DeployOutcome> {
  let res = run_deploy(d);
  d.reporter.done(res.is_ok());
  res
}

/// Best effort. A failed lookup only degrades the banner.
pub fn public_ip(d: &Deployer) -> Option<IpAddr> {
  match d.fetcher.fetch_text(&d.cfg.public_ip_url) {
    Ok(body) => {
      let ip = body.trim().parse::<IpAddr>().ok();
      if ip.is_none() {
        d.reporter.log_line("warn", None, format!("unexpected reply from {}", d.cfg.public_ip_url));
      }
      ip
    }
    Err(e) => {
      d.reporter.log_line("warn", None, format!("public IP lookup failed: {e:#}"));
      None
    }
  }
}

pub fn render_banner(outcome: &DeployOutcome, cfg: &DeployConfig, ip: Option<IpAddr>) -> String {
  let host = match ip {
    Some(IpAddr::V6(v6)) => format!("[{v6}]"),
    Some(v4) => v4.to_string(),
    None => "<server-ip>".to_string(),
  };
  let rule = "=".repeat(60);

  let mut out = String::new();
  out.push_str(&rule);
  out.push('\n');
  out.push_str(&format!("Deployment complete (run {})\n", outcome.run_id));
  let docker = match outcome.docker {
    DockerState::Installed => "installed this run",
    DockerState::AlreadyInstalled => "already present",
  };
  let repo = match outcome.repo {
    RepoAction::Cloned => "cloned",
    RepoAction::Pulled => "pulled",
  };
  out.push_str(&format!("  Docker:    {docker}\n"));
  out.push_str(&format!("  Repo:      {repo} into {}\n", outcome.repo_dir.display()));
  out.push_str(&format!("  API:       http://{host}:{}\n", cfg.host_port));
  out.push_str(&format!("  Health:    http://{host}:{}/health\n", cfg.host_port));
  out.push_str(&format!("  Container: {} ({})\n", outcome.container_name, outcome.image_tag));
  out.push_str(&format!("  Env file:  {}\n", outcome.env_file.display()));
  if cfg.env.cookies_str.is_none() {
    out.push_str("\nNext: set COOKIES_STR in the env file, then restart the container:\n");
    out.push_str(&format!("  docker restart {}\n", outcome.container_name));
  }
  out.push_str(&rule);
  out.push('\n');
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::provision::events::ProvisionEvent;
  use crate::provision::runner::exit_code_of;
  use crate::provision::testing::{recording_reporter, CannedFetcher, FakeRunner};
  use std::fs;

  fn config(base: &std::path::Path) -> DeployConfig {
    DeployConfig {
      base_dir: base.to_path_buf(),
      repo_url: "https://git.example/acme/shop-api.git".into(),
      container_name: "shop".into(),
      image_tag: "shop:latest".into(),
      sudo: SudoMode::Never,
      ..DeployConfig::default()
    }
  }

  fn installer() -> CannedFetcher {
    CannedFetcher::default()
      .with("https://get.docker.com", "#!/bin/sh\n")
      .with("https://ifconfig.me", "203.0.113.7\n")
  }

  #[test]
  fn full_run_executes_stages_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let runner = FakeRunner::new();
    let fetcher = installer();
    let (rep, sink) = recording_reporter();
    let d = Deployer::new(&runner, &fetcher, &rep, &cfg, false);

    let outcome = deploy(&d).unwrap();

    assert_eq!(outcome.docker, DockerState::Installed);
    assert_eq!(outcome.repo, RepoAction::Cloned);
    assert!(outcome.env_file.exists());

    let started: Vec<String> = sink
      .snapshot()
      .into_iter()
      .filter_map(|ev| match ev {
        ProvisionEvent::StepStart { step, .. } => Some(step),
        _ => None,
      })
      .collect();
    let expected: Vec<String> = Stage::ALL.iter().map(|s| s.id().to_string()).collect();
    assert_eq!(started, expected);
    assert_eq!(sink.snapshot().last(), Some(&ProvisionEvent::Done { run_id: Uuid::nil(), ok: true }));
  }

  #[test]
  fn second_run_skips_docker_and_pulls() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let fetcher = installer();

    let first = FakeRunner::new();
    let (rep, _) = recording_reporter();
    deploy(&Deployer::new(&first, &fetcher, &rep, &cfg, false)).unwrap();

    let second = FakeRunner::new().with_installed("docker");
    let (rep, sink) = recording_reporter();
    let outcome = deploy(&Deployer::new(&second, &fetcher, &rep, &cfg, false)).unwrap();

    assert_eq!(outcome.docker, DockerState::AlreadyInstalled);
    assert_eq!(outcome.repo, RepoAction::Pulled);
    assert!(sink.log_lines().iter().any(|l| l.contains("already installed")));
    assert!(!second.lines().iter().any(|l| l.starts_with("git clone") || l.starts_with("systemctl")));
  }

  #[test]
  fn failed_build_leaves_containers_alone() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let runner = FakeRunner::new().with_installed("docker").fail("docker build", 2);
    let fetcher = installer();
    let (rep, sink) = recording_reporter();

    let err = deploy(&Deployer::new(&runner, &fetcher, &rep, &cfg, false)).unwrap_err();

    assert_eq!(exit_code_of(&err), Some(2));
    let lines = runner.lines();
    assert!(lines.last().unwrap().starts_with("docker build"));
    assert!(!lines.iter().any(|l| l.starts_with("docker stop") || l.starts_with("docker rm") || l.starts_with("docker run")));
    assert!(sink
      .snapshot()
      .iter()
      .any(|ev| matches!(ev, ProvisionEvent::StepError { step, .. } if step == "image")));
    assert_eq!(sink.snapshot().last(), Some(&ProvisionEvent::Done { run_id: Uuid::nil(), ok: false }));
  }

  #[test]
  fn env_file_lands_in_repo_dir() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let runner = FakeRunner::new().with_installed("docker");
    let fetcher = installer();
    let (rep, _) = recording_reporter();

    let outcome = deploy(&Deployer::new(&runner, &fetcher, &rep, &cfg, false)).unwrap();

    assert_eq!(outcome.env_file, dir.path().join("shop-api").join(".env"));
    let text = fs::read_to_string(&outcome.env_file).unwrap();
    assert!(text.contains("\nAPI_PORT=8080\n"));
  }

  #[test]
  fn auto_sudo_depends_on_uid() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.sudo = SudoMode::Auto;
    let fetcher = installer();
    let (rep, _) = recording_reporter();

    let root = FakeRunner::new();
    let d = Deployer::new(&root, &fetcher, &rep, &cfg, false);
    assert_eq!(d.privileged(CommandSpec::new("docker").arg("ps")).program, "docker");

    let user = FakeRunner { uid: "1000".into(), ..FakeRunner::new() };
    let d = Deployer::new(&user, &fetcher, &rep, &cfg, false);
    assert_eq!(d.privileged(CommandSpec::new("docker").arg("ps")).to_string(), "sudo docker ps");

    cfg.sudo = SudoMode::Always;
    let d = Deployer::new(&root, &fetcher, &rep, &cfg, false);
    assert_eq!(d.privileged(CommandSpec::new("docker").arg("ps")).program, "sudo");
  }

  #[test]
  fn git_is_never_run_under_sudo() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.sudo = SudoMode::Always;
    let runner = FakeRunner::new().with_installed("docker");
    let fetcher = installer();
    let (rep, _) = recording_reporter();

    deploy(&Deployer::new(&runner, &fetcher, &rep, &cfg, false)).unwrap();

    let lines = runner.lines();
    assert!(lines.iter().any(|l| l.starts_with("git clone")));
    assert!(lines.iter().any(|l| l.starts_with("sudo env DEBIAN_FRONTEND=noninteractive apt-get update")));
    assert!(lines.iter().any(|l| l.starts_with("sudo docker build")));
  }

  #[test]
  fn public_ip_lookup_is_best_effort() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let runner = FakeRunner::new();
    let (rep, sink) = recording_reporter();

    let ok = installer();
    assert_eq!(public_ip(&Deployer::new(&runner, &ok, &rep, &cfg, false)), Some("203.0.113.7".parse().unwrap()));

    let down = CannedFetcher::default();
    assert_eq!(public_ip(&Deployer::new(&runner, &down, &rep, &cfg, false)), None);

    let junk = CannedFetcher::default().with("https://ifconfig.me", "<html>rate limited</html>");
    assert_eq!(public_ip(&Deployer::new(&runner, &junk, &rep, &cfg, false)), None);
    assert_eq!(sink.log_lines().len(), 2);
  }

  #[test]
  fn banner_points_at_health_endpoint() {
    let cfg = DeployConfig::default();
    let outcome = DeployOutcome {
      run_id: Uuid::nil(),
      docker: DockerState::Installed,
      repo: RepoAction::Cloned,
      repo_dir: PathBuf::from("xianyu-backend"),
      env_file: PathBuf::from("xianyu-backend/.env"),
      image_tag: cfg.image_tag.clone(),
      container_name: cfg.container_name.clone(),
    };

    let text = render_banner(&outcome, &cfg, Some("198.51.100.4".parse().unwrap()));
    assert!(text.contains("http://198.51.100.4:8080/health"));
    assert!(text.contains(&format!("(run {})", Uuid::nil())));
    assert!(text.contains("Docker:    installed this run\n"));
    assert!(text.contains("Repo:      cloned into xianyu-backend\n"));
    assert!(text.contains("COOKIES_STR"));

    let rerun = DeployOutcome { docker: DockerState::AlreadyInstalled, repo: RepoAction::Pulled, ..outcome.clone() };
    let text = render_banner(&rerun, &cfg, None);
    assert!(text.contains("http://<server-ip>:8080\n"));
    assert!(text.contains("Docker:    already present\n"));
    assert!(text.contains("Repo:      pulled into xianyu-backend\n"));

    let text = render_banner(&outcome, &cfg, Some("2001:db8::1".parse().unwrap()));
    assert!(text.contains("http://[2001:db8::1]:8080"));
  }
}
