//! SPDX-License-Identifier: GPL-3.0-or-later
use crate::provision::env_file::EnvFile;
use crate::provision::runner::CommandSpec;
use crate::provision::Deployer;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Packages,
  Docker,
  Repository,
  EnvFile,
  Image,
  Container,
}

impl Stage {
  pub const ALL: [Stage; 6] = [
    Stage::Packages,
    Stage::Docker,
    Stage::Repository,
    Stage::EnvFile,
    Stage::Image,
    Stage::Container,
  ];

  pub fn id(self) -> &'static str {
    match self {
      Stage::Packages => "packages",
      Stage::Docker => "docker",
      Stage::Repository => "repository",
      Stage::EnvFile => "env_file",
      Stage::Image => "image",
      Stage::Container => "container",
    }
  }

  pub fn title(self) -> &'static str {
    match self {
      Stage::Packages => "Installing system packages",
      Stage::Docker => "Installing Docker",
      Stage::Repository => "Syncing backend repository",
      Stage::EnvFile => "Writing environment file",
      Stage::Image => "Building Docker image",
      Stage::Container => "Restarting container",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerState {
  AlreadyInstalled,
  Installed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoAction {
  Cloned,
  Pulled,
}

pub fn install_packages(d: &Deployer) -> Result<()> {
  let step = Stage::Packages.id();
  d.runner.run(d.reporter, step, &apt(d, &["update", "-y"])).context("apt-get update failed")?;

  if d.cfg.packages.is_empty() {
    d.reporter.log_line("info", Some(step), "No packages configured.");
    return Ok(());
  }
  let mut args = vec!["install", "-y"];
  args.extend(d.cfg.packages.iter().map(String::as_str));
  d.runner.run(d.reporter, step, &apt(d, &args)).context("apt-get install failed")?;
  Ok(())
}

fn apt(d: &Deployer, args: &[&str]) -> CommandSpec {
  d.privileged(
    CommandSpec::new("apt-get")
      .args(args.iter().copied())
      .env("DEBIAN_FRONTEND", "noninteractive"),
  )
}

pub fn install_docker(d: &Deployer) -> Result<DockerState> {
  let step = Stage::Docker.id();
  if d.runner.succeeds(&CommandSpec::new("docker").arg("--version")) {
    d.reporter.log_line("info", Some(step), "Docker is already installed, skipping.");
    return Ok(DockerState::AlreadyInstalled);
  }

  // the dir must outlive the installer run
  let work_dir = if d.dry_run {
    None
  } else {
    let dir = tempfile::Builder::new()
      .prefix("docker-install")
      .tempdir()
      .context("creating temp dir for docker installer")?;
    Some(dir)
  };
  let script_path = match &work_dir {
    Some(dir) => {
      let path = dir.path().join("get-docker.sh");
      d.reporter.log_line("info", Some(step), format!("Downloading {}", d.cfg.docker_install_url));
      let script = d
        .fetcher
        .fetch_text(&d.cfg.docker_install_url)
        .context("downloading docker install script")?;
      fs::write(&path, script).with_context(|| format!("writing {}", path.display()))?;
      path
    }
    None => {
      d.reporter.log_line("info", Some(step), format!("would download {}", d.cfg.docker_install_url));
      PathBuf::from("get-docker.sh")
    }
  };

  let install = d.privileged(CommandSpec::new("sh").arg(script_path.display().to_string()));
  d.runner.run(d.reporter, step, &install).context("docker install script failed")?;

  for action in ["enable", "start"] {
    let cmd = d.privileged(CommandSpec::new("systemctl").args([action, "docker"]));
    d.runner.run(d.reporter, step, &cmd).with_context(|| format!("systemctl {action} docker failed"))?;
  }

  Ok(DockerState::Installed)
}

pub fn sync_repository(d: &Deployer) -> Result<RepoAction> {
  let step = Stage::Repository.id();
  let repo_dir = d.cfg.repo_dir();

  if repo_dir.is_dir() {
    d.reporter.log_line("info", Some(step), format!("{} exists, pulling latest changes.", repo_dir.display()));
    let pull = CommandSpec::new("git").arg("pull").current_dir(&repo_dir);
    d.runner.run(d.reporter, step, &pull).context("git pull failed")?;
    return Ok(RepoAction::Pulled);
  }

  let clone = CommandSpec::new("git")
    .args(["clone", d.cfg.repo_url.as_str(), d.cfg.repo_name().as_str()])
    .current_dir(&d.cfg.base_dir);
  d.runner.run(d.reporter, step, &clone).context("git clone failed")?;
  Ok(RepoAction::Cloned)
}

pub fn write_env_file(d: &Deployer) -> Result<PathBuf> {
  let step = Stage::EnvFile.id();
  let path = d.cfg.repo_dir().join(&d.cfg.env_file);
  let env = EnvFile::from_config(d.cfg)?;

  if d.dry_run {
    d.reporter.log_line("info", Some(step), format!("would write {}", path.display()));
    return Ok(path);
  }

  env.write(&path)?;
  d.reporter.log_line("info", Some(step), format!("Wrote {}", path.display()));
  if env.cookies_str.is_none() {
    d.reporter.log_line("warn", Some(step), "COOKIES_STR is not set; edit the env file after deploy.");
  }
  Ok(path)
}

pub fn build_image(d: &Deployer) -> Result<()> {
  let step = Stage::Image.id();
  let cmd = d.privileged(
    CommandSpec::new("docker")
      .args(["build", "-t", d.cfg.image_tag.as_str(), "."])
      .current_dir(d.cfg.repo_dir()),
  );
  d.runner.run(d.reporter, step, &cmd).context("docker build failed")?;
  Ok(())
}

pub fn restart_container(d: &Deployer) -> Result<()> {
  let step = Stage::Container.id();
  let name = d.cfg.container_name.as_str();

  // the container may not exist yet
  for action in ["stop", "rm"] {
    let cmd = d.privileged(CommandSpec::new("docker").args([action, name]));
    if let Err(e) = d.runner.run(d.reporter, step, &cmd) {
      d.reporter.log_line("warn", Some(step), format!("ignoring failed docker {action}: {e:#}"));
    }
  }

  let cmd = d.privileged(
    CommandSpec::new("docker")
      .args(["run", "-d", "--name", name])
      .args(["--env-file", d.cfg.env_file.as_str()])
      .args(["-p".to_string(), d.cfg.port_mapping()])
      .args(["--restart", d.cfg.restart_policy.as_str()])
      .arg(d.cfg.image_tag.as_str())
      .current_dir(d.cfg.repo_dir()),
  );
  d.runner.run(d.reporter, step, &cmd).context("docker run failed")?;
  Ok(())
}
