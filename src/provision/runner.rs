//! SPDX-License-Identifier: GPL-3.0-or-later
use crate::provision::events::Reporter;
use anyhow::{bail, Context, Result};
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

/// A command that exited non-zero. Kept in the error chain so the exit code can reach `main`.
#[derive(Debug, thiserror::Error)]
#[error("command failed ({}): {command}", describe_code(.code))]
pub struct CommandFailed {
  pub command: String,
  pub code: Option<i32>,
}

fn describe_code(code: &Option<i32>) -> String {
  match code {
    Some(c) => format!("exit={c}"),
    None => "killed by signal".to_string(),
  }
}

/// Exit code of the first failed command in an error chain.
pub fn exit_code_of(err: &anyhow::Error) -> Option<i32> {
  err.chain().find_map(|e| e.downcast_ref::<CommandFailed>()).and_then(|f| f.code)
}

/// An external command description, turned into a `std::process::Command` only when it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
  pub program: String,
  pub args: Vec<String>,
  pub cwd: Option<PathBuf>,
  pub env: Vec<(String, String)>,
}

impl CommandSpec {
  pub fn new(program: impl Into<String>) -> Self {
    Self { program: program.into(), args: Vec::new(), cwd: None, env: Vec::new() }
  }

  pub fn arg(mut self, arg: impl Into<String>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
    self.cwd = Some(dir.as_ref().to_path_buf());
    self
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.push((key.into(), value.into()));
    self
  }

  /// Wraps the command in `sudo`, passing env vars through `env` so sudo's env reset does not drop them.
  pub fn with_sudo(self) -> Self {
    let mut args = Vec::new();
    if !self.env.is_empty() {
      args.push("env".to_string());
      args.extend(self.env.iter().map(|(k, v)| format!("{k}={v}")));
    }
    args.push(self.program);
    args.extend(self.args);
    Self { program: "sudo".to_string(), args, cwd: self.cwd, env: Vec::new() }
  }

  pub fn to_command(&self) -> Command {
    let mut cmd = Command::new(&self.program);
    cmd.args(&self.args);
    if let Some(dir) = &self.cwd {
      cmd.current_dir(dir);
    }
    for (k, v) in &self.env {
      cmd.env(k, v);
    }
    cmd
  }
}

impl fmt::Display for CommandSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (k, v) in &self.env {
      write!(f, "{k}={v} ")?;
    }
    write!(f, "{}", self.program)?;
    for a in &self.args {
      if a.is_empty() || a.contains(char::is_whitespace) {
        write!(f, " '{}'", a.replace('\'', r"'\''"))?;
      } else {
        write!(f, " {a}")?;
      }
    }
    if let Some(dir) = &self.cwd {
      write!(f, " (in {})", dir.display())?;
    }
    Ok(())
  }
}

pub trait CommandRunner {
  /// Runs to completion with output streamed into the reporter. Non-zero exit is an error.
  fn run(&self, reporter: &Reporter, step: &str, cmd: &CommandSpec) -> Result<()>;

  /// Runs silently and reports whether the command exited zero. A missing binary counts as failure.
  fn succeeds(&self, cmd: &CommandSpec) -> bool;

  /// Captures trimmed stdout.
  fn output(&self, cmd: &CommandSpec) -> Result<String>;
}

/// Runs real processes on this host.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
  fn run(&self, reporter: &Reporter, step: &str, cmd: &CommandSpec) -> Result<()> {
    run_with_output(reporter, step, cmd)
  }

  fn succeeds(&self, cmd: &CommandSpec) -> bool {
    cmd
      .to_command()
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .map(|s| s.success())
      .unwrap_or(false)
  }

  fn output(&self, cmd: &CommandSpec) -> Result<String> {
    let out = cmd
      .to_command()
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .output()
      .with_context(|| format!("failed to run {cmd}"))?;

    if !out.status.success() {
      return Err(CommandFailed { command: cmd.to_string(), code: out.status.code() }.into());
    }

    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
  }
}

pub fn run_with_output(reporter: &Reporter, step: &str, spec: &CommandSpec) -> Result<()> {
  // stream stdout and stderr into events
  reporter.log_line("info", Some(step), format!("running: {spec}"));
  let mut child = spec
    .to_command()
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .with_context(|| format!("failed to spawn {spec}"))?;

  let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
    bail!("child pipes unavailable for {spec}");
  };

  let status = thread::scope(|s| {
    s.spawn(|| {
      for line in BufReader::new(stdout).lines().map_while(Result::ok) {
        reporter.child_line("info", step, &line);
      }
    });
    s.spawn(|| {
      for line in BufReader::new(stderr).lines().map_while(Result::ok) {
        reporter.child_line("error", step, &line);
      }
    });
    child.wait()
  })
  .with_context(|| format!("waiting for {spec}"))?;

  if !status.success() {
    return Err(CommandFailed { command: spec.to_string(), code: status.code() }.into());
  }

  Ok(())
}

/// Logs mutating commands instead of running them. Probes still go to the wrapped runner.
pub struct DryRunRunner<R> {
  inner: R,
}

impl<R: CommandRunner> DryRunRunner<R> {
  pub fn new(inner: R) -> Self {
    Self { inner }
  }
}

impl<R: CommandRunner> CommandRunner for DryRunRunner<R> {
  fn run(&self, reporter: &Reporter, step: &str, cmd: &CommandSpec) -> Result<()> {
    reporter.log_line("info", Some(step), format!("would run: {cmd}"));
    Ok(())
  }

  fn succeeds(&self, cmd: &CommandSpec) -> bool {
    self.inner.succeeds(cmd)
  }

  fn output(&self, cmd: &CommandSpec) -> Result<String> {
    self.inner.output(cmd)
  }
}
