//! SPDX-License-Identifier: GPL-3.0-or-later
//! Fakes for driving the pipeline without touching the host.
use crate::provision::events::recording::RecordingSink;
use crate::provision::events::Reporter;
use crate::provision::fetch::Fetcher;
use crate::provision::runner::{CommandFailed, CommandRunner, CommandSpec};
use anyhow::{anyhow, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use uuid::Uuid;

/// Records every command. Failures are scripted by command prefix ("docker build", "docker").
#[derive(Default)]
pub struct FakeRunner {
  pub calls: RefCell<Vec<CommandSpec>>,
  pub failures: HashMap<String, i32>,
  pub installed: Vec<String>,
  pub uid: String,
}

impl FakeRunner {
  pub fn new() -> Self {
    Self { uid: "0".to_string(), ..Default::default() }
  }

  pub fn fail(mut self, prefix: &str, code: i32) -> Self {
    self.failures.insert(prefix.to_string(), code);
    self
  }

  pub fn with_installed(mut self, program: &str) -> Self {
    self.installed.push(program.to_string());
    self
  }

  /// Command lines without env or cwd, in call order.
  pub fn lines(&self) -> Vec<String> {
    self
      .calls
      .borrow()
      .iter()
      .map(|c| std::iter::once(c.program.clone()).chain(c.args.iter().cloned()).collect::<Vec<_>>().join(" "))
      .collect()
  }

  fn failure_for(&self, cmd: &CommandSpec) -> Option<i32> {
    let line = std::iter::once(cmd.program.as_str())
      .chain(cmd.args.iter().map(String::as_str))
      .filter(|p| *p != "sudo")
      .collect::<Vec<_>>()
      .join(" ");
    self
      .failures
      .iter()
      .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
      .max_by_key(|(prefix, _)| prefix.len())
      .map(|(_, code)| *code)
  }
}

impl CommandRunner for FakeRunner {
  fn run(&self, _reporter: &Reporter, _step: &str, cmd: &CommandSpec) -> Result<()> {
    self.calls.borrow_mut().push(cmd.clone());
    if let Some(code) = self.failure_for(cmd) {
      return Err(CommandFailed { command: cmd.to_string(), code: Some(code) }.into());
    }

    // a clone leaves the checkout behind like the real thing
    if cmd.program == "git" && cmd.args.first().map(String::as_str) == Some("clone") {
      if let (Some(dir), Some(name)) = (&cmd.cwd, cmd.args.last()) {
        fs::create_dir_all(dir.join(name))?;
      }
    }
    Ok(())
  }

  fn succeeds(&self, cmd: &CommandSpec) -> bool {
    self.installed.contains(&cmd.program)
  }

  fn output(&self, cmd: &CommandSpec) -> Result<String> {
    match cmd.program.as_str() {
      "id" => Ok(self.uid.clone()),
      other => Err(anyhow!("no canned output for {other}")),
    }
  }
}

/// Serves fixed bodies per URL; anything else is a fetch error.
#[derive(Default)]
pub struct CannedFetcher {
  pub bodies: HashMap<String, String>,
  pub requested: RefCell<Vec<String>>,
}

impl CannedFetcher {
  pub fn with(mut self, url: &str, body: &str) -> Self {
    self.bodies.insert(url.to_string(), body.to_string());
    self
  }
}

impl Fetcher for CannedFetcher {
  fn fetch_text(&self, url: &str) -> Result<String> {
    self.requested.borrow_mut().push(url.to_string());
    self.bodies.get(url).cloned().ok_or_else(|| anyhow!("GET {url}: connection refused"))
  }
}

pub fn recording_reporter() -> (Reporter, RecordingSink) {
  let sink = RecordingSink::default();
  (Reporter::with_run_id(Uuid::nil(), Box::new(sink.clone())), sink)
}
