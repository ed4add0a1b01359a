//! SPDX-License-Identifier: GPL-3.0-or-later
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ProvisionEvent {
  #[serde(rename = "step_start")]
  StepStart {
    run_id: Uuid,
    step: String,
    title: String,
  },

  #[serde(rename = "log")]
  Log {
    run_id: Uuid,
    level: String,
    step: Option<String>,
    line: String,
  },

  #[serde(rename = "step_ok")]
  StepOk {
    run_id: Uuid,
    step: String,
  },

  #[serde(rename = "step_error")]
  StepError {
    run_id: Uuid,
    step: String,
    message: String,
  },

  #[serde(rename = "done")]
  Done {
    run_id: Uuid,
    ok: bool,
  },
}

/// Destination for provision events.
pub trait EventSink: Send + Sync {
  fn emit(&self, ev: &ProvisionEvent);
}

/// Turns events into `log` records.
pub struct LogSink;

impl EventSink for LogSink {
  fn emit(&self, ev: &ProvisionEvent) {
    match ev {
      ProvisionEvent::StepStart { step, title, .. } => log::info!("[{step}] {title}"),
      ProvisionEvent::Log { level, step, line, .. } => {
        let level = parse_level(level);
        match step {
          Some(step) => log::log!(level, "[{step}] {line}"),
          None => log::log!(level, "{line}"),
        }
      }
      ProvisionEvent::StepOk { step, .. } => log::info!("[{step}] done"),
      ProvisionEvent::StepError { step, message, .. } => log::error!("[{step}] failed: {message}"),
      ProvisionEvent::Done { run_id, ok } => {
        if *ok {
          log::info!("run {run_id} finished");
        } else {
          log::error!("run {run_id} failed");
        }
      }
    }
  }
}

/// Writes one JSON object per event, stdout by default.
pub struct JsonLinesSink<W = std::io::Stdout> {
  out: Mutex<W>,
}

impl JsonLinesSink {
  pub fn stdout() -> Self {
    Self::new(std::io::stdout())
  }
}

impl<W: Write + Send> JsonLinesSink<W> {
  pub fn new(out: W) -> Self {
    Self { out: Mutex::new(out) }
  }

  pub fn into_inner(self) -> W {
    self.out.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
  fn emit(&self, ev: &ProvisionEvent) {
    let Ok(line) = serde_json::to_string(ev) else {
      return;
    };
    let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    // ignore write errors on a closed stdout
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
  }
}

fn parse_level(level: &str) -> log::Level {
  match level {
    "error" => log::Level::Error,
    "warn" => log::Level::Warn,
    "debug" => log::Level::Debug,
    "trace" => log::Level::Trace,
    _ => log::Level::Info,
  }
}

/// Stamps every event with the run id and forwards it to a sink.
pub struct Reporter {
  run_id: Uuid,
  sink: Box<dyn EventSink>,
}

impl Reporter {
  pub fn new(sink: Box<dyn EventSink>) -> Self {
    Self::with_run_id(Uuid::new_v4(), sink)
  }

  pub fn with_run_id(run_id: Uuid, sink: Box<dyn EventSink>) -> Self {
    Self { run_id, sink }
  }

  pub fn run_id(&self) -> Uuid {
    self.run_id
  }

  pub fn emit(&self, ev: ProvisionEvent) {
    self.sink.emit(&ev);
  }

  pub fn step_start(&self, step: &str, title: &str) {
    self.emit(ProvisionEvent::StepStart {
      run_id: self.run_id,
      step: step.to_string(),
      title: title.to_string(),
    });
  }

  pub fn step_ok(&self, step: &str) {
    self.emit(ProvisionEvent::StepOk {
      run_id: self.run_id,
      step: step.to_string(),
    });
  }

  pub fn step_error(&self, step: &str, msg: impl Into<String>) {
    self.emit(ProvisionEvent::StepError {
      run_id: self.run_id,
      step: step.to_string(),
      message: msg.into(),
    });
  }

  pub fn log_line(&self, level: &str, step: Option<&str>, line: impl Into<String>) {
    self.emit(ProvisionEvent::Log {
      run_id: self.run_id,
      level: level.to_string(),
      step: step.map(|s| s.to_string()),
      line: line.into(),
    });
  }

  pub fn done(&self, ok: bool) {
    self.emit(ProvisionEvent::Done { run_id: self.run_id, ok });
  }

  /// Forwards one line of child output, dropping blank ones.
  pub fn child_line(&self, level: &str, step: &str, line: &str) {
    if !line.trim().is_empty() {
      self.log_line(level, Some(step), line.to_string());
    }
  }
}
