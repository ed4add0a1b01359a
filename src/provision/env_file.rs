//! SPDX-License-Identifier: GPL-3.0-or-later
use crate::provision::types::DeployConfig;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// Keys written to the env file, in file order.
pub const ENV_KEYS: [&str; 6] = ["DATABASE_URL", "API_HOST", "API_PORT", "CORS_ORIGINS", "DOCKER_ENV", "COOKIES_STR"];

/// Environment consumed by the backend container through `--env-file`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvFile {
  pub database_url: String,
  pub api_host: String,
  pub api_port: u16,
  pub cors_origins: String,
  pub docker_env: bool,
  /// left commented out when unset so the operator can fill it in after deploy
  pub cookies_str: Option<String>,
}

impl EnvFile {
  /// Fails on values spanning lines, since `--env-file` would read the tail as extra keys.
  pub fn from_config(cfg: &DeployConfig) -> Result<Self> {
    let values = [
      ("DATABASE_URL", Some(&cfg.env.database_url)),
      ("API_HOST", Some(&cfg.env.api_host)),
      ("CORS_ORIGINS", Some(&cfg.env.cors_origins)),
      ("COOKIES_STR", cfg.env.cookies_str.as_ref()),
    ];
    for (key, value) in values {
      if value.is_some_and(|v| v.contains(['\n', '\r'])) {
        bail!("{key} must be a single line");
      }
    }

    Ok(Self {
      database_url: cfg.env.database_url.clone(),
      api_host: cfg.env.api_host.clone(),
      api_port: cfg.container_port,
      cors_origins: cfg.env.cors_origins.clone(),
      docker_env: cfg.env.docker_env,
      cookies_str: cfg.env.cookies_str.clone().filter(|v| !v.trim().is_empty()),
    })
  }

  pub fn render(&self) -> String {
    let mut out = String::new();
    out.push_str("# Generated by backend-deploy. Overwritten on every run.\n");
    out.push_str(&format!("DATABASE_URL={}\n", self.database_url));
    out.push_str(&format!("API_HOST={}\n", self.api_host));
    out.push_str(&format!("API_PORT={}\n", self.api_port));
    out.push_str(&format!("CORS_ORIGINS={}\n", self.cors_origins));
    out.push_str(&format!("DOCKER_ENV={}\n", self.docker_env));
    match &self.cookies_str {
      Some(cookies) => out.push_str(&format!("COOKIES_STR={cookies}\n")),
      None => {
        out.push_str("# Set your Xianyu cookies here after deploy, then restart the container.\n");
        out.push_str("# COOKIES_STR=\n");
      }
    }
    out
  }

  /// Replaces whatever is at `path`; no merge with the previous file.
  pub fn write(&self, path: &Path) -> Result<()> {
    fs::write(path, self.render()).with_context(|| format!("writing env file {}", path.display()))?;

    // the file carries a credential
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      let perm = fs::Permissions::from_mode(0o600);
      fs::set_permissions(path, perm).with_context(|| format!("restricting permissions on {}", path.display()))?;
    }

    Ok(())
  }
}
