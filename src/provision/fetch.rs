//! SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use std::time::Duration;

pub trait Fetcher {
  fn fetch_text(&self, url: &str) -> Result<String>;
}

/// Blocking HTTP client used for the Docker install script and the public IP lookup.
pub struct HttpFetcher {
  client: Client,
}

impl HttpFetcher {
  pub fn new(timeout_secs: u64, user_agent: &str) -> Result<Self> {
    let client = Client::builder()
      .timeout(Duration::from_secs(timeout_secs))
      .user_agent(user_agent)
      .build()
      .context("building HTTP client")?;
    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch_text(&self, url: &str) -> Result<String> {
    let resp = self
      .client
      .get(url)
      .send()
      .with_context(|| format!("GET {url}"))?
      .error_for_status()
      .with_context(|| format!("GET {url}"))?;
    resp.text().with_context(|| format!("reading body of {url}"))
  }
}
