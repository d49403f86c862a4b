//! Defect-tracker client for ferry.
//!
//! Try pushes report back to a Bugzilla-style tracker: one comment when a
//! push is created, one more when infrastructure failures are detected.
//! This crate provides the blocking REST client behind those comments;
//! the `Tracker` trait it implements lives in ferry-core.
//!
//! Comments are best-effort at call sites: a tracker outage must never
//! fail a sync operation.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use ferry_config::TrackerConfig;
use tracing::debug;

/// Blocking REST client posting comments to `<base>/rest/bug/<id>/comment`.
#[derive(Debug)]
pub struct RestTracker {
    base: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
}

impl RestTracker {
    /// Build a client from configuration. Fails when no base URL is set.
    pub fn from_config(config: &TrackerConfig) -> Result<Self> {
        let base = config
            .base
            .clone()
            .context("tracker base URL not configured")?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    /// Post a comment on a bug.
    pub fn comment(&self, bug: u64, text: &str) -> Result<()> {
        let url = format!("{}/rest/bug/{bug}/comment", self.base);
        debug!(bug, url = %url, "posting tracker comment");

        let mut request = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "comment": text }));
        if let Some(key) = &self.api_key {
            request = request.header("X-Bugzilla-API-Key", key);
        }

        let response = request
            .send()
            .with_context(|| format!("failed to post comment to {url}"))?;

        if !response.status().is_success() {
            bail!(
                "tracker comment on bug {bug} failed with status {}: {}",
                response.status(),
                response.text().unwrap_or_default()
            );
        }
        Ok(())
    }
}

impl ferry_core::Tracker for RestTracker {
    fn comment(&self, bug: u64, text: &str) -> Result<()> {
        RestTracker::comment(self, bug, text)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn config_for(port: u16) -> TrackerConfig {
        TrackerConfig {
            base: Some(format!("http://127.0.0.1:{port}/")),
            api_key: Some("k3y".to_string()),
            timeout_secs: 5,
        }
    }

    #[test]
    fn from_config_requires_base() {
        let config = TrackerConfig::default();
        assert!(RestTracker::from_config(&config).is_err());
    }

    #[test]
    fn comment_posts_json_with_api_key() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
        let port = server.server_addr().to_ip().expect("addr").port();

        let handle = std::thread::spawn(move || {
            let mut request = server.recv().expect("recv");
            let url = request.url().to_string();
            let api_key = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("X-Bugzilla-API-Key"))
                .map(|h| h.value.as_str().to_string());
            let mut body = String::new();
            request
                .as_reader()
                .read_to_string(&mut body)
                .expect("read body");
            request
                .respond(tiny_http::Response::from_string("{}"))
                .expect("respond");
            (url, api_key, body)
        });

        let tracker = RestTracker::from_config(&config_for(port)).expect("tracker");
        tracker.comment(1234, "Pushed to try").expect("comment");

        let (url, api_key, body) = handle.join().expect("join");
        assert_eq!(url, "/rest/bug/1234/comment");
        assert_eq!(api_key.as_deref(), Some("k3y"));
        let parsed: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(parsed["comment"], "Pushed to try");
    }

    #[test]
    fn comment_surfaces_http_errors() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
        let port = server.server_addr().to_ip().expect("addr").port();

        let handle = std::thread::spawn(move || {
            let request = server.recv().expect("recv");
            request
                .respond(tiny_http::Response::from_string("no").with_status_code(503))
                .expect("respond");
        });

        let tracker = RestTracker::from_config(&config_for(port)).expect("tracker");
        let err = tracker.comment(1, "hello").unwrap_err();
        assert!(err.to_string().contains("503"));
        handle.join().expect("join");
    }
}
