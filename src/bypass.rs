//! Client for a FlareSolverr-compatible challenge bypass service.
//!
//! Every solve goes through the shared [`Gatekeeper`] and reports its
//! outcome back to it. Browser sessions are reused per domain so cookies
//! earned by one solve carry over to the next.

use crate::config::BypassConfig;
use crate::error::BypassError;
use crate::gatekeeper::Gatekeeper;
use crate::http_client::PageResponse;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Extra time allowed on the HTTP call beyond the service-side `maxTimeout`
const TRANSPORT_MARGIN: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BypassRequest<'a> {
    cmd: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    post_data: Option<&'a str>,
}

impl<'a> BypassRequest<'a> {
    fn command(cmd: &'a str) -> Self {
        Self {
            cmd,
            url: None,
            session: None,
            max_timeout: None,
            post_data: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BypassResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    solution: Option<Solution>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    sessions: Vec<String>,
}

impl BypassResponse {
    fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok")
    }

    fn into_service_error(self) -> BypassError {
        BypassError::Service {
            status: self.status,
            message: self.message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
}

/// A solved page as returned by the bypass service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    pub url: String,
    pub status: u16,
    pub response: String,
    #[serde(default)]
    pub cookies: Vec<SolutionCookie>,
    #[serde(default)]
    pub user_agent: String,
}

impl From<Solution> for PageResponse {
    fn from(s: Solution) -> Self {
        PageResponse {
            url: s.url,
            status: s.status,
            body: s.response,
        }
    }
}

/// Reports a timeout to the gatekeeper if a sent request is abandoned
/// before its outcome is known, e.g. when the caller's timeout aborts it.
/// A call whose cancellation token fired first was given up on purpose and
/// is not held against the service.
struct PendingOutcome<'a> {
    gatekeeper: &'a Gatekeeper,
    url: &'a str,
    cancel: Option<&'a CancellationToken>,
    armed: bool,
}

impl<'a> PendingOutcome<'a> {
    fn arm(
        gatekeeper: &'a Gatekeeper,
        url: &'a str,
        cancel: Option<&'a CancellationToken>,
    ) -> Self {
        Self {
            gatekeeper,
            url,
            cancel,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingOutcome<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.cancel.map_or(false, CancellationToken::is_cancelled) {
            log::debug!("[bypass] call for {} cancelled by caller", self.url);
            return;
        }
        log::warn!("[bypass] call for {} abandoned before completion", self.url);
        self.gatekeeper.report_timeout();
    }
}

pub struct BypassClient {
    http: Client,
    endpoint: String,
    config: BypassConfig,
    gatekeeper: Gatekeeper,
    /// domain → session id
    sessions: Mutex<HashMap<String, String>>,
}

impl BypassClient {
    pub fn new(config: BypassConfig, gatekeeper: Gatekeeper) -> Result<Self, BypassError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.max_timeout_ms) + TRANSPORT_MARGIN)
            .build()?;
        let endpoint = format!("{}/v1", config.base_url.trim_end_matches('/'));

        Ok(Self {
            http,
            endpoint,
            config,
            gatekeeper,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn gatekeeper(&self) -> &Gatekeeper {
        &self.gatekeeper
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Solve a GET request through the bypass service
    pub async fn get(&self, url: &str, identity: Option<&str>) -> Result<Solution, BypassError> {
        self.solve("request.get", url, None, identity, None).await
    }

    /// Like [`get`](Self::get), giving up while queued once `cancel` fires.
    /// Dropping the call after cancelling does not count against the circuit.
    pub async fn get_cancellable(
        &self,
        url: &str,
        identity: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Solution, BypassError> {
        self.solve("request.get", url, None, identity, Some(cancel))
            .await
    }

    /// Solve a form POST; `post_data` is `application/x-www-form-urlencoded`
    pub async fn post(
        &self,
        url: &str,
        post_data: &str,
        identity: Option<&str>,
    ) -> Result<Solution, BypassError> {
        self.solve("request.post", url, Some(post_data), identity, None)
            .await
    }

    async fn solve(
        &self,
        cmd: &str,
        url: &str,
        post_data: Option<&str>,
        identity: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Solution, BypassError> {
        let domain = domain_of(url)?;
        let queue_timeout = self.gatekeeper.config().queue_timeout();
        let permit = match cancel {
            Some(token) => {
                self.gatekeeper
                    .acquire_slot_cancellable(queue_timeout, identity, token)
                    .await?
            }
            None => self.gatekeeper.acquire_slot(queue_timeout, identity).await?,
        };

        let session = if self.config.session_reuse {
            self.session_for(&domain).await
        } else {
            None
        };

        let started = Instant::now();
        let request = BypassRequest {
            url: Some(url),
            session: session.as_deref(),
            max_timeout: Some(self.config.max_timeout_ms),
            post_data,
            ..BypassRequest::command(cmd)
        };
        let mut pending = PendingOutcome::arm(&self.gatekeeper, url, cancel);
        let result = self.send(&request).await;
        pending.disarm();
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(response) if response.is_ok() => match response.solution {
                Some(solution) => {
                    self.gatekeeper.report_success(elapsed);
                    log::debug!(
                        "[bypass] solved {} in {}ms (status {})",
                        url,
                        elapsed.as_millis(),
                        solution.status
                    );
                    Ok(solution)
                }
                None => {
                    self.gatekeeper.report_failure();
                    Err(BypassError::MissingSolution)
                }
            },
            Ok(response) => {
                self.gatekeeper.report_failure();
                if session.is_some() {
                    self.forget_session(&domain);
                }
                Err(response.into_service_error())
            }
            Err(BypassError::Timeout(ms)) => {
                self.gatekeeper.report_timeout();
                Err(BypassError::Timeout(ms))
            }
            Err(e) => {
                self.gatekeeper.report_failure();
                Err(e)
            }
        };

        if let Err(e) = &outcome {
            log::warn!("[bypass] {} {} failed after {}ms: {}", cmd, url, elapsed.as_millis(), e);
        }
        drop(permit);
        outcome
    }

    async fn send(&self, request: &BypassRequest<'_>) -> Result<BypassResponse, BypassError> {
        let timeout_ms = self.config.max_timeout_ms;
        let response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BypassError::Timeout(timeout_ms)
                } else {
                    BypassError::Http(e)
                }
            })?;

        // Failures come back as non-2xx with the same JSON envelope
        Ok(response.json::<BypassResponse>().await?)
    }

    /// Existing session for `domain`, creating one when absent. Creation
    /// failures fall back to a sessionless request.
    async fn session_for(&self, domain: &str) -> Option<String> {
        if let Some(id) = self.lock_sessions().get(domain) {
            return Some(id.clone());
        }

        let wanted = format!("{}-{}", domain, uuid::Uuid::new_v4().simple());
        let request = BypassRequest {
            session: Some(&wanted),
            ..BypassRequest::command("sessions.create")
        };
        let created = match self.send(&request).await {
            Ok(response) if response.is_ok() => response.session.unwrap_or(wanted),
            Ok(response) => {
                log::warn!("[bypass] session create for {} refused: {}", domain, response.message);
                return None;
            }
            Err(e) => {
                log::warn!("[bypass] session create for {} failed: {}", domain, e);
                return None;
            }
        };

        let existing = {
            let mut sessions = self.lock_sessions();
            match sessions.get(domain) {
                Some(existing) => Some(existing.clone()),
                None => {
                    sessions.insert(domain.to_string(), created.clone());
                    None
                }
            }
        };

        match existing {
            // Lost a creation race; keep the first session
            Some(existing) => {
                if let Err(e) = self.destroy_remote(&created).await {
                    log::debug!("[bypass] failed to destroy duplicate session {}: {}", created, e);
                }
                Some(existing)
            }
            None => {
                log::info!("[bypass] created session {} for {}", created, domain);
                Some(created)
            }
        }
    }

    fn forget_session(&self, domain: &str) {
        if let Some(id) = self.lock_sessions().remove(domain) {
            log::info!("[bypass] dropped session {} for {}", id, domain);
        }
    }

    /// Sessions this client is currently reusing, as `(domain, session)`
    pub fn local_sessions(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .lock_sessions()
            .iter()
            .map(|(d, s)| (d.clone(), s.clone()))
            .collect();
        out.sort();
        out
    }

    /// Sessions alive on the bypass service
    pub async fn list_sessions(&self) -> Result<Vec<String>, BypassError> {
        let response = self.send(&BypassRequest::command("sessions.list")).await?;
        if !response.is_ok() {
            return Err(response.into_service_error());
        }
        Ok(response.sessions)
    }

    pub async fn destroy_session(&self, session: &str) -> Result<(), BypassError> {
        self.lock_sessions().retain(|_, id| id != session);
        self.destroy_remote(session).await
    }

    /// Destroy every session this client created, returning how many went
    pub async fn destroy_all_sessions(&self) -> usize {
        let ids: Vec<String> = self.lock_sessions().drain().map(|(_, id)| id).collect();
        let mut destroyed = 0;
        for id in ids {
            match self.destroy_remote(&id).await {
                Ok(()) => destroyed += 1,
                Err(e) => log::warn!("[bypass] failed to destroy session {}: {}", id, e),
            }
        }
        destroyed
    }

    async fn destroy_remote(&self, session: &str) -> Result<(), BypassError> {
        let request = BypassRequest {
            session: Some(session),
            ..BypassRequest::command("sessions.destroy")
        };
        let response = self.send(&request).await?;
        if response.is_ok() {
            Ok(())
        } else {
            Err(response.into_service_error())
        }
    }
}

/// Host part of `url`, used as the session key
pub fn domain_of(url: &str) -> Result<String, BypassError> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .ok_or_else(|| BypassError::InvalidUrl(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = BypassRequest {
            url: Some("https://example.org/a"),
            max_timeout: Some(60_000),
            post_data: Some("q=1"),
            ..BypassRequest::command("request.post")
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "cmd": "request.post",
                "url": "https://example.org/a",
                "maxTimeout": 60000,
                "postData": "q=1"
            })
        );

        let list = serde_json::to_value(BypassRequest::command("sessions.list")).unwrap();
        assert_eq!(list, json!({"cmd": "sessions.list"}));
    }

    #[test]
    fn test_response_parsing() {
        let response: BypassResponse = serde_json::from_value(json!({
            "status": "ok",
            "message": "Challenge solved!",
            "solution": {
                "url": "https://example.org/a",
                "status": 200,
                "response": "<html>ok</html>",
                "cookies": [{"name": "cf_clearance", "value": "abc", "domain": ".example.org"}],
                "userAgent": "Mozilla/5.0"
            },
            "startTimestamp": 1,
            "endTimestamp": 2,
            "version": "3.3.0"
        }))
        .unwrap();

        assert!(response.is_ok());
        let solution = response.solution.unwrap();
        assert_eq!(solution.cookies[0].name, "cf_clearance");
        assert_eq!(solution.user_agent, "Mozilla/5.0");

        let page = PageResponse::from(solution);
        assert_eq!(page.status, 200);
        assert_eq!(page.body, "<html>ok</html>");
    }

    #[test]
    fn test_error_response() {
        let response: BypassResponse = serde_json::from_value(json!({
            "status": "error",
            "message": "Error: Maximum timeout reached"
        }))
        .unwrap();
        assert!(!response.is_ok());
        assert!(matches!(
            response.into_service_error(),
            BypassError::Service { ref status, .. } if status == "error"
        ));
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("https://Example.org/path?q=1").unwrap(), "example.org");
        assert!(matches!(domain_of("not a url"), Err(BypassError::InvalidUrl(_))));
    }

    #[test]
    fn test_endpoint_normalised() {
        let client = BypassClient::new(
            BypassConfig {
                base_url: "http://localhost:8191/".to_string(),
                ..BypassConfig::default()
            },
            Gatekeeper::new(Default::default()),
        )
        .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8191/v1");
    }
}
