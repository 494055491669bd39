//! REST backend.
//!
//! Talks HTTPS basic-auth to the router's JSON collection API with one
//! persistent [`reqwest::Client`]. Object ids for queues and mangle rules
//! are discovered once and cached; a `404` on a cached id invalidates the
//! cache entry and the lookup is re-resolved exactly once before the error
//! is surfaced.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Deserializer};

use wanguard_common::config::RouterConfig;
use wanguard_common::names::{QueueName, RuleComment};

use crate::backend::{QueueStats, RouterBackend, RuleStatus};
use crate::error::RouterError;
use crate::parse::parse_time_ms;

pub struct RestBackend {
    client: reqwest::Client,
    base: String,
    user: String,
    password: String,
    deadline: Duration,
    queue_ids: Mutex<HashMap<String, String>>,
    rule_ids: Mutex<HashMap<String, String>>,
}

impl RestBackend {
    pub fn new(
        router: &RouterConfig,
        password: Option<String>,
        deadline: Duration,
    ) -> Result<Self, RouterError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!router.verify_tls)
            .timeout(deadline)
            .build()
            .map_err(|e| RouterError::Connection(e.to_string()))?;
        Ok(RestBackend {
            client,
            base: format!("https://{}:{}/rest", router.host, router.port()),
            user: router.user.clone(),
            password: password.unwrap_or_default(),
            deadline,
            queue_ids: Mutex::new(HashMap::new()),
            rule_ids: Mutex::new(HashMap::new()),
        })
    }

    fn map_transport_error(&self, e: reqwest::Error) -> RouterError {
        if e.is_timeout() {
            RouterError::Timeout(self.deadline)
        } else if e.is_decode() {
            RouterError::Schema(e.to_string())
        } else {
            RouterError::Connection(e.to_string())
        }
    }

    fn check_status(status: reqwest::StatusCode, context: &str) -> Result<(), RouterError> {
        use reqwest::StatusCode;
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RouterError::Auth),
            StatusCode::NOT_FOUND => Err(RouterError::NotFound(context.to_string())),
            s if s.is_client_error() => {
                Err(RouterError::Rejected(format!("{context}: HTTP {s}")))
            }
            s => Err(RouterError::Server(format!("{context}: HTTP {s}"))),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        context: &str,
    ) -> Result<T, RouterError> {
        let resp = self
            .client
            .get(format!("{}/{path}", self.base))
            .basic_auth(&self.user, Some(&self.password))
            .query(query)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        Self::check_status(resp.status(), context)?;
        resp.json::<T>()
            .await
            .map_err(|e| RouterError::Schema(format!("{context}: {e}")))
    }

    async fn patch_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        context: &str,
    ) -> Result<(), RouterError> {
        let resp = self
            .client
            .patch(format!("{}/{path}", self.base))
            .basic_auth(&self.user, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        Self::check_status(resp.status(), context)
    }

    async fn resolve_queue_id(&self, queue: &QueueName) -> Result<String, RouterError> {
        if let Some(id) = self.queue_ids.lock().unwrap().get(queue.as_str()) {
            return Ok(id.clone());
        }
        let rows: Vec<IdRow> = self
            .get_json("queue/simple", &[("name", queue.as_str())], queue.as_str())
            .await?;
        let row = rows
            .into_iter()
            .find(|r| r.name == queue.as_str())
            .ok_or_else(|| RouterError::NotFound(queue.as_str().to_string()))?;
        self.queue_ids
            .lock()
            .unwrap()
            .insert(queue.as_str().to_string(), row.id.clone());
        Ok(row.id)
    }

    async fn resolve_rule(&self, comment: &RuleComment) -> Result<RuleRow, RouterError> {
        let rows: Vec<RuleRow> = self
            .get_json(
                "ip/firewall/mangle",
                &[("comment", comment.as_str())],
                comment.as_str(),
            )
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| RouterError::NotFound(comment.as_str().to_string()))?;
        self.rule_ids
            .lock()
            .unwrap()
            .insert(comment.as_str().to_string(), row.id.clone());
        Ok(row)
    }

    async fn cached_rule_id(&self, comment: &RuleComment) -> Result<String, RouterError> {
        if let Some(id) = self.rule_ids.lock().unwrap().get(comment.as_str()) {
            return Ok(id.clone());
        }
        Ok(self.resolve_rule(comment).await?.id)
    }

    async fn set_rule_disabled(
        &self,
        comment: &RuleComment,
        disabled: bool,
    ) -> Result<(), RouterError> {
        let body = serde_json::json!({ "disabled": if disabled { "true" } else { "false" } });
        let id = self.cached_rule_id(comment).await?;
        let path = format!("ip/firewall/mangle/{id}");
        match self.patch_json(&path, &body, comment.as_str()).await {
            Err(RouterError::NotFound(_)) => {
                // Rule was recreated with a new id; re-resolve once.
                self.rule_ids.lock().unwrap().remove(comment.as_str());
                let id = self.resolve_rule(comment).await?.id;
                let path = format!("ip/firewall/mangle/{id}");
                self.patch_json(&path, &body, comment.as_str()).await
            }
            other => other,
        }
    }

    async fn queue_stats_by_id(&self, id: &str, context: &str) -> Result<QueueStats, RouterError> {
        let row: StatsRow = self
            .get_json(&format!("queue/simple/{id}/stats"), &[], context)
            .await?;
        Ok(QueueStats {
            packets: row.packets,
            bytes: row.bytes,
            dropped: row.dropped,
            queued_packets: row.queued_packets,
            queued_bytes: row.queued_bytes,
            timestamp: Utc::now(),
        })
    }
}

impl RouterBackend for RestBackend {
    async fn get_queue_stats(&self, queue: &QueueName) -> Result<QueueStats, RouterError> {
        let id = self.resolve_queue_id(queue).await?;
        match self.queue_stats_by_id(&id, queue.as_str()).await {
            Err(RouterError::NotFound(_)) => {
                self.queue_ids.lock().unwrap().remove(queue.as_str());
                let id = self.resolve_queue_id(queue).await?;
                self.queue_stats_by_id(&id, queue.as_str()).await
            }
            other => other,
        }
    }

    async fn set_queue_rates(
        &self,
        queue: &QueueName,
        download_bps: u64,
        upload_bps: u64,
    ) -> Result<(), RouterError> {
        let body = serde_json::json!({
            "max-limit-down": download_bps,
            "max-limit-up": upload_bps,
        });
        let id = self.resolve_queue_id(queue).await?;
        let path = format!("queue/simple/{id}");
        match self.patch_json(&path, &body, queue.as_str()).await {
            Err(RouterError::NotFound(_)) => {
                self.queue_ids.lock().unwrap().remove(queue.as_str());
                let id = self.resolve_queue_id(queue).await?;
                let path = format!("queue/simple/{id}");
                self.patch_json(&path, &body, queue.as_str()).await
            }
            other => other,
        }
    }

    async fn rule_status(&self, comment: &RuleComment) -> Result<RuleStatus, RouterError> {
        match self.resolve_rule(comment).await {
            Ok(row) => Ok(RuleStatus {
                exists: true,
                enabled: !row.disabled,
            }),
            Err(RouterError::NotFound(_)) => Ok(RuleStatus {
                exists: false,
                enabled: false,
            }),
            Err(e) => Err(e),
        }
    }

    async fn enable_rule(&self, comment: &RuleComment) -> Result<(), RouterError> {
        self.set_rule_disabled(comment, false).await
    }

    async fn disable_rule(&self, comment: &RuleComment) -> Result<(), RouterError> {
        self.set_rule_disabled(comment, true).await
    }

    async fn ping(
        &self,
        host: &str,
        count: u32,
        per_probe_timeout: Duration,
    ) -> Result<Vec<f64>, RouterError> {
        let body = serde_json::json!({
            "address": host,
            "count": count,
            "timeout-ms": per_probe_timeout.as_millis() as u64,
        });
        let resp = self
            .client
            .post(format!("{}/ping", self.base))
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        Self::check_status(resp.status(), host)?;
        let rows: Vec<PingRow> = resp
            .json()
            .await
            .map_err(|e| RouterError::Schema(format!("ping {host}: {e}")))?;
        Ok(rows
            .iter()
            .filter_map(|r| r.time.as_deref().and_then(parse_time_ms))
            .collect())
    }
}

// ── Wire rows ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IdRow {
    #[serde(rename = ".id")]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct RuleRow {
    #[serde(rename = ".id")]
    id: String,
    #[serde(default, deserialize_with = "bool_flex")]
    disabled: bool,
}

#[derive(Debug, Deserialize)]
struct StatsRow {
    #[serde(deserialize_with = "u64_flex")]
    packets: u64,
    #[serde(deserialize_with = "u64_flex")]
    bytes: u64,
    #[serde(deserialize_with = "u64_flex")]
    dropped: u64,
    #[serde(rename = "queued-packets", deserialize_with = "u64_flex")]
    queued_packets: u64,
    #[serde(rename = "queued-bytes", deserialize_with = "u64_flex")]
    queued_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct PingRow {
    #[serde(default)]
    time: Option<String>,
}

/// Routers disagree on whether counters are JSON numbers or strings.
fn u64_flex<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    use serde::de::Error;
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom(format!("counter out of range: {n}"))),
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("bad counter: {s:?}"))),
        other => Err(D::Error::custom(format!("bad counter: {other}"))),
    }
}

fn bool_flex<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    use serde::de::Error;
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::String(s) => match s.as_str() {
            "true" | "yes" => Ok(true),
            "false" | "no" => Ok(false),
            other => Err(D::Error::custom(format!("bad bool: {other:?}"))),
        },
        other => Err(D::Error::custom(format!("bad bool: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Wire Decoding ──────────────────────────────────────────────────

    #[test]
    fn stats_row_accepts_numbers_and_strings() {
        let row: StatsRow = serde_json::from_str(
            r#"{"packets":"184523","bytes":9999999,"dropped":"12",
                "queued-packets":45,"queued-bytes":"67890"}"#,
        )
        .unwrap();
        assert_eq!(row.packets, 184_523);
        assert_eq!(row.bytes, 9_999_999);
        assert_eq!(row.dropped, 12);
        assert_eq!(row.queued_packets, 45);
    }

    #[test]
    fn rule_row_decodes_string_disabled() {
        let row: RuleRow = serde_json::from_str(r#"{".id":"*7","disabled":"true"}"#).unwrap();
        assert!(row.disabled);
        let row: RuleRow = serde_json::from_str(r#"{".id":"*7","disabled":false}"#).unwrap();
        assert!(!row.disabled);
    }

    #[test]
    fn rule_row_defaults_to_enabled() {
        let row: RuleRow = serde_json::from_str(r#"{".id":"*7"}"#).unwrap();
        assert!(!row.disabled);
    }

    #[test]
    fn ping_rows_tolerate_lost_replies() {
        let rows: Vec<PingRow> =
            serde_json::from_str(r#"[{"time":"12ms"},{},{"time":"867us"}]"#).unwrap();
        let rtts: Vec<f64> = rows
            .iter()
            .filter_map(|r| r.time.as_deref().and_then(parse_time_ms))
            .collect();
        assert_eq!(rtts, vec![12.0, 0.867]);
    }

    // ─── Status Mapping ─────────────────────────────────────────────────

    #[test]
    fn status_mapping() {
        use reqwest::StatusCode;
        assert!(RestBackend::check_status(StatusCode::OK, "q").is_ok());
        assert!(matches!(
            RestBackend::check_status(StatusCode::UNAUTHORIZED, "q"),
            Err(RouterError::Auth)
        ));
        assert!(matches!(
            RestBackend::check_status(StatusCode::NOT_FOUND, "q"),
            Err(RouterError::NotFound(_))
        ));
        assert!(matches!(
            RestBackend::check_status(StatusCode::BAD_REQUEST, "q"),
            Err(RouterError::Rejected(_))
        ));
        assert!(matches!(
            RestBackend::check_status(StatusCode::INTERNAL_SERVER_ERROR, "q"),
            Err(RouterError::Server(_))
        ));
    }
}
