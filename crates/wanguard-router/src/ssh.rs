//! SSH backend.
//!
//! Drives the system `ssh` client through `tokio::process`, multiplexing
//! every command over one persistent control socket (`ControlMaster=auto` +
//! `ControlPersist`), so only the first call pays the handshake. Commands
//! are assembled from the fixed templates below; the only variable parts are
//! identifiers already validated by `QueueName`/`RuleComment` and formatted
//! integers, so nothing is ever hand-escaped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;

use wanguard_common::config::RouterConfig;
use wanguard_common::names::{QueueName, RuleComment};

use crate::backend::{QueueStats, RouterBackend, RuleStatus};
use crate::error::RouterError;
use crate::parse::{parse_as_value, parse_bool, parse_time_ms, parse_u64};

pub struct SshBackend {
    host: String,
    port: u16,
    user: String,
    key_path: Option<PathBuf>,
    control_path: PathBuf,
    deadline: Duration,
}

impl SshBackend {
    pub fn new(router: &RouterConfig, deadline: Duration) -> Self {
        let control_path = std::env::temp_dir().join(format!(
            "wanguard-ssh-{}-{}-{}.sock",
            router.host,
            router.port(),
            std::process::id()
        ));
        SshBackend {
            host: router.host.clone(),
            port: router.port(),
            user: router.user.clone(),
            key_path: router.ssh_key_path.clone(),
            control_path,
            deadline,
        }
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg("ControlPersist=60")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("ConnectTimeout=5")
            .arg("-p")
            .arg(self.port.to_string());
        if let Some(key) = &self.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.user, self.host))
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn exec(&self, remote: String) -> Result<String, RouterError> {
        let output = tokio::time::timeout(self.deadline, self.command(&remote).output())
            .await
            .map_err(|_| RouterError::Timeout(self.deadline))?
            .map_err(|e| RouterError::Connection(format!("ssh spawn failed: {e}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Exit 255 is ssh's own transport/connection failure.
        if output.status.code() == Some(255) {
            if stderr.contains("Permission denied") {
                Err(RouterError::Auth)
            } else {
                Err(RouterError::Connection(stderr.trim().to_string()))
            }
        } else {
            Err(RouterError::Rejected(stderr.trim().to_string()))
        }
    }

}

// ── Command templates ───────────────────────────────────────────────

fn queue_stats_template(queue: &QueueName) -> String {
    format!(r#"/queue simple print stats as-value where name="{queue}""#)
}

fn set_rates_template(queue: &QueueName, download_bps: u64, upload_bps: u64) -> String {
    // max-limit is upload/download, matching the router's CLI order.
    format!(r#"/queue simple set [find name="{queue}"] max-limit={upload_bps}/{download_bps}"#)
}

fn rule_status_template(comment: &RuleComment) -> String {
    format!(r#"/ip firewall mangle print as-value where comment="{comment}""#)
}

fn rule_toggle_template(comment: &RuleComment, enable: bool) -> String {
    let verb = if enable { "enable" } else { "disable" };
    format!(r#"/ip firewall mangle {verb} [find comment="{comment}"]"#)
}

fn ping_template(host: &str, count: u32, per_probe_timeout: Duration) -> String {
    format!(
        "/ping {host} count={count} interval=200ms ttl-timeout={}ms as-value",
        per_probe_timeout.as_millis()
    )
}

fn stats_field(map: &std::collections::HashMap<&str, &str>, key: &str) -> Result<u64, RouterError> {
    map.get(key)
        .and_then(|v| parse_u64(v))
        .ok_or_else(|| RouterError::Schema(format!("missing or bad field {key:?}")))
}

impl RouterBackend for SshBackend {
    async fn get_queue_stats(&self, queue: &QueueName) -> Result<QueueStats, RouterError> {
        let out = self.exec(queue_stats_template(queue)).await?;
        let line = out
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| RouterError::NotFound(queue.as_str().to_string()))?;
        let map = parse_as_value(line);
        Ok(QueueStats {
            packets: stats_field(&map, "packets")?,
            bytes: stats_field(&map, "bytes")?,
            dropped: stats_field(&map, "dropped")?,
            queued_packets: stats_field(&map, "queued-packets")?,
            queued_bytes: stats_field(&map, "queued-bytes")?,
            timestamp: Utc::now(),
        })
    }

    async fn set_queue_rates(
        &self,
        queue: &QueueName,
        download_bps: u64,
        upload_bps: u64,
    ) -> Result<(), RouterError> {
        self.exec(set_rates_template(queue, download_bps, upload_bps))
            .await?;
        Ok(())
    }

    async fn rule_status(&self, comment: &RuleComment) -> Result<RuleStatus, RouterError> {
        let out = self.exec(rule_status_template(comment)).await?;
        let Some(line) = out.lines().find(|l| !l.trim().is_empty()) else {
            return Ok(RuleStatus {
                exists: false,
                enabled: false,
            });
        };
        let map = parse_as_value(line);
        let disabled = map
            .get("disabled")
            .and_then(|v| parse_bool(v))
            .ok_or_else(|| RouterError::Schema("missing or bad field \"disabled\"".into()))?;
        Ok(RuleStatus {
            exists: true,
            enabled: !disabled,
        })
    }

    async fn enable_rule(&self, comment: &RuleComment) -> Result<(), RouterError> {
        self.exec(rule_toggle_template(comment, true)).await?;
        Ok(())
    }

    async fn disable_rule(&self, comment: &RuleComment) -> Result<(), RouterError> {
        self.exec(rule_toggle_template(comment, false)).await?;
        Ok(())
    }

    async fn ping(
        &self,
        host: &str,
        count: u32,
        per_probe_timeout: Duration,
    ) -> Result<Vec<f64>, RouterError> {
        if !wanguard_common::names::is_valid_identifier(host) {
            return Err(RouterError::Rejected(format!("bad ping host {host:?}")));
        }
        let out = self.exec(ping_template(host, count, per_probe_timeout)).await?;
        let rtts: Vec<f64> = out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| {
                let map = parse_as_value(l);
                map.get("time").and_then(|v| parse_time_ms(v))
            })
            .collect();
        Ok(rtts)
    }

    /// Tear down the multiplexed master connection, if one is running.
    async fn close(&self) {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(format!("{}@{}", self.user, self.host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Ok(mut child) = cmd.spawn() {
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        }
    }
}
