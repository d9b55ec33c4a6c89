//! Risk-gated approval gateway.
//!
//! Requests are matched against declarative rules at creation time;
//! anything a rule does not auto-decide enters `pending` with a
//! blocking wait handle bounded by the request's time-to-live. A
//! background sweep expires unattended requests. Every state
//! transition is persisted as a full JSON snapshot, so listings and
//! lookups survive a process restart.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use gantry_core::{short_id, ApprovalConfig, RiskLevel};

use crate::{OrchestrationError, Result};

/// Status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Timeout,
    Cancelled,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Denied => write!(f, "denied"),
            ApprovalStatus::Timeout => write!(f, "timeout"),
            ApprovalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An approval request and its resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub step_id: String,
    pub plan_id: String,
    pub tool_name: String,
    pub operation: String,
    pub risk_level: RiskLevel,

    pub description: String,
    #[serde(default)]
    pub consequences: Vec<String>,
    #[serde(default)]
    pub rollback_available: bool,
    pub rollback_description: Option<String>,

    pub created_at: DateTime<Utc>,
    pub timeout_secs: u64,
    /// `created_at + timeout`, fixed at creation
    pub expires_at: DateTime<Utc>,

    pub status: ApprovalStatus,
    pub approved_by: Option<String>,
    pub denied_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub denial_reason: Option<String>,

    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl ApprovalRequest {
    fn from_spec(spec: ApprovalSpec, default_timeout: Duration) -> Self {
        let created_at = Utc::now();
        let timeout_secs = spec.timeout_secs.unwrap_or(default_timeout.as_secs());
        Self {
            request_id: format!("APPROVAL_{}_{}", created_at.timestamp(), short_id()),
            step_id: spec.step_id,
            plan_id: spec.plan_id,
            tool_name: spec.tool_name,
            operation: spec.operation,
            risk_level: spec.risk_level,
            description: spec.description,
            consequences: spec.consequences,
            rollback_available: spec.rollback_available,
            rollback_description: spec.rollback_description,
            created_at,
            timeout_secs,
            expires_at: created_at + ChronoDuration::seconds(timeout_secs as i64),
            status: ApprovalStatus::Pending,
            approved_by: None,
            denied_by: None,
            resolved_at: None,
            denial_reason: None,
            context: spec.context,
        }
    }

    /// Whether the request's time-to-live has elapsed.
    pub fn is_expired(&self) -> bool {
        self.status == ApprovalStatus::Pending && Utc::now() > self.expires_at
    }

    /// Remaining time before expiry.
    pub fn time_remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Input to [`ApprovalGateway::request_approval`].
#[derive(Debug, Clone)]
pub struct ApprovalSpec {
    pub step_id: String,
    pub plan_id: String,
    pub tool_name: String,
    pub operation: String,
    pub risk_level: RiskLevel,
    pub description: String,
    pub consequences: Vec<String>,
    pub rollback_available: bool,
    pub rollback_description: Option<String>,
    /// Time-to-live; the gateway default applies when absent
    pub timeout_secs: Option<u64>,
    pub context: HashMap<String, serde_json::Value>,
}

impl ApprovalSpec {
    pub fn new(
        step_id: impl Into<String>,
        plan_id: impl Into<String>,
        tool_name: impl Into<String>,
        operation: impl Into<String>,
        risk_level: RiskLevel,
        description: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            plan_id: plan_id.into(),
            tool_name: tool_name.into(),
            operation: operation.into(),
            risk_level,
            description: description.into(),
            consequences: Vec::new(),
            rollback_available: false,
            rollback_description: None,
            timeout_secs: None,
            context: HashMap::new(),
        }
    }

    pub fn with_consequence(mut self, consequence: impl Into<String>) -> Self {
        self.consequences.push(consequence.into());
        self
    }

    pub fn with_rollback(mut self, description: impl Into<String>) -> Self {
        self.rollback_available = true;
        self.rollback_description = Some(description.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// What a matching rule does with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDisposition {
    AutoApprove,
    AutoDeny,
    RequireManual,
}

/// Declarative matcher for automatic approval decisions.
///
/// Each axis is optional: a rule with no pattern for an axis matches
/// any value on that axis. Rules are evaluated
/// lowest-priority-number-first; the first full match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub rule_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tool_patterns: Vec<String>,
    #[serde(default)]
    pub risk_levels: Vec<RiskLevel>,
    #[serde(default)]
    pub operation_patterns: Vec<String>,

    pub disposition: RuleDisposition,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> i32 {
    100
}

impl ApprovalRule {
    pub fn new(
        rule_id: impl Into<String>,
        name: impl Into<String>,
        disposition: RuleDisposition,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            name: name.into(),
            description: String::new(),
            tool_patterns: Vec::new(),
            risk_levels: Vec::new(),
            operation_patterns: Vec::new(),
            disposition,
            enabled: true,
            priority: default_priority(),
        }
    }

    pub fn with_tool_patterns(mut self, patterns: Vec<String>) -> Self {
        self.tool_patterns = patterns;
        self
    }

    pub fn with_risk_levels(mut self, levels: Vec<RiskLevel>) -> Self {
        self.risk_levels = levels;
        self
    }

    pub fn with_operation_patterns(mut self, patterns: Vec<String>) -> Self {
        self.operation_patterns = patterns;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether every specified axis matches the request.
    pub fn matches(&self, request: &ApprovalRequest) -> bool {
        if !self.tool_patterns.is_empty()
            && !any_pattern_matches(&self.tool_patterns, &request.tool_name)
        {
            return false;
        }

        if !self.risk_levels.is_empty() && !self.risk_levels.contains(&request.risk_level) {
            return false;
        }

        if !self.operation_patterns.is_empty()
            && !any_pattern_matches(&self.operation_patterns, &request.operation)
        {
            return false;
        }

        true
    }
}

fn any_pattern_matches(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|pattern| {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => re.is_match(value),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Invalid approval rule pattern");
                false
            }
        }
    })
}

/// The default rule set.
pub fn default_rules() -> Vec<ApprovalRule> {
    vec![
        ApprovalRule::new(
            "deny_catastrophic_fs_ops",
            "Deny Catastrophic Filesystem Operations",
            RuleDisposition::AutoDeny,
        )
        .with_operation_patterns(vec![
            r"rm\s+-rf\s+/(\s|$)".to_string(),
            r"\bmkfs(\.\w+)?\b".to_string(),
            r"\bformat\b".to_string(),
            r"dd\s+if=.+\s+of=/dev/".to_string(),
            r":\(\)\s*\{\s*:\|:&\s*\}\s*;\s*:".to_string(),
            r"(curl|wget)\s+.*\|\s*(ba|z)?sh".to_string(),
        ])
        .with_priority(1),
        ApprovalRule::new(
            "manual_shell_approval",
            "Manual Approval for Shell Execution",
            RuleDisposition::RequireManual,
        )
        .with_tool_patterns(vec!["shell_execute".to_string(), "bash".to_string()])
        .with_risk_levels(vec![
            RiskLevel::Moderate,
            RiskLevel::High,
            RiskLevel::Critical,
        ])
        .with_priority(5),
        ApprovalRule::new(
            "auto_approve_low_risk_read",
            "Auto-approve Low Risk Read Operations",
            RuleDisposition::AutoApprove,
        )
        .with_tool_patterns(vec![
            "^read_file$".to_string(),
            "^list_files$".to_string(),
            "^find_in_files$".to_string(),
        ])
        .with_risk_levels(vec![RiskLevel::Low])
        .with_priority(10),
    ]
}

struct PendingEntry {
    request: ApprovalRequest,
    decision_tx: Option<oneshot::Sender<bool>>,
    decision_rx: Option<oneshot::Receiver<bool>>,
}

type NotificationHandler = Box<dyn Fn(&ApprovalRequest) + Send + Sync>;

/// Risk-gated decision broker.
pub struct ApprovalGateway {
    approvals_dir: PathBuf,
    rules: std::sync::RwLock<Vec<ApprovalRule>>,
    pending: Arc<Mutex<HashMap<String, PendingEntry>>>,
    handlers: std::sync::RwLock<Vec<NotificationHandler>>,
    default_timeout: Duration,
    sweep_interval: Duration,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ApprovalGateway {
    /// Create a gateway persisting under `approvals_dir`, loaded with
    /// the default rule set.
    pub fn new(approvals_dir: impl Into<PathBuf>, config: &ApprovalConfig) -> Result<Self> {
        let approvals_dir = approvals_dir.into();
        std::fs::create_dir_all(&approvals_dir).map_err(|source| {
            OrchestrationError::Persistence {
                path: approvals_dir.clone(),
                source,
            }
        })?;

        Ok(Self {
            approvals_dir,
            rules: std::sync::RwLock::new(default_rules()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            handlers: std::sync::RwLock::new(Vec::new()),
            default_timeout: config.default_timeout(),
            sweep_interval: config.sweep_interval(),
            sweeper: std::sync::Mutex::new(None),
        })
    }

    /// Add a rule. Takes effect for subsequent requests.
    pub fn add_rule(&self, rule: ApprovalRule) {
        self.rules.write().unwrap_or_else(|e| e.into_inner()).push(rule);
    }

    /// Replace the whole rule set.
    pub fn set_rules(&self, rules: Vec<ApprovalRule>) {
        *self.rules.write().unwrap_or_else(|e| e.into_inner()) = rules;
    }

    /// Register a handler notified when a request enters `pending`.
    pub fn add_notification_handler<F>(&self, handler: F)
    where
        F: Fn(&ApprovalRequest) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(handler));
    }

    /// Submit a request. Rules may resolve it immediately; otherwise it
    /// enters `pending` with a registered wait handle. Returns the
    /// request id either way.
    pub async fn request_approval(&self, spec: ApprovalSpec) -> Result<String> {
        let mut request = ApprovalRequest::from_spec(spec, self.default_timeout);
        let request_id = request.request_id.clone();

        match self.evaluate_rules(&request) {
            Some(RuleDisposition::AutoApprove) => {
                request.status = ApprovalStatus::Approved;
                request.approved_by = Some("system_rule".to_string());
                request.resolved_at = Some(Utc::now());
                persist_request(&self.approvals_dir, &request).await?;

                tracing::info!(request_id = %request_id, tool = %request.tool_name, "Auto-approved by rule");
                return Ok(request_id);
            }
            Some(RuleDisposition::AutoDeny) => {
                request.status = ApprovalStatus::Denied;
                request.denied_by = Some("system_rule".to_string());
                request.denial_reason = Some("Denied by automatic rule".to_string());
                request.resolved_at = Some(Utc::now());
                persist_request(&self.approvals_dir, &request).await?;

                tracing::warn!(request_id = %request_id, tool = %request.tool_name, "Auto-denied by rule");
                return Ok(request_id);
            }
            Some(RuleDisposition::RequireManual) | None => {}
        }

        let (decision_tx, decision_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                request_id.clone(),
                PendingEntry {
                    request: request.clone(),
                    decision_tx: Some(decision_tx),
                    decision_rx: Some(decision_rx),
                },
            );
        }

        persist_request(&self.approvals_dir, &request).await?;

        for handler in self.handlers.read().unwrap_or_else(|e| e.into_inner()).iter() {
            handler(&request);
        }

        tracing::info!(
            request_id = %request_id,
            tool = %request.tool_name,
            risk = %request.risk_level,
            "Approval request pending"
        );
        Ok(request_id)
    }

    /// Block until the request is resolved or its time-to-live elapses.
    ///
    /// Returns true only for an approved request. A request unknown to
    /// the pending set is answered from storage.
    pub async fn wait_for_approval(&self, request_id: &str) -> bool {
        let (decision_rx, remaining) = {
            let mut pending = self.pending.lock().await;
            match pending.get_mut(request_id) {
                Some(entry) => (
                    entry.decision_rx.take(),
                    entry.request.time_remaining(),
                ),
                None => {
                    drop(pending);
                    return match load_request(&self.approvals_dir, request_id).await {
                        Some(request) => request.status == ApprovalStatus::Approved,
                        None => false,
                    };
                }
            }
        };

        let decision_rx = match decision_rx {
            Some(rx) => rx,
            // Another caller already holds the wait handle.
            None => return false,
        };

        match tokio::time::timeout(remaining, decision_rx).await {
            Ok(Ok(decision)) => decision,
            // Handle dropped: the request was cancelled.
            Ok(Err(_)) => false,
            Err(_) => {
                self.expire_request(request_id).await;
                false
            }
        }
    }

    /// Approve a pending request. No-op (false) for unknown or
    /// already-resolved ids.
    pub async fn approve_request(
        &self,
        request_id: &str,
        approved_by: impl Into<String>,
    ) -> Result<bool> {
        let request = {
            let mut pending = self.pending.lock().await;
            let mut entry = match pending.remove(request_id) {
                Some(entry) => entry,
                None => return Ok(false),
            };

            entry.request.status = ApprovalStatus::Approved;
            entry.request.approved_by = Some(approved_by.into());
            entry.request.resolved_at = Some(Utc::now());
            if let Some(tx) = entry.decision_tx.take() {
                let _ = tx.send(true);
            }
            entry.request
        };

        persist_request(&self.approvals_dir, &request).await?;

        tracing::info!(
            request_id = %request_id,
            approved_by = %request.approved_by.as_deref().unwrap_or(""),
            "Approval granted"
        );
        Ok(true)
    }

    /// Deny a pending request. No-op (false) for unknown or
    /// already-resolved ids.
    pub async fn deny_request(
        &self,
        request_id: &str,
        denied_by: impl Into<String>,
        reason: Option<String>,
    ) -> Result<bool> {
        let request = {
            let mut pending = self.pending.lock().await;
            let mut entry = match pending.remove(request_id) {
                Some(entry) => entry,
                None => return Ok(false),
            };

            entry.request.status = ApprovalStatus::Denied;
            entry.request.denied_by = Some(denied_by.into());
            entry.request.denial_reason =
                Some(reason.unwrap_or_else(|| "Denied by user".to_string()));
            entry.request.resolved_at = Some(Utc::now());
            if let Some(tx) = entry.decision_tx.take() {
                let _ = tx.send(false);
            }
            entry.request
        };

        persist_request(&self.approvals_dir, &request).await?;

        tracing::warn!(
            request_id = %request_id,
            reason = %request.denial_reason.as_deref().unwrap_or(""),
            "Approval denied"
        );
        Ok(true)
    }

    /// Cancel a pending request, explicitly dropping its wait handle.
    pub async fn cancel_request(&self, request_id: &str) -> Result<bool> {
        let request = {
            let mut pending = self.pending.lock().await;
            let mut entry = match pending.remove(request_id) {
                Some(entry) => entry,
                None => return Ok(false),
            };

            entry.request.status = ApprovalStatus::Cancelled;
            entry.request.resolved_at = Some(Utc::now());
            // Dropping the sender releases any blocked waiter with a
            // negative result.
            drop(entry.decision_tx.take());
            entry.request
        };

        persist_request(&self.approvals_dir, &request).await?;

        tracing::info!(request_id = %request_id, "Approval request cancelled");
        Ok(true)
    }

    /// All requests currently pending in memory.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let pending = self.pending.lock().await;
        pending.values().map(|e| e.request.clone()).collect()
    }

    /// Look up a request: pending set first, then storage.
    pub async fn get_request(&self, request_id: &str) -> Option<ApprovalRequest> {
        {
            let pending = self.pending.lock().await;
            if let Some(entry) = pending.get(request_id) {
                return Some(entry.request.clone());
            }
        }
        load_request(&self.approvals_dir, request_id).await
    }

    /// List requests, newest first, merging the pending set with
    /// storage.
    pub async fn list_requests(
        &self,
        status_filter: Option<ApprovalStatus>,
        plan_filter: Option<&str>,
        limit: usize,
    ) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = Vec::new();
        {
            let pending = self.pending.lock().await;
            requests.extend(pending.values().map(|e| e.request.clone()));
        }
        let in_memory: std::collections::HashSet<String> =
            requests.iter().map(|r| r.request_id.clone()).collect();

        if let Ok(mut dir) = tokio::fs::read_dir(&self.approvals_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_request_file(&path).await {
                    Some(request) if !in_memory.contains(&request.request_id) => {
                        requests.push(request);
                    }
                    _ => {}
                }
            }
        }

        requests.retain(|r| {
            status_filter.map(|s| r.status == s).unwrap_or(true)
                && plan_filter.map(|p| r.plan_id == p).unwrap_or(true)
        });
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        requests.truncate(limit);
        requests
    }

    /// Start the background sweep that expires unattended pending
    /// requests. Safe to call more than once.
    pub fn start_expiry_sweep(&self) {
        let mut guard = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let pending = Arc::clone(&self.pending);
        let approvals_dir = self.approvals_dir.clone();
        let interval = self.sweep_interval;

        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let expired: Vec<PendingEntry> = {
                    let mut map = pending.lock().await;
                    let ids: Vec<String> = map
                        .iter()
                        .filter(|(_, e)| e.request.is_expired())
                        .map(|(id, _)| id.clone())
                        .collect();
                    ids.into_iter().filter_map(|id| map.remove(&id)).collect()
                };

                for mut entry in expired {
                    entry.request.status = ApprovalStatus::Timeout;
                    entry.request.resolved_at = Some(Utc::now());
                    if let Some(tx) = entry.decision_tx.take() {
                        let _ = tx.send(false);
                    }

                    if let Err(e) = persist_request(&approvals_dir, &entry.request).await {
                        tracing::error!(
                            request_id = %entry.request.request_id,
                            error = %e,
                            "Failed to persist expired approval request"
                        );
                    }
                    tracing::info!(
                        request_id = %entry.request.request_id,
                        "Approval request expired"
                    );
                }
            }
        }));
    }

    /// Stop the background sweep.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    fn evaluate_rules(&self, request: &ApprovalRequest) -> Option<RuleDisposition> {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        let mut sorted: Vec<&ApprovalRule> = rules.iter().filter(|r| r.enabled).collect();
        sorted.sort_by_key(|r| r.priority);

        for rule in sorted {
            if rule.matches(request) {
                tracing::debug!(
                    rule_id = %rule.rule_id,
                    request_id = %request.request_id,
                    disposition = ?rule.disposition,
                    "Approval rule matched"
                );
                return Some(rule.disposition);
            }
        }
        None
    }

    /// Transition a pending request to timeout after its waiter's TTL
    /// elapsed.
    async fn expire_request(&self, request_id: &str) {
        let request = {
            let mut pending = self.pending.lock().await;
            pending.remove(request_id).map(|mut entry| {
                entry.request.status = ApprovalStatus::Timeout;
                entry.request.resolved_at = Some(Utc::now());
                entry.request
            })
        };

        if let Some(request) = request {
            tracing::warn!(request_id = %request_id, "Approval request timed out");
            if let Err(e) = persist_request(&self.approvals_dir, &request).await {
                tracing::error!(
                    request_id = %request_id,
                    error = %e,
                    "Failed to persist timed out approval request"
                );
            }
        }
    }
}

impl Drop for ApprovalGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn persist_request(dir: &Path, request: &ApprovalRequest) -> Result<()> {
    let path = dir.join(format!("{}.json", request.request_id));
    let body = serde_json::to_string_pretty(request)?;

    tokio::fs::write(&path, body).await.map_err(|source| {
        tracing::error!(
            request_id = %request.request_id,
            path = %path.display(),
            error = %source,
            "Failed to save approval request"
        );
        OrchestrationError::Persistence { path, source }
    })
}

async fn load_request(dir: &Path, request_id: &str) -> Option<ApprovalRequest> {
    read_request_file(&dir.join(format!("{}.json", request_id))).await
}

async fn read_request_file(path: &Path) -> Option<ApprovalRequest> {
    let body = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&body) {
        Ok(request) => Some(request),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to parse approval request");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(dir: &Path) -> ApprovalGateway {
        ApprovalGateway::new(dir, &ApprovalConfig::default()).unwrap()
    }

    fn spec(tool: &str, operation: &str, risk: RiskLevel) -> ApprovalSpec {
        ApprovalSpec::new("step-1", "plan-1", tool, operation, risk, "test request")
    }

    #[tokio::test]
    async fn test_auto_approve_low_risk_read() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());

        // Resolves immediately, no block.
        let id = gateway
            .request_approval(spec("read_file", "read README.md", RiskLevel::Low))
            .await
            .unwrap();

        let request = gateway.get_request(&id).await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Approved);
        assert_eq!(request.approved_by.as_deref(), Some("system_rule"));
        assert!(gateway.pending_requests().await.is_empty());

        assert!(gateway.wait_for_approval(&id).await);
    }

    #[tokio::test]
    async fn test_auto_deny_catastrophic_operation() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());

        let id = gateway
            .request_approval(spec("shell_execute", "rm -rf / --no-preserve-root", RiskLevel::Critical))
            .await
            .unwrap();

        let request = gateway.get_request(&id).await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Denied);
        assert_eq!(request.denied_by.as_deref(), Some("system_rule"));
        assert!(!gateway.wait_for_approval(&id).await);
    }

    #[tokio::test]
    async fn test_manual_approval_flow() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(gateway(dir.path()));

        let id = gateway
            .request_approval(spec("shell_execute", "cargo build", RiskLevel::Moderate))
            .await
            .unwrap();
        assert_eq!(
            gateway.get_request(&id).await.unwrap().status,
            ApprovalStatus::Pending
        );

        let waiter = {
            let gateway = Arc::clone(&gateway);
            let id = id.clone();
            tokio::spawn(async move { gateway.wait_for_approval(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(gateway.approve_request(&id, "reviewer").await.unwrap());
        assert!(waiter.await.unwrap());

        // Idempotent: already resolved.
        assert!(!gateway.approve_request(&id, "reviewer").await.unwrap());
        assert!(!gateway.deny_request(&id, "reviewer", None).await.unwrap());

        let request = gateway.get_request(&id).await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Approved);
        assert_eq!(request.approved_by.as_deref(), Some("reviewer"));
        assert!(request.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_denial_releases_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(gateway(dir.path()));

        let id = gateway
            .request_approval(spec("shell_execute", "git push --force", RiskLevel::High))
            .await
            .unwrap();

        let waiter = {
            let gateway = Arc::clone(&gateway);
            let id = id.clone();
            tokio::spawn(async move { gateway.wait_for_approval(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(gateway
            .deny_request(&id, "reviewer", Some("not on a friday".to_string()))
            .await
            .unwrap());
        assert!(!waiter.await.unwrap());

        let request = gateway.get_request(&id).await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Denied);
        assert_eq!(request.denial_reason.as_deref(), Some("not on a friday"));
    }

    #[tokio::test]
    async fn test_cancel_releases_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(gateway(dir.path()));

        let id = gateway
            .request_approval(spec("shell_execute", "terraform apply", RiskLevel::High))
            .await
            .unwrap();

        let waiter = {
            let gateway = Arc::clone(&gateway);
            let id = id.clone();
            tokio::spawn(async move { gateway.wait_for_approval(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(gateway.cancel_request(&id).await.unwrap());
        assert!(!waiter.await.unwrap());
        assert_eq!(
            gateway.get_request(&id).await.unwrap().status,
            ApprovalStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_wait_times_out_with_no_decision() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());

        let id = gateway
            .request_approval(
                spec("shell_execute", "cargo publish", RiskLevel::High).with_timeout_secs(1),
            )
            .await
            .unwrap();

        let start = std::time::Instant::now();
        assert!(!gateway.wait_for_approval(&id).await);
        assert!(start.elapsed() >= Duration::from_millis(900));

        // Persisted status is timeout; a late decision is a safe no-op.
        let request = gateway.get_request(&id).await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Timeout);
        assert!(!gateway.approve_request(&id, "too-late").await.unwrap());
    }

    #[tokio::test]
    async fn test_expiry_sweep_releases_unattended_requests() {
        let dir = tempfile::tempdir().unwrap();
        let config = ApprovalConfig::default().with_sweep_interval(1);
        let gateway = ApprovalGateway::new(dir.path(), &config).unwrap();
        gateway.start_expiry_sweep();

        let id = gateway
            .request_approval(
                spec("shell_execute", "sleep forever", RiskLevel::High).with_timeout_secs(0),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1300)).await;

        let request = gateway.get_request(&id).await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Timeout);
        assert!(gateway.pending_requests().await.is_empty());

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_rule_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());

        // A permissive rule at a worse (higher) priority number must
        // lose to the default deny rule at priority 1.
        gateway.add_rule(
            ApprovalRule::new("allow_everything", "Allow", RuleDisposition::AutoApprove)
                .with_priority(50),
        );

        let id = gateway
            .request_approval(spec("shell_execute", "dd if=/dev/zero of=/dev/sda", RiskLevel::High))
            .await
            .unwrap();
        assert_eq!(
            gateway.get_request(&id).await.unwrap().status,
            ApprovalStatus::Denied
        );

        // But it wins over the manual-shell rule once priority says so.
        gateway.add_rule(
            ApprovalRule::new("fast_lane", "Fast lane", RuleDisposition::AutoApprove)
                .with_tool_patterns(vec!["^git_commit$".to_string()])
                .with_priority(0),
        );
        let id = gateway
            .request_approval(spec("git_commit", "commit changes", RiskLevel::Moderate))
            .await
            .unwrap();
        assert_eq!(
            gateway.get_request(&id).await.unwrap().status,
            ApprovalStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_unset_axes_match_anything() {
        let request = ApprovalRequest::from_spec(
            spec("anything", "whatever", RiskLevel::Critical),
            Duration::from_secs(300),
        );

        let rule = ApprovalRule::new("bare", "Bare", RuleDisposition::RequireManual);
        assert!(rule.matches(&request));

        let risk_only = ApprovalRule::new("risky", "Risky", RuleDisposition::RequireManual)
            .with_risk_levels(vec![RiskLevel::Critical]);
        assert!(risk_only.matches(&request));

        let wrong_tool = ApprovalRule::new("other", "Other", RuleDisposition::RequireManual)
            .with_tool_patterns(vec!["^git_push$".to_string()]);
        assert!(!wrong_tool.matches(&request));
    }

    #[tokio::test]
    async fn test_requests_survive_restart() {
        let dir = tempfile::tempdir().unwrap();

        let id = {
            let gateway = gateway(dir.path());
            let id = gateway
                .request_approval(spec("shell_execute", "make deploy", RiskLevel::High))
                .await
                .unwrap();
            gateway
                .deny_request(&id, "reviewer", Some("needs review".to_string()))
                .await
                .unwrap();
            id
        };

        // A fresh instance over the same directory serves the snapshot.
        let gateway = gateway(dir.path());
        let request = gateway.get_request(&id).await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Denied);
        assert_eq!(request.timeout_secs, 300);
        assert_eq!(
            request.expires_at,
            request.created_at + ChronoDuration::seconds(300)
        );

        let listed = gateway
            .list_requests(Some(ApprovalStatus::Denied), Some("plan-1"), 10)
            .await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].request_id, id);

        assert!(gateway
            .list_requests(Some(ApprovalStatus::Pending), None, 10)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_request_serde_round_trip() {
        let mut request = ApprovalRequest::from_spec(
            spec("shell_execute", "cargo clean", RiskLevel::Moderate)
                .with_consequence("removes target/")
                .with_rollback("rebuild")
                .with_context("cwd", serde_json::json!("/repo")),
            Duration::from_secs(60),
        );
        request.status = ApprovalStatus::Approved;
        request.approved_by = Some("reviewer".to_string());
        request.resolved_at = Some(Utc::now());

        let json = serde_json::to_string_pretty(&request).unwrap();
        let back: ApprovalRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }
}
