//! Push notification dispatch: verify, parse, resolve, trigger, summarize

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::resolver::{resolve, resolve_known};
use crate::secrets::{SecretProvider, fetch_secret_value};
use crate::signature::verify_signature;
use crate::trigger::{PipelineTrigger, TriggerClient, TriggerReceipt};
use crate::webhook::Notification;

const PUSH_EVENT: &str = "push";

/// Lifecycle of one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStage {
    Received,
    Authenticated,
    Parsed,
    Resolved,
    Dispatching,
    Completed,
    Rejected,
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchStage::Received => "received",
            DispatchStage::Authenticated => "authenticated",
            DispatchStage::Parsed => "parsed",
            DispatchStage::Resolved => "resolved",
            DispatchStage::Dispatching => "dispatching",
            DispatchStage::Completed => "completed",
            DispatchStage::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Why an authenticated notification was accepted without dispatching.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    IgnoredEvent { event: String },
    BranchMismatch { received: String, expected: String },
    NoCommits,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::IgnoredEvent { event } => write!(f, "ignored '{}' event", event),
            SkipReason::BranchMismatch { received, expected } => {
                write!(f, "ref '{}' is not '{}'", received, expected)
            }
            SkipReason::NoCommits => f.write_str("push contains no commits"),
        }
    }
}

/// What one request to the raw webhook consists of.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    pub signature: Option<&'a str>,
    pub event: Option<&'a str>,
    pub body: &'a [u8],
    pub dry_run: bool,
}

impl<'a> DispatchRequest<'a> {
    pub fn new(signature: Option<&'a str>, body: &'a [u8]) -> Self {
        Self {
            signature,
            event: None,
            body,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchedPipeline {
    pub project: String,
    pub pipeline: String,
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedDispatch {
    pub project: String,
    pub pipeline: String,
    pub error: String,
}

/// Response body for an accepted notification.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchSummary {
    pub dispatch_id: String,
    pub received_at: DateTime<Utc>,
    pub stage: DispatchStage,
    pub skipped: Option<SkipReason>,
    pub dry_run: bool,
    /// Resolved projects, in first-detection order.
    pub projects: Vec<String>,
    pub pipelines: Vec<String>,
    pub dispatched: Vec<DispatchedPipeline>,
    pub failed: Vec<FailedDispatch>,
    /// Resolved identifiers that are not in the catalog and were not triggered.
    pub unknown: Vec<String>,
    pub message: String,
}

impl DispatchSummary {
    fn new(dry_run: bool) -> Self {
        Self {
            dispatch_id: Uuid::now_v7().to_string(),
            received_at: Utc::now(),
            stage: DispatchStage::Received,
            skipped: None,
            dry_run,
            projects: Vec::new(),
            pipelines: Vec::new(),
            dispatched: Vec::new(),
            failed: Vec::new(),
            unknown: Vec::new(),
            message: String::new(),
        }
    }

    fn advance(&mut self, stage: DispatchStage) {
        debug!("Dispatch {}: {} -> {}", self.dispatch_id, self.stage, stage);
        self.stage = stage;
    }

    fn skip(mut self, reason: SkipReason) -> Self {
        warn!("Dispatch {} skipped: {}", self.dispatch_id, reason);
        self.message = format!("Skipped: {}", reason);
        self.skipped = Some(reason);
        self.advance(DispatchStage::Rejected);
        self
    }

    fn complete(mut self) -> Self {
        self.message = format!("Modified project in repo: {:?}", self.projects);
        self.advance(DispatchStage::Completed);
        self
    }

    pub fn dispatched_projects(&self) -> Vec<&str> {
        self.dispatched.iter().map(|d| d.project.as_str()).collect()
    }

    pub fn failed_projects(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.project.as_str()).collect()
    }
}

/// Turns authenticated push notifications into pipeline starts.
pub struct Dispatcher {
    config: DispatchConfig,
    secrets: Arc<dyn SecretProvider>,
    trigger: TriggerClient,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        secrets: Arc<dyn SecretProvider>,
        trigger: TriggerClient,
    ) -> Self {
        Self {
            config,
            secrets,
            trigger,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Handles one notification.
    ///
    /// Errors are limited to authentication failures and malformed payloads;
    /// everything after parsing, including failed triggers, lands in the
    /// returned summary.
    pub async fn handle(&self, request: DispatchRequest<'_>) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::new(request.dry_run);
        debug!(
            "Dispatch {} received {} bytes",
            summary.dispatch_id,
            request.body.len()
        );

        self.authenticate(&request).await.inspect_err(|e| {
            error!("Dispatch {} rejected: {}", summary.dispatch_id, e);
        })?;
        summary.advance(DispatchStage::Authenticated);

        if let Some(event) = request.event.filter(|e| *e != PUSH_EVENT) {
            return Ok(summary.skip(SkipReason::IgnoredEvent {
                event: event.to_string(),
            }));
        }

        let notification = Notification::from_slice(request.body).inspect_err(|e| {
            warn!("Dispatch {}: {}", summary.dispatch_id, e);
        })?;
        summary.advance(DispatchStage::Parsed);

        if notification.git_ref != self.config.trigger_branch {
            return Ok(summary.skip(SkipReason::BranchMismatch {
                received: notification.git_ref,
                expected: self.config.trigger_branch.clone(),
            }));
        }
        let Some(commit) = notification.head_commit() else {
            return Ok(summary.skip(SkipReason::NoCommits));
        };

        debug!(
            "added / removed / modified : {:?}",
            commit.changed_paths().collect::<Vec<_>>()
        );
        let catalog = &self.config.catalog;
        let (projects, unknown) = if self.config.allow_unknown_projects {
            (resolve(commit.changed_paths(), catalog).into_vec(), Vec::new())
        } else {
            let resolution = resolve_known(commit.changed_paths(), catalog);
            (resolution.projects.into_vec(), resolution.unknown.into_vec())
        };
        if !unknown.is_empty() {
            warn!(
                "Dispatch {}: ignoring paths outside the project catalog: {:?}",
                summary.dispatch_id, unknown
            );
        }
        info!("Dispatch {} projects : {:?}", summary.dispatch_id, projects);

        summary.pipelines = projects
            .iter()
            .map(|p| self.config.pipeline_name(p))
            .collect();
        summary.projects = projects;
        summary.unknown = unknown;
        summary.advance(DispatchStage::Resolved);

        if summary.projects.is_empty() {
            return Ok(summary.complete());
        }
        if request.dry_run {
            info!(
                "[DRY_RUN] Dispatch {} would start {:?}",
                summary.dispatch_id, summary.pipelines
            );
            return Ok(summary.complete());
        }

        summary.advance(DispatchStage::Dispatching);
        let targets: Vec<(String, String)> = summary
            .projects
            .iter()
            .cloned()
            .zip(summary.pipelines.iter().cloned())
            .collect();
        let (dispatched, failed) = self.fan_out(targets).await;
        summary.dispatched = dispatched;
        summary.failed = failed;

        if !summary.failed.is_empty() {
            warn!(
                "Dispatch {}: {} of {} pipeline(s) failed to start",
                summary.dispatch_id,
                summary.failed.len(),
                summary.projects.len()
            );
        }
        Ok(summary.complete())
    }

    async fn authenticate(&self, request: &DispatchRequest<'_>) -> Result<()> {
        let signature = request.signature.unwrap_or_default();
        if signature.is_empty() || request.body.is_empty() {
            return Err(DispatchError::AuthenticationFailure(
                "missing signature or empty body".to_string(),
            ));
        }

        let secret = self.signing_secret().await;
        if verify_signature(signature, request.body, &secret) {
            return Ok(());
        }

        // A cached secret may be stale after rotation; check once against the store.
        if self.secrets.invalidate(&self.config.secrets_name).await {
            let fresh = self.signing_secret().await;
            if fresh != secret && verify_signature(signature, request.body, &fresh) {
                info!("Signing secret '{}' was rotated", self.config.secrets_name);
                return Ok(());
            }
        }

        Err(DispatchError::AuthenticationFailure(
            "signature does not match payload".to_string(),
        ))
    }

    async fn signing_secret(&self) -> String {
        fetch_secret_value(
            self.secrets.as_ref(),
            &self.config.secrets_name,
            &self.config.secret_key,
        )
        .await
    }

    /// Starts every pipeline concurrently and collects results in input order.
    async fn fan_out(
        &self,
        targets: Vec<(String, String)>,
    ) -> (Vec<DispatchedPipeline>, Vec<FailedDispatch>) {
        let trigger = match self.trigger.get().await {
            Ok(trigger) => trigger,
            Err(e) => {
                error!("Pipeline trigger unavailable: {}", e);
                let failed = targets
                    .into_iter()
                    .map(|(project, pipeline)| FailedDispatch {
                        project,
                        pipeline,
                        error: e.to_string(),
                    })
                    .collect();
                return (Vec::new(), failed);
            }
        };

        let mut results = self.start_all(trigger, &targets).await;

        let mut dispatched = Vec::new();
        let mut failed = Vec::new();
        for (index, (project, pipeline)) in targets.into_iter().enumerate() {
            match results[index].take() {
                Some(Ok(receipt)) => {
                    info!("Started pipeline '{}' for project '{}'", pipeline, project);
                    dispatched.push(DispatchedPipeline {
                        project,
                        pipeline,
                        execution_id: receipt.execution_id,
                    });
                }
                Some(Err(e)) => {
                    error!("{}", e);
                    failed.push(FailedDispatch {
                        project,
                        pipeline,
                        error: e.to_string(),
                    });
                }
                None => {
                    error!("Pipeline '{}' did not complete its start request", pipeline);
                    failed.push(FailedDispatch {
                        project,
                        pipeline,
                        error: "start request did not complete before the request deadline"
                            .to_string(),
                    });
                }
            }
        }
        (dispatched, failed)
    }

    async fn start_all(
        &self,
        trigger: Arc<dyn PipelineTrigger>,
        targets: &[(String, String)],
    ) -> Vec<Option<Result<TriggerReceipt>>> {
        let per_trigger = self.config.trigger_timeout;
        let deadline = Instant::now() + self.config.request_deadline;

        let mut tasks = JoinSet::new();
        for (index, (_, pipeline)) in targets.iter().enumerate() {
            let trigger = Arc::clone(&trigger);
            let pipeline = pipeline.clone();
            tasks.spawn(async move {
                let result = match timeout(per_trigger, trigger.start(&pipeline)).await {
                    Ok(result) => result,
                    Err(_) => Err(DispatchError::TriggerTimeout {
                        pipeline,
                        timeout: per_trigger,
                    }),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<TriggerReceipt>>> =
            targets.iter().map(|_| None).collect();
        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((index, result)))) => results[index] = Some(result),
                Ok(Some(Err(e))) => error!("Trigger task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Request deadline exceeded, abandoning {} pending trigger(s)",
                        tasks.len()
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{CachedSecretProvider, SecretMap, StaticSecretProvider};
    use crate::signature::{SignatureAlgorithm, sign_payload};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    const SECRET: &str = "s3cr3t";

    #[derive(Default)]
    struct ScriptedTrigger {
        started: Mutex<Vec<String>>,
        failing: HashSet<String>,
        hanging: HashSet<String>,
    }

    #[async_trait]
    impl PipelineTrigger for ScriptedTrigger {
        async fn start(&self, pipeline_name: &str) -> Result<TriggerReceipt> {
            if self.hanging.contains(pipeline_name) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.failing.contains(pipeline_name) {
                return Err(DispatchError::trigger(pipeline_name, "boom"));
            }
            self.started.lock().unwrap().push(pipeline_name.to_string());
            Ok(TriggerReceipt {
                pipeline: pipeline_name.to_string(),
                execution_id: Some(format!("exec-{}", pipeline_name)),
            })
        }
    }

    fn dispatcher(config: DispatchConfig, trigger: Arc<ScriptedTrigger>) -> Dispatcher {
        let secrets = StaticSecretProvider::new().with_secret("webhook", "GHE_SECRETS", SECRET);
        Dispatcher::new(config, Arc::new(secrets), TriggerClient::preset(trigger))
    }

    fn config() -> DispatchConfig {
        DispatchConfig::new("refs/heads/main", "-build", "webhook")
    }

    fn push(paths: &[&str]) -> Vec<u8> {
        serde_json::json!({
            "ref": "refs/heads/main",
            "commits": [{"added": [], "removed": [], "modified": paths}]
        })
        .to_string()
        .into_bytes()
    }

    async fn send(dispatcher: &Dispatcher, body: &[u8]) -> Result<DispatchSummary> {
        let signature = sign_payload(SignatureAlgorithm::Sha1, body, SECRET).unwrap();
        dispatcher
            .handle(DispatchRequest::new(Some(signature.as_str()), body))
            .await
    }

    #[tokio::test]
    async fn one_failed_trigger_does_not_block_siblings() {
        let trigger = Arc::new(ScriptedTrigger {
            failing: HashSet::from(["project2-build".to_string()]),
            ..Default::default()
        });
        let dispatcher = dispatcher(config(), Arc::clone(&trigger));

        let summary = send(&dispatcher, &push(&["common/lib.rs"])).await.unwrap();

        assert_eq!(summary.stage, DispatchStage::Completed);
        assert_eq!(summary.dispatched_projects(), vec!["project1", "project3"]);
        assert_eq!(summary.failed_projects(), vec!["project2"]);
        assert!(summary.failed[0].error.contains("boom"));
        assert_eq!(
            summary.dispatched[0].execution_id.as_deref(),
            Some("exec-project1-build")
        );
    }

    #[tokio::test]
    async fn slow_trigger_times_out_alone() {
        let trigger = Arc::new(ScriptedTrigger {
            hanging: HashSet::from(["project1-build".to_string()]),
            ..Default::default()
        });
        let mut config = config();
        config.trigger_timeout = Duration::from_millis(50);
        let dispatcher = dispatcher(config, Arc::clone(&trigger));

        let summary = send(&dispatcher, &push(&["project1/a", "project3/b"]))
            .await
            .unwrap();

        assert_eq!(summary.dispatched_projects(), vec!["project3"]);
        assert_eq!(summary.failed_projects(), vec!["project1"]);
        assert!(summary.failed[0].error.contains("did not acknowledge"));
    }

    #[tokio::test]
    async fn request_deadline_abandons_pending_triggers() {
        let trigger = Arc::new(ScriptedTrigger {
            hanging: HashSet::from(["project2-build".to_string()]),
            ..Default::default()
        });
        let mut config = config();
        config.request_deadline = Duration::from_millis(100);
        let dispatcher = dispatcher(config, Arc::clone(&trigger));

        let summary = send(&dispatcher, &push(&["project2/a", "project1/b"]))
            .await
            .unwrap();

        assert_eq!(summary.dispatched_projects(), vec!["project1"]);
        assert_eq!(summary.failed_projects(), vec!["project2"]);
        assert!(summary.failed[0].error.contains("deadline"));
    }

    #[tokio::test]
    async fn unknown_segments_are_reported_not_triggered() {
        let trigger = Arc::new(ScriptedTrigger::default());
        let dispatcher = dispatcher(config(), Arc::clone(&trigger));

        let summary = send(&dispatcher, &push(&["docs/readme.md", "project3/x"]))
            .await
            .unwrap();

        assert_eq!(summary.projects, vec!["project3"]);
        assert_eq!(summary.unknown, vec!["docs"]);
        assert_eq!(*trigger.started.lock().unwrap(), vec!["project3-build"]);
    }

    #[tokio::test]
    async fn passthrough_can_be_enabled() {
        let trigger = Arc::new(ScriptedTrigger::default());
        let mut config = config();
        config.allow_unknown_projects = true;
        let dispatcher = dispatcher(config, Arc::clone(&trigger));

        let summary = send(&dispatcher, &push(&["docs/readme.md"])).await.unwrap();

        assert!(summary.unknown.is_empty());
        assert_eq!(summary.dispatched_projects(), vec!["docs"]);
    }

    #[tokio::test]
    async fn dry_run_resolves_without_triggering() {
        let trigger = Arc::new(ScriptedTrigger::default());
        let dispatcher = dispatcher(config(), Arc::clone(&trigger));
        let body = push(&["project2/a"]);
        let signature = sign_payload(SignatureAlgorithm::Sha1, &body, SECRET).unwrap();

        let mut request = DispatchRequest::new(Some(signature.as_str()), &body);
        request.dry_run = true;
        let summary = dispatcher.handle(request).await.unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.pipelines, vec!["project2-build"]);
        assert!(summary.dispatched.is_empty());
        assert!(trigger.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_push_events_are_skipped_after_authentication() {
        let trigger = Arc::new(ScriptedTrigger::default());
        let dispatcher = dispatcher(config(), Arc::clone(&trigger));
        let body = br#"{"zen": "Keep it logically awesome."}"#;
        let signature = sign_payload(SignatureAlgorithm::Sha1, body, SECRET).unwrap();

        let mut request = DispatchRequest::new(Some(signature.as_str()), body);
        request.event = Some("ping");
        let summary = dispatcher.handle(request).await.unwrap();

        assert_eq!(summary.stage, DispatchStage::Rejected);
        assert_eq!(
            summary.skipped,
            Some(SkipReason::IgnoredEvent {
                event: "ping".to_string()
            })
        );
    }

    #[tokio::test]
    async fn broken_trigger_client_fails_every_project() {
        let secrets = StaticSecretProvider::new().with_secret("webhook", "GHE_SECRETS", SECRET);
        let client = TriggerClient::lazy(|| {
            Err(DispatchError::ConfigError("no credentials".to_string()))
        });
        let dispatcher = Dispatcher::new(config(), Arc::new(secrets), client);

        let summary = send(&dispatcher, &push(&["project1/a", "project2/b"]))
            .await
            .unwrap();

        assert_eq!(summary.stage, DispatchStage::Completed);
        assert!(summary.dispatched.is_empty());
        assert_eq!(summary.failed_projects(), vec!["project1", "project2"]);
    }

    /// Secret store whose value can be swapped underneath a cache.
    struct RotatingSecrets {
        current: Arc<Mutex<String>>,
    }

    #[async_trait]
    impl SecretProvider for RotatingSecrets {
        async fn get_secret(&self, _name: &str) -> Result<SecretMap> {
            let value = self.current.lock().unwrap().clone();
            Ok(SecretMap::from([("GHE_SECRETS".to_string(), value)]))
        }
    }

    #[tokio::test]
    async fn rotated_secret_replaces_stale_cache_entry() {
        let current = Arc::new(Mutex::new("old".to_string()));
        let cached = CachedSecretProvider::new(RotatingSecrets {
            current: Arc::clone(&current),
        });
        let dispatcher = Dispatcher::new(
            config(),
            Arc::new(cached),
            TriggerClient::preset(Arc::new(ScriptedTrigger::default())),
        );
        let body = push(&["project1/a"]);
        let sign = |secret: &str| sign_payload(SignatureAlgorithm::Sha1, &body, secret).unwrap();

        let old = sign("old");
        let request = DispatchRequest::new(Some(old.as_str()), &body);
        assert!(dispatcher.handle(request).await.is_ok());

        *current.lock().unwrap() = "new".to_string();
        let new = sign("new");
        let request = DispatchRequest::new(Some(new.as_str()), &body);
        assert!(dispatcher.handle(request).await.is_ok());

        let err = dispatcher
            .handle(DispatchRequest::new(Some(old.as_str()), &body))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::AuthenticationFailure(_)));
    }

    #[test]
    fn summary_message_lists_projects() {
        let mut summary = DispatchSummary::new(false);
        summary.projects = vec!["project1".to_string()];
        let summary = summary.complete();
        assert_eq!(summary.message, r#"Modified project in repo: ["project1"]"#);
    }
}
