use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use change_dispatch::DispatchConfig;
use change_dispatch::dispatch::{DispatchRequest, DispatchStage, Dispatcher, SkipReason};
use change_dispatch::error::{DispatchError, Result};
use change_dispatch::secrets::StaticSecretProvider;
use change_dispatch::signature::{SignatureAlgorithm, sign_payload};
use change_dispatch::trigger::{PipelineTrigger, TriggerClient, TriggerReceipt};

const SECRET: &str = "s3cr3t";
const COMMON_PUSH: &str = r#"{"ref":"refs/heads/main","commits":[{"added":[],"removed":[],"modified":["common/x.txt"]}]}"#;
const COMMON_PUSH_SIGNATURE: &str = "sha1=100ccdbadd3cbe641a1853d08b6b6fac6366add0";

#[derive(Default)]
struct RecordingTrigger {
    started: Mutex<Vec<String>>,
}

impl RecordingTrigger {
    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl PipelineTrigger for RecordingTrigger {
    async fn start(&self, pipeline_name: &str) -> Result<TriggerReceipt> {
        self.started.lock().unwrap().push(pipeline_name.to_string());
        Ok(TriggerReceipt {
            pipeline: pipeline_name.to_string(),
            execution_id: None,
        })
    }
}

fn setup() -> (Dispatcher, Arc<RecordingTrigger>) {
    let trigger = Arc::new(RecordingTrigger::default());
    let secrets = StaticSecretProvider::new().with_secret("webhook", "GHE_SECRETS", SECRET);
    let config = DispatchConfig::new("refs/heads/main", "-pipeline", "webhook");
    let dispatcher = Dispatcher::new(
        config,
        Arc::new(secrets),
        TriggerClient::preset(trigger.clone()),
    );
    (dispatcher, trigger)
}

fn signed(body: &str) -> String {
    sign_payload(SignatureAlgorithm::Sha1, body.as_bytes(), SECRET).unwrap()
}

async fn deliver(dispatcher: &Dispatcher, body: &str) -> Result<change_dispatch::dispatch::DispatchSummary> {
    let signature = signed(body);
    dispatcher
        .handle(DispatchRequest::new(Some(signature.as_str()), body.as_bytes()))
        .await
}

#[tokio::test]
async fn shared_path_dispatches_every_project() {
    let (dispatcher, trigger) = setup();

    let summary = dispatcher
        .handle(DispatchRequest::new(
            Some(COMMON_PUSH_SIGNATURE),
            COMMON_PUSH.as_bytes(),
        ))
        .await
        .unwrap();

    assert_eq!(summary.stage, DispatchStage::Completed);
    assert_eq!(summary.projects, vec!["project1", "project2", "project3"]);
    assert_eq!(
        summary.dispatched_projects(),
        vec!["project1", "project2", "project3"]
    );
    assert!(summary.failed.is_empty());

    let mut started = trigger.started();
    started.sort();
    assert_eq!(
        started,
        vec!["project1-pipeline", "project2-pipeline", "project3-pipeline"]
    );
}

#[tokio::test]
async fn other_branch_is_a_successful_no_op() {
    let (dispatcher, trigger) = setup();
    let body = r#"{"ref":"refs/heads/feature","commits":[{"added":["project1/a"],"removed":[],"modified":[]}]}"#;

    let summary = deliver(&dispatcher, body).await.unwrap();

    assert_eq!(summary.stage, DispatchStage::Rejected);
    assert!(matches!(summary.skipped, Some(SkipReason::BranchMismatch { .. })));
    assert!(summary.projects.is_empty());
    assert!(trigger.started().is_empty());
}

#[tokio::test]
async fn empty_commit_list_dispatches_nothing() {
    let (dispatcher, trigger) = setup();

    let summary = deliver(&dispatcher, r#"{"ref":"refs/heads/main","commits":[]}"#)
        .await
        .unwrap();

    assert_eq!(summary.skipped, Some(SkipReason::NoCommits));
    assert!(trigger.started().is_empty());
}

#[tokio::test]
async fn root_level_changes_complete_without_dispatch() {
    let (dispatcher, trigger) = setup();
    let body = r#"{"ref":"refs/heads/main","commits":[{"added":["README.md"],"removed":["LICENSE"],"modified":[".gitignore"]}]}"#;

    let summary = deliver(&dispatcher, body).await.unwrap();

    assert_eq!(summary.stage, DispatchStage::Completed);
    assert!(summary.projects.is_empty());
    assert!(trigger.started().is_empty());
}

#[tokio::test]
async fn projects_follow_modified_added_removed_order() {
    let (dispatcher, trigger) = setup();
    let body = r#"{"ref":"refs/heads/main","commits":[
        {"added":["project1/new.rs"],"removed":["project3/old.rs"],"modified":["project2/lib.rs","project2/main.rs"]},
        {"added":["common/ignored.rs"],"removed":[],"modified":[]}
    ]}"#;

    let summary = deliver(&dispatcher, body).await.unwrap();

    assert_eq!(summary.projects, vec!["project2", "project1", "project3"]);
    assert_eq!(
        summary.pipelines,
        vec!["project2-pipeline", "project1-pipeline", "project3-pipeline"]
    );
    assert_eq!(trigger.started().len(), 3);
}

#[tokio::test]
async fn folders_outside_the_catalog_do_not_hide_later_projects() {
    let (dispatcher, trigger) = setup();
    let body = r#"{"ref":"refs/heads/main","commits":[{"added":[],"removed":[],"modified":["docs/a","tools/b","project1/c","project2/d","common/e"]}]}"#;

    let summary = deliver(&dispatcher, body).await.unwrap();

    assert_eq!(summary.projects, vec!["project1", "project2", "project3"]);
    assert_eq!(summary.unknown, vec!["docs", "tools"]);

    let mut started = trigger.started();
    started.sort();
    assert_eq!(
        started,
        vec!["project1-pipeline", "project2-pipeline", "project3-pipeline"]
    );
}

#[tokio::test]
async fn bad_signature_never_reaches_resolution() {
    let (dispatcher, trigger) = setup();
    let tampered = COMMON_PUSH.replace("common", "project1");

    for signature in [Some(COMMON_PUSH_SIGNATURE), Some(""), Some("sha1=00"), None] {
        let err = dispatcher
            .handle(DispatchRequest::new(signature, tampered.as_bytes()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::AuthenticationFailure(_)));
    }
    assert!(trigger.started().is_empty());
}

#[tokio::test]
async fn missing_secret_rejects_every_request() {
    let trigger = Arc::new(RecordingTrigger::default());
    let dispatcher = Dispatcher::new(
        DispatchConfig::new("refs/heads/main", "-pipeline", "webhook"),
        Arc::new(StaticSecretProvider::new()),
        TriggerClient::preset(trigger.clone()),
    );

    let err = dispatcher
        .handle(DispatchRequest::new(
            Some(COMMON_PUSH_SIGNATURE),
            COMMON_PUSH.as_bytes(),
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::AuthenticationFailure(_)));
    assert!(trigger.started().is_empty());
}

#[tokio::test]
async fn signed_garbage_is_malformed() {
    let (dispatcher, trigger) = setup();

    for body in [r#"{"commits":[]}"#, r#"{"ref":"refs/heads/main"}"#, "[1,2,3]"] {
        let err = deliver(&dispatcher, body).await.unwrap_err();
        assert!(matches!(err, DispatchError::MalformedPayload(_)));
    }
    assert!(trigger.started().is_empty());
}

#[tokio::test]
async fn sha256_header_is_accepted_too() {
    let (dispatcher, trigger) = setup();
    let signature =
        sign_payload(SignatureAlgorithm::Sha256, COMMON_PUSH.as_bytes(), SECRET).unwrap();

    let summary = dispatcher
        .handle(DispatchRequest::new(
            Some(signature.as_str()),
            COMMON_PUSH.as_bytes(),
        ))
        .await
        .unwrap();

    assert_eq!(summary.dispatched.len(), 3);
    assert_eq!(trigger.started().len(), 3);
}
