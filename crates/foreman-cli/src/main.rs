use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{Duration, Instant, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use foreman_core::app::{
    ChannelWorkflow, Stores, TreeWorkflow, WebhookBinding, WebhookCommit, WebhookIngress,
    WebhookVerifier,
};
use foreman_core::domain::{AttemptRef, Backoff, HandlerResult, RootRef, WorkflowFamily};
use foreman_core::ports::{Clock, Provider, ProviderError, SystemClock, UlidGenerator};
use foreman_core::typed::Prepare;
use foreman_core::{EngineBuilder, EngineConfig, EngineError};

const WEBHOOK_SECRET: &[u8] = b"whsec_demo";

#[derive(Debug, Deserialize)]
struct Message {
    message_id: u64,
    to: String,
}

/// 最初の n 回は「まだ準備できていない」と答える
struct PrepareMessage {
    remaining_failures: AtomicU32,
}

impl PrepareMessage {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Prepare<Message> for PrepareMessage {
    async fn prepare(&self, attempt: &AttemptRef, data: Message) -> Result<HandlerResult, EngineError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Ok(HandlerResult::validation(format!(
                "message {} not found (left={left})",
                data.message_id
            )));
        }
        Ok(HandlerResult::ok_with(json!({
            "to": data.to,
            "idempotency_key": attempt.attempt_id,
        })))
    }
}

/// Messaging provider that drops the first `n` calls.
struct FlakyMessaging {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl Provider for FlakyMessaging {
    async fn call(&self, request: &serde_json::Value) -> Result<serde_json::Value, ProviderError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(ProviderError::new(format!("503 from messaging (left={left})")));
        }
        Ok(json!({ "delivered_to": request["to"] }))
    }
}

#[derive(Debug, Deserialize)]
struct Account {
    account_id: u64,
}

struct PrepareDeletion;

#[async_trait]
impl Prepare<Account> for PrepareDeletion {
    async fn prepare(&self, _attempt: &AttemptRef, data: Account) -> Result<HandlerResult, EngineError> {
        Ok(HandlerResult::ok_with(json!({ "account_id": data.account_id })))
    }
}

struct DeletionService(&'static str);

#[async_trait]
impl Provider for DeletionService {
    async fn call(&self, request: &serde_json::Value) -> Result<serde_json::Value, ProviderError> {
        info!(service = self.0, account_id = %request["account_id"], "deleted");
        Ok(json!({ "deleted": true }))
    }
}

struct PassThrough;

#[async_trait]
impl Prepare<serde_json::Value> for PassThrough {
    async fn prepare(
        &self,
        _attempt: &AttemptRef,
        data: serde_json::Value,
    ) -> Result<HandlerResult, EngineError> {
        Ok(HandlerResult::ok_with(data))
    }
}

/// Accepts a job and calls back through the webhook ingress a little later,
/// the way a transcription API would.
struct TranscriptionApi {
    ingress: Arc<WebhookIngress>,
    signer: WebhookVerifier,
    clock: Arc<dyn Clock>,
    jobs: AtomicU32,
}

#[async_trait]
impl Provider for TranscriptionApi {
    async fn call(&self, request: &serde_json::Value) -> Result<serde_json::Value, ProviderError> {
        let job_id = format!("job-{}", self.jobs.fetch_add(1, Ordering::Relaxed) + 1);
        let body = serde_json::to_vec(&json!({
            "request_id": job_id,
            "recording_id": request["recording_id"],
            "text": "hello from the transcription API",
        }))
        .map_err(|e| ProviderError::new(e.to_string()))?;
        let header = self
            .signer
            .sign(&body, self.clock.now().timestamp())
            .map_err(|e| ProviderError::new(e.to_string()))?;

        let ingress = self.ingress.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            if let Err(e) = ingress.receive(body, header.into_bytes()).await {
                warn!(error = %e, "webhook delivery failed");
            }
        });
        Ok(json!({ "job": { "id": job_id } }))
    }
}

struct StoreTranscript;

#[async_trait]
impl WebhookCommit for StoreTranscript {
    async fn commit(
        &self,
        attempt: &AttemptRef,
        body: serde_json::Value,
    ) -> Result<HandlerResult, EngineError> {
        let Some(text) = body["text"].as_str() else {
            return Ok(HandlerResult::validation("transcript without text"));
        };
        info!(root_id = %attempt.root_id, text, "transcript stored");
        Ok(HandlerResult::ok())
    }
}

fn load_config() -> Result<EngineConfig, EngineError> {
    match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_file(path),
        None => {
            // デモが数秒で終わるように短めの backoff
            let mut config = EngineConfig::default();
            config.idle_min_ms = 20;
            config.idle_max_ms = 200;
            config.supervisor.backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(2));
            Ok(config)
        }
    }
}

fn family(name: &str) -> Result<WorkflowFamily, EngineError> {
    WorkflowFamily::new(name)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;

    // (A) ストアを先に作る（transcription provider が ingress を必要とするため）
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids = Arc::new(UlidGenerator::new(clock.clone()));
    let stores = Stores::in_memory(clock.clone(), ids, &config);
    let ingress = Arc::new(WebhookIngress::new(
        stores.webhooks.clone(),
        Some("/request_id".into()),
    ));
    let verifier = WebhookVerifier::new(WEBHOOK_SECRET, config.webhook_tolerance());

    // (B) handler / channel / workflow を登録
    let runtime = EngineBuilder::new(config)
        .with_clock(clock.clone())
        .with_stores(stores)
        .register_prepare::<Message, _>("prepare_message", PrepareMessage::new(1))?
        .register_prepare::<Account, _>("prepare_deletion", PrepareDeletion)?
        .register_prepare::<serde_json::Value, _>("pass_through", PassThrough)?
        .channel(
            "channel.message",
            Arc::new(FlakyMessaging {
                remaining_failures: AtomicU32::new(1),
            }),
        )?
        .channel("channel.storage_delete", Arc::new(DeletionService("storage")))?
        .channel("channel.auth_delete", Arc::new(DeletionService("auth")))?
        .channel(
            "channel.transcribe",
            Arc::new(TranscriptionApi {
                ingress,
                signer: verifier.clone(),
                clock: clock.clone(),
                jobs: AtomicU32::new(0),
            }),
        )?
        .workflow(ChannelWorkflow::new(family("message_send")?, "channel.message", "prepare_message"))?
        .workflow(ChannelWorkflow::new(
            family("storage_delete")?,
            "channel.storage_delete",
            "prepare_deletion",
        ))?
        .workflow(ChannelWorkflow::new(family("auth_delete")?, "channel.auth_delete", "prepare_deletion"))?
        .tree(TreeWorkflow::new(
            family("account_delete")?,
            vec![family("storage_delete")?, family("auth_delete")?],
        ))?
        .workflow(
            ChannelWorkflow::new(family("transcription")?, "channel.transcribe", "pass_through")
                .with_webhook(WebhookBinding::new(verifier, Arc::new(StoreTranscript), "/job/id")),
        )?
        .build()?;

    // (C) workflow を開始
    let roots: Vec<RootRef> = vec![
        runtime
            .start_workflow(&family("message_send")?, json!({ "message_id": 1, "to": "a@example.com" }))
            .await?,
        runtime
            .start_workflow(&family("account_delete")?, json!({ "account_id": 42 }))
            .await?,
        runtime
            .start_workflow(&family("transcription")?, json!({ "recording_id": 7 }))
            .await?,
    ];

    // (D) worker を起動して、全 root が terminal になるまで待つ
    let workers = runtime.spawn_workers();
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let mut done = true;
        for root in &roots {
            done &= runtime.status(root).await?.is_terminal();
        }
        if done {
            break;
        }
        if Instant::now() >= deadline {
            warn!("gave up waiting for workflows");
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    workers.shutdown_and_join().await;

    // (E) 結果を表示
    for root in &roots {
        let status = runtime.status(root).await?;
        println!("{}", serde_json::to_string_pretty(&status)?);
        for child in runtime.children_status(root).await? {
            println!("{}", serde_json::to_string_pretty(&child)?);
        }
    }
    println!("queue: {:?}", runtime.queue_counts().await?);
    Ok(())
}
