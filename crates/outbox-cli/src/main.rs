//! outbox-cli - in-process demo of the outbox worker.
//!
//! Config is layered: built-in defaults, then `outbox.toml` in the working
//! directory, then `OUTBOX_*` environment variables (nested keys with `__`,
//! e.g. `OUTBOX_WORKER__BATCH_SIZE=20`).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use outbox_core::app::WorkerBuilder;
use outbox_core::domain::TenantId;
use outbox_core::impls::{InMemoryCoordinator, InMemoryJobStore};
use outbox_core::observability::{self, LogFormat};
use outbox_core::ports::JobStore;
use outbox_core::resilience::{
    CircuitBreakerConfig, CircuitBreakers, RetryPolicy, TokenBucketLimiter, retry,
};
use outbox_core::{Handler, HandlerOutcome, Job, JobPayload, OutboxError, WorkerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct CliConfig {
    log_format: LogFormat,
    worker: WorkerConfig,
    demo: DemoConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            worker: WorkerConfig {
                poll_interval_seconds: 1,
                retry_base_delay_seconds: 1,
                retry_max_delay_seconds: 10,
                ..WorkerConfig::default()
            },
            demo: DemoConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct DemoConfig {
    tenants: Vec<String>,
    emails_per_tenant: u32,
    /// Per-tenant email budget.
    rate_capacity: u32,
    rate_refill_per_minute: u32,
    /// Every n-th gateway call fails transiently. 0 disables.
    fail_every: u32,
    /// Stop once nothing is pending or processing.
    exit_when_drained: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            tenants: vec!["acme".into(), "globex".into()],
            emails_per_tenant: 4,
            rate_capacity: 3,
            rate_refill_per_minute: 60,
            fail_every: 3,
            exit_when_drained: true,
        }
    }
}

fn load_config() -> anyhow::Result<CliConfig> {
    Figment::from(Serialized::defaults(CliConfig::default()))
        .merge(Toml::file("outbox.toml"))
        .merge(Env::prefixed("OUTBOX_").split("__"))
        .extract()
        .context("failed to load configuration")
}

// ---- payloads ----

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

impl JobPayload for SendEmail {
    const TYPE: &'static str = "notify.send_email";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SyncContact {
    contact_id: String,
}

impl JobPayload for SyncContact {
    const TYPE: &'static str = "crm.sync_contact";
}

// ---- handlers ----

/// Stand-in for an SMTP relay that drops every n-th request.
struct FlakyGateway {
    calls: AtomicU32,
    fail_every: u32,
}

impl FlakyGateway {
    async fn send(&self, to: &str) -> Result<(), OutboxError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(OutboxError::Transient(format!("relay dropped message to {to}")));
        }
        Ok(())
    }
}

/// Tenant rate limit, then breaker-guarded gateway call with short
/// in-process retries. Anything still failing goes back to the queue.
struct SendEmailHandler {
    gateway: FlakyGateway,
    limiter: TokenBucketLimiter,
    breakers: Arc<CircuitBreakers>,
    rate_capacity: u32,
    rate_refill_per_minute: u32,
}

#[async_trait]
impl Handler<SendEmail> for SendEmailHandler {
    async fn handle(&self, payload: SendEmail, job: &Job) -> Result<HandlerOutcome, OutboxError> {
        self.limiter.check_and_consume(
            job.tenant_id.as_str(),
            self.rate_capacity,
            self.rate_refill_per_minute,
        )?;

        let breaker = self.breakers.get("smtp");
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(50),
            ..RetryPolicy::default()
        };
        retry(&policy, |_attempt| {
            let breaker = &breaker;
            let gateway = &self.gateway;
            let to = payload.to.as_str();
            async move {
                breaker
                    .call_async(gateway.send(to))
                    .await
                    .map_err(OutboxError::from)
            }
        })
        .await
        .map_err(OutboxError::from)?;

        tracing::info!(to = %payload.to, subject = %payload.subject, "email sent");
        Ok(HandlerOutcome::success())
    }
}

struct SyncContactHandler;

#[async_trait]
impl Handler<SyncContact> for SyncContactHandler {
    async fn handle(&self, payload: SyncContact, _job: &Job) -> Result<HandlerOutcome, OutboxError> {
        if payload.contact_id.is_empty() {
            return Err(OutboxError::Fatal("contact_id is empty".into()));
        }
        tracing::info!(contact_id = %payload.contact_id, "contact synced");
        Ok(HandlerOutcome::success())
    }
}

// ---- main ----

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    observability::init(config.log_format);

    // (A) store / coordinator / 共有 breaker registry
    let store = Arc::new(InMemoryJobStore::new());
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let breakers = Arc::new(CircuitBreakers::new(CircuitBreakerConfig {
        failure_threshold: 3,
        minimum_calls: 3,
        recovery_timeout: Duration::from_secs(5),
        ..CircuitBreakerConfig::default()
    }));

    // (B) handler を登録して worker を組み立てる
    let demo = &config.demo;
    let worker = WorkerBuilder::new(config.worker.clone())
        .store(store.clone())
        .coordinator(coordinator)
        .register::<SendEmail, _>(SendEmailHandler {
            gateway: FlakyGateway {
                calls: AtomicU32::new(0),
                fail_every: demo.fail_every,
            },
            limiter: TokenBucketLimiter::in_memory(),
            breakers: breakers.clone(),
            rate_capacity: demo.rate_capacity,
            rate_refill_per_minute: demo.rate_refill_per_minute,
        })?
        .register::<SyncContact, _>(SyncContactHandler)?
        .expect_job_types(&[SendEmail::TYPE, SyncContact::TYPE])
        .build()?;

    // (C) ジョブ投入
    for tenant in &demo.tenants {
        let tenant_id = TenantId::new(tenant.as_str());
        for i in 0..demo.emails_per_tenant {
            let email = SendEmail {
                to: format!("user{i}@{tenant}.example"),
                subject: format!("welcome #{i}"),
            };
            store.enqueue(email.to_new_job(tenant_id.clone())?).await?;
        }
        let contact = SyncContact {
            contact_id: format!("{tenant}-contact-1"),
        };
        store.enqueue(contact.to_new_job(tenant_id.clone())?).await?;
    }
    // DLQ 行きのサンプル
    if let Some(tenant) = demo.tenants.first() {
        let broken = SyncContact {
            contact_id: String::new(),
        };
        store.enqueue(broken.to_new_job(TenantId::new(tenant.as_str()))?).await?;
    }
    tracing::info!(counts = ?store.counts_by_status().await?, "jobs enqueued");

    // (D) worker 起動。Ctrl-C か（設定次第で）キューが空になるまで待つ
    let handle = worker.spawn();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut progress = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("failed to listen for ctrl-c")?;
                tracing::info!("ctrl-c received, shutting down");
                break;
            }
            _ = progress.tick() => {
                let counts = store.counts_by_status().await?;
                tracing::info!(
                    pending = counts.pending,
                    processing = counts.processing,
                    done = counts.done,
                    error = counts.error,
                    "progress"
                );
                if demo.exit_when_drained && counts.pending + counts.processing == 0 {
                    break;
                }
            }
        }
    }

    // (E) graceful shutdown: in-flight を drain してから leader を手放す
    let stats = handle.worker().stats();
    handle.shutdown_and_join().await;

    let dead_letters = store.dead_letters().await?;
    for dl in &dead_letters {
        tracing::warn!(job_id = %dl.key, reason = %dl.reason, "dead letter");
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("{}", serde_json::to_string_pretty(&breakers.snapshot())?);
    Ok(())
}
