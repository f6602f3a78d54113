//! Reporter dispatch (spec §3, §4.H): turning a pipeline outcome
//! (`start`, `success`, `failure`, `merge-failure`, `no-jobs`, `disabled`,
//! `dequeue`, `enqueue`) into calls against the named reporters a
//! [`PipelineConfig`](zuul_layout::PipelineConfig) lists for that outcome.
//!
//! The reporting/SQL subsystem and the concrete source-system comment driver
//! are external collaborators (spec §1) — this crate owns only the dispatch
//! boundary and a couple of reporter implementations worth keeping
//! in-process: a `tracing`-backed one for operators watching logs, and a
//! generic signed-webhook one for external integrations.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};
use zuul_layout::ReportOutcome;
use zuul_types::ItemId;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("unknown reporter {0:?}")]
    UnknownReporter(String),
    #[error("webhook request failed: {0}")]
    Webhook(String),
}

/// Everything a reporter needs to describe what happened to one item. Cheap
/// to construct and clone — a manager builds one of these once per outcome
/// and hands it to every named reporter for that outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ReportContext {
    pub tenant: String,
    pub pipeline: String,
    pub item: ItemId,
    pub change: String,
    pub outcome: ReportOutcome,
    pub message: String,
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, ctx: &ReportContext) -> Result<(), ReportError>;
}

/// Logs the outcome at `info` (success-ish outcomes) or `warn`
/// (failure-ish), matching how the rest of the scheduler treats its
/// `tracing` output as the primary operator-facing surface (spec §10).
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn report(&self, ctx: &ReportContext) -> Result<(), ReportError> {
        match ctx.outcome {
            ReportOutcome::Success | ReportOutcome::Start | ReportOutcome::Enqueue => {
                info!(
                    tenant = %ctx.tenant,
                    pipeline = %ctx.pipeline,
                    change = %ctx.change,
                    outcome = ?ctx.outcome,
                    "{}",
                    ctx.message
                );
            }
            _ => {
                warn!(
                    tenant = %ctx.tenant,
                    pipeline = %ctx.pipeline,
                    change = %ctx.change,
                    outcome = ?ctx.outcome,
                    "{}",
                    ctx.message
                );
            }
        }
        Ok(())
    }
}

/// Records every report it receives in order — the test double used across
/// the workspace wherever a manager needs to assert "start then success, not
/// success then start" without standing up a real reporter.
#[derive(Default)]
pub struct MemoryReporter {
    reports: Mutex<Vec<ReportContext>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ReportContext> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reporter for MemoryReporter {
    async fn report(&self, ctx: &ReportContext) -> Result<(), ReportError> {
        self.reports.lock().unwrap().push(ctx.clone());
        Ok(())
    }
}

/// Posts an HMAC-SHA256-signed JSON payload to an external URL — the shape
/// an outbound notification integration (chat ops, a status page) actually
/// needs. The signature goes in `X-Zuul-Signature` as `sha256=<hex>`, the
/// same scheme GitHub/GitLab webhooks use, so a receiver can verify the
/// payload without a shared TLS client cert.
pub struct WebhookReporter {
    client: reqwest::Client,
    url: String,
    secret: Vec<u8>,
}

impl WebhookReporter {
    pub fn new(url: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            secret: secret.into(),
        }
    }

    fn sign(&self, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(body);
        let bytes = mac.finalize().into_bytes();
        format!("sha256={}", hex::encode(bytes))
    }
}

#[async_trait]
impl Reporter for WebhookReporter {
    async fn report(&self, ctx: &ReportContext) -> Result<(), ReportError> {
        let body = serde_json::to_vec(ctx).map_err(|e| ReportError::Webhook(e.to_string()))?;
        let signature = self.sign(&body);

        self.client
            .post(&self.url)
            .header("X-Zuul-Signature", signature)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ReportError::Webhook(e.to_string()))?
            .error_for_status()
            .map_err(|e| ReportError::Webhook(e.to_string()))?;

        Ok(())
    }
}

/// The reporters a tenant has configured, addressable by the names a
/// [`PipelineConfig`](zuul_layout::PipelineConfig)'s `ReporterConfig`
/// entries reference.
#[derive(Default)]
pub struct ReportRegistry {
    reporters: BTreeMap<String, Arc<dyn Reporter>>,
}

impl ReportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, reporter: Arc<dyn Reporter>) {
        self.reporters.insert(name.into(), reporter);
    }

    /// Dispatches `ctx` to every named reporter, collecting (not
    /// short-circuiting on) individual failures — one broken reporter must
    /// not stop the others, or the pipeline's own state transition, from
    /// going through.
    pub async fn dispatch(&self, names: &[String], ctx: &ReportContext) -> Vec<ReportError> {
        let mut errors = Vec::new();
        for name in names {
            match self.reporters.get(name) {
                Some(reporter) => {
                    if let Err(e) = reporter.report(ctx).await {
                        warn!(reporter = %name, error = %e, "reporter failed");
                        errors.push(e);
                    }
                }
                None => errors.push(ReportError::UnknownReporter(name.clone())),
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(outcome: ReportOutcome) -> ReportContext {
        ReportContext {
            tenant: "t1".into(),
            pipeline: "gate".into(),
            item: ItemId::new(),
            change: "123,1".into(),
            outcome,
            message: "all jobs succeeded".into(),
        }
    }

    #[tokio::test]
    async fn memory_reporter_records_in_order() {
        let reporter = MemoryReporter::new();
        reporter.report(&ctx(ReportOutcome::Start)).await.unwrap();
        reporter.report(&ctx(ReportOutcome::Success)).await.unwrap();

        let reports = reporter.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].outcome, ReportOutcome::Start);
        assert_eq!(reports[1].outcome, ReportOutcome::Success);
    }

    #[tokio::test]
    async fn registry_dispatches_to_every_named_reporter() {
        let mut registry = ReportRegistry::new();
        let a = Arc::new(MemoryReporter::new());
        let b = Arc::new(MemoryReporter::new());
        registry.register("a", a.clone());
        registry.register("b", b.clone());

        let errors = registry
            .dispatch(&["a".to_string(), "b".to_string()], &ctx(ReportOutcome::Success))
            .await;
        assert!(errors.is_empty());
        assert_eq!(a.reports().len(), 1);
        assert_eq!(b.reports().len(), 1);
    }

    #[tokio::test]
    async fn registry_reports_unknown_reporter_without_failing_others() {
        let mut registry = ReportRegistry::new();
        registry.register("known", Arc::new(MemoryReporter::new()));

        let errors = registry
            .dispatch(
                &["known".to_string(), "missing".to_string()],
                &ctx(ReportOutcome::Failure),
            )
            .await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ReportError::UnknownReporter(_)));
    }

    #[test]
    fn webhook_signature_is_deterministic_for_the_same_body_and_secret() {
        let reporter = WebhookReporter::new("https://example.invalid/hook", b"s3cr3t".to_vec());
        let sig1 = reporter.sign(b"payload");
        let sig2 = reporter.sign(b"payload");
        assert_eq!(sig1, sig2);
        assert!(sig1.starts_with("sha256="));
    }
}
