use async_trait::async_trait;
use tracing::info;

use super::{AuditEvent, AuditSink, MetricsSink, SideResult, Tags, TimingHandle};

fn tags_json(tags: &Tags) -> String {
    serde_json::to_string(tags).unwrap_or_default()
}

/// Emits metrics as structured tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn start_timing(&self, name: &str, tags: &Tags) -> SideResult<TimingHandle> {
        Ok(TimingHandle::start(name, tags))
    }

    fn stop_timing(&self, handle: TimingHandle) -> SideResult<u64> {
        let duration_ms = handle.elapsed_ms();
        info!(
            target: "tenant_lifecycle",
            event = "metric_timing",
            metric = %handle.name,
            tags = %tags_json(&handle.tags),
            duration_ms
        );
        Ok(duration_ms)
    }

    fn emit(&self, name: &str, tags: &Tags, fields: &serde_json::Value) -> SideResult<()> {
        info!(
            target: "tenant_lifecycle",
            event = "metric",
            metric = name,
            tags = %tags_json(tags),
            fields = %fields
        );
        Ok(())
    }
}

/// Writes audit events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAudit;

#[async_trait]
impl AuditSink for TracingAudit {
    async fn record(&self, event: &AuditEvent) -> SideResult<()> {
        info!(
            target: "tenant_lifecycle",
            event = "audit",
            scope = %event.scope,
            operation = %event.operation,
            success = event.success,
            details = %event.details
        );
        Ok(())
    }
}
