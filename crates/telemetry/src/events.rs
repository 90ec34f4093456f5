//! Per-request event emission.
//!
//! One record per completed request, appended to the `usage_events`
//! Redis stream with approximate trimming at 10k entries. Emission is
//! fire-and-forget and lossy-tolerant: spend correctness is carried by
//! the usage queue, events only feed metrics.

use pllm_core::usage::RequestEvent;
use redis::aio::ConnectionManager;
use tracing::warn;

pub const STREAM_KEY: &str = "usage_events";
pub const STREAM_MAXLEN: usize = 10_000;

/// Emits request events onto the capped stream.
#[derive(Clone)]
pub struct EventEmitter {
    redis: ConnectionManager,
}

impl EventEmitter {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Append one event. Errors are logged and swallowed.
    pub async fn emit(&self, event: &RequestEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "request event failed to serialize");
                return;
            }
        };

        let mut redis = self.redis.clone();
        let result = redis::cmd("XADD")
            .arg(STREAM_KEY)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("payload")
            .arg(json)
            .query_async::<String>(&mut redis)
            .await;

        if let Err(e) = result {
            warn!(error = %e, "request event dropped");
        }
    }

    /// Detached emit for handlers that must not await the stream.
    pub fn emit_detached(&self, event: RequestEvent) {
        let emitter = self.clone();
        tokio::spawn(async move {
            emitter.emit(&event).await;
        });
    }
}
