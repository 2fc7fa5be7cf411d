// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Simulated operations driven entirely by their payload.
//!
//! Used for workload replay and load tests: no side effects, only delays,
//! values and failures described by the payload.
//!
//! Payload fields (all optional):
//! - `resources`: array of resource id strings;
//! - `delay_ms`: how long the handler sleeps before settling;
//! - `fail`: `true` or an error message; the handler fails after the delay;
//! - `reject`: `true` makes the pre-check reject the instruction;
//! - `panic`: `true` makes the handler panic after the delay;
//! - `value`: the handler's result (defaults to `null`).

use std::time::Duration;

use crate::catalogue::{Catalogue, HandlerFuture, Operation, ValidateFuture};
use crate::error::{CatalogueError, HandlerError};
use crate::ident::ResourceId;
use crate::instruction::InstructionContext;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};

/// Default operation name registered by [`sim_catalogue`].
pub const SIM_OP: &str = "sim";

/// Operation whose behavior is read from its payload.
#[derive(Debug, Clone, Default)]
pub struct SimOperation {
    priority: i32,
    timeout: Option<Duration>,
}

impl SimOperation {
    /// Operation with default priority and no timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the scheduling priority hint.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the handler timeout hint.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Operation for SimOperation {
    fn resource_ids(&self, payload: &Value) -> Vec<ResourceId> {
        payload
            .get("resources")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(ResourceId::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn execute(&self, payload: Value, _context: InstructionContext) -> HandlerFuture {
        let delay = Duration::from_millis(payload.get("delay_ms").and_then(Value::as_u64).unwrap_or(0));
        let fail = match payload.get("fail") {
            Some(Value::Bool(true)) => Some("simulated failure".to_owned()),
            Some(Value::String(msg)) => Some(msg.clone()),
            _ => None,
        };
        let panics = payload.get("panic").and_then(Value::as_bool).unwrap_or(false);
        let value = payload.get("value").cloned().unwrap_or(Value::Null);
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if panics {
                std::panic::panic_any("simulated panic");
            }
            match fail {
                Some(msg) => Err(HandlerError::Failed(msg)),
                None => Ok(value),
            }
        }
        .boxed()
    }

    fn validate(&self, payload: &Value, _context: &InstructionContext) -> Option<ValidateFuture> {
        let accept = !payload.get("reject").and_then(Value::as_bool).unwrap_or(false);
        Some(async move { accept }.boxed())
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Catalogue with [`SimOperation`] under [`SIM_OP`] and `extra` names.
pub fn sim_catalogue(extra: &[&str]) -> Result<Catalogue, CatalogueError> {
    let mut catalogue = Catalogue::new();
    catalogue.register(SIM_OP, SimOperation::new())?;
    for name in extra {
        catalogue.register(*name, SimOperation::new())?;
    }
    Ok(catalogue)
}

/// Payload builder for [`SimOperation`].
#[derive(Debug, Clone, Default)]
pub struct SimPayload {
    fields: Map<String, Value>,
}

impl SimPayload {
    /// Payload touching `resources`.
    pub fn on(resources: &[&str]) -> Self {
        let mut fields = Map::new();
        fields.insert("resources".into(), json!(resources));
        Self { fields }
    }

    /// Handler sleeps `ms` before settling.
    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.fields.insert("delay_ms".into(), json!(ms));
        self
    }

    /// Handler fails with `message`.
    pub fn failing(mut self, message: &str) -> Self {
        self.fields.insert("fail".into(), json!(message));
        self
    }

    /// Pre-check rejects the instruction.
    pub fn rejected(mut self) -> Self {
        self.fields.insert("reject".into(), json!(true));
        self
    }

    /// Handler panics.
    pub fn panicking(mut self) -> Self {
        self.fields.insert("panic".into(), json!(true));
        self
    }

    /// Handler result.
    pub fn value(mut self, value: Value) -> Self {
        self.fields.insert("value".into(), value);
        self
    }

    /// Finished payload.
    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::CorrelationId;
    use crate::instruction::Source;

    fn ctx() -> InstructionContext {
        InstructionContext {
            correlation_id: CorrelationId::new("sim"),
            created_at: 0,
            source: Source::Test,
            retry_count: 0,
        }
    }

    #[test]
    fn resources_come_from_payload() {
        let op = SimOperation::new();
        let ids = op.resource_ids(&SimPayload::on(&["a", "b"]).build());
        assert_eq!(ids, vec![ResourceId::from("a"), ResourceId::from("b")]);
        assert!(op.resource_ids(&Value::Null).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn handler_honors_delay_and_failure() {
        let op = SimOperation::new();
        let start = tokio::time::Instant::now();
        let out = op
            .execute(SimPayload::on(&[]).delay_ms(40).failing("nope").build(), ctx())
            .await;
        assert_eq!(out, Err(HandlerError::failed("nope")));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn reject_flag_drives_precheck() {
        let op = SimOperation::new();
        let payload = SimPayload::on(&[]).rejected().build();
        assert!(!op.validate(&payload, &ctx()).unwrap().await);
        let value = op
            .execute(SimPayload::on(&[]).value(json!(7)).build(), ctx())
            .await;
        assert_eq!(value, Ok(json!(7)));
    }

    #[test]
    fn catalogue_registers_extras() {
        let catalogue = sim_catalogue(&["task.update"]).unwrap();
        assert_eq!(catalogue.names().collect::<Vec<_>>(), vec!["sim", "task.update"]);
    }
}
