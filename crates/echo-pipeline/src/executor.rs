// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Executor: runs one issued instruction's handler on the tokio runtime.
//!
//! The executor owns nothing but the launch it was given. Status changes are
//! reported back through an [`ExecutionSink`], which serializes them with
//! every other pipeline mutation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::catalogue::Operation;
use crate::error::{panic_message, HandlerError};
use crate::ident::InstructionId;
use crate::instruction::{Instruction, InstructionContext};

/// How an execution window closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The pre-check returned `false`; the handler never ran.
    Rejected,
    /// The handler ran (or its pre-check blew up) and settled.
    Completed(Result<Value, HandlerError>),
}

/// Receiver of executor progress.
pub(crate) trait ExecutionSink: Send + Sync + 'static {
    /// The pre-check passed and the handler is about to run.
    fn on_executing(&self, id: InstructionId);

    /// The execution window closed. Called exactly once per launch.
    fn on_result(self: Arc<Self>, id: InstructionId, result: ExecutionResult);
}

/// Everything needed to run one instruction, detached from the pipeline state.
pub(crate) struct Launch {
    pub(crate) id: InstructionId,
    pub(crate) kind: String,
    pub(crate) payload: Value,
    pub(crate) context: InstructionContext,
    pub(crate) operation: Arc<dyn Operation>,
    pub(crate) timeout: Option<Duration>,
}

impl Launch {
    /// Captures the launch data of an issued instruction.
    pub(crate) fn of(instruction: &Instruction) -> Self {
        Self {
            id: instruction.id,
            kind: instruction.kind.clone(),
            payload: instruction.payload.clone(),
            context: instruction.context.clone(),
            operation: Arc::clone(&instruction.operation),
            timeout: instruction.timeout,
        }
    }
}

/// Reports a panicked result if the executor task unwinds before it
/// reported on its own.
struct ReportOnUnwind<S: ExecutionSink> {
    sink: Arc<S>,
    id: InstructionId,
    armed: bool,
}

impl<S: ExecutionSink> ReportOnUnwind<S> {
    fn report(mut self, result: ExecutionResult) {
        self.armed = false;
        Arc::clone(&self.sink).on_result(self.id, result);
    }
}

impl<S: ExecutionSink> Drop for ReportOnUnwind<S> {
    fn drop(&mut self) {
        if self.armed && std::thread::panicking() {
            warn!(id = %self.id, "executor task unwound");
            Arc::clone(&self.sink).on_result(
                self.id,
                ExecutionResult::Completed(Err(HandlerError::Panicked(
                    "executor task unwound".to_owned(),
                ))),
            );
        }
    }
}

/// Spawns the execution of `launch` on `runtime`, reporting into `sink`.
pub(crate) fn spawn<S: ExecutionSink>(
    runtime: &Handle,
    sink: Arc<S>,
    launch: Launch,
) -> JoinHandle<()> {
    let span = tracing::debug_span!("execute", id = %launch.id, kind = %launch.kind);
    runtime.spawn(
        async move {
            let guard = ReportOnUnwind {
                sink,
                id: launch.id,
                armed: true,
            };
            let result = run(guard.sink.as_ref(), launch).await;
            guard.report(result);
        }
        .instrument(span),
    )
}

/// Runs the pre-check and the handler of `launch`.
///
/// Handler panics and timeouts are converted to [`HandlerError`]s so the
/// execution window always closes with a result. User code is only ever
/// called inside the unwind guard, including the calls that build the
/// pre-check and handler futures.
pub(crate) async fn run<S: ExecutionSink>(sink: &S, launch: Launch) -> ExecutionResult {
    let Launch {
        id,
        payload,
        context,
        operation,
        timeout,
        ..
    } = launch;

    let check = async {
        match operation.validate(&payload, &context) {
            Some(check) => check.await,
            None => true,
        }
    };
    match AssertUnwindSafe(check).catch_unwind().await {
        Ok(true) => {}
        Ok(false) => {
            debug!("pre-check rejected");
            return ExecutionResult::Rejected;
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(%message, "pre-check panicked");
            return ExecutionResult::Completed(Err(HandlerError::Panicked(message)));
        }
    }

    sink.on_executing(id);
    let handler = AssertUnwindSafe(async move { operation.execute(payload, context).await })
        .catch_unwind();
    let settled = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handler).await {
            Ok(settled) => settled,
            Err(_) => {
                warn!(?limit, "handler timed out");
                return ExecutionResult::Completed(Err(HandlerError::TimedOut(limit)));
            }
        },
        None => handler.await,
    };
    let result = settled.unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        warn!(%message, "handler panicked");
        Err(HandlerError::Panicked(message))
    });
    debug!(ok = result.is_ok(), "handler settled");
    ExecutionResult::Completed(result)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::catalogue::FnOperation;
    use crate::ident::CorrelationId;
    use crate::instruction::Source;

    #[derive(Default)]
    struct Recorder {
        executing: Mutex<Vec<InstructionId>>,
        results: Mutex<Vec<(InstructionId, ExecutionResult)>>,
    }

    impl ExecutionSink for Recorder {
        fn on_executing(&self, id: InstructionId) {
            self.executing.lock().unwrap().push(id);
        }

        fn on_result(self: Arc<Self>, id: InstructionId, result: ExecutionResult) {
            self.results.lock().unwrap().push((id, result));
        }
    }

    fn launch(operation: FnOperation, payload: Value) -> Launch {
        let timeout = operation.timeout();
        Launch {
            id: InstructionId::from_raw(1),
            kind: "test.op".into(),
            payload,
            context: InstructionContext {
                correlation_id: CorrelationId::new("c"),
                created_at: 0,
                source: Source::Test,
                retry_count: 0,
            },
            operation: Arc::new(operation),
            timeout,
        }
    }

    #[tokio::test]
    async fn handler_value_is_returned() {
        let sink = Recorder::default();
        let op = FnOperation::new(|_| Vec::new(), |p: Value, _| async move { Ok(p["x"].clone()) });
        let out = run(&sink, launch(op, json!({"x": 5}))).await;
        assert_eq!(out, ExecutionResult::Completed(Ok(json!(5))));
        assert_eq!(sink.executing.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_precheck_skips_handler() {
        let sink = Recorder::default();
        let op = FnOperation::new(|_| Vec::new(), |_, _| async {
            Err(HandlerError::failed("handler must not run"))
        })
            .with_validator(|_, _| async { false });
        let out = run(&sink, launch(op, Value::Null)).await;
        assert_eq!(out, ExecutionResult::Rejected);
        assert!(sink.executing.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panics_become_handler_errors() {
        let sink = Recorder::default();
        let op = FnOperation::new(|_| Vec::new(), |_, _| async {
            if true {
                panic!("boom");
            }
            Ok(Value::Null)
        });
        let out = run(&sink, launch(op, Value::Null)).await;
        assert_eq!(
            out,
            ExecutionResult::Completed(Err(HandlerError::Panicked("boom".into())))
        );
    }

    #[tokio::test]
    async fn panic_while_building_the_future_is_caught() {
        let sink = Recorder::default();
        let op = FnOperation::new(|_| Vec::new(), |p: Value, _| {
            let n = p["n"].as_u64().expect("payload carries n");
            async move { Ok(json!(n)) }
        });
        let out = run(&sink, launch(op, json!({}))).await;
        assert_eq!(
            out,
            ExecutionResult::Completed(Err(HandlerError::Panicked("payload carries n".into())))
        );
    }

    #[tokio::test]
    async fn panic_while_building_the_precheck_is_caught() {
        let sink = Recorder::default();
        let op = FnOperation::new(|_| Vec::new(), |_, _| async { Ok(Value::Null) })
            .with_validator(|p: &Value, _| {
                assert!(p.get("ok").is_some(), "missing ok");
                async { true }
            });
        let out = run(&sink, launch(op, json!({}))).await;
        assert_eq!(
            out,
            ExecutionResult::Completed(Err(HandlerError::Panicked("missing ok".into())))
        );
        assert!(sink.executing.lock().unwrap().is_empty());
    }

    #[derive(Default)]
    struct Unwound(Mutex<Vec<ExecutionResult>>);

    impl ExecutionSink for Unwound {
        fn on_executing(&self, _id: InstructionId) {
            panic!("sink exploded");
        }

        fn on_result(self: Arc<Self>, _id: InstructionId, result: ExecutionResult) {
            self.0.lock().unwrap().push(result);
        }
    }

    #[tokio::test]
    async fn unwinding_task_still_reports_a_result() {
        let sink = Arc::new(Unwound::default());
        let op = FnOperation::new(|_| Vec::new(), |_, _| async { Ok(Value::Null) });
        let joined = spawn(&Handle::current(), Arc::clone(&sink), launch(op, Value::Null)).await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(
            sink.0.lock().unwrap().as_slice(),
            &[ExecutionResult::Completed(Err(HandlerError::Panicked(
                "executor task unwound".into()
            )))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let sink = Recorder::default();
        let op = FnOperation::new(|_| Vec::new(), |_, _| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        })
        .with_timeout(Duration::from_millis(50));
        let out = run(&sink, launch(op, Value::Null)).await;
        assert_eq!(
            out,
            ExecutionResult::Completed(Err(HandlerError::TimedOut(Duration::from_millis(50))))
        );
    }

    #[tokio::test]
    async fn spawn_reports_into_sink() {
        let sink = Arc::new(Recorder::default());
        let op = FnOperation::new(|_| Vec::new(), |_, _| async {
            Err(HandlerError::failed("nope"))
        });
        spawn(&Handle::current(), Arc::clone(&sink), launch(op, Value::Null))
            .await
            .unwrap();
        let results = sink.results.lock().unwrap();
        assert_eq!(
            results.as_slice(),
            &[(
                InstructionId::from_raw(1),
                ExecutionResult::Completed(Err(HandlerError::failed("nope")))
            )]
        );
    }
}
