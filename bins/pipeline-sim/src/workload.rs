// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Workload files and their replay.
//!
//! A workload is a YAML document listing extra simulated operations and an
//! ordered list of steps. Steps run in order; tickets are collected and only
//! awaited once every step has been submitted, so the pipeline sees the
//! workload's real concurrency.
//!
//! Report rows are built from the settled tickets and the lifecycle event
//! stream, never from the pipeline's bounded retention log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use echo_pipeline::sim::{sim_catalogue, SimOperation, SIM_OP};
use echo_pipeline::{
    BatchId, BatchItem, BatchMode, BatchTicket, Catalogue, CatalogueError, InstructionId,
    InstructionStatus, Outcome, Pipeline, PipelineConfig, PipelineError, PipelineEvent,
    PipelineStatus, Ticket, Timestamp, TokioClock,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{info, warn};

/// Parsed workload file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workload {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Overrides the configured concurrency cap.
    #[serde(default)]
    pub concurrency_cap: Option<usize>,
    /// Simulated operations registered next to the default `sim`.
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
    /// Steps, in submission order.
    pub steps: Vec<Step>,
}

/// Extra simulated operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationSpec {
    /// Type name.
    pub name: String,
    /// Scheduling priority hint.
    #[serde(default)]
    pub priority: i32,
    /// Handler timeout hint.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// One workload step.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Dispatch a standalone instruction.
    Dispatch {
        /// Label used in the report and by `cancel`.
        label: String,
        /// Operation type name.
        #[serde(rename = "type", default = "default_kind")]
        kind: String,
        /// Handler payload.
        #[serde(default)]
        payload: Value,
    },
    /// Dispatch a batch; members are labelled `<label>.<seq>`.
    Batch {
        /// Batch label.
        label: String,
        /// Commit discipline.
        mode: BatchMode,
        /// Members in submission order.
        items: Vec<BatchItem>,
    },
    /// Cancel a labelled instruction.
    Cancel {
        /// Label of a dispatched instruction or batch member.
        label: String,
    },
    /// Pause submission.
    Sleep {
        /// Pause length.
        ms: u64,
    },
}

fn default_kind() -> String {
    SIM_OP.to_owned()
}

impl Workload {
    /// Parses a YAML workload.
    pub fn parse(text: &str) -> Result<Self> {
        let workload: Self = serde_yaml::from_str(text).context("invalid workload")?;
        if workload.steps.is_empty() {
            bail!("workload has no steps");
        }
        Ok(workload)
    }

    /// Simulated catalogue for this workload.
    pub fn catalogue(&self) -> Result<Catalogue, CatalogueError> {
        let mut catalogue = sim_catalogue(&[])?;
        for op in &self.operations {
            let mut sim = SimOperation::new().with_priority(op.priority);
            if let Some(ms) = op.timeout_ms {
                sim = sim.with_timeout(Duration::from_millis(ms));
            }
            catalogue.register(op.name.clone(), sim)?;
        }
        Ok(catalogue)
    }

    /// Number of instructions the workload submits.
    pub fn instruction_count(&self) -> usize {
        self.steps
            .iter()
            .map(|step| match step {
                Step::Dispatch { .. } => 1,
                Step::Batch { items, .. } => items.len(),
                Step::Cancel { .. } | Step::Sleep { .. } => 0,
            })
            .sum()
    }

    /// `base` with this workload's cap applied.
    pub fn config(&self, base: &PipelineConfig) -> PipelineConfig {
        let mut config = base.clone();
        if let Some(cap) = self.concurrency_cap {
            config.concurrency_cap = cap;
        }
        config
    }
}

/// One report line: an instruction (or a refused dispatch).
#[derive(Debug, Clone, Serialize)]
pub struct Row {
    /// Workload label.
    pub label: String,
    /// Instruction id, absent when dispatch was refused.
    pub id: Option<InstructionId>,
    /// Operation type name.
    pub kind: String,
    /// Owning batch and position.
    pub batch: Option<String>,
    /// Final status (absent for refused dispatches).
    pub status: Option<InstructionStatus>,
    /// Entry into `Issued`.
    pub issued_at: Option<Timestamp>,
    /// Entry into `Responded`.
    pub responded_at: Option<Timestamp>,
    /// Write-back time.
    pub finalized_at: Option<Timestamp>,
    /// Result value or error message.
    pub detail: String,
}

/// Stage times of one instruction, collected from the event stream.
#[derive(Debug, Clone, Copy, Default)]
struct Trace {
    issued_at: Option<Timestamp>,
    responded_at: Option<Timestamp>,
    finalized_at: Option<Timestamp>,
}

impl Trace {
    fn record(&mut self, event: &PipelineEvent) {
        match event.status {
            InstructionStatus::Issued => self.issued_at = Some(event.at),
            InstructionStatus::Responded => self.responded_at = Some(event.at),
            InstructionStatus::Committed | InstructionStatus::Failed => {
                self.finalized_at = Some(event.at);
            }
            InstructionStatus::Pending | InstructionStatus::Executing => {}
        }
    }
}

/// Drains every event published so far.
fn collect_traces(
    events: &mut broadcast::Receiver<PipelineEvent>,
) -> BTreeMap<InstructionId, Trace> {
    let mut traces: BTreeMap<InstructionId, Trace> = BTreeMap::new();
    loop {
        match events.try_recv() {
            Ok(event) => traces.entry(event.instruction).or_default().record(&event),
            Err(TryRecvError::Lagged(missed)) => {
                warn!(missed, "event stream lagged; some stage times are missing");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    traces
}

impl Row {
    fn settled(
        label: &str,
        id: InstructionId,
        kind: &str,
        batch: Option<String>,
        trace: Trace,
        outcome: &Outcome,
    ) -> Self {
        let (status, detail) = match outcome {
            Ok(value) => (InstructionStatus::Committed, value.to_string()),
            Err(err) => (InstructionStatus::Failed, err.to_string()),
        };
        Self {
            label: label.to_owned(),
            id: Some(id),
            kind: kind.to_owned(),
            batch,
            status: Some(status),
            issued_at: trace.issued_at,
            responded_at: trace.responded_at,
            finalized_at: trace.finalized_at,
            detail,
        }
    }

    fn refused(label: &str, kind: &str, detail: String) -> Self {
        Self {
            label: label.to_owned(),
            id: None,
            kind: kind.to_owned(),
            batch: None,
            status: None,
            issued_at: None,
            responded_at: None,
            finalized_at: None,
            detail,
        }
    }
}

/// How a batch handle settled.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRow {
    /// Workload label.
    pub label: String,
    /// Commit discipline.
    pub mode: BatchMode,
    /// `ok (n outcomes)` or the batch error.
    pub outcome: String,
}

/// Everything a replay produced.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Workload name.
    pub name: String,
    /// Concurrency cap the pipeline ran with.
    pub concurrency_cap: usize,
    /// One row per submitted instruction, in submission order.
    pub rows: Vec<Row>,
    /// Batch settlements, in submission order.
    pub batches: Vec<BatchRow>,
    /// Final counters.
    pub status: PipelineStatus,
}

enum Submitted {
    Single {
        label: String,
        kind: String,
        ticket: Ticket,
    },
    Batch {
        label: String,
        mode: BatchMode,
        kinds: Vec<String>,
        ticket: BatchTicket,
    },
}

/// Events one instruction can publish: one per stage.
const EVENTS_PER_INSTRUCTION: usize = 5;

/// Replays `workload` on a fresh pipeline built from `config`.
///
/// The event buffer is widened to hold every event of the run, so stage
/// times survive even though nothing reads them until the end.
pub async fn replay(workload: &Workload, mut config: PipelineConfig) -> Result<Report> {
    let name = workload.name.clone().unwrap_or_else(|| "workload".to_owned());
    let cap = config.concurrency_cap;
    let needed = workload
        .instruction_count()
        .saturating_mul(EVENTS_PER_INSTRUCTION);
    config.event_capacity = config.event_capacity.max(needed);
    let pipeline = Pipeline::with_clock(
        workload.catalogue()?,
        config,
        Arc::new(TokioClock::starting_at(0)),
    )?;
    let mut events = pipeline.subscribe();
    let safety = pipeline.spawn_safety_tick();
    info!(%name, cap, steps = workload.steps.len(), "replaying workload");

    let mut labels: BTreeMap<String, InstructionId> = BTreeMap::new();
    let mut submitted = Vec::new();
    for step in &workload.steps {
        match step {
            Step::Dispatch {
                label,
                kind,
                payload,
            } => {
                let ticket = pipeline.dispatch(kind, payload.clone());
                if let Some(id) = ticket.id() {
                    labels.insert(label.clone(), id);
                }
                submitted.push(Submitted::Single {
                    label: label.clone(),
                    kind: kind.clone(),
                    ticket,
                });
            }
            Step::Batch { label, mode, items } => {
                let kinds = items.iter().map(|i| i.kind.clone()).collect();
                let ticket = pipeline.dispatch_batch(items.clone(), *mode);
                for (seq, id) in ticket.members().iter().enumerate() {
                    labels.insert(format!("{label}.{seq}"), *id);
                }
                submitted.push(Submitted::Batch {
                    label: label.clone(),
                    mode: *mode,
                    kinds,
                    ticket,
                });
            }
            Step::Cancel { label } => {
                let Some(id) = labels.get(label) else {
                    bail!("cancel refers to unknown label `{label}`");
                };
                if !pipeline.cancel(*id) {
                    warn!(%label, %id, "cancel ignored: instruction already issued");
                }
            }
            Step::Sleep { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
        }
    }

    let mut settled = Vec::with_capacity(submitted.len());
    for entry in submitted {
        settled.push(match entry {
            Submitted::Single {
                label,
                kind,
                ticket,
            } => {
                let id = ticket.id();
                Settled::Single {
                    label,
                    kind,
                    id,
                    outcome: ticket.await,
                }
            }
            Submitted::Batch {
                label,
                mode,
                kinds,
                ticket,
            } => {
                let batch = ticket.batch();
                let members = ticket.members().to_vec();
                Settled::Batch {
                    label,
                    mode,
                    kinds,
                    batch,
                    members,
                    outcome: ticket.await,
                }
            }
        });
    }

    if let Some(handle) = safety {
        handle.abort();
    }
    let traces = collect_traces(&mut events);
    let trace = |id: InstructionId| traces.get(&id).copied().unwrap_or_default();

    let mut rows = Vec::new();
    let mut batches = Vec::new();
    for entry in settled {
        match entry {
            Settled::Single {
                label,
                kind,
                id: Some(id),
                outcome,
            } => rows.push(Row::settled(&label, id, &kind, None, trace(id), &outcome)),
            Settled::Single {
                label,
                kind,
                id: None,
                outcome,
            } => {
                if let Err(err) = outcome {
                    rows.push(Row::refused(&label, &kind, err.to_string()));
                }
            }
            Settled::Batch {
                label,
                mode,
                kinds,
                batch,
                members,
                outcome,
            } => {
                let summary = match &outcome {
                    Ok(outcomes) => format!("ok ({} outcomes)", outcomes.len()),
                    Err(err) => format!("err: {err}"),
                };
                if members.is_empty() && !kinds.is_empty() {
                    rows.push(Row::refused(&label, &kinds.join(","), summary.clone()));
                }
                if let Some(batch) = batch {
                    for (seq, (id, kind)) in members.into_iter().zip(&kinds).enumerate() {
                        let member = member_outcome(&outcome, batch, seq, id);
                        rows.push(Row::settled(
                            &format!("{label}.{seq}"),
                            id,
                            kind,
                            Some(format!("{batch}#{seq} {mode:?}")),
                            trace(id),
                            &member,
                        ));
                    }
                }
                batches.push(BatchRow {
                    label,
                    mode,
                    outcome: summary,
                });
            }
        }
    }

    Ok(Report {
        name,
        concurrency_cap: cap,
        rows,
        batches,
        status: pipeline.status(),
    })
}

enum Settled {
    Single {
        label: String,
        kind: String,
        id: Option<InstructionId>,
        outcome: Outcome,
    },
    Batch {
        label: String,
        mode: BatchMode,
        kinds: Vec<String>,
        batch: Option<BatchId>,
        members: Vec<InstructionId>,
        outcome: Result<Vec<Outcome>, PipelineError>,
    },
}

/// Outcome of member `seq` given how its batch settled.
///
/// A rolled-back atomic batch only reports its cause; every other member
/// failed with a rollback error naming that cause.
fn member_outcome(
    outcome: &Result<Vec<Outcome>, PipelineError>,
    batch: BatchId,
    seq: usize,
    id: InstructionId,
) -> Outcome {
    match outcome {
        Ok(outcomes) => outcomes
            .get(seq)
            .cloned()
            .unwrap_or(Err(PipelineError::Closed)),
        Err(err) => match err.instruction() {
            Some(cause) if cause != id => Err(PipelineError::BatchAborted { id, batch, cause }),
            _ => Err(err.clone()),
        },
    }
}
