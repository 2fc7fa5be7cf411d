// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared helpers for echo-pipeline integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use echo_dry_tests::{sim_catalogue, SimPayload};
use echo_pipeline::{Catalogue, Pipeline, PipelineConfig, TokioClock};
use serde_json::Value;

/// Config used by most tests: safety tick off, so every issue observed comes
/// from an event-driven scheduling pass.
pub fn config(cap: usize) -> PipelineConfig {
    PipelineConfig {
        concurrency_cap: cap,
        safety_tick_ms: 0,
        ..PipelineConfig::default()
    }
}

/// Pipeline over `catalogue` whose clock reads 0 ms at creation and follows
/// tokio (virtual) time.
pub fn pipeline_with(catalogue: Catalogue, cap: usize) -> Pipeline {
    Pipeline::with_clock(catalogue, config(cap), Arc::new(TokioClock::starting_at(0)))
        .expect("valid test config")
}

/// Pipeline over the simulated catalogue.
pub fn pipeline(cap: usize) -> Pipeline {
    pipeline_with(sim_catalogue(&[]).expect("catalogue"), cap)
}

/// Simulated payload touching `resources` and settling after `delay_ms`.
pub fn sim(resources: &[&str], delay_ms: u64) -> Value {
    SimPayload::on(resources).delay_ms(delay_ms).build()
}
