// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
//! Scheduling behavior: resource conflicts, concurrency cap, priority.

mod common;

use std::collections::BTreeMap;

use common::{pipeline, pipeline_with, sim};
use echo_dry_tests::{Probe, SimOperation, SIM_OP};
use echo_pipeline::{
    BlockReason, Blocked, Catalogue, InstructionId, InstructionStatus, ResourceId,
};
use futures_util::future::join_all;

fn within(at: u64, expected: u64) -> bool {
    (expected..=expected + 3).contains(&at)
}

#[tokio::test(start_paused = true)]
async fn conflicting_instruction_waits_for_release() {
    let p = pipeline(10);
    let mut probe = Probe::attach(&p);

    let a = p.dispatch(SIM_OP, sim(&["r1"], 100));
    let b = p.dispatch(SIM_OP, sim(&["r1"], 10));
    let (a_id, b_id) = (a.id().unwrap(), b.id().unwrap());
    assert_eq!(p.instruction_status(a_id), Some(InstructionStatus::Issued));
    assert_eq!(p.instruction_status(b_id), Some(InstructionStatus::Pending));

    let (ra, rb) = tokio::join!(a, b);
    ra.unwrap();
    rb.unwrap();

    probe.drain();
    let wa = probe.window(a_id).unwrap();
    let wb = probe.window(b_id).unwrap();
    assert_eq!(wa.issued, 0);
    assert!(within(wa.responded, 100), "{wa:?}");
    assert!(wb.issued >= wa.responded);
    assert!(within(wb.issued, 100), "{wb:?}");
    assert!(within(wb.responded, 110), "{wb:?}");
    assert_eq!(p.status().locked_resources, 0);
}

#[tokio::test(start_paused = true)]
async fn disjoint_instructions_run_concurrently() {
    let p = pipeline(10);
    let mut probe = Probe::attach(&p);

    let a = p.dispatch(SIM_OP, sim(&["r1"], 30));
    let c = p.dispatch(SIM_OP, sim(&["r2"], 80));
    let (a_id, c_id) = (a.id().unwrap(), c.id().unwrap());
    assert_eq!(p.status().active_count, 2);

    let (ra, rc) = tokio::join!(a, c);
    ra.unwrap();
    rc.unwrap();

    probe.drain();
    let wa = probe.window(a_id).unwrap();
    let wc = probe.window(c_id).unwrap();
    assert_eq!((wa.issued, wc.issued), (0, 0));
    assert!(within(wa.responded, 30));
    assert!(within(wc.responded, 80));
    assert!(wa.overlaps(&wc));
}

#[tokio::test(start_paused = true)]
async fn eleventh_instruction_waits_for_a_free_slot() {
    let p = pipeline(10);
    let mut probe = Probe::attach(&p);

    let tickets: Vec<_> = (0..11)
        .map(|n| p.dispatch(SIM_OP, sim(&[format!("r{n}").as_str()], 50 + n)))
        .collect();
    let last = tickets[10].id().unwrap();

    let status = p.status();
    assert_eq!(status.active_count, 10);
    assert_eq!(status.pending_count, 1);
    assert_eq!(
        p.blocked(),
        vec![Blocked {
            id: last,
            reason: BlockReason::CapReached
        }]
    );

    for outcome in join_all(tickets).await {
        outcome.unwrap();
    }

    probe.drain();
    assert_eq!(probe.peak_active(), 10);
    let first_release = (0..10)
        .map(|n| probe.window(InstructionId::from_raw(n + 1)).unwrap().responded)
        .min()
        .unwrap();
    assert!(probe.window(last).unwrap().issued >= first_release);
    assert!(within(first_release, 50));
    assert_eq!(p.status().committed_total, 11);
}

#[tokio::test(start_paused = true)]
async fn blocked_reports_the_holder() {
    let p = pipeline(10);
    let a = p.dispatch(SIM_OP, sim(&["task:1"], 20));
    let b = p.dispatch(SIM_OP, sim(&["task:1", "task:2"], 5));
    let (a_id, b_id) = (a.id().unwrap(), b.id().unwrap());

    assert_eq!(
        p.blocked(),
        vec![Blocked {
            id: b_id,
            reason: BlockReason::Conflict {
                resource: ResourceId::from("task:1"),
                holder: a_id,
            },
        }]
    );
    let (ra, rb) = tokio::join!(a, b);
    ra.unwrap();
    rb.unwrap();
    assert!(p.blocked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn higher_priority_issues_first_once_unblocked() {
    let mut catalogue = Catalogue::new();
    catalogue.register(SIM_OP, SimOperation::new()).unwrap();
    catalogue
        .register("urgent", SimOperation::new().with_priority(5))
        .unwrap();
    let p = pipeline_with(catalogue, 1);
    let mut probe = Probe::attach(&p);

    let blocker = p.dispatch(SIM_OP, sim(&[], 10));
    let low = p.dispatch(SIM_OP, sim(&[], 10));
    let high = p.dispatch("urgent", sim(&[], 10));
    let (low_id, high_id) = (low.id().unwrap(), high.id().unwrap());

    let (r1, r2, r3) = tokio::join!(blocker, low, high);
    r1.unwrap();
    r2.unwrap();
    r3.unwrap();

    probe.drain();
    let high_issue = probe.entered(high_id, InstructionStatus::Issued).unwrap();
    let low_issue = probe.entered(low_id, InstructionStatus::Issued).unwrap();
    assert!(high_issue < low_issue);
}

#[tokio::test(start_paused = true)]
async fn overlapping_resources_never_share_a_window() {
    let p = pipeline(4);
    let mut probe = Probe::attach(&p);
    let pools = [["a", "b"], ["b", "c"], ["c", "d"], ["d", "a"], ["e", "e"]];

    let mut resources: BTreeMap<InstructionId, Vec<&str>> = BTreeMap::new();
    let mut tickets = Vec::new();
    for n in 0..40u64 {
        let pick = &pools[usize::try_from(n % 5).unwrap()];
        let ticket = p.dispatch(SIM_OP, sim(pick, (n * 37) % 23 + 1));
        resources.insert(ticket.id().unwrap(), pick.to_vec());
        tickets.push(ticket);
    }
    for outcome in join_all(tickets).await {
        outcome.unwrap();
    }

    probe.drain();
    assert_eq!(probe.lagged(), 0);
    assert!(probe.peak_active() <= 4);
    let ids: Vec<_> = resources.keys().copied().collect();
    for (i, x) in ids.iter().enumerate() {
        for y in &ids[i + 1..] {
            let shared = resources[x].iter().any(|r| resources[y].contains(r));
            if shared {
                let (wx, wy) = (probe.window(*x).unwrap(), probe.window(*y).unwrap());
                assert!(!wx.overlaps(&wy), "{x} {wx:?} overlaps {y} {wy:?}");
            }
        }
    }
    let status = p.status();
    assert_eq!((status.active_count, status.locked_resources), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn handler_runs_without_holding_the_pipeline() {
    let p = pipeline(2);
    let slow = p.dispatch(SIM_OP, sim(&["r1"], 1_000));
    // the pipeline stays responsive while a handler is sleeping
    tokio::task::yield_now().await;
    assert_eq!(p.status().active_count, 1);
    let quick = p.dispatch(SIM_OP, sim(&["r2"], 1));
    quick.await.unwrap();
    assert_eq!(
        p.instruction_status(slow.id().unwrap()),
        Some(InstructionStatus::Executing)
    );
    slow.await.unwrap();
}
