// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Built-in scenarios replayed by `pipeline-sim demo`.

/// `(file name, workload text)` pairs, in presentation order.
pub const SCENARIOS: &[(&str, &str)] = &[
    ("01-conflict", include_str!("../workloads/01-conflict.yaml")),
    ("02-disjoint", include_str!("../workloads/02-disjoint.yaml")),
    ("03-atomic-abort", include_str!("../workloads/03-atomic-abort.yaml")),
    ("04-ordered", include_str!("../workloads/04-ordered.yaml")),
    ("05-cap", include_str!("../workloads/05-cap.yaml")),
    ("06-cancel", include_str!("../workloads/06-cancel.yaml")),
];
