//! Benchmarks for the pure decision paths: phase transitions and proof
//! validation.

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uuid::Uuid;

use curia::domain::models::delta::{DeltaOp, DeltaProposal, ProofBundle, ProofMode};
use curia::domain::models::run::Phase;
use curia::domain::models::REQUIRES_PROOF_TAG;
use curia::services::phase_machine::{transition, PhaseEvent, PhaseState};
use curia::services::proof_validator::ProofValidator;

fn bench_phase_transition(c: &mut Criterion) {
    let state = PhaseState::new();
    let event = PhaseEvent::PlanRecorded {
        proposal_id: Uuid::new_v4(),
    };

    c.bench_function("phase_transition_plan_to_build", |b| {
        b.iter(|| transition(black_box(&state), black_box(&event), 3).unwrap());
    });

    let mut retry_state = PhaseState::new();
    retry_state.phase = Phase::Test;
    let fail = PhaseEvent::TestCompleted { passed: false };
    c.bench_function("phase_transition_test_retry", |b| {
        b.iter(|| transition(black_box(&retry_state), black_box(&fail), 3).unwrap());
    });
}

fn bench_proof_validation(c: &mut Criterion) {
    let validator = ProofValidator::new();
    let thresholds = BTreeMap::from([("branch".to_string(), 0.80), ("lines".to_string(), 0.85)]);
    let proposal = DeltaProposal::new(
        Uuid::new_v4(),
        Phase::Build,
        DeltaOp::Add,
        "bench/key",
        "strategy",
        "rationale",
    )
    .with_tag(REQUIRES_PROOF_TAG)
    .with_proof(ProofBundle {
        passed: true,
        coverage_branch: 0.85,
        coverage_lines: 0.9,
        total_tests: 100,
        failed_tests: 0,
        artifacts: vec!["reports/test.json".to_string()],
        mode: ProofMode::Full,
        stderr_summary: None,
        duration_seconds: 10.0,
        report_path: None,
    });

    c.bench_function("proof_validation_full_bundle", |b| {
        b.iter(|| validator.validate(black_box(&proposal), black_box(&thresholds), false));
    });
}

criterion_group!(benches, bench_phase_transition, bench_proof_validation);
criterion_main!(benches);
