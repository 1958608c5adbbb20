use criterion::{criterion_group, criterion_main, Criterion};
use fixture_kernel_core::{
    format_channels, parse_channels, FixtureKernel, ParsedRow, ProductionId, WorkNoteId,
};

const POSITIONS: [&str; 8] = [
    "FOH Truss",
    "1st Electric",
    "2nd Electric",
    "3rd Electric",
    "Box Boom SL",
    "Box Boom SR",
    "Ladder SL",
    "Ladder SR",
];

fn mk_row(index: u32) -> ParsedRow {
    let position = POSITIONS[usize::try_from(index).unwrap_or(0) % POSITIONS.len()];
    ParsedRow {
        external_id: format!("LW-{index:05}"),
        channel: index + 1,
        position: position.to_string(),
        unit_number: (index % 12 + 1).to_string(),
        fixture_type: if index % 3 == 0 { "Source Four 26deg" } else { "Mac Aura" }.to_string(),
        purpose: "benchmark fixture".to_string(),
        universe: Some(index / 512 + 1),
        address: Some(index % 512 + 1),
        raw_universe_address: None,
        position_order_hint: None,
    }
}

fn bench_reconcile(c: &mut Criterion) {
    let rows = (0..2_000).map(mk_row).collect::<Vec<_>>();

    c.bench_function("reconcile_2000_rows_steady_state", |b| {
        let mut kernel = FixtureKernel::in_memory();
        let production = ProductionId::new();
        kernel.reconcile(production, &rows);
        b.iter(|| {
            let result = kernel.reconcile(production, &rows);
            if !result.success {
                panic!("reconcile benchmark reported row errors: {:?}", result.errors);
            }
        });
    });

    c.bench_function("reconcile_2000_rows_with_linked_work_notes", |b| {
        let mut kernel = FixtureKernel::in_memory();
        let production = ProductionId::new();
        kernel.reconcile(production, &rows);
        let fixtures = kernel.fixtures().by_production(production).iter().map(|f| f.id).collect::<Vec<_>>();
        for chunk in fixtures.chunks(20) {
            if let Err(err) = kernel.link(WorkNoteId::new(), chunk) {
                panic!("link benchmark setup failed: {err}");
            }
        }
        let shifted = rows[..1_900].to_vec();
        b.iter(|| {
            kernel.reconcile(production, &shifted);
            kernel.reconcile(production, &rows);
        });
    });
}

fn bench_codec(c: &mut Criterion) {
    let channels = (1..=4_000u32).filter(|channel| channel % 7 != 0).collect::<Vec<_>>();
    let expression = format_channels(channels.iter().copied());

    c.bench_function("format_channels_4000", |b| {
        b.iter(|| format_channels(channels.iter().copied()));
    });
    c.bench_function("parse_channels_4000", |b| {
        b.iter(|| parse_channels(&expression));
    });
}

criterion_group!(reconcile_benches, bench_reconcile, bench_codec);
criterion_main!(reconcile_benches);
