//! Benchmarks for pipeline construction and execution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use tokio::time::Instant;

use dispatchflow::action::Action;
use dispatchflow::pipeline::{Pipeline, RetryAction};
use dispatchflow::testing::{SucceedingAction, TestJob};

const BRANCHES: usize = 5;
const LEAVES: usize = 10;

fn build_tree() -> Pipeline {
    let (_job, mut pipeline) = TestJob::new().root();
    for branch in 0..BRANCHES {
        let mut retry = RetryAction::new(format!("branch-{branch}"), "branch", "benchmark branch")
            .with_section("test");
        for leaf in 0..LEAVES {
            let name = format!("leaf-{branch}-{leaf}");
            retry = retry.with_child(move || Box::new(SucceedingAction::new(&name)) as Box<dyn Action>);
        }
        if pipeline.add_action(Box::new(retry), None).is_err() {
            break;
        }
    }
    pipeline
}

fn pipeline_benchmark(c: &mut Criterion) {
    c.bench_function("build_tree", |b| b.iter(|| black_box(build_tree())));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    c.bench_function("run_tree", |b| {
        b.iter(|| {
            let mut pipeline = build_tree();
            runtime.block_on(async {
                let deadline = Instant::now() + Duration::from_secs(60);
                black_box(pipeline.run_actions(None, deadline).await.is_ok())
            })
        });
    });

    let pipeline = build_tree();
    c.bench_function("describe_tree", |b| b.iter(|| black_box(pipeline.describe(true))));
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
