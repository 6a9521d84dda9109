//! Benchmarks for per-step dispatch overhead in the control-flow interpreter

use autoflow_engine::{Engine, ExecutorRegistry, StaticWorkflowResolver, Step, StepKind, Workflow};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn action_step(id: &str) -> Step {
    Step {
        id: id.to_string(),
        name: None,
        output_variable: Some("out".to_string()),
        condition: None,
        timeout_ms: None,
        retry: Default::default(),
        on_error: Default::default(),
        kind: StepKind::Action {
            action: "core.set".to_string(),
            inputs: IndexMap::from([("value".to_string(), "{{ 1 + 1 }}".to_string())]),
        },
    }
}

fn workflow_with_steps(n: usize) -> Workflow {
    let steps: Vec<Step> = (0..n).map(|i| action_step(&format!("s{i}"))).collect();
    Workflow {
        workflow: autoflow_engine::model::WorkflowMeta {
            id: "bench".to_string(),
            name: "bench".to_string(),
            ..Default::default()
        },
        tools: IndexMap::new(),
        inputs: IndexMap::new(),
        triggers: Vec::new(),
        steps,
    }
}

fn bench_sequential_action_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = Engine::new(ExecutorRegistry::new(), Arc::new(StaticWorkflowResolver::new()));
    let mut group = c.benchmark_group("sequential_action_steps");

    for size in [1usize, 10, 100] {
        let workflow = workflow_with_steps(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.to_async(&rt).iter(|| async {
                let run = engine.execute(&workflow, IndexMap::new()).await;
                black_box(run);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sequential_action_dispatch);
criterion_main!(benches);
