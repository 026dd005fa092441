use criterion::{Criterion, criterion_group, criterion_main};
use saga_log::{
    AppendOptions, InMemorySagaLog, InstanceId, LogEntry, LogFilter, SagaLog, SequenceNumber,
};

fn make_entry(instance_id: InstanceId, sequence: i64, terminal: bool) -> LogEntry {
    LogEntry::builder()
        .instance_id(instance_id)
        .saga_type("order-fulfillment")
        .sequence(SequenceNumber::new(sequence))
        .entry_type("StepSucceeded")
        .state("StepRunning")
        .step_index(Some(0))
        .terminal(terminal)
        .payload_raw(serde_json::json!({
            "type": "StepSucceeded",
            "data": { "kind": "Forward", "step_index": 0, "attempt": 1 }
        }))
        .build()
        .unwrap()
}

fn bench_append_sequenced(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_log/append_10_sequenced", |b| {
        b.iter(|| {
            rt.block_on(async {
                let log = InMemorySagaLog::new();
                let id = InstanceId::new();
                let mut current = SequenceNumber::initial();
                for seq in 1..=10 {
                    current = log
                        .append(
                            make_entry(id, seq, false),
                            AppendOptions::expect_sequence(current),
                        )
                        .await
                        .unwrap();
                }
            });
        });
    });
}

fn bench_non_terminal_scan(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let log = InMemorySagaLog::new();
    rt.block_on(async {
        for i in 0..500 {
            let id = InstanceId::new();
            log.append(make_entry(id, 1, false), AppendOptions::expect_new())
                .await
                .unwrap();
            log.append(
                make_entry(id, 2, i % 2 == 0),
                AppendOptions::expect_sequence(SequenceNumber::first()),
            )
            .await
            .unwrap();
        }
    });

    c.bench_function("saga_log/read_all_non_terminal_500", |b| {
        b.iter(|| {
            rt.block_on(async {
                let pending = log.read_all(LogFilter::non_terminal()).await.unwrap();
                assert_eq!(pending.len(), 250);
            });
        });
    });
}

criterion_group!(benches, bench_append_sequenced, bench_non_terminal_scan);
criterion_main!(benches);
