use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mural_collab::broadcast::BroadcastGroup;
use mural_collab::protocol::{ClientMessage, ServerMessage, UserProfile};
use mural_collab::storage::{OpLog, StoreConfig};
use mural_core::{OperationRecord, Point, ReplicaState, Stroke};
use std::sync::Arc;
use uuid::Uuid;

fn sample_stroke(points: usize) -> Stroke {
    Stroke::pen(
        (0..points).map(|i| Point::new(i as f32, i as f32 * 0.5)).collect(),
        2.0,
        [0.1, 0.2, 0.3, 1.0],
    )
}

fn sample_draw(points: usize) -> OperationRecord {
    OperationRecord::draw(Uuid::new_v4(), sample_stroke(points))
}

/// A plausible session history: mostly draws, sprinkled undos/redos.
fn session_history(len: usize) -> Vec<OperationRecord> {
    let user = Uuid::new_v4();
    (0..len as u64)
        .map(|i| {
            let op = match i % 7 {
                5 => OperationRecord::undo(user, mural_core::OpId::new()),
                6 => OperationRecord::redo(user, mural_core::OpId::new()),
                _ => sample_draw(16),
            };
            op.with_sequence(i)
        })
        .collect()
}

fn bench_submit_encode(c: &mut Criterion) {
    let op = sample_draw(16);

    c.bench_function("submit_encode_16pt", |b| {
        b.iter(|| {
            let msg = ClientMessage::Submit {
                op: black_box(op.clone()),
            };
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let msg = ServerMessage::Operation {
        op: sample_draw(16).with_sequence(7),
    };
    let encoded = msg.encode().unwrap();

    c.bench_function("operation_decode_16pt", |b| {
        b.iter(|| {
            black_box(ServerMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_ack_roundtrip(c: &mut Criterion) {
    c.bench_function("ack_roundtrip", |b| {
        b.iter(|| {
            let msg = ServerMessage::Ack {
                op_id: mural_core::OpId::new(),
                sequence: 42,
            };
            let encoded = msg.encode().unwrap();
            black_box(ServerMessage::decode(&encoded).unwrap());
        })
    });
}

fn bench_fold_apply(c: &mut Criterion) {
    c.bench_function("fold_apply_single_draw", |b| {
        b.iter_custom(|iters| {
            let mut state = ReplicaState::new();
            let ops: Vec<OperationRecord> = (0..iters).map(|_| sample_draw(16)).collect();

            let start = std::time::Instant::now();
            for op in ops {
                state.apply(black_box(op));
            }
            start.elapsed()
        })
    });
}

fn bench_replay_1000_ops(c: &mut Criterion) {
    let history = session_history(1000);

    c.bench_function("replay_1000_ops", |b| {
        b.iter(|| {
            let state = ReplicaState::from_history(black_box(history.clone()));
            black_box(state.active().len());
        })
    });
}

fn bench_duplicate_rejection(c: &mut Criterion) {
    c.bench_function("fold_duplicate_rejection", |b| {
        let mut state = ReplicaState::new();
        let op = sample_draw(16);
        state.apply(op.clone());

        b.iter(|| {
            black_box(state.apply(black_box(op.clone())));
        })
    });
}

fn bench_broadcast_100_users(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_100_users", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let rx = group.add_user(UserProfile::new(format!("User{i}"))).await;
                    receivers.push(rx);
                }

                let frame = Arc::new(vec![0u8; 128]);
                let count = group.send_raw(black_box(frame));
                black_box(count);
            });
        })
    });
}

fn bench_log_append(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("mural_bench_append_{}", Uuid::new_v4()));
    let log = OpLog::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    let room = Uuid::new_v4();
    let op = sample_draw(16);

    c.bench_function("log_append_16pt", |b| {
        b.iter(|| {
            black_box(log.append(black_box(room), black_box(&op)).unwrap());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_log_replay_read(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("mural_bench_replay_{}", Uuid::new_v4()));
    let log = OpLog::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    let room = Uuid::new_v4();

    // Pre-populate with 1000 ops
    for op in session_history(1000) {
        log.append(room, &op).unwrap();
    }

    c.bench_function("log_list_ordered_1000", |b| {
        b.iter(|| {
            black_box(log.list_ordered(black_box(room)).unwrap());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_join_replay_end_to_end(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("mural_bench_join_{}", Uuid::new_v4()));
    let log = OpLog::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    let room = Uuid::new_v4();

    for op in session_history(1000) {
        log.append(room, &op).unwrap();
    }

    // Read + fold: what a late joiner pays before seeing the canvas.
    c.bench_function("join_replay_1000_ops", |b| {
        b.iter(|| {
            let history = log.list_ordered(black_box(room)).unwrap();
            let state = ReplicaState::from_history(history);
            black_box(state.active().len());
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_submit_encode,
    bench_operation_decode,
    bench_ack_roundtrip,
    bench_fold_apply,
    bench_replay_1000_ops,
    bench_duplicate_rejection,
    bench_broadcast_100_users,
    bench_log_append,
    bench_log_replay_read,
    bench_join_replay_end_to_end,
);
criterion_main!(benches);
