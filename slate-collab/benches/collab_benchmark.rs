use criterion::{black_box, criterion_group, criterion_main, Criterion};
use slate_collab::broadcast::BroadcastGroup;
use slate_collab::coalesce::AppendCoalescer;
use slate_collab::protocol::{PeerInfo, RelayedEvent, SyncMessage};
use slate_collab::OfflineQueue;
use slate_core::{BoardEvent, Color, DocumentSnapshot, Point, Role, Stroke, StrokeId, StrokeMode};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn points(n: usize) -> Vec<Point> {
    (0..n).map(|i| Point::new(i as f32 / n as f32, 0.5)).collect()
}

fn append_event(origin: Uuid, n: usize) -> RelayedEvent {
    RelayedEvent::new(
        origin,
        1,
        BoardEvent::StrokeAppend {
            stroke_id: StrokeId::new(origin, 1),
            points: points(n),
        },
    )
}

fn bench_append_encode(c: &mut Criterion) {
    let event = append_event(Uuid::new_v4(), 64);

    c.bench_function("append_encode_64pts", |b| {
        b.iter(|| {
            let msg = SyncMessage::event(black_box("lesson"), black_box(&event)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_append_decode(c: &mut Criterion) {
    let event = append_event(Uuid::new_v4(), 64);
    let encoded = SyncMessage::event("lesson", &event).unwrap().encode().unwrap();

    c.bench_function("append_decode_64pts", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.relayed_event().unwrap());
        })
    });
}

fn bench_init_state_encode(c: &mut Criterion) {
    let origin = Uuid::new_v4();
    let snapshot = DocumentSnapshot {
        strokes: (0..200u64)
            .map(|i| {
                let mut s = Stroke::new(StrokeId::new(origin, i), 1, StrokeMode::Draw, Color::BLACK, 3.0);
                s.points = points(32);
                s
            })
            .collect(),
        ..DocumentSnapshot::default()
    };

    c.bench_function("init_state_encode_200_strokes", |b| {
        b.iter(|| {
            let msg = SyncMessage::init_state("lesson", black_box(&snapshot)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_30_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for i in 0..30 {
                    let peer = PeerInfo::new(format!("Student{i}"), Role::Student);
                    receivers.push(group.add_peer(peer).await);
                }

                for i in 0..1000u64 {
                    let data = Arc::new(vec![i as u8; 96]);
                    group.broadcast_raw(black_box(data));
                }
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    let origin = Uuid::new_v4();
    let event = append_event(origin, 16);

    c.bench_function("offline_queue_1000_events", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for _ in 0..1000 {
                queue.enqueue(event.clone());
            }
            black_box(queue.drain());
        })
    });
}

fn bench_coalesce_gesture(c: &mut Criterion) {
    let id = StrokeId::new(Uuid::new_v4(), 1);

    c.bench_function("coalesce_500_point_gesture", |b| {
        b.iter(|| {
            let mut coalescer = AppendCoalescer::new(Duration::from_secs(60));
            let mut sent = 0;
            for n in 2..=500 {
                sent += coalescer
                    .push(BoardEvent::StrokeAppend { stroke_id: id, points: points(n) })
                    .len();
            }
            sent += coalescer.push(BoardEvent::StrokeEnd { stroke_id: id }).len();
            black_box(sent);
        })
    });
}

criterion_group!(
    benches,
    bench_append_encode,
    bench_append_decode,
    bench_init_state_encode,
    bench_broadcast_1000_messages,
    bench_offline_queue,
    bench_coalesce_gesture,
);
criterion_main!(benches);
