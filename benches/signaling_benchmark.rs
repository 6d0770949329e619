use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio::sync::mpsc;

use huddle::signaling::{
    ClientMessage, ConnId, IceCandidate, PeerInfo, RoomKey, ServerMessage, SessionDirectory,
};

const OFFER_JSON: &str = concat!(
    r#"{"type":"offer","sdp":"v=0\no=- 42 1 IN IP4 127.0.0.1\ns=-\na=ice-ufrag:9f3a\n","#,
    r#""to":"conn_00000000000000b2","from":"conn_00000000000000a1"}"#,
);

/// parsing benchmark
fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Parsing");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ClientMessage::Offer", |b| {
        b.iter(|| {
            let msg: ClientMessage = serde_json::from_str(black_box(OFFER_JSON)).unwrap();
            black_box(msg)
        })
    });

    group.finish();
}

/// outbound serialization benchmark
fn bench_serialize(c: &mut Criterion) {
    let candidate = ServerMessage::IceCandidate {
        candidate: IceCandidate::new("candidate:1 1 udp 2130706431 127.0.0.1 40000 typ host"),
        to: ConnId::try_from("conn_00000000000000b2").unwrap(),
        from: ConnId::try_from("conn_00000000000000a1").unwrap(),
    };
    let joined = ServerMessage::Joined {
        conn_id: ConnId::try_from("conn_00000000000000a1").unwrap(),
        room: RoomKey::from("standup"),
        peers: (0..6)
            .map(|i| PeerInfo {
                conn_id: ConnId::generate(),
                name: format!("peer-{}", i),
            })
            .collect(),
    };

    let mut group = c.benchmark_group("Serialize");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ServerMessage::IceCandidate", |b| {
        b.iter(|| black_box(serde_json::to_string(black_box(&candidate)).unwrap()))
    });

    group.bench_function("ServerMessage::Joined", |b| {
        b.iter(|| black_box(serde_json::to_string(black_box(&joined)).unwrap()))
    });

    group.finish();
}

/// join + leave through the room actor
fn bench_directory(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let directory = SessionDirectory::default();
    let room = RoomKey::from("bench");

    // Keep one resident member so the room actor survives between iterations.
    let (resident_tx, mut resident_rx) = mpsc::unbounded_channel();
    runtime.spawn(async move { while resident_rx.recv().await.is_some() {} });
    runtime
        .block_on(directory.join(
            ConnId::generate(),
            room.clone(),
            "resident".into(),
            resident_tx,
        ))
        .unwrap();

    let mut group = c.benchmark_group("Directory");
    group.throughput(Throughput::Elements(1));

    group.bench_function("join_leave", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let (tx, _rx) = mpsc::unbounded_channel();
                let id = ConnId::generate();
                directory
                    .join(id, room.clone(), "visitor".into(), tx)
                    .await
                    .unwrap();
                black_box(directory.leave(id).await)
            })
        })
    });

    group.finish();
}

criterion_group!(benches, bench_parsing, bench_serialize, bench_directory);
criterion_main!(benches);
