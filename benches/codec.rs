use camlink::transport::message::{
    MotionConfig, RecordingType, Schedule, Signal, UserConfig,
};
use camlink::{decode_envelope, encode_envelope, Envelope, Payload};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn signal_envelope() -> Envelope {
    // A typical SDP answer is a few kilobytes of JSON
    let sdp = "a=candidate:1 1 udp 2130706431 192.168.1.20 50000 typ host\\r\\n".repeat(40);
    let data = format!("{{\"type\":\"answer\",\"sdp\":\"v=0\\r\\n{}\"}}", sdp);
    Envelope::new("v1", "c7", Payload::Signal(Signal::new("c7", data)))
}

fn user_config_envelope() -> Envelope {
    let config = UserConfig {
        recording_type: Some(RecordingType::ContinuousScheduled),
        schedules: (0..7)
            .map(|day| Schedule {
                days_of_week: vec![day],
                start_time: Some("08:00".into()),
                end_time: Some("18:30".into()),
            })
            .collect(),
        motion_config: Some(MotionConfig {
            sensitivity: Some(70),
            pre_record_seconds: Some(5),
            post_record_seconds: Some(15),
        }),
        motion_enabled: Some(true),
        name: Some("Front door".into()),
    };
    Envelope::new("c7", "v1", Payload::UserConfig(config))
}

fn bench_signal_envelope(c: &mut Criterion) {
    let envelope = signal_envelope();
    let frame = encode_envelope(&envelope);

    c.bench_function("encode_signal_envelope", |b| {
        b.iter(|| encode_envelope(black_box(&envelope)))
    });
    c.bench_function("decode_signal_envelope", |b| {
        b.iter(|| decode_envelope(black_box(&frame)))
    });
}

fn bench_user_config(c: &mut Criterion) {
    let envelope = user_config_envelope();
    let frame = encode_envelope(&envelope);

    c.bench_function("encode_user_config", |b| {
        b.iter(|| encode_envelope(black_box(&envelope)))
    });
    c.bench_function("decode_user_config", |b| {
        b.iter(|| decode_envelope(black_box(&frame)))
    });
}

criterion_group!(benches, bench_signal_envelope, bench_user_config);
criterion_main!(benches);
