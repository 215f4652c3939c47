use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use icelink_stun::{StunAttribute, StunMessage};

fn check_request() -> StunMessage {
    let mut msg = StunMessage::binding_request();
    msg.add_attribute(StunAttribute::Username("8hhY:bs4J".to_string()));
    msg.add_attribute(StunAttribute::Priority(1_845_501_695));
    msg.add_attribute(StunAttribute::IceControlled(0x932f_f9b1_5126_3b36));
    msg.add_attribute(StunAttribute::UseCandidate);
    msg.add_message_integrity(b"asd88fgpdd777uzjYhagZg")
        .expect("check request fits");
    msg.add_fingerprint().expect("check request fits");
    msg
}

fn bench_stun_encode(c: &mut Criterion) {
    let msg = check_request();

    let mut group = c.benchmark_group("stun_encode");
    group.throughput(Throughput::Bytes(msg.encode().expect("encodes").len() as u64));

    group.bench_function("binding_request", |b| b.iter(|| black_box(&msg).encode()));

    group.bench_function("integrity_and_fingerprint", |b| {
        b.iter(|| -> icelink_stun::Result<Vec<u8>> {
            let mut msg = StunMessage::binding_request();
            msg.add_attribute(StunAttribute::Username("8hhY:bs4J".to_string()));
            msg.add_message_integrity(black_box(b"asd88fgpdd777uzjYhagZg"))?;
            msg.add_fingerprint()?;
            msg.encode()
        })
    });

    group.finish();
}

fn bench_stun_decode(c: &mut Criterion) {
    let bytes = check_request().encode().expect("encodes");

    let mut group = c.benchmark_group("stun_decode");
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("binding_request", |b| {
        b.iter(|| StunMessage::decode(black_box(&bytes)))
    });

    group.bench_function("verify_integrity", |b| {
        b.iter(|| {
            StunMessage::verify_message_integrity(
                black_box(&bytes),
                black_box(b"asd88fgpdd777uzjYhagZg"),
            )
        })
    });

    group.bench_function("reject_application_data", |b| {
        let payload = vec![0x17u8; 1200];
        b.iter(|| StunMessage::decode(black_box(&payload)))
    });

    group.finish();
}

criterion_group!(benches, bench_stun_encode, bench_stun_decode);
criterion_main!(benches);
