use objectd::protocol::{
    decode_v1_request_header, decode_v2_request_header, encode_v1_request_header,
    encode_v2_request_header, RequestFlags,
};

use criterion::{black_box, criterion_group, Criterion};

criterion_group!(protocol, encode_decode_v1_header, encode_decode_v2_header);

fn encode_decode_v1_header(c: &mut Criterion) {
    c.bench_function("v1 request header encode+decode", |b| {
        b.iter(|| {
            let header = encode_v1_request_header(b'1', 64);
            black_box(decode_v1_request_header(&header))
        });
    });
}

fn encode_decode_v2_header(c: &mut Criterion) {
    c.bench_function("v2 request header encode+decode", |b| {
        b.iter(|| {
            let header = encode_v2_request_header(42, RequestFlags::ORDERED, b'1', 64);
            black_box(decode_v2_request_header(&header))
        });
    });
}
