//! Benchmarks for QuorumSQL protocol encoding/decoding

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quorumsql::engine::Value;
use quorumsql::protocol::{
    decode_request, decode_response, encode_request, encode_response, Consistency,
    Request, Response,
};

fn protocol_benchmarks(c: &mut Criterion) {
    let exec = Request::Exec {
        stmt_id: 7,
        params: vec![
            Value::Integer(123),
            Value::Text("a moderately sized text parameter".to_string()),
            Value::Blob(vec![0xAB; 256]),
        ],
    };
    let encoded_exec = encode_request(&exec);

    c.bench_function("encode_exec_request", |b| {
        b.iter(|| encode_request(black_box(&exec)))
    });

    c.bench_function("decode_exec_request", |b| {
        b.iter(|| decode_request(black_box(&encoded_exec)).unwrap())
    });

    let query = Request::Query {
        stmt_id: 7,
        params: vec![Value::Integer(123)],
        consistency: Consistency::Linearizable,
    };
    c.bench_function("encode_query_request", |b| {
        b.iter(|| encode_request(black_box(&query)))
    });

    let batch = Response::RowBatch {
        rows: (0..100)
            .map(|i| vec![Value::Integer(i), Value::Text(format!("row-{i}"))])
            .collect(),
    };
    let encoded_batch = encode_response(&batch);

    c.bench_function("encode_row_batch_100", |b| {
        b.iter(|| encode_response(black_box(&batch)))
    });

    c.bench_function("decode_row_batch_100", |b| {
        b.iter(|| decode_response(black_box(&encoded_batch)).unwrap())
    });
}

criterion_group!(benches, protocol_benchmarks);
criterion_main!(benches);
