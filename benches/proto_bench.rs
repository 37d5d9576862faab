#![feature(allocator_api)]

use std::alloc::Global;

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use minicodec::decoding::decode;
use minicodec::encoding::encode;
use minicodec::minitable::{MiniTable, MiniTableSub};
use minicodec::wire::DescriptorType;
use minicodec::{Arena, DecodeOptions, EncodeOptions, Message, Status};

fn scalar_token(ty: DescriptorType) -> char {
    (b'!' + ty.index()) as char
}

fn repeated_token(ty: DescriptorType) -> char {
    (b'!' + 18 + ty.index()) as char
}

fn varint(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
    out
}

fn tag(field_number: u32, wire_type: u8) -> Vec<u8> {
    varint(((field_number as u64) << 3) | wire_type as u64)
}

fn length_delimited(field_number: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = tag(field_number, 2);
    out.extend(varint(payload.len() as u64));
    out.extend_from_slice(payload);
    out
}

/// One scalar int32 field: the worked `08 96 01` example from the wire
/// format's own documentation.
fn small_fixture() -> (std::sync::Arc<MiniTable>, Vec<u8>) {
    let table = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int32)), vec![]).unwrap();
    (table, vec![0x08, 0x96, 0x01])
}

/// A packed repeated int32 field plus a repeated submessage field.
fn medium_fixture() -> (std::sync::Arc<MiniTable>, Vec<u8>) {
    let inner = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int32)), vec![]).unwrap();
    let descriptor = format!(
        "!{}{}E",
        repeated_token(DescriptorType::Int32),
        repeated_token(DescriptorType::Message)
    );
    let table = MiniTable::build(&descriptor, vec![MiniTableSub::Message(inner)]).unwrap();

    let mut packed = Vec::new();
    for i in 0..50u64 {
        packed.extend(varint(i));
    }
    let mut buf = length_delimited(1, &packed);

    for i in 0..20u64 {
        let submsg: Vec<u8> = [tag(1, 0), varint(i * 3)].concat();
        buf.extend(length_delimited(2, &submsg));
    }
    (table, buf)
}

/// A larger packed repeated field, a larger repeated submessage field, and a
/// `map<string, int32>` field.
fn large_fixture() -> (std::sync::Arc<MiniTable>, Vec<u8>) {
    let inner = MiniTable::build(&format!("!{}E", scalar_token(DescriptorType::Int32)), vec![]).unwrap();
    let entry = MiniTable::build(
        &format!("\"{}{}E", scalar_token(DescriptorType::String), scalar_token(DescriptorType::Int32)),
        vec![],
    )
    .unwrap();
    let descriptor = format!(
        "!{}{}{}E",
        repeated_token(DescriptorType::Int32),
        repeated_token(DescriptorType::Message),
        repeated_token(DescriptorType::Message),
    );
    let table = MiniTable::build(
        &descriptor,
        vec![MiniTableSub::Message(inner), MiniTableSub::Message(entry)],
    )
    .unwrap();

    let mut packed = Vec::new();
    for i in 0..1000u64 {
        packed.extend(varint(i));
    }
    let mut buf = length_delimited(1, &packed);

    for i in 0..200u64 {
        let submsg: Vec<u8> = [tag(1, 0), varint(i)].concat();
        buf.extend(length_delimited(2, &submsg));
    }

    for i in 0..100u64 {
        let key = format!("key{i}");
        let mut entry_bytes = length_delimited(1, key.as_bytes());
        entry_bytes.extend(tag(2, 0));
        entry_bytes.extend(varint(i));
        buf.extend(length_delimited(3, &entry_bytes));
    }

    (table, buf)
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for (name, fixture) in [("small", small_fixture as fn() -> _), ("medium", medium_fixture), ("large", large_fixture)] {
        let (table, data) = fixture();
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut arena = Arena::new(&Global);
                let mut msg = Message::new(&table, &mut arena);
                let status = decode(
                    black_box(&data),
                    &mut msg,
                    &table,
                    None,
                    DecodeOptions::default(),
                    &mut arena,
                );
                black_box(status)
            })
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for (name, fixture) in [("small", small_fixture as fn() -> _), ("medium", medium_fixture), ("large", large_fixture)] {
        let (table, data) = fixture();
        let mut arena = Arena::new(&Global);
        let mut msg = Message::new(&table, &mut arena);
        let status = decode(&data, &mut msg, &table, None, DecodeOptions::default(), &mut arena);
        assert_eq!(status, Status::Ok);

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let (bytes, status) = encode(black_box(&msg), &table, EncodeOptions::default(), &mut arena);
                black_box((bytes, status))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode, bench_encode);
criterion_main!(benches);
