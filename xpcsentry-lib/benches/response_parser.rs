#![allow(clippy::unwrap_used, clippy::expect_used, clippy::arithmetic_side_effects)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::fmt::Write as _;
use std::hint::black_box;
use xpcsentry_lib::launchd::parser::{parse_disabled_services, parse_endpoints, parse_program_target, parse_services};

const AGENT_DUMP: &str = include_str!("../tests/fixtures/gui_501_agent.txt");

/// Domain dump with `count` services and as many disabled entries.
fn domain_dump(count: usize) -> String {
    let mut dump = String::from("gui/501 = {\n\ttype = gui\n\thandle = 501\n\n\tservices = {\n");
    for i in 0..count {
        writeln!(dump, "\t\t{:>8}      -     com.example.service.{i}", i % 7).unwrap();
    }
    dump.push_str("\t}\n\n\tdisabled services = {\n");
    for i in 0..count {
        writeln!(dump, "\t\t\"com.example.disabled.{i}\" => disabled").unwrap();
    }
    dump.push_str("\t}\n}\n");
    dump
}

/// Domain listings are the largest dumps; launchd on a busy host lists ~1000 services.
fn bench_parse_services(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_services");
    for count in [100, 500, 1000, 5000] {
        let dump = domain_dump(count);
        group.throughput(Throughput::Bytes(dump.len() as u64));
        group.bench_with_input(BenchmarkId::new("services", count), &dump, |b, dump| {
            b.iter(|| black_box(parse_services(black_box(dump))));
        });
        group.bench_with_input(BenchmarkId::new("disabled", count), &dump, |b, dump| {
            b.iter(|| black_box(parse_disabled_services(black_box(dump))));
        });
    }
    group.finish();
}

fn bench_parse_service_record(c: &mut Criterion) {
    c.bench_function("parse_service_record", |b| {
        b.iter(|| {
            let endpoints = parse_endpoints(black_box(AGENT_DUMP));
            let target = parse_program_target(black_box(AGENT_DUMP));
            black_box((endpoints, target))
        });
    });
}

criterion_group!(benches, bench_parse_services, bench_parse_service_record);
criterion_main!(benches);
