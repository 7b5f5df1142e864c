use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde::{Deserialize, Serialize};

use persevere_core::{
    ArgValue, CompositeArg, Invocation, InvocationSerializer, JsonSerializer, MethodId, ParamType,
    PredicateSerializer, ResultPredicate, TypeRegistry,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LineItem {
    sku: String,
    quantity: u32,
    unit_price_cents: i64,
}

impl CompositeArg for LineItem {
    const TYPE_TAG: &'static str = "bench.line_item";
}

fn invocation(lines: usize) -> Invocation {
    let items: Vec<ArgValue> = (0..lines)
        .map(|i| {
            ArgValue::composite(&LineItem {
                sku: format!("SKU-{i:05}"),
                quantity: (i % 7) as u32 + 1,
                unit_price_cents: 1_999,
            })
            .expect("composite")
        })
        .collect();
    Invocation::new(
        "orders",
        MethodId::new(
            "submit",
            [
                ParamType::Str,
                ParamType::list(ParamType::composite::<LineItem>()),
                ParamType::optional(ParamType::Bytes),
            ],
        ),
        vec!["order-42".into(), ArgValue::List(items), ArgValue::Null],
    )
    .expect("valid invocation")
}

fn bench_invocation(c: &mut Criterion) {
    let serializer = JsonSerializer::new(TypeRegistry::new().with::<LineItem>());
    let mut group = c.benchmark_group("invocation");

    for lines in [1usize, 16, 256] {
        let inv = invocation(lines);
        let blob = InvocationSerializer::encode(&serializer, &inv).expect("encode");
        group.throughput(Throughput::Bytes(blob.bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", lines), &inv, |b, inv| {
            b.iter(|| InvocationSerializer::encode(&serializer, black_box(inv)))
        });
        group.bench_with_input(BenchmarkId::new("decode", lines), &blob, |b, blob| {
            b.iter(|| InvocationSerializer::decode(&serializer, black_box(blob)))
        });
    }

    group.finish();
}

fn bench_predicate(c: &mut Criterion) {
    let serializer = JsonSerializer::default();
    let predicate = ResultPredicate::All {
        of: vec![
            ResultPredicate::no_error_or_kinds(["not_found", "conflict"]),
            ResultPredicate::ResultNotNull,
        ],
    };
    let blob = PredicateSerializer::encode(&serializer, &predicate).expect("encode");

    c.bench_function("predicate/decode", |b| {
        b.iter(|| PredicateSerializer::decode(&serializer, black_box(&blob)))
    });
}

criterion_group!(benches, bench_invocation, bench_predicate);
criterion_main!(benches);
