use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use knotgraph::construct::{Database, PersistenceMode};
use knotgraph::engine::Engine;
use knotgraph::parser::parse_query;

fn seeded(nodes: usize) -> Database {
    let db = Database::new(PersistenceMode::InMemory).unwrap();
    let engine = Engine::new(&db);
    let mut script = String::new();
    for n in 0..nodes {
        script.push_str(&format!("add node (key=n{n} tags=even:{});", n % 2 == 0));
    }
    for n in 1..nodes {
        script.push_str(&format!("add edge (from=n{} to=n{n} type=next);", n - 1));
    }
    assert!(engine.execute(&script).is_ok());
    db
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let query = "select (key=user* tags=active) as u; select edge (direction=forward type=owns) in u as o; \
                 select () in o; delete (key=* tags=temp); add edge (from=a to=b type=owns);";
    c.bench_function("parse 5 statements", |b| b.iter(|| parse_query(black_box(query)).unwrap()));

    let db = seeded(1000);
    let engine = Engine::new(&db);
    c.bench_function("select by key 1k", |b| b.iter(|| engine.execute(black_box("select (key=n500);"))));
    c.bench_function("select by tag 1k", |b| b.iter(|| engine.execute(black_box("select (tags=even:true);"))));
    c.bench_function("traverse 1k", |b| {
        b.iter(|| engine.execute(black_box("select (key=n1*) as s; select edge (direction=forward) in s as e; select () in e;")))
    });

    c.bench_function("add and commit 100", |b| {
        b.iter_batched(
            || seeded(0),
            |db| {
                let engine = Engine::new(&db);
                for n in 0..100 {
                    engine.execute(&format!("add node (key=k{n});"));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
