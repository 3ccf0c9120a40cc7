use criterion::{black_box, criterion_group, criterion_main, Criterion};
use motion::coord::Coord;
use motion::queue::{LookaheadQueue, Move};

fn benchmark_lookahead(c: &mut Criterion) {
    c.bench_function("flush_zigzag_moves", |b| {
        b.iter(|| {
            let mut q = LookaheadQueue::new(1500.0);
            let mut pos = (0.0, 0.0);
            for i in 0..200 {
                let (x, y) = if i % 2 == 0 {
                    (pos.0 + 10.0, pos.1)
                } else {
                    (pos.0, pos.1 + 10.0)
                };
                let mv = Move::new(
                    Coord::xyz(pos.0, pos.1, 0.0),
                    Coord::xyz(x, y, 0.0),
                    black_box(150.0),
                    black_box(3000.0),
                    1500.0,
                    0.02,
                );
                q.add_move(mv, f64::INFINITY);
                pos = (x, y);
            }
            q.flush(false)
        })
    });
}

criterion_group!(benches, benchmark_lookahead);
criterion_main!(benches);
