use criterion::{Criterion, black_box, criterion_group, criterion_main};
use dataplane_rtp_codec::seq::nearest_to_rtp_seq_num;

fn bench_nearest(c: &mut Criterion) {
    c.bench_function("nearest_to_rtp_seq_num", |b| {
        b.iter(|| nearest_to_rtp_seq_num(black_box(0x1_FFF0), black_box(0x10)))
    });
}

criterion_group!(benches, bench_nearest);
criterion_main!(benches);
