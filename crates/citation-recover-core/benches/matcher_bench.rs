use citation_recover_core::{Candidate, CandidateIndex, SourceId};
use criterion::{criterion_group, criterion_main, Criterion};

fn mk_page_text(index: usize) -> String {
    format!(
        "Register of baptisms, parish {index}, entry {}; {}",
        index * 7,
        "transcribed from the original register with marginal notes ".repeat(5)
    )
}

fn mk_index(size: usize) -> CandidateIndex {
    (0..size)
        .map(|index| {
            let text = mk_page_text(index);
            Candidate::new(
                SourceId(i64::try_from(index).unwrap_or(i64::MAX)),
                &text.as_bytes()[..200],
                19_000_101 + i64::try_from(index % 365).unwrap_or(0),
            )
        })
        .collect()
}

fn bench_classify(c: &mut Criterion) {
    let index = mk_index(20_000);
    let reference = mk_page_text(12_345);
    let date = 19_000_101 + i64::try_from(12_345 % 365).unwrap_or(0);

    c.bench_function("classify_indexed_20k", |b| {
        b.iter(|| index.classify(std::hint::black_box(&reference), std::hint::black_box(date)));
    });
}

criterion_group!(benches, bench_classify);
criterion_main!(benches);
