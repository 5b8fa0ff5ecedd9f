use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lens_source_recon::config::RegularizationMethod;
use lens_source_recon::numeric::Rect;
use lens_source_recon::regularization;
use lens_source_recon::source_grid::SourceGrid;

fn uniform_active_grid(n: usize) -> SourceGrid {
    let mut grid = SourceGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), n, n, 6).unwrap();
    for id in grid.leaves_preorder() {
        grid.cell_mut(id).maps_to_image_pixel = true;
    }
    grid.assign_active_indices(Default::default());
    grid
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("regularization_build");
    group.sample_size(30);

    let grid = uniform_active_grid(64);

    group.bench_function("norm", |b| {
        b.iter(|| black_box(regularization::build(RegularizationMethod::Norm, black_box(&grid), None).unwrap()))
    });

    group.bench_function("gradient", |b| {
        b.iter(|| black_box(regularization::build(RegularizationMethod::Gradient, black_box(&grid), None).unwrap()))
    });

    group.bench_function("curvature", |b| {
        b.iter(|| black_box(regularization::build(RegularizationMethod::Curvature, black_box(&grid), None).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
