use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lens_source_recon::config::RayTracingMethod;
use lens_source_recon::deflector::Deflector;
use lens_source_recon::image_grid::ImageGrid;
use lens_source_recon::mapping;
use lens_source_recon::numeric::{Point, Rect};
use lens_source_recon::source_grid::SourceGrid;

struct SisLike;

impl Deflector for SisLike {
    fn deflect(&self, x: f64, y: f64, _thread_hint: usize) -> Point {
        let r = (x * x + y * y).sqrt().max(1e-6);
        let theta_e = 0.3;
        Point::new(x - theta_e * x / r, y - theta_e * y / r)
    }

    fn magnification(&self, x: f64, y: f64, _thread_hint: usize) -> f64 {
        let r = (x * x + y * y).sqrt().max(1e-6);
        (1.0 - 0.3 / r).recip().abs()
    }
}

fn window() -> Rect {
    Rect::new(-2.0, 2.0, -2.0, 2.0)
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("mapping_overlap");
    group.sample_size(20);

    let image = ImageGrid::new(window(), black_box(64), black_box(64), &SisLike, None, true);

    group.bench_function("calculate_pixel_magnifications", |b| {
        b.iter(|| {
            let mut source = SourceGrid::new(window(), 2, 2, 6).unwrap();
            mapping::calculate_pixel_magnifications(black_box(&image), black_box(&mut source));
        })
    });

    group.bench_function("adaptive_subgrid_and_build_l", |b| {
        b.iter(|| {
            let mut image = ImageGrid::new(window(), 64, 64, &SisLike, None, true);
            let mut source = SourceGrid::new(window(), 2, 2, 6).unwrap();
            mapping::calculate_pixel_magnifications(&image, &mut source);
            mapping::adaptive_subgrid(&mut source, &image, black_box(5.0), black_box(0.0));
            source.assign_indices_and_count_levels();
            source.assign_active_indices(Default::default());
            mapping::assign_image_active_indices(&mut image);
            black_box(mapping::build_l_matrix(RayTracingMethod::AreaOverlap, &image, &source));
        })
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
