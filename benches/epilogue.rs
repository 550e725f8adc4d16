use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tracea_evt::catalog::bias::LinCombBiasEltActArgs;
use tracea_evt::catalog::linear::LinCombEltActArgs;
use tracea_evt::catalog::{LinCombEltAct, LinCombPerRowBiasEltAct};
use tracea_evt::semantic::functor::{GELU, ReLU};
use tracea_evt::{
    make_epilogue, AccumulatorTensor, DeviceBuffer, EpilogueConfig, ProblemShape, Shape, TensorRef, TmaWarpSpecialized,
};

type Cta = Shape<128, 128, 1>;
type Epi = Shape<32, 128, 1>;

fn accumulators(problem: &ProblemShape) -> AccumulatorTensor {
    let mut rng = StdRng::seed_from_u64(7);
    let values: Vec<f32> = (0..problem.m * problem.n * problem.l).map(|_| rng.gen_range(-4.0..4.0)).collect();
    AccumulatorTensor::row_major(*problem, &values).unwrap()
}

fn bench_lin_comb_relu(c: &mut Criterion) {
    let mut group = c.benchmark_group("lin_comb_elt_act_relu");

    for &size in &[256usize, 1024] {
        let problem = ProblemShape::new(size, size, 1, 1);
        let mainloop = accumulators(&problem);
        let output = TensorRef::<f16>::row_major(&problem);
        group.throughput(Throughput::Elements((size * size) as u64));

        for (label, config) in [("parallel", EpilogueConfig::default()), ("sequential", EpilogueConfig::sequential())] {
            let epilogue = make_epilogue::<TmaWarpSpecialized, LinCombEltAct<ReLU, f16, f32>, Cta, Epi>(
                &LinCombEltActArgs { alpha: 0.5, ..Default::default() },
                config,
            );
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, _| {
                b.iter(|| epilogue.run(&mainloop, None, &output).unwrap());
            });
        }
    }

    group.finish();
}

fn bench_per_row_bias_gelu(c: &mut Criterion) {
    let mut group = c.benchmark_group("lin_comb_per_row_bias_gelu");

    let problem = ProblemShape::new(1024, 1024, 1, 1);
    let mainloop = accumulators(&problem);
    let source = TensorRef::<f16>::row_major(&problem);
    let output = TensorRef::<f16>::row_major(&problem);
    let bias = DeviceBuffer::from_slice(&vec![0.125f32; problem.m]);
    group.throughput(Throughput::Elements((problem.m * problem.n) as u64));

    let args = LinCombBiasEltActArgs { beta: 1.0, bias_ptr: Some(bias), ..Default::default() };
    for (label, config) in [("parallel", EpilogueConfig::default()), ("sequential", EpilogueConfig::sequential())] {
        let epilogue =
            make_epilogue::<TmaWarpSpecialized, LinCombPerRowBiasEltAct<GELU, f16, f32, f32>, Cta, Epi>(&args, config);
        group.bench_function(label, |b| {
            b.iter(|| epilogue.run(&mainloop, Some(&source), &output).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_lin_comb_relu, bench_per_row_bias_gelu);
criterion_main!(benches);
