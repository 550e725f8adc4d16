use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use tracea_evt::catalog::bias::LinCombBiasArgs;
use tracea_evt::catalog::linear::{LinCombArgs, LinCombEltActArgs, LinCombPtrArrayArgs};
use tracea_evt::catalog::{
    LinCombEltAct, LinCombPerColBias, LinCombPerRowBias, LinearCombination, LinearCombinationGroupedWgrad,
};
use tracea_evt::core::element::RoundNearest;
use tracea_evt::nodes::compute::Compute;
use tracea_evt::nodes::fetch::AccFetch;
use tracea_evt::semantic::functor::{ReLU, Sigmoid, SiLU};
use tracea_evt::semantic::tree::Tree;
use tracea_evt::{
    make_epilogue, AccumulatorTensor, DeviceBuffer, Epilogue, EpilogueConfig, ProblemShape, PtrArrayTmaWarpSpecialized,
    ReferenceMainloop, Shape, Stride, TensorRef, TileOrder, TmaWarpSpecialized,
};

type Cta = Shape<8, 8, 1>;
type Epi = Shape<4, 8, 1>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_test_writer().try_init();
}

fn random_values(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-4.0f32..4.0)).collect()
}

fn packed(problem: &ProblemShape, values: &[f32]) -> TensorRef<f32> {
    TensorRef::new(DeviceBuffer::from_slice(values), Stride::packed_row_major(problem))
}

#[test]
fn test_linear_combination_law_is_bit_exact() {
    init_tracing();
    let mut rng = StdRng::seed_from_u64(7);
    let problem = ProblemShape::new(13, 19, 1, 2);
    let acc = random_values(&mut rng, problem.output_len());
    let c = random_values(&mut rng, problem.output_len());
    let (alpha, beta) = (1.37f32, -0.61f32);

    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let source = packed(&problem, &c);
    let output = TensorRef::<f32>::row_major(&problem);

    let epilogue = make_epilogue::<TmaWarpSpecialized, LinearCombination<f32>, Cta, Epi>(
        &LinCombArgs::new(alpha, beta),
        EpilogueConfig::default(),
    );
    epilogue.run(&mainloop, Some(&source), &output).unwrap();

    for (i, got) in output.buffer.to_vec().into_iter().enumerate() {
        let expected = beta.mul_add(c[i], alpha * acc[i]);
        assert_eq!(got.to_bits(), expected.to_bits(), "element {i}");
    }
}

#[test]
fn test_four_by_four_scenario() {
    let problem = ProblemShape::new(4, 4, 1, 1);
    let acc: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let source = TensorRef::<f32>::row_major(&problem);
    let output = TensorRef::<f32>::row_major(&problem);

    let epilogue = make_epilogue::<TmaWarpSpecialized, LinearCombination<f32>, Shape<4, 4, 1>, Shape<4, 4, 1>>(
        &LinCombArgs::new(2.0, 1.0),
        EpilogueConfig::sequential(),
    );
    epilogue.run(&mainloop, Some(&source), &output).unwrap();

    let expected: Vec<f32> = acc.iter().map(|v| 2.0 * v).collect();
    assert_eq!(output.buffer.to_vec(), expected);
}

#[test]
fn test_reference_mainloop_feeds_epilogue() {
    let problem = ProblemShape::new(6, 10, 5, 1);
    let mut rng = StdRng::seed_from_u64(3);
    let a = random_values(&mut rng, 6 * 5);
    let b = random_values(&mut rng, 5 * 10);
    let mainloop =
        ReferenceMainloop::row_major(problem, DeviceBuffer::from_slice(&a), DeviceBuffer::from_slice(&b)).unwrap();
    let output = TensorRef::<f32>::row_major(&problem);

    let epilogue = make_epilogue::<TmaWarpSpecialized, LinearCombination<f32>, Cta, Epi>(
        &LinCombArgs::new(1.0, 0.0),
        EpilogueConfig::default(),
    );
    epilogue.run(&mainloop, None, &output).unwrap();

    for m in 0..6 {
        for n in 0..10 {
            let mut expected = 0.0f32;
            for k in 0..5 {
                expected += a[m * 5 + k] * b[k * 10 + n];
            }
            assert_eq!(output.load(m, n, 0), expected);
        }
    }
}

#[test]
fn test_activation_composes_with_linear_combination() {
    let mut rng = StdRng::seed_from_u64(11);
    let problem = ProblemShape::new(9, 16, 1, 1);
    let acc = random_values(&mut rng, problem.output_len());
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();

    let plain = TensorRef::<f32>::row_major(&problem);
    make_epilogue::<TmaWarpSpecialized, LinearCombination<f32>, Cta, Epi>(
        &LinCombArgs::new(0.75, 0.0),
        EpilogueConfig::default(),
    )
    .run(&mainloop, None, &plain)
    .unwrap();

    let fused = TensorRef::<f32>::row_major(&problem);
    make_epilogue::<TmaWarpSpecialized, LinCombEltAct<SiLU, f32>, Cta, Epi>(
        &LinCombEltActArgs::new(0.75, 0.0, ()),
        EpilogueConfig::default(),
    )
    .run(&mainloop, None, &fused)
    .unwrap();

    for (z, d) in plain.buffer.to_vec().into_iter().zip(fused.buffer.to_vec()) {
        let silu = z * (1.0 / (1.0 + (-z).exp()));
        assert!((d - silu).abs() <= 1e-6 * silu.abs().max(1.0), "silu({z}) = {silu}, got {d}");
    }
}

#[test]
fn test_hand_built_tree_composes_activations() {
    type Inner = Tree<Compute<ReLU, f32, f32, RoundNearest, 1>, (AccFetch,)>;
    type Outer = Tree<Compute<Sigmoid, f32, f32, RoundNearest, 1>, (Inner,)>;

    let problem = ProblemShape::new(8, 8, 1, 1);
    let acc: Vec<f32> = (0..64).map(|v| (v as f32 - 32.0) / 8.0).collect();
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let output = TensorRef::<f32>::row_major(&problem);

    let epilogue: Epilogue<Cta, Epi, Outer> = Epilogue::new((((), ()), ()), EpilogueConfig::sequential());
    assert!(!epilogue.needs_source());
    epilogue.run(&mainloop, None, &output).unwrap();

    for (x, d) in acc.iter().zip(output.buffer.to_vec()) {
        let expected = 1.0 / (1.0 + (-x.max(0.0)).exp());
        assert!((d - expected).abs() < 1e-6);
    }
}

#[test]
fn test_per_row_and_per_col_bias() {
    let problem = ProblemShape::new(10, 12, 1, 1);
    let acc: Vec<f32> = (0..120).map(|v| v as f32 * 0.25).collect();
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let row_bias: Vec<f32> = (0..10).map(|m| m as f32 * 100.0).collect();
    let col_bias: Vec<f32> = (0..12).map(|n| -(n as f32)).collect();

    let by_row = TensorRef::<f32>::row_major(&problem);
    let args = LinCombBiasArgs { alpha: 2.0, bias_ptr: Some(DeviceBuffer::from_slice(&row_bias)), ..Default::default() };
    make_epilogue::<TmaWarpSpecialized, LinCombPerRowBias<f32>, Cta, Epi>(&args, EpilogueConfig::default())
        .run(&mainloop, None, &by_row)
        .unwrap();

    let by_col = TensorRef::<f32>::row_major(&problem);
    let args = LinCombBiasArgs { alpha: 2.0, bias_ptr: Some(DeviceBuffer::from_slice(&col_bias)), ..Default::default() };
    make_epilogue::<TmaWarpSpecialized, LinCombPerColBias<f32>, Cta, Epi>(&args, EpilogueConfig::default())
        .run(&mainloop, None, &by_col)
        .unwrap();

    for m in 0..10 {
        for n in 0..12 {
            let a = acc[m * 12 + n];
            assert_eq!(by_row.load(m, n, 0), 2.0f32.mul_add(a, row_bias[m]));
            assert_eq!(by_col.load(m, n, 0), 2.0f32.mul_add(a, col_bias[n]));
        }
    }
}

#[test]
fn test_short_bias_vector_rejected() {
    let problem = ProblemShape::new(10, 12, 1, 1);
    let args: LinCombBiasArgs<f32, f32> =
        LinCombBiasArgs { bias_ptr: Some(DeviceBuffer::zeroed(9)), ..Default::default() };
    let epilogue =
        make_epilogue::<TmaWarpSpecialized, LinCombPerRowBias<f32>, Cta, Epi>(&args, EpilogueConfig::default());
    assert!(epilogue.can_implement(&problem).is_err());
}

#[test]
fn test_ptr_array_alpha_per_batch() {
    let problem = ProblemShape::new(8, 8, 1, 2);
    let batch: Vec<f32> = (0..64).map(|v| v as f32 - 20.0).collect();
    let acc: Vec<f32> = batch.iter().chain(batch.iter()).copied().collect();
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let output = TensorRef::<f32>::row_major(&problem);

    let args = LinCombPtrArrayArgs {
        alpha_ptr_array: Some(vec![DeviceBuffer::from_slice(&[1.0f32]), DeviceBuffer::from_slice(&[0.5f32])]),
        ..Default::default()
    };
    let epilogue =
        make_epilogue::<PtrArrayTmaWarpSpecialized, LinearCombination<f32>, Cta, Epi>(&args, EpilogueConfig::default());
    epilogue.can_implement(&problem).unwrap();
    epilogue.run(&mainloop, None, &output).unwrap();

    for m in 0..8 {
        for n in 0..8 {
            let first = output.load(m, n, 0);
            assert_eq!(first, batch[m * 8 + n]);
            assert_eq!(output.load(m, n, 1), first * 0.5);
        }
    }
}

#[test]
fn test_ptr_array_too_short_rejected() {
    let args = LinCombPtrArrayArgs {
        alpha_ptr_array: Some(vec![DeviceBuffer::from_slice(&[1.0f32])]),
        ..Default::default()
    };
    let epilogue =
        make_epilogue::<PtrArrayTmaWarpSpecialized, LinearCombination<f32>, Cta, Epi>(&args, EpilogueConfig::default());
    assert!(epilogue.can_implement(&ProblemShape::new(8, 8, 1, 2)).is_err());
}

#[test]
fn test_grouped_wgrad_zeroes_cross_group_products() {
    let problem = ProblemShape::new(8, 8, 1, 1);
    let mainloop = AccumulatorTensor::row_major(problem, &[1.0; 64]).unwrap();
    let output = TensorRef::<f32>::row_major(&problem);

    make_epilogue::<TmaWarpSpecialized, LinearCombinationGroupedWgrad<2, f32>, Cta, Epi>(
        &LinCombArgs::new(3.0, 0.0),
        EpilogueConfig::default(),
    )
    .run(&mainloop, None, &output)
    .unwrap();

    for m in 0..8 {
        for n in 0..8 {
            let expected = if m / 4 == n / 4 { 3.0 } else { 0.0 };
            assert_eq!(output.load(m, n, 0), expected, "({m}, {n})");
        }
    }
}

#[test]
fn test_result_is_independent_of_tile_order() {
    let mut rng = StdRng::seed_from_u64(5);
    let problem = ProblemShape::new(17, 23, 1, 3);
    let acc = random_values(&mut rng, problem.output_len());
    let c = random_values(&mut rng, problem.output_len());
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let source = packed(&problem, &c);

    let mut results = Vec::new();
    for order in [TileOrder::RowMajor, TileOrder::ColumnMajor, TileOrder::Reversed] {
        for parallel in [false, true] {
            let output = TensorRef::<f32>::row_major(&problem);
            make_epilogue::<TmaWarpSpecialized, LinCombEltAct<ReLU, f32>, Cta, Epi>(
                &LinCombEltActArgs::new(0.5, 2.0, ()),
                EpilogueConfig { parallel, tile_order: order, ..Default::default() },
            )
            .run(&mainloop, Some(&source), &output)
            .unwrap();
            results.push(output.buffer.to_vec());
        }
    }
    assert!(results.windows(2).all(|w| w[0] == w[1]));
}
