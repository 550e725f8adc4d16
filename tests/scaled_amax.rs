use half::f16;
use proptest::prelude::*;

use tracea_evt::catalog::scaled::{ScaledAmaxAuxArgs, ScaledLinCombBiasEltActArgs};
use tracea_evt::catalog::{ScaledLinCombPerRowBiasEltAct, ScaledLinCombPerRowBiasEltActAmaxAux};
use tracea_evt::nodes::aux::RowMajor;
use tracea_evt::semantic::functor::{Identity, ReLU};
use tracea_evt::{
    make_epilogue, AccumulatorTensor, DeviceBuffer, EpilogueConfig, Float8E4M3, ProblemShape, Shape, TensorRef,
    TileOrder, TmaWarpSpecialized,
};

type Cta = Shape<16, 32, 1>;
type Epi = Shape<8, 32, 1>;

/// fp8 D, fp8 aux: split-tree branch.
type Fp8Aux<Act> = ScaledLinCombPerRowBiasEltActAmaxAux<RowMajor, Act, Float8E4M3, f32, Float8E4M3, f32, f32, f32>;
/// fp8 D, f16 aux: inline branch.
type WideAux<Act> = ScaledLinCombPerRowBiasEltActAmaxAux<RowMajor, Act, Float8E4M3, f32, f16, f32, f32, f32>;

const M: usize = 40;
const N: usize = 32;

fn problem() -> ProblemShape {
    ProblemShape::new(M, N, 1, 1)
}

fn accumulators() -> Vec<f32> {
    (0..M * N).map(|i| ((i * 37) % 101) as f32 * 0.125 - 6.0).collect()
}

fn fp8_aux_args(bias: &[f32]) -> ScaledAmaxAuxArgs<f32, f32, Float8E4M3, f32, ()> {
    ScaledAmaxAuxArgs {
        alpha: 1.5,
        scale_a: 0.5,
        scale_b: 2.0,
        scale_d: 0.25,
        scale_aux: 4.0,
        bias_ptr: Some(DeviceBuffer::from_slice(bias)),
        amax_d_ptr: Some(DeviceBuffer::zeroed(1)),
        amax_aux_ptr: Some(DeviceBuffer::zeroed(1)),
        aux_ptr: Some(DeviceBuffer::zeroed(M * N)),
        ..Default::default()
    }
}

/// `Z` computed by the plain scaled pipeline with a wide output, which ignores `scale_d`.
fn reference_z(acc: &AccumulatorTensor, scaled: &ScaledLinCombBiasEltActArgs<f32, f32, ()>) -> Vec<f32> {
    let z = TensorRef::<f32>::row_major(&problem());
    make_epilogue::<TmaWarpSpecialized, ScaledLinCombPerRowBiasEltAct<Identity, f32, f32, f32, f32>, Cta, Epi>(
        scaled,
        EpilogueConfig::sequential(),
    )
    .run(acc, None, &z)
    .unwrap();
    z.buffer.to_vec()
}

fn max_abs(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

#[test]
fn test_split_tree_matches_independent_recomputation() {
    let acc_values = accumulators();
    let mainloop = AccumulatorTensor::row_major(problem(), &acc_values).unwrap();
    let bias: Vec<f32> = (0..M).map(|m| m as f32 * 0.5 - 10.0).collect();
    let args = fp8_aux_args(&bias);

    let d = TensorRef::<Float8E4M3>::row_major(&problem());
    let epilogue = make_epilogue::<TmaWarpSpecialized, Fp8Aux<Identity>, Cta, Epi>(&args, EpilogueConfig::default());
    epilogue.can_implement(&problem()).unwrap();
    epilogue.run(&mainloop, None, &d).unwrap();

    // D against the non-split scaled pipeline
    let d_ref = TensorRef::<Float8E4M3>::row_major(&problem());
    make_epilogue::<TmaWarpSpecialized, ScaledLinCombPerRowBiasEltAct<Identity, Float8E4M3, f32, f32, f32>, Cta, Epi>(
        &args.scaled(),
        EpilogueConfig::sequential(),
    )
    .run(&mainloop, None, &d_ref)
    .unwrap();
    assert_eq!(d.buffer.to_vec(), d_ref.buffer.to_vec());

    // aux and both amax values against Z
    let z = reference_z(&mainloop, &args.scaled());
    let aux = args.aux_ptr.as_ref().unwrap().to_vec();
    for (i, (&zi, &stored)) in z.iter().zip(&aux).enumerate() {
        assert_eq!(stored, Float8E4M3::from_f32(zi * 4.0), "aux element {i}");
    }
    assert_eq!(args.amax_aux_ptr.as_ref().unwrap().load(0), max_abs(&z));
    assert_eq!(args.amax_d_ptr.as_ref().unwrap().load(0), max_abs(&z));
}

#[test]
fn test_fp8_output_saturates_after_scaling() {
    let problem = problem();
    let mainloop = AccumulatorTensor::row_major(problem, &vec![1000.0; M * N]).unwrap();
    let d = TensorRef::<Float8E4M3>::row_major(&problem);
    let args = ScaledLinCombBiasEltActArgs { scale_d: 2.0, ..Default::default() };
    make_epilogue::<TmaWarpSpecialized, ScaledLinCombPerRowBiasEltAct<Identity, Float8E4M3, f32, f32, f32>, Cta, Epi>(
        &args,
        EpilogueConfig::default(),
    )
    .run(&mainloop, None, &d)
    .unwrap();
    assert!(d.buffer.to_vec().iter().all(|&v| v == Float8E4M3::max_finite()));
}

#[test]
fn test_wide_aux_stores_unscaled_z() {
    let acc_values = accumulators();
    let mainloop = AccumulatorTensor::row_major(problem(), &acc_values).unwrap();
    let args: ScaledAmaxAuxArgs<f32, f32, f16, f32, ()> = ScaledAmaxAuxArgs {
        alpha: 2.0,
        scale_aux: 8.0,
        amax_d_ptr: Some(DeviceBuffer::zeroed(1)),
        amax_aux_ptr: Some(DeviceBuffer::zeroed(1)),
        aux_ptr: Some(DeviceBuffer::zeroed(M * N)),
        ..Default::default()
    };

    let d = TensorRef::<Float8E4M3>::row_major(&problem());
    make_epilogue::<TmaWarpSpecialized, WideAux<ReLU>, Cta, Epi>(&args, EpilogueConfig::default())
        .run(&mainloop, None, &d)
        .unwrap();

    let aux = args.aux_ptr.as_ref().unwrap().to_vec();
    for (&a, &stored) in acc_values.iter().zip(&aux) {
        assert_eq!(stored, f16::from_f32(2.0 * a));
    }
    // only an fp8 aux tensor records its amax
    assert_eq!(args.amax_aux_ptr.as_ref().unwrap().load(0), 0.0);
    // amax of D is taken after the activation
    let relu_max = acc_values.iter().fold(0.0f32, |m, &a| m.max((2.0 * a).max(0.0)));
    assert_eq!(args.amax_d_ptr.as_ref().unwrap().load(0), relu_max);
}

#[test]
fn test_amax_skipped_for_wide_output() {
    let mainloop = AccumulatorTensor::row_major(problem(), &accumulators()).unwrap();
    type WideOut = ScaledLinCombPerRowBiasEltActAmaxAux<RowMajor, Identity, f16, f32, f16, f32, f32, f32>;
    let args: ScaledAmaxAuxArgs<f32, f32, f16, f32, ()> =
        ScaledAmaxAuxArgs { amax_d_ptr: Some(DeviceBuffer::zeroed(1)), ..Default::default() };

    let d = TensorRef::<f16>::row_major(&problem());
    make_epilogue::<TmaWarpSpecialized, WideOut, Cta, Epi>(&args, EpilogueConfig::default())
        .run(&mainloop, None, &d)
        .unwrap();
    assert_eq!(args.amax_d_ptr.as_ref().unwrap().load(0), 0.0);
}

#[test]
fn test_amax_propagates_nan() {
    let mut values = accumulators();
    values[5 * N + 3] = f32::NAN;
    let mainloop = AccumulatorTensor::row_major(problem(), &values).unwrap();
    let args = fp8_aux_args(&[0.0; M]);

    let d = TensorRef::<Float8E4M3>::row_major(&problem());
    make_epilogue::<TmaWarpSpecialized, Fp8Aux<Identity>, Cta, Epi>(&args, EpilogueConfig::default())
        .run(&mainloop, None, &d)
        .unwrap();
    assert!(args.amax_d_ptr.as_ref().unwrap().load(0).is_nan());
    assert!(args.amax_aux_ptr.as_ref().unwrap().load(0).is_nan());
}

#[test]
fn test_misaligned_fp8_aux_rejected() {
    let problem = ProblemShape::new(16, 24, 1, 1);
    let args: ScaledAmaxAuxArgs<f32, f32, Float8E4M3, f32, ()> =
        ScaledAmaxAuxArgs { aux_ptr: Some(DeviceBuffer::zeroed(16 * 24)), ..Default::default() };
    let epilogue = make_epilogue::<TmaWarpSpecialized, Fp8Aux<Identity>, Cta, Epi>(&args, EpilogueConfig::default());
    assert!(epilogue.can_implement(&problem).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_amax_independent_of_tile_order(values in prop::collection::vec(-500.0f32..500.0, M * N)) {
        let mainloop = AccumulatorTensor::row_major(problem(), &values).unwrap();
        let expected = max_abs(&values);

        for order in [TileOrder::RowMajor, TileOrder::ColumnMajor, TileOrder::Reversed] {
            for parallel in [false, true] {
                let args = fp8_aux_args(&[0.0; M]);
                let args = ScaledAmaxAuxArgs { alpha: 1.0, scale_a: 1.0, scale_b: 1.0, ..args };
                let d = TensorRef::<Float8E4M3>::row_major(&problem());
                make_epilogue::<TmaWarpSpecialized, Fp8Aux<Identity>, Cta, Epi>(
                    &args,
                    EpilogueConfig { parallel, tile_order: order, ..Default::default() },
                )
                .run(&mainloop, None, &d)
                .unwrap();
                prop_assert_eq!(args.amax_d_ptr.as_ref().unwrap().load(0), expected);
                prop_assert_eq!(args.amax_aux_ptr.as_ref().unwrap().load(0), expected);
            }
        }
    }
}
