use half::f16;

use tracea_evt::core::element::{Bit, RoundStyle};
use tracea_evt::core::loader::ConfigLoader;
use tracea_evt::{
    build_epilogue, AccumulatorTensor, ActivationKind, AnyBuffer, AnyTensor, AuxLayout, DeviceBuffer, Element,
    EpilogueBindings, EpilogueConfig, EpilogueError, EpilogueSpec, Float8E4M3, NumericKind, PipelineKind,
    ProblemShape, TileOrder,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn accumulators(problem: &ProblemShape) -> Vec<f32> {
    (0..problem.m * problem.n * problem.l).map(|i| ((i * 11) % 19) as f32 - 9.0).collect()
}

#[test]
fn test_json_spec_builds_and_runs() {
    init_tracing();
    let spec: EpilogueSpec = serde_json::from_str(
        r#"{
            "pipeline": {"kind": "lin_comb_per_row_bias_elt_act"},
            "activation": {"kind": "clamp", "lower": -2.0, "upper": 3.0},
            "output": "f16",
            "alpha": 0.5,
            "config": {"parallel": false, "tile_order": "column_major"}
        }"#,
    )
    .unwrap();
    assert_eq!(spec.describe(), "lin_comb_per_row_bias_elt_act<clamp>/f16");
    assert_eq!(spec.config.tile_order, TileOrder::ColumnMajor);

    let problem = ProblemShape::new(80, 72, 1, 1);
    let bias: Vec<f32> = (0..80).map(|m| (m % 4) as f32 * 0.25).collect();
    let bindings = EpilogueBindings { bias: Some(DeviceBuffer::from_slice(&bias)), ..Default::default() };
    let kernel = build_epilogue(&spec, &bindings).unwrap();
    kernel.can_implement(&problem).unwrap();

    let acc = accumulators(&problem);
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let output = AnyTensor::row_major(NumericKind::F16, &problem).unwrap();
    kernel.run(&mainloop, None, &output).unwrap();

    let d = output.downcast::<f16>("D").unwrap();
    for m in 0..problem.m {
        for n in 0..problem.n {
            let z = 0.5f32.mul_add(acc[m * problem.n + n], bias[m]);
            assert_eq!(d.load(m, n, 0), f16::from_f32(z.clamp(-2.0, 3.0)), "({m}, {n})");
        }
    }
}

#[test]
fn test_source_read_through_registry() {
    let spec = EpilogueSpec { alpha: 2.0, beta: -1.0, ..EpilogueSpec::new(PipelineKind::LinearCombination, NumericKind::F32) };
    let kernel = build_epilogue(&spec, &EpilogueBindings::default()).unwrap();
    assert!(kernel.needs_source());

    let problem = ProblemShape::new(17, 33, 1, 1);
    let acc = accumulators(&problem);
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let source = AnyTensor::row_major(NumericKind::F32, &problem).unwrap();
    source.downcast::<f32>("C").unwrap().buffer.fill(4.0);
    let output = AnyTensor::row_major(NumericKind::F32, &problem).unwrap();
    kernel.run(&mainloop, Some(source.as_source()), &output).unwrap();

    let expected: Vec<f64> = acc.iter().map(|&a| (2.0 * a - 4.0) as f64).collect();
    assert_eq!(output.to_f64_vec(), expected);
}

#[test]
fn test_ptr_array_scalars_per_group() {
    let spec = EpilogueSpec {
        policy: tracea_evt::policy::PolicyKind::PtrArrayTmaWarpSpecialized,
        activation: ActivationKind::Relu,
        ..EpilogueSpec::new(PipelineKind::LinCombEltAct, NumericKind::F32)
    };
    let bindings = EpilogueBindings {
        alpha_ptr_array: Some(vec![DeviceBuffer::from_slice(&[1.0]), DeviceBuffer::from_slice(&[0.5])]),
        ..Default::default()
    };
    let kernel = build_epilogue(&spec, &bindings).unwrap();

    let problem = ProblemShape::new(8, 8, 1, 2);
    let acc = accumulators(&problem);
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let output = AnyTensor::row_major(NumericKind::F32, &problem).unwrap();
    kernel.run(&mainloop, None, &output).unwrap();

    let d = output.to_f64_vec();
    for (i, (&a, &value)) in acc.iter().zip(&d).enumerate() {
        let alpha = if i < 64 { 1.0 } else { 0.5 };
        assert_eq!(value, (alpha * a).max(0.0) as f64, "element {i}");
    }

    let three_groups = ProblemShape::new(8, 8, 1, 3);
    assert!(kernel.can_implement(&three_groups).is_err());
}

#[test]
fn test_amax_pipeline_through_registry() {
    let spec = EpilogueSpec {
        activation: ActivationKind::Relu,
        scale_aux: 2.0,
        ..EpilogueSpec::new(PipelineKind::ScaledLinCombPerRowBiasEltActAmaxAux, NumericKind::E4M3)
    };
    let problem = ProblemShape::new(32, 64, 1, 1);
    let bindings = EpilogueBindings {
        aux: Some(AnyBuffer::E4M3(DeviceBuffer::zeroed(32 * 64))),
        amax_d: Some(DeviceBuffer::zeroed(1)),
        amax_aux: Some(DeviceBuffer::zeroed(1)),
        ..Default::default()
    };
    let kernel = build_epilogue(&spec, &bindings).unwrap();
    kernel.can_implement(&problem).unwrap();

    let acc = accumulators(&problem);
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let output = AnyTensor::row_major(NumericKind::E4M3, &problem).unwrap();
    kernel.run(&mainloop, None, &output).unwrap();

    let abs_max = acc.iter().fold(0.0f32, |m, a| m.max(a.abs()));
    let relu_max = acc.iter().fold(0.0f32, |m, &a| m.max(a.max(0.0)));
    assert_eq!(bindings.amax_aux.as_ref().unwrap().load(0), abs_max);
    assert_eq!(bindings.amax_d.as_ref().unwrap().load(0), relu_max);
}

#[test]
fn test_misaligned_problem_rejected_at_run() {
    let spec = EpilogueSpec::new(PipelineKind::LinCombPerRowBiasEltActAux, NumericKind::F16);
    let problem = ProblemShape::new(16, 12, 1, 1);
    let bindings = EpilogueBindings { aux: Some(AnyBuffer::F16(DeviceBuffer::zeroed(16 * 12))), ..Default::default() };
    let kernel = build_epilogue(&spec, &bindings).unwrap();

    let mainloop = AccumulatorTensor::row_major(problem, &accumulators(&problem)).unwrap();
    let output = AnyTensor::row_major(NumericKind::F16, &problem).unwrap();
    let err = kernel.run(&mainloop, None, &output).unwrap_err();
    assert!(matches!(err, EpilogueError::Misaligned { .. }));
}

#[test]
fn test_config_file_round_trip_with_overrides() {
    let path = std::env::temp_dir().join(format!("tracea_evt_spec_{}.json", std::process::id()));
    let spec = EpilogueSpec {
        activation: ActivationKind::LeakyRelu { alpha: 0.25 },
        config: EpilogueConfig { occupancy: 2, ..EpilogueConfig::sequential() },
        ..EpilogueSpec::new(PipelineKind::LinCombEltAct, NumericKind::BF16)
    };
    ConfigLoader::save_json(&spec, &path).unwrap();
    let loaded: EpilogueSpec = ConfigLoader::load_json(&path).unwrap();
    let _ = std::fs::remove_file(&path);
    assert_eq!(loaded, spec);

    let config = loaded.config.with_overrides(Some("true"), Some("reversed"));
    assert!(config.parallel);
    assert_eq!(config.tile_order, TileOrder::Reversed);
    assert_eq!(config.occupancy, 2);
}

#[test]
fn test_wide_aux_column_major_under_half_output() {
    let spec = EpilogueSpec {
        activation: ActivationKind::Relu,
        aux: Some(NumericKind::F32),
        aux_layout: AuxLayout::ColumnMajor,
        ..EpilogueSpec::new(PipelineKind::LinCombPerRowBiasEltActAux, NumericKind::F16)
    };
    assert_eq!(spec.describe(), "lin_comb_per_row_bias_elt_act_aux<relu>/f16+aux:f32");

    let problem = ProblemShape::new(24, 40, 1, 1);
    let bias: Vec<f32> = (0..24).map(|m| (m % 4) as f32 * 0.25).collect();
    let bindings = EpilogueBindings {
        bias: Some(DeviceBuffer::from_slice(&bias)),
        aux: Some(AnyBuffer::F32(DeviceBuffer::zeroed(24 * 40))),
        ..Default::default()
    };
    let kernel = build_epilogue(&spec, &bindings).unwrap();

    let acc = accumulators(&problem);
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let output = AnyTensor::row_major(NumericKind::F16, &problem).unwrap();
    kernel.run(&mainloop, None, &output).unwrap();

    let d = output.downcast::<f16>("D").unwrap();
    let aux = bindings.aux.as_ref().unwrap().downcast::<f32>("aux").unwrap().to_vec();
    for m in 0..problem.m {
        for n in 0..problem.n {
            let z = acc[m * problem.n + n] + bias[m];
            assert_eq!(aux[n * problem.m + m], z, "aux ({m}, {n})");
            assert_eq!(d.load(m, n, 0), f16::from_f32(z.max(0.0)), "D ({m}, {n})");
        }
    }
}

#[test]
fn test_fp8_aux_under_half_output_from_json() {
    let spec: EpilogueSpec = serde_json::from_str(
        r#"{
            "pipeline": {"kind": "scaled_lin_comb_per_row_bias_elt_act_amax_aux"},
            "activation": {"kind": "relu"},
            "output": "f16",
            "aux": "e4m3",
            "aux_layout": "column_major",
            "scale_aux": 2.0
        }"#,
    )
    .unwrap();
    assert_eq!(spec.aux_kind(), NumericKind::E4M3);
    assert_eq!(spec.aux_layout, AuxLayout::ColumnMajor);

    let problem = ProblemShape::new(32, 64, 1, 1);
    let bindings = EpilogueBindings {
        aux: Some(AnyBuffer::E4M3(DeviceBuffer::zeroed(32 * 64))),
        amax_d: Some(DeviceBuffer::zeroed(1)),
        amax_aux: Some(DeviceBuffer::zeroed(1)),
        ..Default::default()
    };
    let kernel = build_epilogue(&spec, &bindings).unwrap();
    kernel.can_implement(&problem).unwrap();

    let acc = accumulators(&problem);
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let output = AnyTensor::row_major(NumericKind::F16, &problem).unwrap();
    kernel.run(&mainloop, None, &output).unwrap();

    let abs_max = acc.iter().fold(0.0f32, |m, a| m.max(a.abs()));
    assert_eq!(bindings.amax_aux.as_ref().unwrap().load(0), abs_max);
    // D is not fp8, so its amax stays untouched
    assert_eq!(bindings.amax_d.as_ref().unwrap().load(0), 0.0);

    let aux = bindings.aux.as_ref().unwrap().downcast::<Float8E4M3>("aux").unwrap();
    let d = output.downcast::<f16>("D").unwrap();
    for m in 0..problem.m {
        for n in 0..problem.n {
            let z = acc[m * problem.n + n];
            let stored = Float8E4M3::from_f64_rounded((z * 2.0) as f64, RoundStyle::ToNearest);
            assert_eq!(aux.load(n * problem.m + m).into_f64(), stored.into_f64(), "aux ({m}, {n})");
            assert_eq!(d.load(m, n, 0), f16::from_f32(z.max(0.0)), "D ({m}, {n})");
        }
    }
}

#[test]
fn test_aux_element_must_match_binding() {
    let spec = EpilogueSpec {
        aux: Some(NumericKind::BF16),
        ..EpilogueSpec::new(PipelineKind::LinCombPerColBiasEltActAux, NumericKind::F32)
    };
    let bindings = EpilogueBindings { aux: Some(AnyBuffer::F32(DeviceBuffer::zeroed(64))), ..Default::default() };
    let err = build_epilogue(&spec, &bindings).err().unwrap();
    assert!(matches!(err, EpilogueError::ElementMismatch { tensor: "aux", expected: "bf16", actual: "f32" }));
}

#[test]
fn test_bit_aux_records_positivity_mask() {
    let spec = EpilogueSpec {
        activation: ActivationKind::Gelu,
        aux: Some(NumericKind::Bit),
        ..EpilogueSpec::new(PipelineKind::LinCombPerColBiasEltActAux, NumericKind::F16)
    };
    let problem = ProblemShape::new(8, 128, 1, 1);
    let bindings = EpilogueBindings { aux: Some(AnyBuffer::Bit(DeviceBuffer::zeroed(8 * 128))), ..Default::default() };
    let kernel = build_epilogue(&spec, &bindings).unwrap();
    kernel.can_implement(&problem).unwrap();

    let acc = accumulators(&problem);
    let mainloop = AccumulatorTensor::row_major(problem, &acc).unwrap();
    let output = AnyTensor::row_major(NumericKind::F16, &problem).unwrap();
    kernel.run(&mainloop, None, &output).unwrap();

    let mask = bindings.aux.as_ref().unwrap().downcast::<Bit>("aux").unwrap().to_vec();
    for (i, (&a, bit)) in acc.iter().zip(mask).enumerate() {
        assert_eq!(bit, Bit(a > 0.0), "element {i}");
    }
}
