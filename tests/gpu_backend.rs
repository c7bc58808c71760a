//! GPU Backend Tests
//!
//! Tests for verifying the wgpu unpooling operator.
//! These tests compare GPU results with the CPU reference operator and are
//! skipped on machines without a wgpu adapter.

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustyunpool::nn::{Layer, UnpoolingLayer};
use rustyunpool::params::{Engine, UnpoolingParameter};
use rustyunpool::runtime::backend::{RuntimeError, SliceLayout, UnpoolingOperator};
use rustyunpool::runtime::cpu_backend::CpuUnpooling;
use rustyunpool::runtime::wgpu_backend::WgpuUnpooling;
use rustyunpool::tensor::Blob;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn gpu_operator() -> Option<WgpuUnpooling> {
    init_logger();
    match pollster::block_on(WgpuUnpooling::new()) {
        Ok(operator) => Some(operator),
        Err(err) => {
            println!("skipping GPU test: {err}");
            None
        }
    }
}

fn random_input(len: usize, rng: &mut StdRng) -> Vec<f32> {
    ArrayD::random_using(IxDyn(&[len]), Uniform::new(-2.0f32, 2.0), rng).into_raw_vec()
}

/// Random mask with repeated indices, so the scatter order matters.
fn random_mask(layout: &SliceLayout, rng: &mut StdRng) -> Vec<f32> {
    (0..layout.input_len())
        .map(|_| rng.gen_range(0..layout.output_volume) as f32)
        .collect()
}

#[test]
fn test_gpu_forward_matches_cpu() {
    let Some(gpu) = gpu_operator() else { return };
    let cpu = CpuUnpooling::new();
    let mut rng = StdRng::seed_from_u64(11);

    for (num_slices, input_volume, output_volume) in [(1, 4, 16), (6, 12, 48), (130, 9, 25)] {
        let layout = SliceLayout::new(num_slices, input_volume, output_volume).unwrap();
        let input = random_input(layout.input_len(), &mut rng);
        let mask = random_mask(&layout, &mut rng);

        let mut cpu_out = vec![0.0; layout.output_len()];
        let mut gpu_out = vec![f32::NAN; layout.output_len()];
        cpu.forward(&layout, &input, &mask, &mut cpu_out).unwrap();
        gpu.forward(&layout, &input, &mask, &mut gpu_out).unwrap();
        assert_eq!(cpu_out, gpu_out, "forward mismatch for {layout:?}");
    }
    println!("Unpooling forward: PASSED");
}

#[test]
fn test_gpu_backward_matches_cpu() {
    let Some(gpu) = gpu_operator() else { return };
    let cpu = CpuUnpooling::new();
    let mut rng = StdRng::seed_from_u64(12);

    for (num_slices, input_volume, output_volume) in [(1, 4, 16), (70, 3, 10)] {
        let layout = SliceLayout::new(num_slices, input_volume, output_volume).unwrap();
        let top_diff = random_input(layout.output_len(), &mut rng);
        let mask = random_mask(&layout, &mut rng);

        let mut cpu_diff = vec![0.0; layout.input_len()];
        let mut gpu_diff = vec![f32::NAN; layout.input_len()];
        cpu.backward(&layout, &top_diff, &mask, &mut cpu_diff).unwrap();
        gpu.backward(&layout, &top_diff, &mask, &mut gpu_diff).unwrap();
        assert_eq!(cpu_diff, gpu_diff, "backward mismatch for {layout:?}");
    }
    println!("Unpooling backward: PASSED");
}

#[test]
fn test_gpu_rejects_invalid_mask() {
    let Some(gpu) = gpu_operator() else { return };
    let layout = SliceLayout::new(1, 2, 4).unwrap();
    let mut output = [3.0; 4];
    let err = gpu
        .forward(&layout, &[1.0, 2.0], &[0.0, -1.0], &mut output)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::MaskIndexOutOfBounds { position: 1, .. }));
    assert_eq!(output, [3.0; 4]);
}

#[test]
fn test_gpu_empty_batch_is_noop() {
    let Some(gpu) = gpu_operator() else { return };
    let layout = SliceLayout::new(0, 4, 16).unwrap();
    let mut output: [f32; 0] = [];
    gpu.forward(&layout, &[], &[], &mut output).unwrap();
}

#[test]
fn test_accelerated_layer_matches_reference_layer() {
    if gpu_operator().is_none() {
        return;
    }
    let mut rng = StdRng::seed_from_u64(5);
    let shape = [2, 4, 3, 3];
    let features = ArrayD::random_using(IxDyn(&shape), Uniform::new(-1.0f32, 1.0), &mut rng);
    let mask = ArrayD::random_using(IxDyn(&shape), Uniform::new(0.0f32, 36.0), &mut rng)
        .mapv(f32::floor);

    let mut outputs = Vec::new();
    for engine in [Engine::Reference, Engine::Accelerated] {
        let mut layer = UnpoolingLayer::new(UnpoolingParameter::square(2).with_engine(engine));
        let bottom = vec![
            Blob::from_array(features.clone()),
            Blob::from_array(mask.clone()),
        ];
        let mut top = vec![Blob::new(&[1])];
        layer.setup(&bottom, &mut top).unwrap();
        layer.forward(&bottom, &mut top).unwrap();
        outputs.push(top.remove(0));
    }
    assert_eq!(outputs[0].shape(), &[2, 4, 6, 6]);
    assert_eq!(outputs[0].data(), outputs[1].data());
}
