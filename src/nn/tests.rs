use super::*;
use crate::dtype::{DType, Device};
use crate::pruning::gen_two_four_sparse_mask;
use crate::tensor::{self, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn two_four_layer(out: usize, inp: usize) -> Linear {
    let mut rng = StdRng::seed_from_u64(3);
    let mask = gen_two_four_sparse_mask(out, inp, DType::F16, Device::Accelerator, &mut rng)
        .expect("mask");
    let weight = Tensor::rand(&[out, inp], &mut rng)
        .with_dtype(DType::F16)
        .to_device(Device::Accelerator)
        .mul(&mask)
        .expect("mul");
    let bias = Tensor::rand(&[out], &mut rng)
        .with_dtype(DType::F16)
        .to_device(Device::Accelerator);
    Linear::from_tensors(weight, Some(bias)).expect("layer")
}

#[test]
fn test_linear_forward_is_x_wt_plus_b() {
    let weight = Tensor::new(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let bias = Tensor::new(&[0.5, -0.5], &[2]);
    let layer = Linear::from_tensors(weight, Some(bias)).unwrap();

    let x = Tensor::new(&[1.0, 0.0, 1.0], &[1, 3]);
    let y = layer.forward(&x).unwrap();
    assert_eq!(y.shape(), &[1, 2]);
    assert_eq!(y.data(), &[4.5, 9.5]);
}

#[test]
fn test_linear_without_bias_uses_mm() {
    let weight = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let layer = Linear::from_tensors(weight, None).unwrap();
    let y = layer.forward(&Tensor::new(&[1.0, 1.0], &[1, 2])).unwrap();
    assert_eq!(y.data(), &[3.0, 7.0]);
    assert!(!layer.has_bias());
}

#[test]
fn test_linear_flattens_batch_dims() {
    let layer = Linear::with_seed(4, 3, Some(1));
    let x = Tensor::ones(&[2, 5, 4]);
    let y = layer.forward(&x).unwrap();
    assert_eq!(y.shape(), &[2, 5, 3]);

    let flat = layer.forward(&Tensor::ones(&[10, 4])).unwrap();
    assert_eq!(y.data(), flat.data());
}

#[test]
fn test_linear_rejects_wrong_in_features() {
    let layer = Linear::with_seed(4, 3, Some(1));
    assert!(layer.forward(&Tensor::ones(&[2, 5])).is_err());
    assert!(layer.forward(&Tensor::ones(&[4])).is_err());
}

#[test]
fn test_semi_sparse_weight_matches_dense_forward() {
    let dense = two_four_layer(32, 64);
    let mut sparse = dense.clone();
    sparse.sparsify_weight().unwrap();
    assert!(sparse.weight().is_semi_sparse());

    let mut rng = StdRng::seed_from_u64(9);
    let x = Tensor::rand(&[16, 64], &mut rng)
        .with_dtype(DType::F16)
        .to_device(Device::Accelerator);
    let expected = dense.forward(&x).unwrap();
    let got = sparse.forward(&x).unwrap();
    assert!(
        got.allclose(&expected, 1e-3, 1e-3),
        "max diff {:?}",
        got.max_abs_diff(&expected)
    );
}

#[test]
fn test_semi_sparse_weight_without_bias() {
    let mut layer = two_four_layer(8, 16);
    layer.set_bias(None);
    let dense_w = layer.weight().as_dense().cloned().unwrap();
    layer.sparsify_weight().unwrap();

    let x = Tensor::ones(&[3, 16])
        .with_dtype(DType::F16)
        .to_device(Device::Accelerator);
    let expected = tensor::mm(&x, &dense_w.t().unwrap()).unwrap();
    assert!(layer.forward(&x).unwrap().allclose(&expected, 1e-3, 1e-3));
}

#[test]
fn test_sparsify_rejects_cpu_weight() {
    let mut layer = Linear::with_seed(8, 4, Some(0));
    let err = layer.sparsify_weight().unwrap_err();
    assert!(matches!(err, crate::error::SparseError::DeviceUnsupported { .. }));
    assert!(!layer.weight().is_semi_sparse());
}

#[test]
fn test_compressed_weight_is_not_a_parameter() {
    let mut layer = two_four_layer(4, 8);
    assert_eq!(layer.named_parameters().len(), 2);
    layer.sparsify_weight().unwrap();
    let names: Vec<String> = layer.named_parameters().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["bias".to_string()]);
}

#[test]
fn test_model_parameter_names() {
    let mut model = Model::new(8, 16, Some(0));
    let names: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["linear.weight", "linear.bias"]);
    assert_eq!(model.parameter("linear.weight").unwrap().shape(), &[8, 16]);
    assert!(model.parameter_mut("linear.bias").is_some());
    assert!(model.parameter("missing").is_none());
    assert_eq!(model.num_parameters(), 8 * 16 + 8);
}

#[test]
fn test_model_seed_is_reproducible() {
    let a = Model::new(4, 8, Some(5));
    let b = Model::new(4, 8, Some(5));
    let c = Model::new(4, 8, Some(6));
    let wa = a.parameter("linear.weight").unwrap();
    assert!(wa.values_eq(b.parameter("linear.weight").unwrap()));
    assert!(!wa.values_eq(c.parameter("linear.weight").unwrap()));
}

#[test]
fn test_to_casts_dense_parameters() {
    let model = Model::new(4, 8, Some(0))
        .to(DType::F16, Device::Accelerator)
        .unwrap();
    let w = model.parameter("linear.weight").unwrap();
    assert_eq!(w.dtype(), DType::F16);
    assert_eq!(w.device(), Device::Accelerator);
}

#[test]
fn test_to_refuses_to_cast_compressed_weight() {
    let mut layer = two_four_layer(4, 8);
    layer.sparsify_weight().unwrap();
    assert!(layer.clone().to(DType::F16, Device::Accelerator).is_ok());
    assert!(layer.to(DType::BF16, Device::Accelerator).is_err());
}

#[test]
fn test_set_weight_checks_shape() {
    let mut layer = Linear::with_seed(4, 3, Some(0));
    assert!(layer.set_weight(Weight::Dense(Tensor::zeros(&[4, 3]))).is_err());
    assert!(layer.set_weight(Weight::Dense(Tensor::zeros(&[3, 4]))).is_ok());
}
