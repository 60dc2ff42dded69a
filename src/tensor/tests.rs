use super::*;
use crate::dtype::{DType, Device};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn test_tensor_creation() {
    let t = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.numel(), 4);
    assert_eq!(t.dtype(), DType::F32);
    assert_eq!(t.device(), Device::Cpu);
    assert!(!t.requires_grad_enabled());
}

#[test]
#[should_panic(expected = "doesn't match shape")]
fn test_tensor_new_panics_on_length_mismatch() {
    let _ = Tensor::new(&[1.0, 2.0, 3.0], &[2, 2]);
}

#[test]
fn test_from_vec_rejects_length_mismatch() {
    assert!(Tensor::from_vec(vec![1.0; 3], &[2, 2]).is_err());
}

#[test]
fn test_transpose() {
    let t = Tensor::new(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let tt = t.t().unwrap();
    assert_eq!(tt.shape(), &[3, 2]);
    assert_eq!(tt.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    assert!(tt.t().unwrap().values_eq(&t));
}

#[test]
fn test_transpose_requires_2d() {
    let t = Tensor::zeros(&[2, 2, 2]);
    assert!(t.t().is_err());
}

#[test]
fn test_detach_drops_grad_and_gets_new_id() {
    let t = Tensor::ones(&[2]).requires_grad();
    let d = t.detach();
    assert!(!d.requires_grad_enabled());
    assert_ne!(t.id(), d.id());
    assert_eq!(t.data(), d.data());
}

#[test]
fn test_dtype_cast_rounds() {
    let t = Tensor::new(&[0.1, 1.6, -200.0], &[3]);
    let h = t.to_dtype(DType::F16);
    assert_eq!(h.dtype(), DType::F16);
    assert_eq!(h.data()[1], half::f16::from_f32(1.6).to_f32());
    let q = t.to_dtype(DType::I8);
    assert_eq!(q.data(), &[0.0, 2.0, -128.0]);
}

#[test]
fn test_mm_basic() {
    // [[1, 2], [3, 4]] @ [[5, 6], [7, 8]] = [[19, 22], [43, 50]]
    let a = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let b = Tensor::new(&[5.0, 6.0, 7.0, 8.0], &[2, 2]);
    let c = mm(&a, &b).unwrap();
    assert_eq!(c.data(), &[19.0, 22.0, 43.0, 50.0]);
}

#[test]
fn test_mm_parallel_matches_serial() {
    let mut rng = StdRng::seed_from_u64(7);
    let a = Tensor::rand(&[17, 12], &mut rng);
    let b = Tensor::rand(&[12, 9], &mut rng);
    let serial = mm(&a, &b).unwrap();
    let parallel = mm(
        &a.clone().to_device(Device::Accelerator),
        &b.to_device(Device::Accelerator),
    )
    .unwrap();
    assert!(serial.values_eq(&parallel));
    assert_eq!(parallel.device(), Device::Accelerator);
}

#[test]
fn test_mm_shape_mismatch() {
    let a = Tensor::zeros(&[2, 3]);
    let b = Tensor::zeros(&[2, 3]);
    assert!(mm(&a, &b).is_err());
}

#[test]
fn test_mm_dtype_mismatch() {
    let a = Tensor::zeros(&[2, 2]).with_dtype(DType::F16);
    let b = Tensor::zeros(&[2, 2]);
    assert!(matches!(
        mm(&a, &b),
        Err(SparseError::UnsupportedDtype { .. })
    ));
}

#[test]
fn test_addmm_broadcasts_bias_over_rows() {
    let a = Tensor::new(&[1.0, 0.0, 0.0, 1.0], &[2, 2]);
    let b = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let bias = Tensor::new(&[10.0, 20.0], &[2]);
    let c = addmm(&bias, &a, &b).unwrap();
    assert_eq!(c.data(), &[11.0, 22.0, 13.0, 24.0]);
}

#[test]
fn test_addmm_rejects_bad_bias() {
    let a = Tensor::zeros(&[2, 2]);
    let bias = Tensor::zeros(&[3]);
    assert!(addmm(&bias, &a, &a).is_err());
}

#[test]
fn test_allclose() {
    let a = Tensor::new(&[1.0, 2.0], &[2]);
    let b = Tensor::new(&[1.0005, 2.001], &[2]);
    assert!(a.allclose(&b, 1e-3, 1e-3));
    let c = Tensor::new(&[1.1, 2.0], &[2]);
    assert!(!a.allclose(&c, 1e-3, 1e-3));
    let d = Tensor::new(&[1.0, 2.0], &[1, 2]);
    assert!(!a.allclose(&d, 1e-3, 1e-3));
}

#[test]
fn test_randint_range() {
    let mut rng = StdRng::seed_from_u64(0);
    let t = Tensor::randint(2, &[64], &mut rng);
    assert!(t.data().iter().all(|&v| v == 0.0 || v == 1.0));
}

#[test]
fn test_reshape_and_relu() {
    let t = Tensor::new(&[-1.0, 2.0, -3.0, 4.0], &[2, 2]);
    let r = t.reshape(&[4]).unwrap().relu();
    assert_eq!(r.data(), &[0.0, 2.0, 0.0, 4.0]);
    assert!(t.reshape(&[3]).is_err());
    assert_eq!(t.sum(), 2.0);
}
