use super::*;
use crate::pruning::gen_two_four_sparse_mask;
use crate::tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn sparse_source(m: usize, k: usize, dtype: DType, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let mask = gen_two_four_sparse_mask(m, k, dtype, Device::Accelerator, &mut rng).unwrap();
    Tensor::rand(&[m, k], &mut rng)
        .with_dtype(dtype)
        .to_device(Device::Accelerator)
        .mul(&mask)
        .unwrap()
}

fn dense_operand(k: usize, n: usize, dtype: DType, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    Tensor::rand(&[k, n], &mut rng)
        .with_dtype(dtype)
        .to_device(Device::Accelerator)
}

#[test]
fn test_from_dense_records_shape_and_grad() {
    let a = sparse_source(8, 16, DType::F16, 0).requires_grad();
    let s = SemiSparseTensor::from_dense(a).unwrap();
    assert_eq!(s.shape(), &[8, 16]);
    assert_eq!(s.original_shape(), [8, 16]);
    assert!(!s.is_transposed());
    assert!(s.requires_grad_enabled());
    assert_eq!(s.dtype(), DType::F16);
    assert_eq!(s.device(), Device::Accelerator);
    assert_eq!(s.compressed_size_bytes(), 8 * 8 * 2 + 8 * 16 / 8);
}

#[test]
fn test_double_transpose_restores_flag_and_shares_context() {
    let s = SemiSparseTensor::from_dense(sparse_source(8, 16, DType::F16, 1)).unwrap();
    let once = s.t();
    assert!(once.is_transposed());
    assert_eq!(once.shape(), &[16, 8]);
    assert!(once.shares_context(&s));

    let twice = once.t();
    assert!(!twice.is_transposed());
    assert_eq!(twice.shape(), s.shape());
    assert!(twice.shares_context(&s));
    assert_ne!(twice.id(), s.id());
}

#[test]
fn test_detach_keeps_context_and_flag() {
    let s = SemiSparseTensor::from_dense(sparse_source(4, 8, DType::F16, 2).requires_grad())
        .unwrap()
        .t();
    let d = s.detach();
    assert!(d.shares_context(&s));
    assert!(d.is_transposed());
    assert!(!d.requires_grad_enabled());
    assert!(s.requires_grad_enabled());
    assert_ne!(d.id(), s.id());
}

#[test]
fn test_compression_requires_accelerator() {
    let a = sparse_source(4, 8, DType::F16, 3).to_device(Device::Cpu);
    let err = SemiSparseTensor::from_dense(a).unwrap_err();
    assert!(matches!(err, SparseError::DeviceUnsupported { .. }));
}

#[test]
fn test_compression_rejects_f32() {
    let a = sparse_source(4, 8, DType::F32, 4);
    let err = SemiSparseTensor::from_dense(a).unwrap_err();
    assert!(matches!(err, SparseError::UnsupportedDtype { .. }));
}

#[test]
fn test_compression_rejects_dense_source() {
    let a = Tensor::ones(&[4, 8])
        .with_dtype(DType::F16)
        .to_device(Device::Accelerator);
    let err = SemiSparseTensor::from_dense(a).unwrap_err();
    assert!(matches!(err, SparseError::NotTwoFourSparse { nonzeros: 4, .. }));
}

#[test]
fn test_context_mm_matches_dense() {
    for dtype in [DType::F16, DType::BF16] {
        let a = sparse_source(32, 64, dtype, 5);
        let b = dense_operand(64, 16, dtype, 6);
        let expected = tensor::mm(&a, &b).unwrap();
        let ctx = SparseContext::compress(&a).unwrap();
        let got = ctx.mm(&b).unwrap();
        assert_eq!(got.shape(), &[32, 16]);
        assert_eq!(got.dtype(), dtype);
        assert!(got.allclose(&expected, 1e-3, 1e-3), "{dtype}");
    }
}

#[test]
fn test_context_addmm_column_bias_matches_dense() {
    let a = sparse_source(16, 32, DType::F16, 7);
    let b = dense_operand(32, 8, DType::F16, 8);
    let bias = dense_operand(1, 8, DType::F16, 9).reshape(&[8]).unwrap();
    let expected = tensor::addmm(&bias, &a, &b).unwrap();
    let got = SparseContext::compress(&a)
        .unwrap()
        .addmm(&b, &bias, BiasAxis::Columns)
        .unwrap();
    assert!(got.allclose(&expected, 1e-3, 1e-3));
}

#[test]
fn test_context_addmm_row_bias() {
    let a = sparse_source(4, 8, DType::F16, 10);
    let b = dense_operand(8, 3, DType::F16, 11);
    let bias = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[4])
        .with_dtype(DType::F16)
        .to_device(Device::Accelerator);
    let plain = tensor::mm(&a, &b).unwrap();
    let got = SparseContext::compress(&a)
        .unwrap()
        .addmm(&b, &bias, BiasAxis::Rows)
        .unwrap();
    for i in 0..4 {
        for j in 0..3 {
            let want = DType::F16.round(plain.data()[i * 3 + j] + bias.data()[i]);
            assert!((got.data()[i * 3 + j] - want).abs() <= 1e-2);
        }
    }
}

#[test]
fn test_context_rejects_bad_operands() {
    let ctx = SparseContext::compress(&sparse_source(4, 8, DType::F16, 12)).unwrap();
    assert!(ctx.mm(&dense_operand(4, 4, DType::F16, 0)).is_err());
    assert!(ctx.mm(&dense_operand(8, 4, DType::BF16, 0)).is_err());
    let wrong_bias = Tensor::zeros(&[3])
        .with_dtype(DType::F16)
        .to_device(Device::Accelerator);
    assert!(ctx
        .addmm(&dense_operand(8, 4, DType::F16, 0), &wrong_bias, BiasAxis::Columns)
        .is_err());
}

#[test]
fn test_int8_kernel_is_exact() {
    let mut rng = StdRng::seed_from_u64(13);
    let mask = gen_two_four_sparse_mask(8, 16, DType::I8, Device::Accelerator, &mut rng).unwrap();
    let a = Tensor::randint(3, &[8, 16], &mut rng)
        .with_dtype(DType::I8)
        .to_device(Device::Accelerator)
        .mul(&mask)
        .unwrap();
    let b = Tensor::randint(3, &[16, 4], &mut rng)
        .with_dtype(DType::I8)
        .to_device(Device::Accelerator);
    let expected = tensor::mm(&a, &b).unwrap();
    let got = SparseContext::compress(&a).unwrap().mm(&b).unwrap();
    assert!(got.values_eq(&expected));
}

#[test]
fn test_debug_shows_logical_shape() {
    let s = SemiSparseTensor::from_dense(sparse_source(4, 8, DType::F16, 14)).unwrap();
    assert_eq!(format!("{:?}", s.t()), "SemiSparseTensor(shape=[8, 4])");
}
