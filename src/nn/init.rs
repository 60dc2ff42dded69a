//! Weight initialization.
//!
//! Linear layers draw weight and bias from U(-1/sqrt(fan_in), 1/sqrt(fan_in)),
//! the default used by common deep learning frameworks for fully connected
//! layers (kaiming uniform with `a = sqrt(5)`).
//!
//! # References
//!
//! - He, K., et al. (2015). Delving deep into rectifiers: Surpassing human-level
//!   performance on `ImageNet` classification. ICCV.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tensor::Tensor;

/// RNG for an optional seed; entropy when `None`.
#[must_use]
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Samples from U(low, high).
pub fn uniform<R: Rng + ?Sized>(shape: &[usize], low: f32, high: f32, rng: &mut R) -> Tensor {
    let numel: usize = shape.iter().product();
    let data: Vec<f32> = if low < high {
        (0..numel).map(|_| rng.gen_range(low..high)).collect()
    } else {
        vec![low; numel]
    };
    Tensor::new(&data, shape)
}

/// Fully connected default: U(-1/sqrt(fan_in), 1/sqrt(fan_in)).
pub fn linear_uniform<R: Rng + ?Sized>(shape: &[usize], fan_in: usize, rng: &mut R) -> Tensor {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    uniform(shape, -bound, bound, rng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_uniform_bounds() {
        let mut rng = seeded_rng(Some(42));
        let t = linear_uniform(&[64, 25], 25, &mut rng);
        for &val in t.data() {
            assert!((-0.2..=0.2).contains(&val), "Value {val} out of bounds");
        }
    }

    #[test]
    fn test_seeded_rng_reproducible() {
        let t1 = linear_uniform(&[10, 10], 10, &mut seeded_rng(Some(7)));
        let t2 = linear_uniform(&[10, 10], 10, &mut seeded_rng(Some(7)));
        assert_eq!(t1.data(), t2.data());
    }

    #[test]
    fn test_degenerate_range_is_constant() {
        let t = uniform(&[3], 1.5, 1.5, &mut seeded_rng(Some(0)));
        assert_eq!(t.data(), &[1.5, 1.5, 1.5]);
    }
}
