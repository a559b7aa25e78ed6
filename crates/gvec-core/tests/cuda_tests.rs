//! GPU integration tests for the CUDA device.
//! Run with: cargo test -p gvec-core --features cuda -- --nocapture

#![cfg(feature = "cuda")]

use gvec_core::{BatchedGemm, Gemm, ProbDist, Session, SessionConfig};

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "element {} differs: {} vs {} (tol={})",
            i, x, y, tol
        );
    }
}

fn gpu() -> Session {
    Session::cuda(0, SessionConfig::default().with_seed(7)).expect("CUDA device 0")
}

// ============================================================================
// Transfer and lazy storage
// ============================================================================

#[test]
fn test_cuda_roundtrip() {
    let s = gpu();
    assert_eq!(s.device_name(), "cuda:0");
    let data = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
    let v = s.make_vector_data(&data).unwrap();
    assert_eq!(v.data().unwrap(), data);
    assert_eq!(v.slice(2, 5).unwrap().data().unwrap(), &data[2..5]);
}

#[test]
fn test_cuda_zero_vector_reads_zero() {
    let s = gpu();
    let v = s.make_vector(1000);
    assert_eq!(v.data().unwrap(), vec![0.0; 1000]);
    assert!(!v.is_materialized().unwrap());
}

// ============================================================================
// Elementwise and BLAS
// ============================================================================

#[test]
fn test_cuda_scale_add_sum() {
    let s = gpu();
    let v = s.make_vector_data(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    v.scale(2.0);
    v.add_scalar(1.0);
    assert_eq!(v.data().unwrap(), vec![3.0, 5.0, 7.0, 9.0]);
    assert_eq!(v.sum().unwrap(), 24.0);
}

#[test]
fn test_cuda_large_elementwise() {
    // spans many blocks at the default block width
    let s = gpu();
    let n = 100_003;
    let data: Vec<f32> = (0..n).map(|i| (i % 17) as f32 * 0.1).collect();
    let v = s.make_vector_data(&data).unwrap();
    v.exp();
    let want: Vec<f32> = data.iter().map(|x| x.exp()).collect();
    assert_close(&v.data().unwrap(), &want, 1e-4);
}

#[test]
fn test_cuda_mul_div_dot() {
    let s = gpu();
    let a = s.make_vector_data(&[1.0, 2.0, 3.0]).unwrap();
    let b = s.make_vector_data(&[4.0, 5.0, 6.0]).unwrap();
    assert_eq!(a.dot(&b).unwrap(), 32.0);
    a.mul(&b).unwrap();
    assert_eq!(a.data().unwrap(), vec![4.0, 10.0, 18.0]);
    a.div(&b).unwrap();
    assert_close(&a.data().unwrap(), &[1.0, 2.0, 3.0], 1e-6);
}

#[test]
fn test_cuda_repeated_variants() {
    let s = gpu();
    for pattern in [vec![1.0, 2.0, 3.0, 4.0], vec![1.0, 2.0, 3.0]] {
        let v = s.make_vector(12);
        let p = s.make_vector_data(&pattern).unwrap();
        v.add_repeated(&p).unwrap();
        let want: Vec<f32> = (0..12).map(|i| pattern[i % pattern.len()]).collect();
        assert_eq!(v.data().unwrap(), want);
    }
}

#[test]
fn test_cuda_normal_odd_length() {
    let s = gpu();
    let v = s.make_vector(1001);
    v.rand(ProbDist::Normal).wait().unwrap();
    let data = v.data().unwrap();
    let mean: f32 = data.iter().sum::<f32>() / data.len() as f32;
    assert!(mean.abs() < 0.2, "mean {mean}");
}

// ============================================================================
// Reductions and products
// ============================================================================

#[test]
fn test_cuda_add_logs_wide_rows() {
    let s = gpu();
    let cols = 1000;
    let data: Vec<f32> = (0..2 * cols).map(|i| ((i * 7) % 11) as f32 * 0.3).collect();
    let v = s.make_vector_data(&data).unwrap();
    let got = v.add_logs(cols).unwrap().data().unwrap();
    let want: Vec<f32> = data
        .chunks(cols)
        .map(|row| {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            max + row.iter().map(|x| (x - max).exp()).sum::<f32>().ln()
        })
        .collect();
    assert_close(&got, &want, 1e-3);
}

#[test]
fn test_cuda_map_max() {
    let s = gpu();
    let v = s.make_vector_data(&[1.0, 9.0, 2.0, 8.0, 3.0, 3.0]).unwrap();
    assert_eq!(v.map_max(3).unwrap().table().unwrap(), vec![1, 3]);
}

#[test]
fn test_cuda_map_max_skips_nan() {
    let s = gpu();
    let v = s
        .make_vector_data(&[f32::NAN, 2.0, 5.0, 5.0, f32::NAN, f32::NAN, f32::NAN, f32::NAN, f32::NAN])
        .unwrap();
    assert_eq!(v.map_max(3).unwrap().table().unwrap(), vec![2, 3, 6]);
}

#[test]
fn test_cuda_gemm_and_batched() {
    let s = gpu();
    let a = s.make_vector_data(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();
    let b = s.make_vector_data(&[1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0]).unwrap();
    let c = s.make_vector(8);
    c.batched_gemm(&BatchedGemm::new(2, Gemm::new(2, 2, 2)), &a, &b)
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(c.data().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 10.0, 12.0, 14.0, 16.0]);
}
