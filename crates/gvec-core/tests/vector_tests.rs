//! Integration tests for gvec-core on the emulated device.
//! Run with: cargo test -p gvec-core -- --nocapture

use gvec_core::{
    BatchedGemm, DeviceError, EmulatedDevice, Gemm, ProbDist, Session, SessionConfig, VecError,
};
use proptest::prelude::*;

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

fn tracked() -> (Session, std::sync::Arc<gvec_core::DeviceStats>) {
    let dev = EmulatedDevice::new();
    let stats = dev.stats();
    (Session::new(dev).unwrap(), stats)
}

// ============================================================================
// Lazy storage
// ============================================================================

#[test]
fn test_fresh_vectors_allocate_nothing() {
    let (s, stats) = tracked();
    for n in [0, 1, 7, 1000] {
        let v = s.make_vector(n);
        assert_eq!(v.len(), n);
        assert_eq!(v.data().unwrap(), vec![0.0; n]);
        v.scale(3.0);
        assert_eq!(v.dot(&s.make_vector(n)).unwrap(), 0.0);
        assert_eq!(v.norm().unwrap(), 0.0);
    }
    s.synchronize().unwrap();
    assert_eq!(stats.allocations(), 0);
}

#[test]
fn test_dropped_vectors_release_memory() {
    let (s, stats) = tracked();
    {
        let v = s.make_vector_data(&[1.0; 16]).unwrap();
        let _view = v.slice(4, 8).unwrap();
        let _copy = v.copy().unwrap();
    }
    s.synchronize().unwrap();
    assert_eq!(stats.live_elements(), 0);
    assert_eq!(stats.allocations(), stats.frees());
}

#[test]
fn test_view_keeps_storage_alive() {
    let s = Session::emulated().unwrap();
    let view = {
        let v = s.make_vector_data(&[1.0, 2.0, 3.0]).unwrap();
        v.slice(1, 3).unwrap()
    };
    assert_eq!(view.data().unwrap(), vec![2.0, 3.0]);
}

#[test]
fn test_vector_outliving_session_handle() {
    let v = {
        let s = Session::emulated().unwrap();
        s.make_vector_data(&[4.0, 5.0]).unwrap()
    };
    v.add_scalar(1.0);
    assert_eq!(v.data().unwrap(), vec![5.0, 6.0]);
}

// ============================================================================
// Slicing and aliasing
// ============================================================================

#[test]
fn test_slices_concatenate_to_parent() {
    let s = Session::emulated().unwrap();
    let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
    let v = s.make_vector_data(&data).unwrap();
    for k in 0..=10 {
        let (left, right) = (v.slice(0, k).unwrap(), v.slice(k, 10).unwrap());
        assert_eq!(left.len() + right.len(), 10);
        assert!(!left.overlaps(&right));
        let joined = s.concat(&[&left, &right]).unwrap();
        assert_eq!(joined.data().unwrap(), data);
    }
}

#[test]
fn test_slice_overlap_relation() {
    let s = Session::emulated().unwrap();
    let v = s.make_vector(8);
    for i in 0..8 {
        for j in i + 1..=8 {
            assert!(v.overlaps(&v.slice(i, j).unwrap()));
        }
    }
    let a = v.slice(1, 5).unwrap();
    assert!(a.overlaps(&v.slice(4, 6).unwrap()));
    assert!(!a.overlaps(&v.slice(5, 6).unwrap()));
    assert!(!a.overlaps(&s.make_vector(8)));
}

#[test]
fn test_write_aliasing_is_rejected_before_enqueue() {
    let (s, stats) = tracked();
    let v = s.make_vector(6);
    let a = v.slice(0, 3).unwrap();
    let b = v.slice(2, 5).unwrap();
    for err in [
        a.add(&b).unwrap_err(),
        a.mul(&b).unwrap_err(),
        a.div(&b).unwrap_err(),
        a.set(&b).unwrap_err(),
        a.elem_max(&b).unwrap_err(),
    ] {
        assert!(err.is_fatal(), "{err}");
    }
    assert_eq!(a.dot(&b).unwrap(), 0.0);
    assert_eq!(stats.allocations(), 0);
}

#[test]
fn test_cross_session_operands_are_rejected() {
    let s1 = Session::emulated().unwrap();
    let s2 = Session::emulated().unwrap();
    let a = s1.make_vector(2);
    let b = s2.make_vector(2);
    assert!(matches!(a.add(&b), Err(VecError::Contract(_))));
}

// ============================================================================
// Arithmetic scenarios
// ============================================================================

#[test]
fn test_scale_add_scalar_sum() {
    let s = Session::emulated().unwrap();
    let v = s.make_vector_data(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    v.scale(2.0);
    assert_eq!(v.data().unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
    v.add_scalar(1.0);
    assert_eq!(v.data().unwrap(), vec![3.0, 5.0, 7.0, 9.0]);
    assert_eq!(v.sum().unwrap(), 24.0);
}

#[test]
fn test_zero_divided_stays_zero() {
    let (s, stats) = tracked();
    let zero = s.make_vector(4);
    let d = s.make_vector_data(&[1.0, -2.0, 0.5, 8.0]).unwrap();
    zero.div(&d).unwrap().wait().unwrap();
    assert_eq!(zero.data().unwrap(), vec![0.0; 4]);
    assert!(!zero.is_materialized().unwrap());
    assert_eq!(stats.allocations(), 1);
}

#[test]
fn test_add_repeated_non_power_of_two() {
    let s = Session::emulated().unwrap();
    let v = s.make_vector_data(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();
    let p = s.make_vector_data(&[10.0, 20.0, 30.0, 40.0]).unwrap();
    v.add_repeated(&p).unwrap();
    assert_eq!(
        v.data().unwrap(),
        vec![11.0, 22.0, 33.0, 44.0, 15.0, 26.0, 37.0, 48.0]
    );
    let odd = s.make_vector_data(&[1.0; 6]).unwrap();
    odd.add_repeated(&s.make_vector_data(&[1.0, 2.0, 3.0]).unwrap()).unwrap();
    assert_eq!(odd.data().unwrap(), vec![2.0, 3.0, 4.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_accumulation_chain_from_zero() {
    let (s, stats) = tracked();
    let acc = s.make_vector(3);
    let x = s.make_vector_data(&[1.0, 2.0, 3.0]).unwrap();
    acc.add(&x).unwrap();
    acc.add(&x).unwrap();
    acc.sub(&s.make_vector(3)).unwrap();
    assert_eq!(acc.data().unwrap(), vec![2.0, 4.0, 6.0]);
    // x and the accumulator; the zero operand never allocates
    assert_eq!(stats.allocations(), 2);
}

#[test]
fn test_abs_max_reads_magnitude() {
    let s = Session::emulated().unwrap();
    let v = s.make_vector_data(&[0.5, -9.0, 3.0, 9.0]).unwrap();
    assert_eq!(v.abs_max().unwrap(), 9.0);
    assert_eq!(s.make_vector(0).abs_max().unwrap(), 0.0);
}

#[test]
fn test_async_mutations_are_ordered() {
    let s = Session::emulated().unwrap();
    let v = s.make_vector(1000);
    let pending: Vec<_> = (0..20).map(|_| v.add_scalar(0.5)).collect();
    let last = v.scale(2.0);
    last.wait().unwrap();
    for c in pending {
        c.wait().unwrap();
    }
    assert_close(&v.data().unwrap(), &vec![20.0; 1000], 1e-4);
}

#[test]
fn test_concurrent_host_threads() {
    let s = Session::emulated().unwrap();
    let v = s.make_vector_data(&[0.0; 64]).unwrap();
    let v = std::sync::Arc::new(v);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let v = std::sync::Arc::clone(&v);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    v.add_scalar(1.0);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(v.data().unwrap(), vec![200.0; 64]);
}

#[tokio::test]
async fn test_completions_from_async_code() {
    let s = Session::emulated().unwrap();
    let v = s.make_vector(4);
    v.set_data(&[1.0, 2.0, 3.0, 4.0]).unwrap().await.unwrap();
    v.log_softmax(2).unwrap().await.unwrap();
    s.seed(3).await.unwrap();
}

#[tokio::test]
async fn test_host_reads_from_async_code() {
    let s = Session::emulated().unwrap();
    let v = s.make_vector_data(&[3.0, 4.0]).unwrap();
    assert_eq!(v.data().unwrap(), vec![3.0, 4.0]);
    assert_eq!(v.norm().unwrap(), 5.0);
    assert_eq!(v.dot(&v.copy().unwrap()).unwrap(), 25.0);
    assert!(v.is_materialized().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_reads_from_multi_thread_runtime() {
    let s = Session::emulated().unwrap();
    let v = s.make_vector_data(&[1.0, 2.0, 3.0]).unwrap();
    let task = tokio::spawn(async move { v.sum() });
    assert_eq!(task.await.unwrap().unwrap(), 6.0);
}

// ============================================================================
// Reductions, mapping and products
// ============================================================================

#[test]
fn test_add_logs_chunk_rules() {
    let s = Session::emulated().unwrap();
    let v = s.make_vector_data(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]).unwrap();
    assert!(v.add_logs(4).unwrap_err().is_fatal());
    assert_close(
        &v.add_logs(0).unwrap().data().unwrap(),
        &v.add_logs(6).unwrap().data().unwrap(),
        1e-6,
    );
    assert_eq!(v.add_logs(2).unwrap().len(), 3);
}

#[test]
fn test_wide_rows_reduce_in_passes() {
    let cfg = SessionConfig {
        reduce_width: 8,
        block_width: 16,
        seed: Some(5),
    };
    let s = Session::with_config(EmulatedDevice::new(), cfg).unwrap();
    let v = s.make_vector(3 * 100);
    v.rand(ProbDist::Normal);
    let data = v.data().unwrap();
    let got = v.add_logs(100).unwrap().data().unwrap();
    let want: Vec<f32> = data
        .chunks(100)
        .map(|row| {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            max + row.iter().map(|x| (x - max).exp()).sum::<f32>().ln()
        })
        .collect();
    assert_close(&got, &want, 1e-4);
}

#[test]
fn test_scatter_add_sums_duplicates() {
    let s = Session::emulated().unwrap();
    let m = s.make_mapper(2, &[1, 1, 0, 1]).unwrap();
    let input = s.make_vector_data(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    let out = s.make_vector(2);
    m.map_transpose(&input, &out).unwrap();
    assert_eq!(out.data().unwrap(), vec![3.0, 7.0]);
}

#[test]
fn test_map_max_then_gather() {
    let s = Session::emulated().unwrap();
    let v = s.make_vector_data(&[3.0, 1.0, -1.0, -5.0, 2.0, 2.0]).unwrap();
    let m = v.map_max(2).unwrap();
    assert_eq!(m.table().unwrap(), vec![0, 2, 4]);
    let out = s.make_vector(3);
    m.map(&v, &out).unwrap();
    assert_eq!(out.data().unwrap(), vec![3.0, -1.0, 2.0]);
}

#[test]
fn test_batched_gemm_divisibility() {
    let s = Session::emulated().unwrap();
    let g = Gemm::new(1, 1, 1);
    let (a, b, c) = (s.make_vector(3), s.make_vector(3), s.make_vector(3));
    assert!(c.batched_gemm(&BatchedGemm::new(3, g), &a, &b).is_ok());
    let c4 = s.make_vector(4);
    assert!(c4.batched_gemm(&BatchedGemm::new(3, g), &a, &b).unwrap_err().is_fatal());
}

#[test]
fn test_batched_gemm_is_one_queue_step() {
    let (s, stats) = tracked();
    let a = s.make_vector_data(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    let b = s.make_vector_data(&[1.0, 1.0, 1.0, 1.0]).unwrap();
    let c = s.make_vector(4);
    let done = c
        .batched_gemm(&BatchedGemm::new(4, Gemm::new(1, 1, 1)), &a, &b)
        .unwrap();
    let seen = c.data().unwrap();
    done.wait().unwrap();
    assert_eq!(seen, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(stats.streams_forked(), 4);
}

// ============================================================================
// Device failures
// ============================================================================

#[test]
fn test_out_of_memory_reaches_the_caller() {
    let s = Session::new(EmulatedDevice::with_capacity(64)).unwrap();
    let v = s.make_vector(100);
    let err = v.add_scalar(1.0).wait().unwrap_err();
    assert!(matches!(err, VecError::Device(DeviceError::OutOfMemory { .. })));
    assert!(!err.is_fatal());
    // the session keeps working for requests that fit
    let small = s.make_vector_data(&[1.0, 2.0]).unwrap();
    assert_eq!(small.sum().unwrap(), 3.0);
}

#[test]
fn test_seeded_config_from_json() {
    let cfg: SessionConfig = serde_json::from_str(r#"{"seed": 42}"#).unwrap();
    let a = Session::with_config(EmulatedDevice::new(), cfg.clone()).unwrap();
    let b = Session::with_config(EmulatedDevice::new(), cfg).unwrap();
    let (x, y) = (a.make_vector(9), b.make_vector(9));
    x.rand(ProbDist::Uniform);
    y.rand(ProbDist::Uniform);
    assert_eq!(x.data().unwrap(), y.data().unwrap());
}

// ============================================================================
// Properties
// ============================================================================

fn small_vec() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-10.0f32..10.0, 0..48)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_dot_is_symmetric_and_linear(pair in (1usize..48).prop_flat_map(|n| {
        (prop::collection::vec(-10.0f32..10.0, n), prop::collection::vec(-10.0f32..10.0, n))
    }), c in -4.0f32..4.0) {
        let s = Session::emulated().unwrap();
        let u = s.make_vector_data(&pair.0).unwrap();
        let v = s.make_vector_data(&pair.1).unwrap();
        let l1: f32 = pair.0.iter().zip(&pair.1).map(|(x, y)| (x * y).abs()).sum();
        let tol = 1e-4 * (1.0 + l1) * (1.0 + c.abs());
        let uv = u.dot(&v).unwrap();
        prop_assert!((uv - v.dot(&u).unwrap()).abs() <= tol);
        u.scale(c);
        let scaled = u.dot(&v).unwrap();
        prop_assert!((scaled - c * uv).abs() <= tol);
    }

    #[test]
    fn prop_slice_lengths_and_contents(data in small_vec(), a in 0usize..48, b in 0usize..48) {
        let n = data.len();
        let (lo, hi) = (a.min(b).min(n), a.max(b).min(n));
        let s = Session::emulated().unwrap();
        let v = s.make_vector_data(&data).unwrap();
        let sl = v.slice(lo, hi).unwrap();
        prop_assert_eq!(sl.len(), hi - lo);
        prop_assert_eq!(sl.data().unwrap(), data[lo..hi].to_vec());
    }

    #[test]
    fn prop_add_logs_zero_chunk_equals_full(data in prop::collection::vec(-5.0f32..5.0, 1..40)) {
        let s = Session::emulated().unwrap();
        let v = s.make_vector_data(&data).unwrap();
        let whole = v.add_logs(0).unwrap().data().unwrap();
        let full = v.add_logs(data.len()).unwrap().data().unwrap();
        prop_assert_eq!(whole, full);
    }

    #[test]
    fn prop_fast_add_matches_general(
        data in prop::collection::vec(prop_oneof![Just(0.0f32), Just(-0.0f32), -10.0f32..10.0], 0..48),
        subtract in any::<bool>(),
    ) {
        let s = Session::emulated().unwrap();
        let x = s.make_vector_data(&data).unwrap();
        let lazy = s.make_vector(data.len());
        let eager = s.make_vector_data(&vec![0.0; data.len()]).unwrap();
        for acc in [&lazy, &eager] {
            if subtract { acc.sub(&x).unwrap() } else { acc.add(&x).unwrap() };
        }
        let bits = |v: &gvec_core::Vector| -> Vec<u32> {
            v.data().unwrap().iter().map(|f| f.to_bits()).collect()
        };
        prop_assert_eq!(bits(&lazy), bits(&eager));
    }
}
