//! End-to-end aggregation scenarios over the in-process loopback cluster.
//!
//! Every rank runs as a tokio task with its own aggregator; assertions run
//! inside the rank tasks and failures propagate through the join handles.

use std::sync::Arc;

use gradax::{
    AggConfig, AggError, DataType, GradAggregator, GradHeader, GradTensor, HostAdapter,
    LoopbackCluster, LoopbackCollective, LoopbackMessaging, NullCollective, StorageFormat,
};

/// Read a tensor's current contents through its storage pointer.
fn read_f32(t: &GradTensor) -> Vec<f32> {
    unsafe { std::slice::from_raw_parts(t.ptr() as *const f32, t.element_count()) }.to_vec()
}

/// Write values through a tensor's storage pointer.
fn write_f32(t: &GradTensor, vals: &[f32]) {
    assert_eq!(vals.len(), t.element_count());
    unsafe {
        std::ptr::copy_nonoverlapping(vals.as_ptr(), t.ptr() as *mut f32, vals.len());
    }
}

fn host_aggregator(mpi: LoopbackMessaging, config: AggConfig) -> GradAggregator<LoopbackMessaging> {
    GradAggregator::with_host_backend(Arc::new(mpi), config)
}

// S1: two ranks, one gradient each, headers summed alongside.
#[tokio::test]
async fn test_two_rank_sum_with_header() {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for (r, mpi) in ranks.into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let mut agg = host_aggregator(mpi, AggConfig::default());
            let mut data = if r == 0 {
                vec![1.0f32, 2.0, 3.0]
            } else {
                vec![4.0f32, 5.0, 6.0]
            };
            let mut grads = vec![GradTensor::from_f32_slice(&mut data, 1, 3)];
            let mut header = GradHeader::new(0);
            header.num_samples = if r == 0 { 4 } else { 6 };

            let did = unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            assert!(did);
            assert_eq!(read_f32(&grads[0]), vec![5.0, 7.0, 9.0]);
            assert_eq!(header.num_samples, 10);
            // Shape preservation.
            assert_eq!((grads[0].rows(), grads[0].cols()), (1, 3));
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

// S2: a zero-sample rank contributes zeros, garbage input notwithstanding.
#[tokio::test]
async fn test_zero_sample_rank_is_zeroed() {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for (r, mpi) in ranks.into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let mut agg = host_aggregator(mpi, AggConfig::default());
            let mut data = if r == 0 {
                vec![9.0f32, -3.0, 42.0] // garbage; this rank saw no samples
            } else {
                vec![1.0f32, 1.0, 1.0]
            };
            let mut grads = vec![GradTensor::from_f32_slice(&mut data, 1, 3)];
            let mut header = GradHeader::new(0);
            header.num_samples = if r == 0 { 0 } else { 3 };

            let did = unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            assert!(did);
            assert_eq!(read_f32(&grads[0]), vec![1.0, 1.0, 1.0]);
            assert_eq!(header.num_samples, 3);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

// S3: four ranks, one-element gradients.
#[tokio::test]
async fn test_four_rank_sum() {
    let ranks = LoopbackCluster::spawn(4);
    let mut handles = Vec::new();
    for (r, mpi) in ranks.into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let mut agg = host_aggregator(mpi, AggConfig::default());
            let mut data = vec![(r + 1) as f32];
            let mut grads = vec![GradTensor::from_f32_slice(&mut data, 1, 1)];
            let mut header = GradHeader::new(0);
            header.num_samples = 1;

            unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            assert_eq!(read_f32(&grads[0]), vec![10.0]);
            assert_eq!(header.num_samples, 4);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

// S4 / property 6: async mode returns the previous iteration's aggregate.
#[tokio::test]
async fn test_async_one_iteration_delay() {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for (_r, mpi) in ranks.into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let mut agg = host_aggregator(mpi, AggConfig::new(true, gradax::HOST_DEVICE));
            let mut data = vec![1.0f32];
            let mut grads = vec![GradTensor::from_f32_slice(&mut data, 1, 1)];

            // Iteration 1: nothing aggregated yet.
            let mut header = GradHeader::new(0);
            header.num_samples = 4;
            let did = unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            assert!(!did);

            // Iteration 2: receives iteration 1's sum (1 + 1).
            write_f32(&grads[0], &[2.0]);
            let mut header = GradHeader::new(0);
            header.num_samples = 4;
            let did = unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            assert!(did);
            assert_eq!(read_f32(&grads[0]), vec![2.0]);
            assert_eq!(header.num_samples, 8);

            // Iteration 3: zero-sample input drains the pipeline and
            // receives iteration 2's sum (2 + 2) without relaunching.
            let mut header = GradHeader::new(0);
            let did = unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            assert!(did);
            assert_eq!(read_f32(&grads[0]), vec![4.0]);
            assert_eq!(header.num_samples, 8);
            assert!(!agg.has_pending());
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

fn packing_inputs(rank: usize) -> Vec<Vec<f32>> {
    let mut tensors = Vec::new();
    for t in 0..100 {
        tensors.push((0..4).map(|i| (t * 31 + i * 3 + rank * 7) as f32).collect());
    }
    for t in 0..3 {
        tensors.push(
            (0..9000)
                .map(|i| ((t * 13 + i) % 97) as f32 + rank as f32)
                .collect(),
        );
    }
    tensors
}

async fn run_packing_cluster(threshold: usize) -> Vec<Vec<f32>> {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for (r, mpi) in ranks.into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let mut config = AggConfig::default();
            config.pack_threshold_bytes = threshold;
            let mut agg = host_aggregator(mpi, config);
            let mut backing = packing_inputs(r);
            let mut grads: Vec<GradTensor> = backing
                .iter_mut()
                .map(|v| {
                    let len = v.len();
                    GradTensor::from_f32_slice(v, 1, len)
                })
                .collect();
            let mut header = GradHeader::new(0);
            header.num_samples = 8;
            unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            grads.iter().map(read_f32).collect::<Vec<_>>()
        }));
    }
    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }
    assert_eq!(results[0], results[1]);
    results.pop().unwrap()
}

// S5 / property 5: packing is numerically transparent.
#[tokio::test]
async fn test_packing_transparency() {
    let packed = run_packing_cluster(gradax::DEFAULT_PACK_THRESHOLD_BYTES).await;
    let unpacked = run_packing_cluster(0).await;
    assert_eq!(packed, unpacked);

    // Against a locally computed reference sum.
    let a = packing_inputs(0);
    let b = packing_inputs(1);
    for (t, result) in packed.iter().enumerate() {
        let expected: Vec<f32> = a[t].iter().zip(&b[t]).map(|(x, y)| x + y).collect();
        assert_eq!(result, &expected, "tensor {t}");
    }
}

// S6: DistributedCheck detects rank skew.
#[tokio::test]
async fn test_distributed_check() {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for (r, mpi) in ranks.into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let agg = host_aggregator(mpi, AggConfig::default());
            let skewed = agg.distributed_check(100 + r as u64, 2).await.unwrap();
            assert!(!skewed);
            let uniform = agg.distributed_check(100, 2).await.unwrap();
            assert!(uniform);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

// Property 4: single-rank world short-circuits.
#[tokio::test]
async fn test_single_rank_identity() {
    let ranks = LoopbackCluster::spawn(1);
    let mpi = ranks.into_iter().next().unwrap();
    let mut agg = host_aggregator(mpi, AggConfig::default());

    let mut data = vec![1.5f32, -2.5];
    let mut grads = vec![GradTensor::from_f32_slice(&mut data, 1, 2)];
    let mut header = GradHeader::new(1);
    header.num_samples = 5;
    header.criterion = 0.25;

    let did = unsafe { agg.aggregate(&mut grads, &mut header, false) }
        .await
        .unwrap();
    assert!(did);
    assert_eq!(read_f32(&grads[0]), vec![1.5, -2.5]);
    assert_eq!(header.num_samples, 5);
    assert_eq!(header.criterion, 0.25);

    header.num_samples = 0;
    header.criterion = 0.0;
    let did = unsafe { agg.aggregate(&mut grads, &mut header, false) }
        .await
        .unwrap();
    assert!(!did);
}

// Property 9: reset followed by a zero-sample call yields zeroed gradients.
#[tokio::test]
async fn test_idempotent_reset_async() {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for mpi in ranks {
        handles.push(tokio::spawn(async move {
            let mut agg = host_aggregator(mpi, AggConfig::new(true, gradax::HOST_DEVICE));
            let mut data = vec![7.0f32, 8.0];
            let mut grads = vec![GradTensor::from_f32_slice(&mut data, 1, 2)];

            let mut header = GradHeader::new(0);
            let did = unsafe { agg.aggregate(&mut grads, &mut header, true) }
                .await
                .unwrap();
            assert!(did); // forced by the reset

            let mut header = GradHeader::new(0);
            let did = unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            assert!(!did);
            assert_eq!(read_f32(&grads[0]), vec![0.0, 0.0]);
            assert!(!agg.has_pending());
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

fn equivalence_inputs(rank: usize) -> Vec<Vec<f32>> {
    let small = (0..4).map(|i| (rank + i) as f32).collect();
    let large = (0..9000).map(|i| ((i % 89) + rank) as f32).collect();
    vec![small, large]
}

async fn run_equivalence_cluster(
    ranks: Vec<LoopbackMessaging>,
    collectives: Option<Vec<LoopbackCollective>>,
    device: i32,
) -> Vec<Vec<f32>> {
    let world = ranks.len();
    let mut collectives: Vec<Option<LoopbackCollective>> = match collectives {
        Some(c) => c.into_iter().map(Some).collect(),
        None => (0..world).map(|_| None).collect(),
    };
    let mut handles = Vec::new();
    for (r, mpi) in ranks.into_iter().enumerate() {
        let collective = collectives[r].take();
        handles.push(tokio::spawn(async move {
            let adapter = Arc::new(HostAdapter::for_device(device));
            let mut agg = match collective {
                Some(c) => GradAggregator::new(
                    Arc::new(mpi),
                    adapter,
                    Arc::new(c),
                    AggConfig::new(false, device),
                ),
                None => GradAggregator::new(
                    Arc::new(mpi),
                    adapter,
                    Arc::new(NullCollective),
                    AggConfig::new(false, device),
                ),
            };
            let mut backing = equivalence_inputs(r);
            let mut grads: Vec<GradTensor> = backing
                .iter_mut()
                .map(|v| {
                    let len = v.len();
                    GradTensor::from_f32_slice(v, 1, len).with_device(device)
                })
                .collect();
            let mut header = GradHeader::new(0);
            header.num_samples = 16;
            unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            assert_eq!(header.num_samples, 32);
            grads.iter().map(read_f32).collect::<Vec<_>>()
        }));
    }
    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }
    assert_eq!(results[0], results[1]);
    results.pop().unwrap()
}

// Property 10: all four backends agree.
#[tokio::test]
async fn test_branch_equivalence() {
    // Branch C: host gradients over host messaging.
    let host = run_equivalence_cluster(LoopbackCluster::spawn(2), None, gradax::HOST_DEVICE).await;
    // Branch A: device gradients staged through pinned host buffers.
    let staged = run_equivalence_cluster(LoopbackCluster::spawn(2), None, 0).await;
    // Branch B: device gradients read directly by the transport (GDR).
    let gdr = run_equivalence_cluster(LoopbackCluster::spawn_with_gdr(2), None, 0).await;
    // Branch D: the device collective library.
    let collective = run_equivalence_cluster(
        LoopbackCluster::spawn(2),
        Some(LoopbackCollective::spawn(2)),
        0,
    )
    .await;

    let expected: Vec<Vec<f32>> = equivalence_inputs(0)
        .iter()
        .zip(&equivalence_inputs(1))
        .map(|(a, b)| a.iter().zip(b).map(|(x, y)| x + y).collect())
        .collect();

    assert_eq!(host, expected);
    assert_eq!(staged, expected);
    assert_eq!(gdr, expected);
    assert_eq!(collective, expected);
}

// Property 8: gathering a per-rank value then slicing by rank yields the
// original, on both the direct and the host-staged path.
#[tokio::test]
async fn test_all_gather_roundtrip() {
    for device in [gradax::HOST_DEVICE, 0] {
        let ranks = LoopbackCluster::spawn(2);
        let mut handles = Vec::new();
        for (r, mpi) in ranks.into_iter().enumerate() {
            handles.push(tokio::spawn(async move {
                let adapter = Arc::new(HostAdapter::for_device(device));
                let mut agg = GradAggregator::new(
                    Arc::new(mpi),
                    adapter,
                    Arc::new(NullCollective),
                    AggConfig::new(false, device),
                );
                agg.distributed_init(device, 16).unwrap();

                let mut src_data = vec![(r * 10 + 1) as f32, (r * 10 + 2) as f32];
                let mut dst_data = vec![0.0f32; 4];
                let src = GradTensor::from_f32_slice(&mut src_data, 1, 2).with_device(device);
                let dst = GradTensor::from_f32_slice(&mut dst_data, 1, 4).with_device(device);

                unsafe { agg.distributed_all_gather(&src, &dst, 2) }
                    .await
                    .unwrap();
                let gathered = read_f32(&dst);
                assert_eq!(gathered, vec![1.0, 2.0, 11.0, 12.0]);
                // Slicing by rank recovers this rank's contribution.
                assert_eq!(&gathered[r * 2..r * 2 + 2], read_f32(&src).as_slice());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_distributed_all_reduce_max() {
    for device in [gradax::HOST_DEVICE, 0] {
        let ranks = LoopbackCluster::spawn(2);
        let mut handles = Vec::new();
        for (r, mpi) in ranks.into_iter().enumerate() {
            handles.push(tokio::spawn(async move {
                let adapter = Arc::new(HostAdapter::for_device(device));
                let mut agg = GradAggregator::new(
                    Arc::new(mpi),
                    adapter,
                    Arc::new(NullCollective),
                    AggConfig::new(false, device),
                );
                agg.distributed_init(device, 16).unwrap();

                let mut data = vec![(r + 1) as f32, (10 - r) as f32];
                let buf = GradTensor::from_f32_slice(&mut data, 1, 2).with_device(device);
                unsafe { agg.distributed_all_reduce(&buf, gradax::ReduceOp::Max) }
                    .await
                    .unwrap();
                assert_eq!(read_f32(&buf), vec![2.0, 10.0]);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_staged_all_reduce_without_init_fails() {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for mpi in ranks {
        handles.push(tokio::spawn(async move {
            let adapter = Arc::new(HostAdapter::for_device(0));
            let mut agg = GradAggregator::new(
                Arc::new(mpi),
                adapter,
                Arc::new(NullCollective),
                AggConfig::new(false, 0),
            );
            let mut data = vec![1.0f32];
            let buf = GradTensor::from_f32_slice(&mut data, 1, 1).with_device(0);
            let err = unsafe { agg.distributed_all_reduce(&buf, gradax::ReduceOp::Sum) }
                .await
                .unwrap_err();
            assert!(matches!(err, AggError::StagingUnavailable));
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test]
async fn test_wait_all() {
    let ranks = LoopbackCluster::spawn(3);
    let mut handles = Vec::new();
    for mpi in ranks {
        handles.push(tokio::spawn(async move {
            let agg = host_aggregator(mpi, AggConfig::default());
            agg.wait_all().await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test]
async fn test_sparse_gradient_rejected() {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for mpi in ranks {
        handles.push(tokio::spawn(async move {
            let mut agg = host_aggregator(mpi, AggConfig::default());
            let mut data = vec![0.0f32; 4];
            let mut grads = vec![
                GradTensor::from_f32_slice(&mut data, 2, 2).with_format(StorageFormat::SparseCsc),
            ];
            let mut header = GradHeader::new(0);
            header.num_samples = 1;
            let err = unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap_err();
            assert!(matches!(err, AggError::SparseGradient { index: 0 }));
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test]
async fn test_reset_with_pending_is_fatal() {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for mpi in ranks {
        handles.push(tokio::spawn(async move {
            let mut agg = host_aggregator(mpi, AggConfig::new(true, gradax::HOST_DEVICE));
            let mut data = vec![1.0f32];
            let mut grads = vec![GradTensor::from_f32_slice(&mut data, 1, 1)];
            let mut header = GradHeader::new(0);
            header.num_samples = 2;
            unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            assert!(agg.has_pending());

            let mut header = GradHeader::new(0);
            let err = unsafe { agg.aggregate(&mut grads, &mut header, true) }
                .await
                .unwrap_err();
            assert!(matches!(err, AggError::ResetWithPending));

            // A normal call joins the pending work and drains cleanly.
            let mut header = GradHeader::new(0);
            unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            assert!(!agg.has_pending());
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test]
async fn test_shadow_shape_mismatch_is_fatal() {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for mpi in ranks {
        handles.push(tokio::spawn(async move {
            let mut agg = host_aggregator(mpi, AggConfig::new(true, gradax::HOST_DEVICE));
            let mut data = vec![1.0f32, 2.0];
            let mut grads = vec![GradTensor::from_f32_slice(&mut data, 1, 2)];
            let mut header = GradHeader::new(0);
            header.num_samples = 2;
            unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();

            // Same tensor count, different shape.
            let mut other = vec![1.0f32, 2.0, 3.0];
            let mut grads = vec![GradTensor::from_f32_slice(&mut other, 1, 3)];
            let mut header = GradHeader::new(0);
            header.num_samples = 2;
            let err = unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap_err();
            assert!(matches!(err, AggError::ShadowMismatch { index: 0 }));
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

// Aggregating twice reuses the one-shot plan; values accumulate per call.
#[tokio::test]
async fn test_repeated_sync_aggregation() {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for mpi in ranks {
        handles.push(tokio::spawn(async move {
            let mut agg = host_aggregator(mpi, AggConfig::default());
            let mut data = vec![1.0f32, 1.0];
            let mut grads = vec![GradTensor::from_f32_slice(&mut data, 1, 2)];
            for iter in 1..=3u64 {
                write_f32(&grads[0], &[iter as f32, 1.0]);
                let mut header = GradHeader::new(0);
                header.num_samples = 1;
                unsafe { agg.aggregate(&mut grads, &mut header, false) }
                    .await
                    .unwrap();
                assert_eq!(read_f32(&grads[0]), vec![2.0 * iter as f32, 2.0]);
                assert_eq!(header.num_samples, 2);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

// F64 gradients take the same paths.
#[tokio::test]
async fn test_f64_gradients() {
    let ranks = LoopbackCluster::spawn(2);
    let mut handles = Vec::new();
    for (r, mpi) in ranks.into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let mut agg = host_aggregator(mpi, AggConfig::default());
            let mut data = vec![0.5f64 + r as f64, 1.25];
            let mut grads = vec![GradTensor::from_f64_slice(&mut data, 2, 1)];
            assert_eq!(grads[0].dtype(), DataType::F64);
            let mut header = GradHeader::new(0);
            header.num_samples = 1;
            unsafe { agg.aggregate(&mut grads, &mut header, false) }
                .await
                .unwrap();
            let out =
                unsafe { std::slice::from_raw_parts(grads[0].ptr() as *const f64, 2) }.to_vec();
            assert_eq!(out, vec![2.0, 2.5]);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}
