//! Multi-stream ordering and atomics under randomized workloads.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stragg_device::{DeviceBuffer, DeviceContext, DevicePtr, Kernel, LaunchConfig, ThreadIdx};

/// Adds `inputs[i]` into `counters[inputs[i] % buckets]`.
struct Histogram {
    inputs: DevicePtr,
    counters: DevicePtr,
    n: usize,
    buckets: u64,
    _keep: [Arc<DeviceBuffer>; 2],
}

impl Kernel for Histogram {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn run(&self, idx: ThreadIdx) {
        let i = idx.global();
        if i >= self.n {
            return;
        }
        unsafe {
            let v = self.inputs.byte_add(8 * i).read_u64();
            let bucket = (v % self.buckets) as usize;
            self.counters
                .byte_add(8 * bucket)
                .atomic_u64()
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[test]
fn test_streams_share_counters() {
    const BUCKETS: usize = 64;
    const PER_STREAM: usize = 10_000;

    let ctx = DeviceContext::new(0).unwrap();
    let counters = Arc::new(ctx.alloc_zeros(8 * BUCKETS).unwrap());
    let streams: Vec<_> = (0..4).map(|_| ctx.new_stream().unwrap()).collect();
    let mut rng = StdRng::seed_from_u64(3);
    let mut expected = [0u64; BUCKETS];

    for stream in &streams {
        let values: Vec<u64> = (0..PER_STREAM).map(|_| rng.random()).collect();
        for v in &values {
            expected[(v % BUCKETS as u64) as usize] += 1;
        }
        let mut pinned = ctx.alloc_pinned(8 * PER_STREAM).unwrap();
        pinned.as_u64_mut_slice().copy_from_slice(&values);
        let pinned = Arc::new(pinned);
        let inputs = Arc::new(ctx.alloc_zeros(8 * PER_STREAM).unwrap());

        stream.memcpy_htod(&pinned, 0..8 * PER_STREAM, &inputs, 0).unwrap();
        let kernel = Histogram {
            inputs: inputs.device_ptr(),
            counters: counters.device_ptr(),
            n: PER_STREAM,
            buckets: BUCKETS as u64,
            _keep: [Arc::clone(&inputs), Arc::clone(&counters)],
        };
        stream
            .launch(LaunchConfig::for_num_elems(PER_STREAM as u32, 128), Arc::new(kernel))
            .unwrap();
    }
    for stream in &streams {
        stream.synchronize().unwrap();
    }

    let mut out = vec![0u8; 8 * BUCKETS];
    streams[0].memcpy_dtoh(&counters, 0, &mut out).unwrap();
    let got: Vec<u64> = out
        .chunks_exact(8)
        .map(|c| u64::from_ne_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(got, expected);
    assert_eq!(got.iter().sum::<u64>(), 4 * PER_STREAM as u64);
}

#[test]
fn test_events_fire_in_stream_order() {
    let ctx = DeviceContext::new(0).unwrap();
    let stream = ctx.new_stream().unwrap();
    let buf = Arc::new(ctx.alloc_zeros(1 << 20).unwrap());
    let events: Vec<_> = (0..16)
        .map(|_| {
            stream.memset_zeros(&buf, 0..buf.len()).unwrap();
            stream.record_event().unwrap()
        })
        .collect();
    events[15].synchronize();
    assert!(events.iter().all(|e| e.query()));
}
