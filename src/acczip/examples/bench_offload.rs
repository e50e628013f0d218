use std::sync::Arc;
use std::time::{Duration, Instant};

use acczip::{
    CompletionOrder, InstancePool, MockAccelerator, MockConfig, PoolConfig, Session,
    SessionConfig, SessionStats, open_session,
};

#[derive(Debug, Clone, Default)]
struct BenchAgg {
    compress_total: Duration,
    decompress_total: Duration,
    compressed_total: usize,
    input_total: usize,
}

impl BenchAgg {
    fn ratio(&self) -> f64 {
        if self.input_total == 0 {
            return 0.0;
        }
        self.compressed_total as f64 / self.input_total as f64
    }

    fn compress_mib_s(&self) -> f64 {
        if self.compress_total.is_zero() {
            return 0.0;
        }
        (self.input_total as f64 / (1024.0 * 1024.0)) / self.compress_total.as_secs_f64()
    }

    fn decompress_mib_s(&self) -> f64 {
        if self.decompress_total.is_zero() {
            return 0.0;
        }
        (self.input_total as f64 / (1024.0 * 1024.0)) / self.decompress_total.as_secs_f64()
    }
}

fn build_mixed_dataset(bytes: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes);
    let mut state: u32 = 0x1234_5678;

    while out.len() < bytes {
        let zone = (out.len() / 4096) % 3;
        match zone {
            0 => out.extend_from_slice(b"acczip-offload-engine-"),
            1 => out.extend_from_slice(b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
            _ => {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                out.push((state >> 24) as u8);
            }
        }
    }

    out.truncate(bytes);
    out
}

fn run_case(session: &mut Session, input: &[u8], iters: usize) -> (BenchAgg, SessionStats) {
    let mut agg = BenchAgg::default();
    let mut compressed = vec![0_u8; input.len() + input.len() / 4 + 64 * 1024];
    let mut restored = vec![0_u8; input.len()];

    for _ in 0..iters {
        let start_c = Instant::now();
        let mut src_len = input.len();
        let mut dst_len = compressed.len();
        session
            .compress(input, &mut src_len, &mut compressed, &mut dst_len, true)
            .expect("compress should succeed");
        let elapsed_c = start_c.elapsed();

        let start_d = Instant::now();
        let stream_len = dst_len;
        let mut src_len = stream_len;
        let mut dst_len = restored.len();
        session
            .decompress(&compressed[..stream_len], &mut src_len, &mut restored, &mut dst_len)
            .expect("decompress should succeed");
        let elapsed_d = start_d.elapsed();

        assert_eq!(&restored[..dst_len], input);
        agg.compress_total += elapsed_c;
        agg.decompress_total += elapsed_d;
        agg.compressed_total += stream_len;
        agg.input_total += input.len();
    }

    (agg, session.stats())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("acczip=info")),
        )
        .init();

    let sizes = [4 * 1024 * 1024, 16 * 1024 * 1024];
    let iters = 5;
    let mock = Arc::new(MockAccelerator::new(MockConfig {
        instances: 4,
        order: CompletionOrder::Shuffled { seed: 5 },
        latency_polls: 1,
        ..MockConfig::default()
    }));
    let pool = InstancePool::start(mock.clone(), PoolConfig::default()).expect("pool should start");

    println!("acczip offload benchmark (release)");
    println!("iters={}", iters);
    println!("sizes={:?}", sizes);

    for size in sizes {
        let input = build_mixed_dataset(size);
        let mib = size as f64 / (1024.0 * 1024.0);

        let software_only = SessionConfig {
            hw_enabled: false,
            async_queue_depth: 0,
            ..SessionConfig::from_env().expect("environment config should be valid")
        };
        let offload = SessionConfig {
            async_queue_depth: 0,
            ..SessionConfig::from_env().expect("environment config should be valid")
        };

        for (label, config) in [("software", software_only), ("offload", offload)] {
            let mut session = open_session(Some(&pool), config).expect("session should open");
            let (agg, stats) = run_case(&mut session, &input, iters);
            println!(
                "size={:.0}MiB mode={} ratio={:.3} comp={:.1}MiB/s decomp={:.1}MiB/s hw_chunks={} sw_chunks={} retries={}",
                mib,
                label,
                agg.ratio(),
                agg.compress_mib_s(),
                agg.decompress_mib_s(),
                stats.hardware_chunks,
                stats.software_chunks,
                stats.software_retries,
            );
        }
    }

    println!(
        "mock submits={} completions={} slot_reuse_violations={}",
        mock.submit_count(),
        mock.completion_count(),
        mock.slot_reuse_violations()
    );
}
