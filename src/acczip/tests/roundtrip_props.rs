use std::sync::{Arc, OnceLock};

use acczip::{
    CompletionOrder, InstancePool, MIN_CHUNK_SIZE, MockAccelerator, MockConfig, PoolConfig,
    SessionConfig, decode_stream_on_cpu, open_session,
};
use proptest::prelude::*;

fn shared_pool() -> &'static Arc<InstancePool> {
    static POOL: OnceLock<Arc<InstancePool>> = OnceLock::new();
    POOL.get_or_init(|| {
        let mock = Arc::new(MockAccelerator::new(MockConfig {
            instances: 2,
            order: CompletionOrder::Shuffled { seed: 11 },
            latency_polls: 1,
            fail_every: Some(7),
            ..MockConfig::default()
        }));
        InstancePool::start(
            mock,
            PoolConfig {
                slots_per_instance: 3,
                ..PoolConfig::default()
            },
        )
        .expect("pool should start")
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_roundtrip_in_arbitrary_pieces(
        data in proptest::collection::vec(any::<u8>(), 0..40_000),
        repeat in 1usize..6,
        piece in 1usize..20_000,
    ) {
        let input = data
            .iter()
            .flat_map(|&byte| std::iter::repeat_n(byte, repeat))
            .take(60_000)
            .collect::<Vec<_>>();
        let config = SessionConfig {
            chunk_size: MIN_CHUNK_SIZE,
            min_hw_input: 0,
            hw_skip_after_miss: 0,
            async_queue_depth: 0,
            ..SessionConfig::default()
        };
        let mut session = open_session(Some(shared_pool()), config).expect("session");

        let mut stream = Vec::new();
        let mut dst = vec![0_u8; 2 * MIN_CHUNK_SIZE + piece];
        let mut offset = 0;
        loop {
            let end = (offset + piece).min(input.len());
            let is_last = end == input.len();
            let mut src_len = end - offset;
            let mut dst_len = dst.len();
            let result = session.compress(&input[offset..end], &mut src_len, &mut dst, &mut dst_len, is_last);
            stream.extend_from_slice(&dst[..dst_len]);
            offset += src_len;
            match result {
                Ok(()) if is_last && offset == input.len() => break,
                Ok(()) => {}
                Err(acczip::AcczipError::InsufficientBuffer) => prop_assert!(src_len + dst_len > 0),
                Err(error) => return Err(TestCaseError::fail(error.to_string())),
            }
        }

        let decoded = decode_stream_on_cpu(&stream).expect("stream decodes");
        prop_assert_eq!(&decoded, &input);

        let mut restored = Vec::new();
        session
            .decompress_stream(&mut stream.as_slice(), &mut restored)
            .expect("decompress_stream");
        prop_assert_eq!(restored, input);
    }
}
