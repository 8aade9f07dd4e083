//! Property tests for the recursion bound.
//!
//! Wrapping a payload in `n` gzip layers and scanning with a maximum depth of
//! `r` must never scan deeper than `r`, must flag the cut when `n > r`, and
//! must find the payload exactly when it is reachable.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use proptest::prelude::*;

use scan_dispatch::{CacheConfig, Engine, EngineConfig, PatternMatcher};

fn wrap(mut payload: Vec<u8>, layers: usize) -> Vec<u8> {
    for _ in 0..layers {
        let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
        enc.write_all(&payload).unwrap();
        payload = enc.finish().unwrap();
    }
    payload
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn depth_never_exceeds_max_recursion(layers in 1usize..7, max in 1u32..6) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = EngineConfig {
            temp_dir: Some(tmp.path().to_path_buf()),
            cache: CacheConfig { enabled: false, ..CacheConfig::default() },
            ..EngineConfig::default()
        };
        config.limits.max_recursion = max;
        let engine = Engine::builder()
            .config(config)
            .matcher(PatternMatcher::new().with_pattern("Deep.Marker", b"DEEP-MARKER"))
            .build()
            .unwrap();

        let bytes = wrap(b"payload with DEEP-MARKER inside".to_vec(), layers);
        let report = engine.scan_bytes(&bytes);

        prop_assert!(report.stats.max_depth <= max);
        if layers as u32 > max {
            prop_assert!(report.limits_exceeded);
        }
        prop_assert_eq!(report.outcome.is_virus(), layers as u32 <= max);
    }
}
