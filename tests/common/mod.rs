#![allow(dead_code)]
use std::sync::Once;

use downlink::stager::{stage_image, BLOCK_SIZE, GROUP_SIZE};
use downlink::storage::MemStorage;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Sample image of `num_blocks` blocks where every sample of block `i` is `i`.
pub fn image(num_blocks: usize) -> Vec<u8> {
    (0..num_blocks * BLOCK_SIZE)
        .map(|i| (i / BLOCK_SIZE) as u8)
        .collect()
}

pub fn staged(num_blocks: usize) -> MemStorage {
    let mut storage = MemStorage::new();
    let written = stage_image(&mut storage, &image(num_blocks), BLOCK_SIZE, GROUP_SIZE).unwrap();
    assert_eq!(written, num_blocks);
    storage
}
