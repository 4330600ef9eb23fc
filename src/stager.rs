//! Block staging.
//!
//! Raw samples live in storage as groups of [GROUP_SIZE] blocks of [BLOCK_SIZE]
//! samples, one group per sequential address. The final group holds
//! `total_blocks % group_size` blocks when the block count is not a multiple of the
//! group size and only those blocks are read.
use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::storage::Storage;
use crate::Result;

/// Samples (bytes) per block.
pub const BLOCK_SIZE: usize = 64;
/// Blocks per storage group.
pub const GROUP_SIZE: usize = 7;

/// A block of raw samples staged for one transform cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Storage address of the group this block was read from.
    pub address: u32,
    /// Sequential block number, starting at 0.
    pub index: usize,
    pub data: Vec<u8>,
}

/// Iterates over the blocks held in storage, reading one group at a time.
///
/// # Example
/// ```
/// use downlink::storage::MemStorage;
/// use downlink::stager::{stage_image, Stager};
///
/// let mut storage = MemStorage::new();
/// let num_blocks = stage_image(&mut storage, &[7u8; 64 * 9], 64, 7).unwrap();
/// assert_eq!(num_blocks, 9);
///
/// let blocks: Vec<_> = Stager::new(storage, num_blocks).filter_map(Result::ok).collect();
/// assert_eq!(blocks.len(), 9);
/// assert_eq!(blocks[8].address, 1);
/// ```
pub struct Stager<S>
where
    S: Storage,
{
    storage: S,
    block_size: usize,
    group_size: usize,
    total_blocks: usize,
    // Number of blocks read from storage so far
    staged: usize,
    next_address: u32,
    ready: VecDeque<Block>,
    failed: bool,
}

impl<S> Stager<S>
where
    S: Storage,
{
    /// Stage `total_blocks` blocks using the default block and group sizes.
    pub fn new(storage: S, total_blocks: usize) -> Self {
        Stager {
            storage,
            block_size: BLOCK_SIZE,
            group_size: GROUP_SIZE,
            total_blocks,
            staged: 0,
            next_address: 0,
            ready: VecDeque::new(),
            failed: false,
        }
    }

    /// # Panics
    /// If `block_size` is 0.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        self.block_size = block_size;
        self
    }

    /// # Panics
    /// If `group_size` is 0.
    #[must_use]
    pub fn with_group_size(mut self, group_size: usize) -> Self {
        assert!(group_size > 0, "group size must be non-zero");
        self.group_size = group_size;
        self
    }

    #[must_use]
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Number of storage groups, including a trailing residual group.
    #[must_use]
    pub fn num_groups(&self) -> usize {
        self.total_blocks.div_ceil(self.group_size)
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    /// Read the next group from storage into the ready cache. Returns the number of
    /// blocks read, 0 when all blocks have been staged.
    fn read_group(&mut self) -> Result<usize> {
        let remaining = self.total_blocks - self.staged;
        if remaining == 0 {
            return Ok(0);
        }
        let count = remaining.min(self.group_size);
        if count < self.group_size {
            debug!(
                address = self.next_address,
                residual = count,
                "reading residual group"
            );
        }

        let address = self.next_address;
        let dat = self.storage.read(address, count * self.block_size)?;
        for (i, chunk) in dat.chunks_exact(self.block_size).enumerate() {
            self.ready.push_back(Block {
                address,
                index: self.staged + i,
                data: chunk.to_vec(),
            });
        }
        trace!(address, count, "staged group");

        self.staged += count;
        self.next_address += 1;
        Ok(count)
    }
}

impl<S> Iterator for Stager<S>
where
    S: Storage,
{
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(block) = self.ready.pop_front() {
            return Some(Ok(block));
        }
        if self.failed {
            return None;
        }
        match self.read_group() {
            Ok(0) => None,
            Ok(_) => self.ready.pop_front().map(Ok),
            Err(err) => {
                // storage errors are not retried
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Write a raw sample image to storage as sequential groups of `group_size` blocks
/// starting at address 0, zero-padding a trailing partial block.
///
/// Returns the number of blocks written.
///
/// # Errors
/// Any error writing to storage.
///
/// # Panics
/// If `block_size` or `group_size` is 0.
pub fn stage_image<S>(
    storage: &mut S,
    image: &[u8],
    block_size: usize,
    group_size: usize,
) -> Result<usize>
where
    S: Storage + ?Sized,
{
    assert!(block_size > 0 && group_size > 0, "block geometry must be non-zero");
    let num_blocks = image.len().div_ceil(block_size);
    let group_bytes = block_size * group_size;

    for (address, group) in image.chunks(group_bytes).enumerate() {
        let blocks_in_group = group.len().div_ceil(block_size);
        let mut buf = group.to_vec();
        buf.resize(blocks_in_group * block_size, 0);
        storage.write(address as u32, &buf)?;
    }
    debug!(bytes = image.len(), blocks = num_blocks, "staged image");

    Ok(num_blocks)
}
