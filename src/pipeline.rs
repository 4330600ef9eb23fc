//! Capture and compress driver.
//!
//! A [Pipeline] moves every staged block through the transform accelerator and
//! queues one coefficient packet per block:
//!
//! ```text
//! Stager -> Session (transmit, wait, receive) -> assemble -> SharedQueue
//! ```
//!
//! Transfer faults skip the offending block and re-initialise the session. Hardware
//! faults, storage errors, queue exhaustion and cancellation abort the run.
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, span, warn, Level};
use typed_builder::TypedBuilder;

use crate::packet::{assemble, Header, Packet, MAX_PACKET_SIZE, TYPE_COEFFICIENTS};
use crate::queue::SharedQueue;
use crate::stager::{Block, Stager, BLOCK_SIZE, GROUP_SIZE};
use crate::storage::Storage;
use crate::telemetry::Telemetry;
use crate::transform::{Accelerator, Session, MAX_COEFFICIENTS};
use crate::{Error, Result};

/// Pipeline tunables.
#[derive(Debug, Clone, TypedBuilder)]
pub struct PipelineOpts {
    /// Number of blocks held in storage.
    pub total_blocks: usize,
    #[builder(default = BLOCK_SIZE)]
    pub block_size: usize,
    #[builder(default = GROUP_SIZE)]
    pub group_size: usize,
    /// Time to wait for one transform to complete.
    #[builder(default = Duration::from_millis(100))]
    pub transform_timeout: Duration,
    /// Wait this long for transmit vacancy instead of failing a word immediately.
    #[builder(default, setter(strip_option))]
    pub vacancy_timeout: Option<Duration>,
    /// Coefficients retained per block.
    #[builder(default = MAX_COEFFICIENTS)]
    pub coefficient_capacity: usize,
}

/// Outcome of a pipeline run.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    pub telemetry: Telemetry,
    /// Packets placed on the queue.
    pub queued: usize,
    /// Indexes of blocks skipped because of a transfer fault.
    pub skipped: Vec<usize>,
}

impl Report {
    /// Compression ratio telemetry packet for this run.
    ///
    /// # Errors
    /// See [Telemetry::ratio_packet].
    pub fn telemetry_packet(&self) -> Result<Packet> {
        self.telemetry.ratio_packet()
    }

    /// Ratio (type 2) and bandwidth (type 1) packets, in the order they are sent to a
    /// newly connected ground station.
    ///
    /// # Errors
    /// See [Telemetry::ratio_packet] and [Telemetry::bandwidth_packet].
    pub fn telemetry_packets(&self) -> Result<Vec<Packet>> {
        Ok(vec![
            self.telemetry.ratio_packet()?,
            self.telemetry.bandwidth_packet()?,
        ])
    }
}

/// Serialise coefficients big-endian, two bytes each.
#[must_use]
pub fn coefficients_payload(coefficients: &[i16]) -> Vec<u8> {
    coefficients.iter().flat_map(|c| c.to_be_bytes()).collect()
}

/// Drives staged blocks through a transform [Session].
///
/// # Example
/// ```
/// use downlink::pipeline::{Pipeline, PipelineOpts};
/// use downlink::queue::SharedQueue;
/// use downlink::stager::stage_image;
/// use downlink::storage::MemStorage;
/// use downlink::transform::SoftAccelerator;
///
/// let mut storage = MemStorage::new();
/// let total_blocks = stage_image(&mut storage, &[1u8; 64 * 7], 64, 7).unwrap();
///
/// let opts = PipelineOpts::builder().total_blocks(total_blocks).build();
/// let mut pipeline = Pipeline::new(storage, SoftAccelerator::default(), opts).unwrap();
/// let queue = SharedQueue::new(16);
/// let report = pipeline.run(&queue, None).unwrap();
///
/// assert_eq!(report.queued, 7);
/// assert_eq!(queue.len(), 7);
/// ```
pub struct Pipeline<S, A>
where
    S: Storage,
    A: Accelerator,
{
    stager: Stager<S>,
    session: Session<A>,
    opts: PipelineOpts,
    coefficients: Vec<i16>,
}

impl<S, A> Pipeline<S, A>
where
    S: Storage,
    A: Accelerator,
{
    /// Create a pipeline and initialise the accelerator.
    ///
    /// # Errors
    /// * [Error::SizeViolation] if `coefficient_capacity` coefficients would not fit in
    ///   one packet.
    /// * [Error::HardwareFault] if the accelerator fails to initialise.
    pub fn new(storage: S, accelerator: A, opts: PipelineOpts) -> Result<Self> {
        let len = Header::LEN + 2 * opts.coefficient_capacity;
        if len > MAX_PACKET_SIZE {
            return Err(Error::SizeViolation {
                len,
                max: MAX_PACKET_SIZE,
            });
        }
        let stager = Stager::new(storage, opts.total_blocks)
            .with_block_size(opts.block_size)
            .with_group_size(opts.group_size);
        let mut session = Session::new(accelerator);
        if let Some(timeout) = opts.vacancy_timeout {
            session = session.with_vacancy_timeout(timeout);
        }
        session.init()?;
        debug!(
            blocks = opts.total_blocks,
            groups = stager.num_groups(),
            "pipeline initialised"
        );

        Ok(Pipeline {
            stager,
            session,
            coefficients: vec![0; opts.coefficient_capacity],
            opts,
        })
    }

    pub fn session(&self) -> &Session<A> {
        &self.session
    }

    /// Compress every staged block and push one coefficient packet per block onto
    /// `queue`. Blocks are checked against `cancel` before each transfer and while
    /// waiting on the accelerator.
    ///
    /// # Errors
    /// * [Error::Cancelled] if cancellation is signalled.
    /// * [Error::QueueFull] if the queue cannot take a packet.
    /// * [Error::HardwareFault] if re-initialising after a transfer fault fails.
    /// * Any storage error.
    pub fn run(&mut self, queue: &SharedQueue, cancel: Option<&Receiver<()>>) -> Result<Report> {
        let mut report = Report::default();
        let start = Instant::now();

        while let Some(block) = self.stager.next() {
            let block = block?;
            if let Some(cancel) = cancel {
                if cancel.try_recv().is_ok() {
                    info!(block = block.index, "capture cancelled");
                    return Err(Error::Cancelled);
                }
            }

            let span = span!(Level::TRACE, "block", index = block.index, address = block.address);
            let _guard = span.enter();

            let started = Instant::now();
            let zult = self.compress(&block, cancel);
            report.telemetry.add_busy(started.elapsed());
            let num = match zult {
                Ok(num) => num,
                Err(err) if err.is_transfer_fault() => {
                    warn!(block = block.index, "skipping block: {err}");
                    report.telemetry.skip();
                    report.skipped.push(block.index);
                    self.session.init()?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let payload = coefficients_payload(&self.coefficients[..num]);
            let packet = assemble(&payload, TYPE_COEFFICIENTS)?;
            if let Err(err) = queue.push(packet) {
                error!(block = block.index, "capture aborted: {err}");
                return Err(err);
            }
            report.telemetry.add(block.data.len(), payload.len());
            report.queued += 1;
        }

        info!(
            queued = report.queued,
            skipped = report.skipped.len(),
            ratio = ?report.telemetry.ratio(),
            elapsed = ?start.elapsed(),
            "capture complete"
        );
        Ok(report)
    }

    fn compress(&mut self, block: &Block, cancel: Option<&Receiver<()>>) -> Result<usize> {
        self.session.transmit(&block.data)?;
        self.session.wait_done(self.opts.transform_timeout, cancel)?;
        self.session.receive(&mut self.coefficients)
    }
}

impl<S, A> Pipeline<S, A>
where
    S: Storage + Send + 'static,
    A: Accelerator + Send + 'static,
{
    /// Run the pipeline on a named background thread.
    ///
    /// # Errors
    /// [Error::Io] if the thread cannot be spawned.
    pub fn spawn(
        mut self,
        queue: SharedQueue,
        cancel: Option<Receiver<()>>,
    ) -> Result<JoinHandle<Result<Report>>> {
        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || self.run(&queue, cancel.as_ref()))?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::channel::bounded;

    use super::*;
    use crate::packet::{TYPE_BANDWIDTH, TYPE_RATIO};
    use crate::stager::stage_image;
    use crate::storage::MemStorage;
    use crate::transform::SoftAccelerator;

    fn storage(num_blocks: usize) -> MemStorage {
        let mut storage = MemStorage::new();
        let image: Vec<u8> = (0..num_blocks * BLOCK_SIZE).map(|i| i as u8).collect();
        stage_image(&mut storage, &image, BLOCK_SIZE, GROUP_SIZE).unwrap();
        storage
    }

    fn opts(total_blocks: usize) -> PipelineOpts {
        PipelineOpts::builder().total_blocks(total_blocks).build()
    }

    #[test]
    fn test_coefficients_payload_is_big_endian() {
        assert_eq!(coefficients_payload(&[0x0102, -2]), vec![0x01, 0x02, 0xff, 0xfe]);
    }

    #[test]
    fn test_run_queues_packet_per_block() {
        let mut pipeline = Pipeline::new(storage(9), SoftAccelerator::default(), opts(9)).unwrap();
        let queue = SharedQueue::new(16);
        let report = pipeline.run(&queue, None).unwrap();

        assert_eq!(report.queued, 9);
        assert!(report.skipped.is_empty());
        assert_eq!(report.telemetry.input_bytes, 9 * 64);
        // 32 coefficients of 2 bytes
        assert_eq!(report.telemetry.output_bytes, 9 * 64);

        let first = queue.pop().unwrap();
        assert_eq!(first.packet_type(), TYPE_COEFFICIENTS);
        assert_eq!(first.payload().len(), 64);
        // samples 0,1 pack to 0x0100, serialised big-endian
        assert_eq!(&first.payload()[..2], &[0x01, 0x00]);
    }

    #[test]
    fn test_queue_full_aborts() {
        let mut pipeline = Pipeline::new(storage(7), SoftAccelerator::default(), opts(7)).unwrap();
        let queue = SharedQueue::new(3);
        let zult = pipeline.run(&queue, None);
        assert!(matches!(zult, Err(Error::QueueFull { capacity: 3 })), "got {zult:?}");
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_hardware_fault_aborts_init() {
        let accel = SoftAccelerator::default().with_stuck_status(0x4);
        let zult = Pipeline::new(storage(7), accel, opts(7));
        assert!(matches!(zult, Err(Error::HardwareFault { status: 0x4 })));
    }

    #[test]
    fn test_coefficient_capacity_must_fit_packet() {
        let opts = PipelineOpts::builder()
            .total_blocks(7)
            .coefficient_capacity(66)
            .build();
        let zult = Pipeline::new(storage(7), SoftAccelerator::default(), opts);
        assert!(
            matches!(zult, Err(Error::SizeViolation { len: 136, max: 134 })),
            "got {:?}",
            zult.err()
        );

        let opts = PipelineOpts::builder()
            .total_blocks(7)
            .coefficient_capacity(65)
            .build();
        assert!(Pipeline::new(storage(7), SoftAccelerator::default(), opts).is_ok());
    }

    #[test]
    fn test_telemetry_packets() {
        let mut pipeline = Pipeline::new(storage(7), SoftAccelerator::default(), opts(7)).unwrap();
        let queue = SharedQueue::new(16);
        let report = pipeline.run(&queue, None).unwrap();

        let packets = report.telemetry_packets().unwrap();
        let types: Vec<u8> = packets.iter().map(Packet::packet_type).collect();
        assert_eq!(types, vec![TYPE_RATIO, TYPE_BANDWIDTH]);
        assert_eq!(packets[0], report.telemetry_packet().unwrap());
    }

    #[test]
    fn test_overflow_skips_block() {
        let opts = PipelineOpts::builder()
            .total_blocks(7)
            .coefficient_capacity(16)
            .build();
        let mut pipeline = Pipeline::new(storage(7), SoftAccelerator::default(), opts).unwrap();
        let queue = SharedQueue::new(16);
        let report = pipeline.run(&queue, None).unwrap();

        assert_eq!(report.queued, 0);
        assert_eq!(report.skipped, (0..7).collect::<Vec<_>>());
        assert_eq!(report.telemetry.skipped, 7);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancelled_before_first_block() {
        let mut pipeline = Pipeline::new(storage(7), SoftAccelerator::default(), opts(7)).unwrap();
        let queue = SharedQueue::new(16);
        let (tx, rx) = bounded(1);
        tx.send(()).unwrap();
        let zult = pipeline.run(&queue, Some(&rx));
        assert!(matches!(zult, Err(Error::Cancelled)), "got {zult:?}");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_storage_error_aborts() {
        // storage holds one group but the pipeline expects two
        let mut pipeline = Pipeline::new(storage(7), SoftAccelerator::default(), opts(14)).unwrap();
        let queue = SharedQueue::new(16);
        let zult = pipeline.run(&queue, None);
        assert!(matches!(zult, Err(Error::NotEnoughData { .. })), "got {zult:?}");
        assert_eq!(queue.len(), 7);
    }

    #[test]
    fn test_spawn() {
        let pipeline = Pipeline::new(storage(7), SoftAccelerator::default(), opts(7)).unwrap();
        let queue = SharedQueue::new(16);
        let handle = pipeline.spawn(queue.clone(), None).unwrap();
        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.queued, 7);
        assert_eq!(queue.len(), 7);
    }
}
