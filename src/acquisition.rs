//! Cyclic acquisition loop and write-back decoder.
//!
//! One scan cycle runs these steps in order:
//!
//! 1. Read every registered block from the controller and store the bytes
//!    (setting the block dirty when they changed).
//! 2. Re-decode every variable and publish the values that changed.
//! 3. Pack every dirty block into one broadcast frame.
//! 4. Broadcast the frame.
//! 5. Sleep for whatever is left of the minimum cycle time.
//!
//! When the driver reports no connection the cycle instead marks every block
//! dirty, so the first successful read afterwards is broadcast in full, and
//! tries to reconnect, waiting the reconnect delay after a failure. A driver
//! error during the reads also marks every block dirty.
//!
//! [`Acquisition`] is also the [`ServerHandler`] of the gateway's server: a
//! new client marks all blocks dirty, received bytes are decoded as write-back
//! commands, and the loop thread follows the server's start and stop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::block::MemoryBlock;
use crate::driver::{self, SharedDriver};
use crate::error::{GatewayError, Result};
use crate::frame::{BroadcastFrame, CommandReader, WriteCommand, MAX_CHUNK_PAYLOAD};
use crate::server::{Broadcaster, ClientInfo, ServerHandler};
use crate::stop::StopSignal;
use crate::utils::format_bytes;
use crate::variable::{BlockLayout, TypedVar, ValueChange};

/// Default minimum duration of one scan cycle.
pub const DEFAULT_MIN_CYCLE: Duration = Duration::from_millis(50);

/// Default wait after a failed connection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Timing of the acquisition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionConfig {
    /// Minimum duration of one connected cycle.
    pub min_cycle: Duration,
    /// Wait after a failed connection attempt.
    pub reconnect_delay: Duration,
}

impl AcquisitionConfig {
    /// Creates a configuration with default timings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum cycle duration.
    pub fn with_min_cycle(mut self, min_cycle: Duration) -> Self {
        self.min_cycle = min_cycle;
        self
    }

    /// Sets the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            min_cycle: DEFAULT_MIN_CYCLE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// What a single call to [`Acquisition::run_cycle`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Blocks were read; `broadcast_len` is the frame size, 0 if nothing was dirty.
    Connected {
        /// Size of the broadcast frame in bytes.
        broadcast_len: usize,
    },
    /// The driver was disconnected and the reconnection succeeded.
    Reconnected,
    /// The driver was disconnected and the reconnection failed.
    ConnectFailed,
}

struct Shared {
    config: AcquisitionConfig,
    driver: SharedDriver,
    blocks: Vec<BlockLayout>,
    changes: Mutex<Option<Sender<ValueChange>>>,
    broadcaster: Mutex<Option<Broadcaster>>,
    connected: AtomicBool,
    cycles: AtomicU64,
}

struct Worker {
    stop: StopSignal,
    handle: JoinHandle<()>,
}

/// Scan loop over a fixed set of blocks.
pub struct Acquisition {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Acquisition {
    /// Creates a stopped acquisition over `blocks`.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if `blocks` is empty, two layouts
    /// share a block number, or a block is empty or too long for one
    /// broadcast chunk.
    pub fn new(
        config: AcquisitionConfig,
        driver: SharedDriver,
        blocks: Vec<BlockLayout>,
    ) -> Result<Self> {
        if blocks.is_empty() {
            return Err(GatewayError::config("no blocks registered"));
        }
        for (i, layout) in blocks.iter().enumerate() {
            let num = layout.block().num();
            let len = layout.block().len();
            if len == 0 || len > MAX_CHUNK_PAYLOAD {
                return Err(GatewayError::config(format!(
                    "block {} length must be 1-{}, got {}",
                    num, MAX_CHUNK_PAYLOAD, len
                )));
            }
            if blocks[..i].iter().any(|other| other.block().num() == num) {
                return Err(GatewayError::config(format!(
                    "block {} registered twice",
                    num
                )));
            }
        }

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                driver,
                blocks,
                changes: Mutex::new(None),
                broadcaster: Mutex::new(None),
                connected: AtomicBool::new(false),
                cycles: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Publishes every value change on `sender` from now on.
    pub fn set_change_sender(&self, sender: Sender<ValueChange>) {
        *lock(&self.shared.changes) = Some(sender);
    }

    /// Returns the timing configuration.
    pub fn config(&self) -> &AcquisitionConfig {
        &self.shared.config
    }

    /// Returns the registered blocks in registration order.
    pub fn blocks(&self) -> impl Iterator<Item = &Arc<MemoryBlock>> {
        self.shared.blocks.iter().map(|layout| layout.block())
    }

    /// Returns every registered variable, block by block.
    pub fn variables(&self) -> impl Iterator<Item = &Arc<TypedVar>> {
        self.shared
            .blocks
            .iter()
            .flat_map(|layout| layout.variables().iter())
    }

    /// Returns whether the last cycle saw an open controller connection.
    pub fn is_plc_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Returns the number of completed connected cycles.
    pub fn cycle_count(&self) -> u64 {
        self.shared.cycles.load(Ordering::SeqCst)
    }

    /// Runs one scan cycle without sleeping.
    ///
    /// # Errors
    ///
    /// Returns the first driver or decoding error of a connected cycle.
    /// Connection failures are reported as [`CycleOutcome::ConnectFailed`].
    pub fn run_cycle(&self) -> Result<CycleOutcome> {
        self.shared.run_cycle()
    }

    /// Reads every block and re-decodes every variable.
    pub fn poll_blocks(&self) -> Result<()> {
        self.shared.poll_blocks()
    }

    /// Packs every dirty block into a broadcast frame and clears the flags.
    ///
    /// Returns `None` when no block is dirty. If a block cannot be packed the
    /// frame is dropped and every flag taken for it is set again.
    pub fn assemble_broadcast(&self) -> Result<Option<Vec<u8>>> {
        self.shared.assemble_broadcast()
    }

    /// Decodes a received write-back buffer and applies its commands.
    ///
    /// The buffer may hold several frames back to back. Returns the number of
    /// commands the driver accepted; a command the driver rejects is logged
    /// and skipped.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Protocol` at the first malformed frame or
    /// command. Every command before it has been applied; the rest of the
    /// buffer is discarded.
    pub fn apply_write_back(&self, buf: &[u8]) -> Result<usize> {
        self.shared.apply_write_back(buf)
    }

    /// Marks every block dirty so the next cycle sends a full snapshot.
    pub fn mark_all_dirty(&self) {
        self.shared.mark_all_dirty();
    }

    /// Starts the loop thread, broadcasting through `broadcaster` if given.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidParameter` if the loop is already
    /// running, or `GatewayError::Io` if the thread cannot be spawned.
    pub fn start(&self, broadcaster: Option<Broadcaster>) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(GatewayError::invalid_parameter(
                "acquisition",
                "already started",
            ));
        }
        *lock(&self.shared.broadcaster) = broadcaster;

        let stop = StopSignal::new();
        let shared = Arc::clone(&self.shared);
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || shared.run(thread_stop))?;
        *worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Stops the loop thread and waits for it.
    pub fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        worker.stop.stop();
        if worker.handle.join().is_err() {
            error!("Acquisition thread panicked");
        }
        *lock(&self.shared.broadcaster) = None;
    }

    /// Returns whether the loop thread is running.
    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("config", &self.shared.config)
            .field("blocks", &self.shared.blocks.len())
            .field("connected", &self.is_plc_connected())
            .field("cycles", &self.cycle_count())
            .finish()
    }
}

impl ServerHandler for Acquisition {
    fn on_start(&self, broadcaster: &Broadcaster) {
        if let Err(e) = self.start(Some(broadcaster.clone())) {
            error!("Failed to start acquisition: {}", e);
        }
    }

    fn on_stop(&self) {
        self.stop();
    }

    fn on_client_connected(&self, client: &ClientInfo) {
        debug!("Client {} connected, scheduling full snapshot", client.addr);
        for block in self.blocks() {
            block.on_client_connect();
        }
    }

    fn on_received(&self, client: &ClientInfo, data: &[u8]) {
        match self.apply_write_back(data) {
            Ok(applied) => debug!("Applied {} write(s) from {}", applied, client.addr),
            Err(e) => warn!("Write-back from {} rejected: {}", client.addr, e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn run(&self, stop: StopSignal) {
        info!(
            "Acquisition started: {} block(s), cycle {:?}",
            self.blocks.len(),
            self.config.min_cycle
        );
        while !stop.is_stopped() {
            let started = Instant::now();
            let pause = match self.run_cycle() {
                Ok(CycleOutcome::Connected { .. }) => {
                    self.config.min_cycle.saturating_sub(started.elapsed())
                }
                Ok(CycleOutcome::Reconnected) => Duration::ZERO,
                Ok(CycleOutcome::ConnectFailed) => self.config.reconnect_delay,
                Err(e) if e.is_connectivity() => {
                    warn!("PLC read failed: {}", e);
                    self.config.min_cycle
                }
                Err(e) => {
                    error!("Acquisition cycle failed: {}", e);
                    self.config.min_cycle
                }
            };
            if !pause.is_zero() && !stop.sleep(pause) {
                break;
            }
        }
        info!("Acquisition stopped after {} cycle(s)", self.cycles.load(Ordering::SeqCst));
    }

    fn run_cycle(&self) -> Result<CycleOutcome> {
        let connected = driver::lock(&self.driver).is_connected();
        if !connected {
            if self.connected.swap(false, Ordering::SeqCst) {
                warn!("PLC connection lost");
            }
            self.mark_all_dirty();

            let opened = driver::lock(&self.driver).open();
            return match opened {
                Ok(()) => {
                    info!("PLC connected");
                    self.connected.store(true, Ordering::SeqCst);
                    Ok(CycleOutcome::Reconnected)
                }
                Err(e) => {
                    warn!(
                        "PLC connection failed: {}, retrying in {:?}",
                        e, self.config.reconnect_delay
                    );
                    Ok(CycleOutcome::ConnectFailed)
                }
            };
        }
        self.connected.store(true, Ordering::SeqCst);

        if let Err(e) = self.poll_blocks() {
            if e.is_connectivity() {
                // clients may have missed part of this read
                self.mark_all_dirty();
            }
            return Err(e);
        }
        let broadcast_len = match self.assemble_broadcast()? {
            Some(frame) => {
                if let Some(broadcaster) = lock(&self.broadcaster).as_ref() {
                    broadcaster.broadcast(&frame);
                }
                frame.len()
            }
            None => 0,
        };
        self.cycles.fetch_add(1, Ordering::SeqCst);
        Ok(CycleOutcome::Connected { broadcast_len })
    }

    fn poll_blocks(&self) -> Result<()> {
        for layout in &self.blocks {
            let block = layout.block();
            let bytes = driver::lock(&self.driver).read_bytes(block.num(), 0, block.len())?;
            block.update_bytes(bytes);
        }

        let sender = lock(&self.changes).clone();
        for var in self.blocks.iter().flat_map(|l| l.variables()) {
            if let Some(change) = var.parse()? {
                debug!(
                    "{} (block {}) changed: {} -> {}",
                    change.name, change.block, change.old, change.new
                );
                if let Some(sender) = &sender {
                    // a dropped receiver only means nobody listens
                    let _ = sender.send(change);
                }
            }
        }
        Ok(())
    }

    fn assemble_broadcast(&self) -> Result<Option<Vec<u8>>> {
        let mut frame = BroadcastFrame::new();
        let mut taken: Vec<&Arc<MemoryBlock>> = Vec::new();
        for layout in &self.blocks {
            let block = layout.block();
            if let Some(bytes) = block.take_if_dirty() {
                if let Err(e) = frame.push_chunk(block.num(), &bytes) {
                    // the frame is dropped, so nothing taken so far went out
                    block.set_dirty();
                    for earlier in taken {
                        earlier.set_dirty();
                    }
                    return Err(e);
                }
                taken.push(block);
            }
        }
        Ok(frame.finish())
    }

    fn mark_all_dirty(&self) {
        for layout in &self.blocks {
            layout.block().set_dirty();
        }
    }

    fn apply_write_back(&self, buf: &[u8]) -> Result<usize> {
        let mut applied = 0;
        let mut rest = buf;
        while !rest.is_empty() {
            let reader = CommandReader::new(rest)?;
            let frame_len = reader.frame_len();
            for command in reader {
                if self.apply_command(&command?) {
                    applied += 1;
                }
            }
            rest = &rest[frame_len..];
        }
        Ok(applied)
    }

    fn apply_command(&self, command: &WriteCommand) -> bool {
        let mut driver = driver::lock(&self.driver);
        let result = match command.bit_value() {
            Some(bit) => driver.write_bit(
                command.block(),
                command.byte_offset(),
                command.bit_index(),
                bit,
            ),
            None => driver.write_bytes(command.block(), command.byte_offset(), command.value()),
        };
        match result {
            Ok(()) => {
                debug!(
                    "Write-back block {} bit {} width {}: {}",
                    command.block(),
                    command.bit_offset(),
                    command.bit_width(),
                    format_bytes(command.value())
                );
                true
            }
            Err(e) => {
                warn!(
                    "Write-back to block {} bit {} failed: {}",
                    command.block(),
                    command.bit_offset(),
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, DriverWrite, SimulatedDriver};
    use crate::frame::{decode_broadcast, encode_commands};
    use crate::value::{Value, ValueKind};
    use crate::variable::WriteRoute;
    use std::sync::mpsc;

    struct Fixture {
        sim: Arc<Mutex<SimulatedDriver>>,
        acquisition: Acquisition,
    }

    /// Block 1 (2 bytes: flag, level) and block 2 (4 bytes: total).
    fn fixture(connected: bool) -> Fixture {
        let mut sim = SimulatedDriver::new().with_block(1, 2).with_block(2, 4);
        if connected {
            sim.open().unwrap();
        }
        let sim = Arc::new(Mutex::new(sim));
        let driver: SharedDriver = sim.clone();

        let route = WriteRoute::Direct(Arc::clone(&driver));
        let mut first = BlockLayout::new(Arc::new(MemoryBlock::new(1, 2)), route.clone());
        first.add("flag", ValueKind::Bool).unwrap();
        let mut second = BlockLayout::new(Arc::new(MemoryBlock::new(2, 4)), route);
        second.add("total", ValueKind::Int32).unwrap();

        let config = AcquisitionConfig::new()
            .with_min_cycle(Duration::from_millis(5))
            .with_reconnect_delay(Duration::from_millis(5));
        let acquisition = Acquisition::new(config, driver, vec![first, second]).unwrap();
        Fixture { sim, acquisition }
    }

    fn clear_dirty(acquisition: &Acquisition) {
        for block in acquisition.blocks() {
            block.reset_dirty();
        }
    }

    #[test]
    fn test_rejects_empty_and_duplicate_blocks() {
        let driver = driver::shared(SimulatedDriver::new());
        assert!(matches!(
            Acquisition::new(AcquisitionConfig::new(), Arc::clone(&driver), vec![]),
            Err(GatewayError::Config { .. })
        ));

        let queue = WriteRoute::Queue(Default::default());
        let a = BlockLayout::new(Arc::new(MemoryBlock::new(4, 1)), queue.clone());
        let b = BlockLayout::new(Arc::new(MemoryBlock::new(4, 1)), queue);
        assert!(Acquisition::new(AcquisitionConfig::new(), driver, vec![a, b]).is_err());
    }

    #[test]
    fn test_rejects_unframeable_block_lengths() {
        let queue = WriteRoute::Queue(Default::default());
        for len in [0, MAX_CHUNK_PAYLOAD + 1] {
            let layout = BlockLayout::new(Arc::new(MemoryBlock::new(3, len)), queue.clone());
            let result = Acquisition::new(
                AcquisitionConfig::new(),
                driver::shared(SimulatedDriver::new()),
                vec![layout],
            );
            assert!(matches!(result, Err(GatewayError::Config { .. })));
        }
    }

    #[test]
    fn test_failed_assembly_keeps_dirty_flags() {
        let queue = WriteRoute::Queue(Default::default());
        let small = BlockLayout::new(Arc::new(MemoryBlock::new(1, 2)), queue.clone());
        let huge = BlockLayout::new(
            Arc::new(MemoryBlock::new(2, MAX_CHUNK_PAYLOAD + 1)),
            queue,
        );
        let shared = Shared {
            config: AcquisitionConfig::new(),
            driver: driver::shared(SimulatedDriver::new()),
            blocks: vec![small, huge],
            changes: Mutex::new(None),
            broadcaster: Mutex::new(None),
            connected: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        };

        assert!(shared.assemble_broadcast().is_err());
        assert!(shared.blocks.iter().all(|l| l.block().is_dirty()));
    }

    #[test]
    fn test_read_failure_marks_all_dirty() {
        let mut sim = SimulatedDriver::new().with_block(1, 2);
        sim.open().unwrap();
        let driver = driver::shared(sim);
        let queue = WriteRoute::Queue(Default::default());
        let first = BlockLayout::new(Arc::new(MemoryBlock::new(1, 2)), queue.clone());
        let missing = BlockLayout::new(Arc::new(MemoryBlock::new(9, 2)), queue);
        let acquisition =
            Acquisition::new(AcquisitionConfig::new(), driver, vec![first, missing]).unwrap();
        clear_dirty(&acquisition);

        let err = acquisition.run_cycle().unwrap_err();
        assert!(err.is_connectivity());
        assert!(acquisition.blocks().all(|b| b.is_dirty()));
        assert_eq!(acquisition.cycle_count(), 0);
    }

    #[test]
    fn test_disconnected_cycle_marks_all_dirty() {
        let fx = fixture(false);
        fx.sim.lock().unwrap().fail_next_opens(1);
        clear_dirty(&fx.acquisition);

        assert_eq!(fx.acquisition.run_cycle().unwrap(), CycleOutcome::ConnectFailed);
        assert!(fx.acquisition.blocks().all(|b| b.is_dirty()));
        assert!(!fx.acquisition.is_plc_connected());

        assert_eq!(fx.acquisition.run_cycle().unwrap(), CycleOutcome::Reconnected);
        assert!(fx.acquisition.is_plc_connected());

        // first read after reconnecting carries every block
        let outcome = fx.acquisition.run_cycle().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Connected {
                broadcast_len: 4 + (4 + 2) + (4 + 4)
            }
        );
        assert_eq!(fx.acquisition.cycle_count(), 1);
        assert_eq!(fx.sim.lock().unwrap().open_attempts(), 2);
    }

    #[test]
    fn test_connection_loss_detected() {
        let fx = fixture(true);
        fx.acquisition.run_cycle().unwrap();
        assert!(fx.acquisition.is_plc_connected());

        fx.sim.lock().unwrap().set_connected(false);
        clear_dirty(&fx.acquisition);
        assert_eq!(fx.acquisition.run_cycle().unwrap(), CycleOutcome::Reconnected);
        assert!(fx.acquisition.blocks().all(|b| b.is_dirty()));
    }

    #[test]
    fn test_only_dirty_blocks_broadcast() {
        let fx = fixture(true);
        fx.acquisition.poll_blocks().unwrap();
        let first = fx.acquisition.assemble_broadcast().unwrap().unwrap();
        assert_eq!(decode_broadcast(&first).unwrap().len(), 2);

        fx.acquisition.poll_blocks().unwrap();
        assert!(fx.acquisition.assemble_broadcast().unwrap().is_none());

        fx.sim.lock().unwrap().set_block(2, vec![0, 0, 1, 0]);
        fx.acquisition.poll_blocks().unwrap();
        let frame = fx.acquisition.assemble_broadcast().unwrap().unwrap();
        let chunks = decode_broadcast(&frame).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].block, 2);
        assert_eq!(chunks[0].payload, vec![0, 0, 1, 0]);
    }

    #[test]
    fn test_client_connect_resends_everything() {
        let fx = fixture(true);
        fx.acquisition.poll_blocks().unwrap();
        fx.acquisition.assemble_broadcast().unwrap();

        let client = ClientInfo {
            id: 1,
            addr: "127.0.0.1:5000".parse().unwrap(),
        };
        fx.acquisition.on_client_connected(&client);
        let frame = fx.acquisition.assemble_broadcast().unwrap().unwrap();
        assert_eq!(decode_broadcast(&frame).unwrap().len(), 2);
    }

    #[test]
    fn test_value_changes_published() {
        let fx = fixture(true);
        let (tx, rx) = mpsc::channel();
        fx.acquisition.set_change_sender(tx);

        fx.sim.lock().unwrap().set_block(1, vec![0x01, 0x00]);
        fx.sim.lock().unwrap().set_block(2, vec![0x00, 0x01, 0x00, 0x00]);
        fx.acquisition.poll_blocks().unwrap();

        let changes: Vec<_> = rx.try_iter().collect();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].name, "flag");
        assert_eq!(changes[0].new, Value::Bool(true));
        assert_eq!(changes[1].name, "total");
        assert_eq!(changes[1].old, Value::Int32(0));
        assert_eq!(changes[1].new, Value::Int32(65536));

        fx.acquisition.poll_blocks().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_write_back_bit_command() {
        let mut sim = SimulatedDriver::new().with_block(5, 4);
        sim.open().unwrap();
        let sim = Arc::new(Mutex::new(sim));
        let driver: SharedDriver = sim.clone();
        let layout = BlockLayout::new(
            Arc::new(MemoryBlock::new(5, 4)),
            WriteRoute::Direct(Arc::clone(&driver)),
        );
        let acquisition = Acquisition::new(AcquisitionConfig::new(), driver, vec![layout]).unwrap();

        // block 5, bit offset 10, width 1, value 0x04
        let buf = hex::decode(concat!("0c000000", "0500", "0a000000", "01", "04")).unwrap();
        assert_eq!(acquisition.apply_write_back(&buf).unwrap(), 1);
        assert_eq!(
            sim.lock().unwrap().writes(),
            &[DriverWrite::Bit {
                block: 5,
                offset: 1,
                bit: 2,
                value: true
            }]
        );
    }

    #[test]
    fn test_write_back_bytes_and_coalesced_frames() {
        let fx = fixture(true);
        let mut buf = encode_commands(&[WriteCommand::from_value(2, 0, &Value::Int32(-1))]);
        buf.extend(encode_commands(&[WriteCommand::from_value(1, 8, &Value::Bool(true))]));

        assert_eq!(fx.acquisition.apply_write_back(&buf).unwrap(), 2);
        let sim = fx.sim.lock().unwrap();
        assert_eq!(sim.block(2).unwrap(), &[0xFF; 4]);
        assert_eq!(sim.block(1).unwrap(), &[0x00, 0x01]);
    }

    #[test]
    fn test_write_back_malformed_keeps_earlier_commands() {
        let fx = fixture(true);
        let mut buf = encode_commands(&[WriteCommand::from_value(1, 0, &Value::Bool(true))]);
        // half a command header inside the declared length
        buf.extend_from_slice(&[0x02, 0x00, 0x00]);
        let total = buf.len() as u32;
        buf[..4].copy_from_slice(&total.to_le_bytes());

        assert!(matches!(
            fx.acquisition.apply_write_back(&buf),
            Err(GatewayError::Protocol { .. })
        ));
        assert_eq!(fx.sim.lock().unwrap().writes().len(), 1);
    }

    #[test]
    fn test_write_back_driver_error_skips_command() {
        let fx = fixture(true);
        let buf = encode_commands(&[
            WriteCommand::from_value(9, 0, &Value::Int16(1)),
            WriteCommand::from_value(1, 0, &Value::Int16(2)),
        ]);
        assert_eq!(fx.acquisition.apply_write_back(&buf).unwrap(), 1);
        assert_eq!(fx.sim.lock().unwrap().block(1).unwrap(), &[0x00, 0x02]);
    }

    #[test]
    fn test_loop_thread_runs_and_stops() {
        let fx = fixture(true);
        fx.acquisition.start(None).unwrap();
        assert!(fx.acquisition.start(None).is_err());

        let deadline = Instant::now() + Duration::from_secs(5);
        while fx.acquisition.cycle_count() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        fx.acquisition.stop();
        assert!(!fx.acquisition.is_running());
        let cycles = fx.acquisition.cycle_count();
        assert!(cycles >= 3);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(fx.acquisition.cycle_count(), cycles);
    }
}
