//! Typed variables bound to memory blocks.
//!
//! A [`TypedVar`] names one scalar inside a [`MemoryBlock`]: it decodes its
//! value from every new snapshot and encodes writes back to the controller.
//! Variables are created through a [`BlockLayout`], which hands out bit
//! offsets sequentially, each rounded up to the kind's alignment, so two
//! variables of the same block never overlap.
//!
//! Where a write goes depends on the process role, captured by
//! [`WriteRoute`]:
//!
//! - [`WriteRoute::Direct`] - the gateway owns the controller connection and
//!   writes through the driver immediately.
//! - [`WriteRoute::Queue`] - a remote client encodes a [`WriteCommand`] into a
//!   [`SendQueue`] for transmission to the gateway.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use plc_gateway::{BlockLayout, MemoryBlock, SendQueue, ValueKind, WriteRoute};
//!
//! let block = Arc::new(MemoryBlock::new(10, 8));
//! let queue = SendQueue::new();
//! let mut layout = BlockLayout::new(block, WriteRoute::Queue(queue.clone()));
//!
//! let running = layout.add("running", ValueKind::Bool).unwrap();
//! let speed = layout.add("speed", ValueKind::Int16).unwrap();
//! assert_eq!(running.bit_offset(), 0);
//! assert_eq!(speed.bit_offset(), 16);
//!
//! speed.set(1500i16).unwrap();
//! assert_eq!(queue.len(), 1);
//! ```

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::block::MemoryBlock;
use crate::driver::{self, SharedDriver};
use crate::error::{GatewayError, Result};
use crate::frame::{encode_commands, WriteCommand};
use crate::utils::{align_up, format_bytes, split_bit_offset};
use crate::value::{Value, ValueKind};

/// A decoded value that differs from the one decoded on the previous cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    /// Block number.
    pub block: u16,
    /// Variable name.
    pub name: String,
    /// Bit address of the variable inside its block.
    pub bit_offset: u32,
    /// Value before this cycle.
    pub old: Value,
    /// Value decoded this cycle.
    pub new: Value,
}

/// Outbound write commands waiting for the client-side sender.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct SendQueue {
    inner: Arc<Mutex<VecDeque<WriteCommand>>>,
}

impl SendQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<WriteCommand>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a command.
    pub fn push(&self, command: WriteCommand) {
        self.lock().push_back(command);
    }

    /// Returns the number of queued commands.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes and returns every queued command, oldest first.
    pub fn drain(&self) -> Vec<WriteCommand> {
        self.lock().drain(..).collect()
    }

    /// Drains the queue into one write-back frame, ready for the socket.
    ///
    /// Returns `None` when nothing is queued.
    pub fn take_frame(&self) -> Option<Vec<u8>> {
        let commands = self.drain();
        if commands.is_empty() {
            None
        } else {
            Some(encode_commands(&commands))
        }
    }
}

/// Destination of variable writes.
#[derive(Clone)]
pub enum WriteRoute {
    /// Write through the controller driver (gateway role).
    Direct(SharedDriver),
    /// Queue an encoded command for the gateway (client role).
    Queue(SendQueue),
}

impl std::fmt::Debug for WriteRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteRoute::Direct(_) => f.write_str("Direct"),
            WriteRoute::Queue(queue) => f.debug_tuple("Queue").field(&queue.len()).finish(),
        }
    }
}

#[derive(Debug)]
struct VarState {
    current: Value,
    previous: Value,
}

/// One scalar at a fixed bit offset inside a memory block.
#[derive(Debug)]
pub struct TypedVar {
    name: String,
    kind: ValueKind,
    bit_offset: u32,
    block: Arc<MemoryBlock>,
    route: WriteRoute,
    state: Mutex<VarState>,
}

impl TypedVar {
    fn lock(&self) -> MutexGuard<'_, VarState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the variable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value kind.
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Returns the bit address inside the block.
    pub fn bit_offset(&self) -> u32 {
        self.bit_offset
    }

    /// Returns the bits this variable occupies.
    pub fn bit_range(&self) -> Range<u32> {
        self.bit_offset..self.bit_offset + self.kind.bit_width() as u32
    }

    /// Returns the block this variable is bound to.
    pub fn block(&self) -> &Arc<MemoryBlock> {
        &self.block
    }

    /// Returns the last decoded value.
    pub fn value(&self) -> Value {
        self.lock().current
    }

    /// Returns the value decoded the cycle before the last one.
    pub fn previous(&self) -> Value {
        self.lock().previous
    }

    /// Decodes the variable from the block's current snapshot.
    ///
    /// Returns the change when the decoded value differs from the last one.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidParameter` if the snapshot is shorter
    /// than the variable's position (a driver returned a short block).
    pub fn parse(&self) -> Result<Option<ValueChange>> {
        let new = self
            .block
            .with_bytes(|bytes| Value::decode(self.kind, bytes, self.bit_offset))?;

        let mut state = self.lock();
        let old = std::mem::replace(&mut state.current, new);
        state.previous = old;
        drop(state);

        if old.same_as(&new) {
            Ok(None)
        } else {
            Ok(Some(ValueChange {
                block: self.block.num(),
                name: self.name.clone(),
                bit_offset: self.bit_offset,
                old,
                new,
            }))
        }
    }

    /// Writes `value` to the controller through the variable's route.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidParameter` if the value kind does not
    /// match the variable, or any driver error for a direct write.
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if value.kind() != self.kind {
            return Err(GatewayError::invalid_parameter(
                "value",
                format!(
                    "'{}' holds {}, got {}",
                    self.name,
                    self.kind,
                    value.kind()
                ),
            ));
        }

        match &self.route {
            WriteRoute::Direct(driver) => {
                let (byte_offset, bit) = split_bit_offset(self.bit_offset);
                let mut driver = driver::lock(driver);
                match value {
                    Value::Bool(v) => driver.write_bit(self.block.num(), byte_offset, bit, v)?,
                    other => {
                        let bytes = other.encode(self.bit_offset);
                        debug!(
                            "Writing {} = {} to block {} byte {}: {}",
                            self.name,
                            other,
                            self.block.num(),
                            byte_offset,
                            format_bytes(&bytes)
                        );
                        driver.write_bytes(self.block.num(), byte_offset, &bytes)?
                    }
                }
            }
            WriteRoute::Queue(queue) => {
                queue.push(WriteCommand::from_value(self.block.num(), self.bit_offset, &value));
            }
        }
        Ok(())
    }

    /// Writes `value` only if it differs from the last decoded value.
    ///
    /// Returns whether a write was issued.
    pub fn update(&self, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        if value.same_as(&self.value()) {
            return Ok(false);
        }
        self.set(value)?;
        Ok(true)
    }
}

/// Sequential, alignment-respecting variable layout for one block.
#[derive(Debug)]
pub struct BlockLayout {
    block: Arc<MemoryBlock>,
    route: WriteRoute,
    cursor: u32,
    variables: Vec<Arc<TypedVar>>,
}

impl BlockLayout {
    /// Starts an empty layout at bit 0 of `block`.
    pub fn new(block: Arc<MemoryBlock>, route: WriteRoute) -> Self {
        Self {
            block,
            route,
            cursor: 0,
            variables: Vec::new(),
        }
    }

    /// Places a new variable after the previous one.
    ///
    /// The start bit is the first free bit rounded up to the kind's
    /// alignment.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidParameter` if the variable does not fit
    /// in the block.
    pub fn add(&mut self, name: impl Into<String>, kind: ValueKind) -> Result<Arc<TypedVar>> {
        let name = name.into();
        let start = align_up(self.cursor, kind.alignment());
        let end = start + kind.bit_width() as u32;
        let capacity = self.block.len() as u64 * 8;
        if end as u64 > capacity {
            return Err(GatewayError::invalid_parameter(
                name,
                format!(
                    "{} at bit {} ends at bit {}, block {} has {} bits",
                    kind,
                    start,
                    end,
                    self.block.num(),
                    capacity
                ),
            ));
        }

        let var = Arc::new(TypedVar {
            name,
            kind,
            bit_offset: start,
            block: Arc::clone(&self.block),
            route: self.route.clone(),
            state: Mutex::new(VarState {
                current: kind.zero(),
                previous: kind.zero(),
            }),
        });
        self.cursor = end;
        self.variables.push(Arc::clone(&var));
        Ok(var)
    }

    /// Returns the first bit not yet assigned.
    pub fn next_free_bit(&self) -> u32 {
        self.cursor
    }

    /// Returns the block being laid out.
    pub fn block(&self) -> &Arc<MemoryBlock> {
        &self.block
    }

    /// Returns the variables in layout order.
    pub fn variables(&self) -> &[Arc<TypedVar>] {
        &self.variables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{shared, Driver, DriverWrite, SimulatedDriver};
    use crate::frame::CommandReader;

    fn queue_layout(len: usize) -> (BlockLayout, SendQueue) {
        let queue = SendQueue::new();
        let block = Arc::new(MemoryBlock::new(3, len));
        (BlockLayout::new(block, WriteRoute::Queue(queue.clone())), queue)
    }

    #[test]
    fn test_layout_offsets() {
        let (mut layout, _) = queue_layout(32);
        let b0 = layout.add("b0", ValueKind::Bool).unwrap();
        let b1 = layout.add("b1", ValueKind::Bool).unwrap();
        let i = layout.add("i", ValueKind::Int16).unwrap();
        let b2 = layout.add("b2", ValueKind::Bool).unwrap();
        let d = layout.add("d", ValueKind::Int32).unwrap();
        let r = layout.add("r", ValueKind::Float32).unwrap();

        assert_eq!(b0.bit_offset(), 0);
        assert_eq!(b1.bit_offset(), 1);
        assert_eq!(i.bit_offset(), 16);
        assert_eq!(b2.bit_offset(), 32);
        assert_eq!(d.bit_offset(), 48);
        assert_eq!(r.bit_offset(), 80);
        assert_eq!(layout.next_free_bit(), 112);
    }

    #[test]
    fn test_layout_never_overlaps() {
        let kinds = [
            ValueKind::Bool,
            ValueKind::Int32,
            ValueKind::Bool,
            ValueKind::Bool,
            ValueKind::Float32,
            ValueKind::Int16,
            ValueKind::Bool,
            ValueKind::Int16,
            ValueKind::Int32,
        ];
        let (mut layout, _) = queue_layout(64);
        for (i, kind) in kinds.iter().cycle().take(40).enumerate() {
            if layout.add(format!("v{}", i), *kind).is_err() {
                break;
            }
        }

        let vars = layout.variables();
        assert!(vars.len() > 10);
        for (i, a) in vars.iter().enumerate() {
            assert_eq!(a.bit_offset() % a.kind().alignment(), 0);
            for b in &vars[i + 1..] {
                let (ra, rb) = (a.bit_range(), b.bit_range());
                assert!(ra.end <= rb.start || rb.end <= ra.start, "{:?} overlaps {:?}", ra, rb);
            }
        }
    }

    #[test]
    fn test_layout_rejects_overflow() {
        let (mut layout, _) = queue_layout(2);
        layout.add("a", ValueKind::Int16).unwrap();
        assert!(layout.add("b", ValueKind::Bool).is_err());
        // the failed add does not move the cursor
        assert_eq!(layout.next_free_bit(), 16);
    }

    #[test]
    fn test_parse_reports_changes_only() {
        let (mut layout, _) = queue_layout(4);
        let flag = layout.add("flag", ValueKind::Bool).unwrap();
        let count = layout.add("count", ValueKind::Int16).unwrap();
        let block = Arc::clone(layout.block());

        block.update_bytes(vec![0x01, 0x00, 0x01, 0x2C]);
        let change = flag.parse().unwrap().unwrap();
        assert_eq!(change.old, Value::Bool(false));
        assert_eq!(change.new, Value::Bool(true));
        assert_eq!(count.parse().unwrap().unwrap().new, Value::Int16(300));

        block.update_bytes(vec![0x01, 0x00, 0x01, 0x2C]);
        assert!(flag.parse().unwrap().is_none());
        assert!(count.parse().unwrap().is_none());
        assert_eq!(count.value(), Value::Int16(300));
        assert_eq!(count.previous(), Value::Int16(300));
    }

    #[test]
    fn test_parse_short_snapshot() {
        let (mut layout, _) = queue_layout(4);
        let _ = layout.add("a", ValueKind::Int16).unwrap();
        let b = layout.add("b", ValueKind::Int16).unwrap();
        layout.block().update_bytes(vec![0, 0]);
        assert!(b.parse().is_err());
    }

    #[test]
    fn test_set_rejects_wrong_kind() {
        let (mut layout, queue) = queue_layout(4);
        let v = layout.add("v", ValueKind::Int16).unwrap();
        assert!(matches!(
            v.set(true),
            Err(GatewayError::InvalidParameter { .. })
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_route_encodes_command() {
        let (mut layout, queue) = queue_layout(4);
        let _pad = layout.add("pad", ValueKind::Bool).unwrap();
        let flag = layout.add("flag", ValueKind::Bool).unwrap();
        let level = layout.add("level", ValueKind::Int16).unwrap();
        flag.set(true).unwrap();
        level.set(-2i16).unwrap();

        let frame = queue.take_frame().unwrap();
        assert!(queue.take_frame().is_none());
        let commands: Vec<_> = CommandReader::new(&frame)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].block(), 3);
        assert_eq!(commands[0].bit_offset(), 1);
        assert_eq!(commands[0].bit_width(), 1);
        assert_eq!(commands[0].value(), &[0b0000_0010]);
        assert_eq!(commands[1].bit_offset(), 16);
        assert_eq!(commands[1].value(), &[0xFF, 0xFE]);
    }

    #[test]
    fn test_direct_route_writes_driver() {
        let mut sim = SimulatedDriver::new().with_block(3, 8);
        sim.open().unwrap();
        let sim = Arc::new(Mutex::new(sim));
        let driver: SharedDriver = sim.clone();

        let block = Arc::new(MemoryBlock::new(3, 8));
        let mut layout = BlockLayout::new(block, WriteRoute::Direct(driver));
        let _pad = layout.add("pad", ValueKind::Int16).unwrap();
        let flag = layout.add("flag", ValueKind::Bool).unwrap();
        let _gap = layout.add("gap", ValueKind::Bool).unwrap();
        let temp = layout.add("temp", ValueKind::Float32).unwrap();

        flag.set(true).unwrap();
        temp.set(1.0f32).unwrap();

        let sim = sim.lock().unwrap();
        assert_eq!(
            sim.writes(),
            &[
                DriverWrite::Bit {
                    block: 3,
                    offset: 2,
                    bit: 0,
                    value: true
                },
                DriverWrite::Bytes {
                    block: 3,
                    offset: 4,
                    data: vec![0x3F, 0x80, 0x00, 0x00]
                },
            ]
        );
        assert_eq!(sim.block(3).unwrap(), &[0, 0, 1, 0, 0x3F, 0x80, 0, 0]);
    }

    #[test]
    fn test_direct_route_propagates_driver_error() {
        let driver = shared(SimulatedDriver::new().with_block(3, 2));
        let block = Arc::new(MemoryBlock::new(3, 2));
        let mut layout = BlockLayout::new(block, WriteRoute::Direct(driver));
        let v = layout.add("v", ValueKind::Int16).unwrap();
        assert!(matches!(v.set(5i16), Err(GatewayError::NotConnected)));
    }

    #[test]
    fn test_update_skips_unchanged_value() {
        let (mut layout, queue) = queue_layout(2);
        let v = layout.add("v", ValueKind::Int16).unwrap();
        assert!(!v.update(0i16).unwrap());
        assert!(v.update(7i16).unwrap());
        assert_eq!(queue.len(), 1);
    }
}
