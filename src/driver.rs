//! PLC driver boundary.
//!
//! The gateway never speaks a field protocol itself. Everything it needs from
//! the controller goes through the [`Driver`] trait: connectivity, block
//! reads, byte writes and single-bit writes. The driver is shared between the
//! acquisition loop, the write-back decoder and direct variable writes, always
//! behind one mutex ([`SharedDriver`]), since a controller connection is not
//! assumed to be usable from two threads at once.
//!
//! Two implementations ship with the crate:
//!
//! - [`SimulatedDriver`] - in-memory blocks with switchable connectivity,
//!   used by the tests and by the binary when no PLC backend is compiled in.
//! - `S7Driver` (feature `s7`) - Siemens S7 data blocks over the `rust7` client.
//!
//! # Example
//!
//! ```
//! use plc_gateway::{Driver, SimulatedDriver};
//!
//! let mut driver = SimulatedDriver::new().with_block(10, 4);
//! driver.open().unwrap();
//! driver.write_bytes(10, 2, &[0x12, 0x34]).unwrap();
//! assert_eq!(driver.read_bytes(10, 0, 4).unwrap(), vec![0, 0, 0x12, 0x34]);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{GatewayError, Result};
use crate::utils::with_bit;

/// Raw access to controller data blocks.
///
/// Offsets are byte offsets from the start of the block; `bit` is 0-7.
pub trait Driver: Send {
    /// Returns whether the connection to the controller is open.
    fn is_connected(&self) -> bool;

    /// Opens the connection to the controller.
    fn open(&mut self) -> Result<()>;

    /// Reads `len` bytes of `block` starting at `offset`.
    fn read_bytes(&mut self, block: u16, offset: usize, len: usize) -> Result<Vec<u8>>;

    /// Writes `data` into `block` starting at `offset`.
    fn write_bytes(&mut self, block: u16, offset: usize, data: &[u8]) -> Result<()>;

    /// Writes a single bit, leaving its neighbours untouched.
    fn write_bit(&mut self, block: u16, offset: usize, bit: u8, value: bool) -> Result<()>;
}

/// A driver shared between the gateway's threads.
pub type SharedDriver = Arc<Mutex<dyn Driver>>;

/// Wraps a driver for sharing.
///
/// # Example
///
/// ```
/// use plc_gateway::{shared, SimulatedDriver};
///
/// let driver = shared(SimulatedDriver::new());
/// ```
pub fn shared<D: Driver + 'static>(driver: D) -> SharedDriver {
    Arc::new(Mutex::new(driver))
}

/// Locks a shared driver, recovering from a poisoned lock.
///
/// A panic inside a driver call leaves the connection state to the driver
/// itself; the next `is_connected` check decides what happens.
pub(crate) fn lock(driver: &SharedDriver) -> MutexGuard<'_, dyn Driver + 'static> {
    driver.lock().unwrap_or_else(|e| e.into_inner())
}

/// A write applied to a [`SimulatedDriver`], kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverWrite {
    /// A byte range write.
    Bytes {
        /// Block number.
        block: u16,
        /// Byte offset.
        offset: usize,
        /// Bytes written.
        data: Vec<u8>,
    },
    /// A single-bit write.
    Bit {
        /// Block number.
        block: u16,
        /// Byte offset.
        offset: usize,
        /// Bit index.
        bit: u8,
        /// Bit value.
        value: bool,
    },
}

/// In-memory controller.
///
/// Starts disconnected. `open` succeeds unless failures were scheduled with
/// [`fail_next_opens`](Self::fail_next_opens).
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    blocks: HashMap<u16, Vec<u8>>,
    connected: bool,
    failing_opens: usize,
    open_attempts: usize,
    writes: Vec<DriverWrite>,
}

impl SimulatedDriver {
    /// Creates a driver with no blocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a zero-filled block.
    pub fn with_block(mut self, block: u16, len: usize) -> Self {
        self.blocks.insert(block, vec![0; len]);
        self
    }

    /// Replaces the contents of a block, creating it if needed.
    pub fn set_block(&mut self, block: u16, bytes: Vec<u8>) {
        self.blocks.insert(block, bytes);
    }

    /// Returns the current contents of a block.
    pub fn block(&self, block: u16) -> Option<&[u8]> {
        self.blocks.get(&block).map(Vec::as_slice)
    }

    /// Forces the connection state, e.g. to simulate a dropped link.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Makes the next `count` calls to `open` fail.
    pub fn fail_next_opens(&mut self, count: usize) {
        self.failing_opens = count;
    }

    /// Returns how many times `open` was called.
    pub fn open_attempts(&self) -> usize {
        self.open_attempts
    }

    /// Returns every write applied so far, oldest first.
    pub fn writes(&self) -> &[DriverWrite] {
        &self.writes
    }

    fn region(&mut self, block: u16, offset: usize, len: usize) -> Result<&mut [u8]> {
        if !self.connected {
            return Err(GatewayError::NotConnected);
        }
        let bytes = self
            .blocks
            .get_mut(&block)
            .ok_or_else(|| GatewayError::driver(format!("block {} does not exist", block)))?;
        let size = bytes.len();
        bytes.get_mut(offset..offset + len).ok_or_else(|| {
            GatewayError::driver(format!(
                "block {} access {}..{} out of range (size {})",
                block,
                offset,
                offset + len,
                size
            ))
        })
    }
}

impl Driver for SimulatedDriver {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn open(&mut self) -> Result<()> {
        self.open_attempts += 1;
        if self.failing_opens > 0 {
            self.failing_opens -= 1;
            return Err(GatewayError::driver("simulated connection refused"));
        }
        self.connected = true;
        Ok(())
    }

    fn read_bytes(&mut self, block: u16, offset: usize, len: usize) -> Result<Vec<u8>> {
        Ok(self.region(block, offset, len)?.to_vec())
    }

    fn write_bytes(&mut self, block: u16, offset: usize, data: &[u8]) -> Result<()> {
        self.region(block, offset, data.len())?.copy_from_slice(data);
        self.writes.push(DriverWrite::Bytes {
            block,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn write_bit(&mut self, block: u16, offset: usize, bit: u8, value: bool) -> Result<()> {
        if bit > 7 {
            return Err(GatewayError::invalid_parameter("bit", "must be 0-7"));
        }
        let byte = &mut self.region(block, offset, 1)?[0];
        *byte = with_bit(*byte, bit, value);
        self.writes.push(DriverWrite::Bit {
            block,
            offset,
            bit,
            value,
        });
        Ok(())
    }
}

#[cfg(feature = "s7")]
pub use s7::S7Driver;

#[cfg(feature = "s7")]
mod s7 {
    use log::warn;
    use rust7::client::{S7Client, S7Error};

    use super::Driver;
    use crate::error::{GatewayError, Result};

    /// Siemens S7 data block access through the `rust7` client.
    pub struct S7Driver {
        client: S7Client,
        address: String,
        rack: u16,
        slot: u16,
    }

    impl S7Driver {
        /// Creates a disconnected driver for the PLC at `address`.
        pub fn new(address: impl Into<String>, rack: u16, slot: u16) -> Self {
            Self {
                client: S7Client::new(),
                address: address.into(),
                rack,
                slot,
            }
        }

        /// Maps a client error, dropping the connection on transport-level
        /// failures so the acquisition loop reconnects.
        fn fail(&mut self, err: S7Error) -> GatewayError {
            match err {
                S7Error::NotConnected => GatewayError::NotConnected,
                S7Error::S7NotFound | S7Error::S7InvalidAddress | S7Error::S7Unspecified => {
                    GatewayError::driver(err.to_string())
                }
                _ => {
                    warn!("S7 transport error, dropping connection: {}", err);
                    self.client.disconnect();
                    GatewayError::driver(err.to_string())
                }
            }
        }
    }

    fn db_start(offset: usize) -> Result<u16> {
        u16::try_from(offset)
            .map_err(|_| GatewayError::invalid_parameter("offset", "must fit in 16 bits"))
    }

    impl Driver for S7Driver {
        fn is_connected(&self) -> bool {
            self.client.connected
        }

        fn open(&mut self) -> Result<()> {
            let (address, rack, slot) = (self.address.clone(), self.rack, self.slot);
            match self.client.connect_rack_slot(&address, rack, slot) {
                Ok(()) => Ok(()),
                Err(e) => Err(self.fail(e)),
            }
        }

        fn read_bytes(&mut self, block: u16, offset: usize, len: usize) -> Result<Vec<u8>> {
            let mut buffer = vec![0u8; len];
            let start = db_start(offset)?;
            match self.client.read_db(block, start, &mut buffer) {
                Ok(()) => Ok(buffer),
                Err(e) => Err(self.fail(e)),
            }
        }

        fn write_bytes(&mut self, block: u16, offset: usize, data: &[u8]) -> Result<()> {
            let start = db_start(offset)?;
            match self.client.write_db(block, start, data) {
                Ok(()) => Ok(()),
                Err(e) => Err(self.fail(e)),
            }
        }

        fn write_bit(&mut self, block: u16, offset: usize, bit: u8, value: bool) -> Result<()> {
            let start = db_start(offset)?;
            match self
                .client
                .write_bit(rust7::S7_AREA_DB, block, start, bit, value)
            {
                Ok(()) => Ok(()),
                Err(e) => Err(self.fail(e)),
            }
        }
    }

    impl std::fmt::Debug for S7Driver {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("S7Driver")
                .field("address", &self.address)
                .field("rack", &self.rack)
                .field("slot", &self.slot)
                .field("connected", &self.client.connected)
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> SimulatedDriver {
        let mut driver = SimulatedDriver::new().with_block(1, 4);
        driver.open().unwrap();
        driver
    }

    #[test]
    fn test_starts_disconnected() {
        let mut driver = SimulatedDriver::new().with_block(1, 4);
        assert!(!driver.is_connected());
        assert!(matches!(
            driver.read_bytes(1, 0, 4),
            Err(GatewayError::NotConnected)
        ));
    }

    #[test]
    fn test_failing_opens() {
        let mut driver = SimulatedDriver::new();
        driver.fail_next_opens(2);
        assert!(driver.open().is_err());
        assert!(driver.open().is_err());
        assert!(driver.open().is_ok());
        assert!(driver.is_connected());
        assert_eq!(driver.open_attempts(), 3);
    }

    #[test]
    fn test_write_bit_keeps_neighbours() {
        let mut driver = connected();
        driver.set_block(1, vec![0b1010_0000, 0, 0, 0]);
        driver.write_bit(1, 0, 0, true).unwrap();
        driver.write_bit(1, 0, 7, false).unwrap();
        assert_eq!(driver.block(1).unwrap()[0], 0b0010_0001);
    }

    #[test]
    fn test_out_of_range_access() {
        let mut driver = connected();
        assert!(driver.read_bytes(1, 2, 4).is_err());
        assert!(driver.write_bytes(1, 4, &[1]).is_err());
        assert!(driver.read_bytes(9, 0, 1).is_err());
        assert!(driver.write_bit(1, 0, 8, true).is_err());
    }

    #[test]
    fn test_writes_are_recorded() {
        let mut driver = connected();
        driver.write_bytes(1, 1, &[0xAB]).unwrap();
        driver.write_bit(1, 3, 2, true).unwrap();
        assert_eq!(
            driver.writes(),
            &[
                DriverWrite::Bytes {
                    block: 1,
                    offset: 1,
                    data: vec![0xAB]
                },
                DriverWrite::Bit {
                    block: 1,
                    offset: 3,
                    bit: 2,
                    value: true
                },
            ]
        );
    }

    #[test]
    fn test_shared_driver_locks() {
        let driver = shared(connected());
        assert!(lock(&driver).is_connected());
        lock(&driver).write_bytes(1, 0, &[1, 2]).unwrap();
        assert_eq!(lock(&driver).read_bytes(1, 0, 2).unwrap(), vec![1, 2]);
    }
}
