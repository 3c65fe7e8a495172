//! # PLC Gateway
//!
//! Bridges a PLC's data blocks to TCP clients.
//!
//! A gateway process owns the controller connection. It reads a fixed set of
//! data blocks every scan cycle, sends the blocks that changed to every
//! connected client in one framed message, and applies the write commands
//! clients send back. Named, typed variables are laid out inside the blocks so
//! application code reads and writes `bool`, `i16`, `i32` and `f32` values
//! instead of raw bytes.
//!
//! ## Features
//!
//! - **Differential broadcast** - a block is sent only when its bytes changed,
//!   or in full when a client connects or the PLC reconnects
//! - **Bounds-checked write-back** - malformed client buffers are rejected,
//!   never read past their end
//! - **Typed variables** - sequential, alignment-respecting layout over a
//!   closed set of value kinds
//! - **Polling server** - independent accept, liveness and receive loops with
//!   an IP allow list
//! - **Pluggable driver** - the controller sits behind the [`Driver`] trait;
//!   an S7 implementation is available with the `s7` feature
//!
//! ## Quick Start
//!
//! ```no_run
//! use plc_gateway::{shared, GatewayBuilder, Role, ServerConfig, SimulatedDriver, ValueKind};
//!
//! fn main() -> plc_gateway::Result<()> {
//!     let driver = shared(SimulatedDriver::new().with_block(10, 8));
//!     let server = ServerConfig::new("0.0.0.0".parse().unwrap(), 2102)
//!         .allow("192.168.0.20".parse().unwrap());
//!
//!     let mut gateway = GatewayBuilder::new(Role::Server)
//!         .server(server)
//!         .driver(driver)
//!         .block(10, 8, &[
//!             ("running", ValueKind::Bool),
//!             ("speed", ValueKind::Int16),
//!             ("setpoint", ValueKind::Float32),
//!         ])
//!         .build()?;
//!
//!     gateway.start()?;
//!     gateway.variable("setpoint").unwrap().set(42.5f32)?;
//!     gateway.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Wire Format
//!
//! Header integers are little-endian, value bytes big-endian. See the
//! [`frame`] module for the field tables.
//!
//! | Direction | Content |
//! |-----------|---------|
//! | gateway → client | `TotalLength` + one `ChunkLength, BlockId, Payload` per dirty block |
//! | client → gateway | `TotalLength` + `BlockId, BitOffset, BitWidth, Value` per command |
//!
//! ## Variable Layout
//!
//! | Kind | Width (bits) | Alignment (bits) |
//! |------|:------------:|:----------------:|
//! | [`ValueKind::Bool`] | 1 | 1 |
//! | [`ValueKind::Int16`] | 16 | 16 |
//! | [`ValueKind::Int32`] | 32 | 16 |
//! | [`ValueKind::Float32`] | 32 | 16 |
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `std::result::Result<T, GatewayError>`. Connection loss is never fatal:
//! the acquisition loop logs it and reconnects after
//! [`AcquisitionConfig::reconnect_delay`].
//!
//! ## Logging
//!
//! The crate logs through the [`log`](https://docs.rs/log) facade. The
//! `plc-gateway` binary installs `env_logger`; set `RUST_LOG=debug` to see
//! every value change and write-back.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod acquisition;
mod block;
mod config;
mod driver;
mod error;
pub mod frame;
mod gateway;
mod server;
mod stop;
pub mod utils;
mod value;
mod variable;

// Public re-exports
pub use acquisition::{
    Acquisition, AcquisitionConfig, CycleOutcome, DEFAULT_MIN_CYCLE, DEFAULT_RECONNECT_DELAY,
};
pub use block::{ChangeDetection, MemoryBlock};
pub use config::{BlockConfig, GatewayConfig, PlcConfig, VariableConfig};
#[cfg(feature = "s7")]
pub use driver::S7Driver;
pub use driver::{shared, Driver, DriverWrite, SharedDriver, SimulatedDriver};
pub use error::{GatewayError, Result};
pub use frame::{
    decode_broadcast, encode_commands, BroadcastChunk, BroadcastFrame, CommandReader,
    WriteCommand, MAX_CHUNK_PAYLOAD,
};
pub use gateway::{Gateway, GatewayBuilder, Role};
pub use server::{
    Broadcaster, ClientInfo, PollingServer, ServerConfig, ServerHandler, DEFAULT_ACCEPT_DELAY,
    DEFAULT_DISCONNECT_DELAY, DEFAULT_LISTENER_DELAY, DEFAULT_PORT, RECEIVE_BUFFER_SIZE,
};
pub use value::{Value, ValueKind};
pub use variable::{BlockLayout, SendQueue, TypedVar, ValueChange, WriteRoute};
