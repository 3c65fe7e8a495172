//! Application context.
//!
//! A [`Gateway`] owns everything one process runs: its blocks, its variables
//! and, in the server role, the polling server and the acquisition loop that
//! feeds it. It is built once through [`GatewayBuilder`] (or from a
//! [`GatewayConfig`]) and started explicitly; there is no global registry.
//!
//! # Roles
//!
//! - [`Role::Server`] - owns the PLC driver. `start` opens the TCP port and
//!   runs the acquisition loop; variable writes go straight to the driver.
//! - [`Role::Client`] - mirrors a remote gateway. Variable writes are queued
//!   as write-back commands ([`Gateway::send_queue`]) and received broadcast
//!   frames are applied with [`Gateway::apply_broadcast`].
//!
//! # Example
//!
//! ```no_run
//! use plc_gateway::{shared, GatewayBuilder, Role, ServerConfig, SimulatedDriver, ValueKind};
//!
//! let driver = shared(SimulatedDriver::new().with_block(10, 4));
//! let server = ServerConfig::new("0.0.0.0".parse().unwrap(), 2102)
//!     .allow("192.168.0.20".parse().unwrap());
//!
//! let mut gateway = GatewayBuilder::new(Role::Server)
//!     .server(server)
//!     .driver(driver)
//!     .block(10, 4, &[("running", ValueKind::Bool), ("speed", ValueKind::Int16)])
//!     .build()
//!     .unwrap();
//!
//! gateway.start().unwrap();
//! gateway.variable("speed").unwrap().set(1200i16).unwrap();
//! gateway.stop();
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::acquisition::{Acquisition, AcquisitionConfig};
use crate::block::{ChangeDetection, MemoryBlock};
use crate::config::{BlockConfig, GatewayConfig, VariableConfig};
use crate::driver::SharedDriver;
use crate::error::{GatewayError, Result};
use crate::frame::{decode_broadcast, MAX_CHUNK_PAYLOAD};
use crate::server::{PollingServer, ServerConfig, ServerHandler};
use crate::value::ValueKind;
use crate::variable::{BlockLayout, SendQueue, TypedVar, ValueChange, WriteRoute};

/// Which side of the TCP link this process is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owns the PLC connection and serves clients.
    #[default]
    Server,
    /// Talks to a remote gateway.
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Collects the parts of a [`Gateway`].
pub struct GatewayBuilder {
    role: Role,
    server: Option<ServerConfig>,
    acquisition: AcquisitionConfig,
    driver: Option<SharedDriver>,
    detection: ChangeDetection,
    blocks: Vec<BlockConfig>,
    changes: Option<Sender<ValueChange>>,
}

impl std::fmt::Debug for GatewayBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayBuilder")
            .field("role", &self.role)
            .field("server", &self.server)
            .field("acquisition", &self.acquisition)
            .field("driver", &self.driver.is_some())
            .field("detection", &self.detection)
            .field("blocks", &self.blocks)
            .finish()
    }
}

impl GatewayBuilder {
    /// Starts an empty builder for `role`.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            server: None,
            acquisition: AcquisitionConfig::default(),
            driver: None,
            detection: ChangeDetection::default(),
            blocks: Vec::new(),
            changes: None,
        }
    }

    /// Prepares a builder from a validated configuration.
    ///
    /// The driver and the value-change channel still have to be supplied.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the configuration does not validate.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = Self::new(config.role)
            .server(config.server_config()?)
            .acquisition(config.acquisition_config())
            .change_detection(config.change_detection);
        for block in &config.blocks {
            let mut block = block.clone();
            block.change_detection = Some(config.detection_for(&block));
            builder = builder.block_config(block);
        }
        Ok(builder)
    }

    /// Sets the server settings (server role).
    pub fn server(mut self, config: ServerConfig) -> Self {
        self.server = Some(config);
        self
    }

    /// Sets the acquisition timings (server role).
    pub fn acquisition(mut self, config: AcquisitionConfig) -> Self {
        self.acquisition = config;
        self
    }

    /// Sets the PLC driver (server role).
    pub fn driver(mut self, driver: SharedDriver) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Sets the change detection for blocks that do not set their own.
    pub fn change_detection(mut self, detection: ChangeDetection) -> Self {
        self.detection = detection;
        self
    }

    /// Publishes decoded value changes on `sender`.
    pub fn value_changes(mut self, sender: Sender<ValueChange>) -> Self {
        self.changes = Some(sender);
        self
    }

    /// Adds a block with its variables in layout order.
    pub fn block(self, num: u16, length: usize, variables: &[(&str, ValueKind)]) -> Self {
        self.block_config(BlockConfig {
            num,
            length,
            change_detection: None,
            variables: variables
                .iter()
                .map(|(name, kind)| VariableConfig {
                    name: name.to_string(),
                    kind: *kind,
                })
                .collect(),
        })
    }

    /// Adds a block described by a [`BlockConfig`].
    pub fn block_config(mut self, block: BlockConfig) -> Self {
        self.blocks.push(block);
        self
    }

    /// Lays out every block and assembles the gateway.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` for a missing server configuration or
    /// driver (server role), no blocks, a duplicate block number or variable
    /// name, or a block length outside `1..=MAX_CHUNK_PAYLOAD`; and
    /// `GatewayError::InvalidParameter` if a block's variables do not fit.
    pub fn build(self) -> Result<Gateway> {
        if self.blocks.is_empty() {
            return Err(GatewayError::config("at least one block is required"));
        }

        let queue = SendQueue::new();
        let route = match (self.role, &self.driver) {
            (Role::Server, Some(driver)) => WriteRoute::Direct(Arc::clone(driver)),
            (Role::Server, None) => {
                return Err(GatewayError::config("server role needs a PLC driver"))
            }
            (Role::Client, _) => WriteRoute::Queue(queue.clone()),
        };

        let mut numbers = HashSet::new();
        let mut variables = HashMap::new();
        let mut layouts = Vec::with_capacity(self.blocks.len());
        for config in &self.blocks {
            if config.length == 0 || config.length > MAX_CHUNK_PAYLOAD {
                return Err(GatewayError::config(format!(
                    "block {} length must be 1-{}, got {}",
                    config.num, MAX_CHUNK_PAYLOAD, config.length
                )));
            }
            if !numbers.insert(config.num) {
                return Err(GatewayError::config(format!(
                    "block {} is listed twice",
                    config.num
                )));
            }

            let detection = config.change_detection.unwrap_or(self.detection);
            let block = Arc::new(MemoryBlock::with_detection(config.num, config.length, detection));
            let mut layout = BlockLayout::new(block, route.clone());
            for var in &config.variables {
                if variables.contains_key(&var.name) {
                    return Err(GatewayError::config(format!(
                        "variable '{}' is defined twice",
                        var.name
                    )));
                }
                let typed = layout.add(var.name.clone(), var.kind)?;
                variables.insert(var.name.clone(), typed);
            }
            layouts.push(layout);
        }
        let blocks: Vec<_> = layouts.iter().map(|l| Arc::clone(l.block())).collect();

        let mode = match (self.role, self.driver) {
            (Role::Server, Some(driver)) => {
                let server_config = self
                    .server
                    .ok_or_else(|| GatewayError::config("server role needs a listen address"))?;
                let acquisition = Arc::new(Acquisition::new(self.acquisition, driver, layouts)?);
                if let Some(sender) = self.changes {
                    acquisition.set_change_sender(sender);
                }
                let handler: Arc<dyn ServerHandler> = acquisition.clone();
                Mode::Server {
                    server: PollingServer::new(server_config, handler),
                    acquisition,
                }
            }
            _ => Mode::Client {
                queue,
                changes: self.changes,
            },
        };

        Ok(Gateway {
            role: self.role,
            blocks,
            variables,
            mode,
            running: false,
        })
    }
}

enum Mode {
    Server {
        server: PollingServer,
        acquisition: Arc<Acquisition>,
    },
    Client {
        queue: SendQueue,
        changes: Option<Sender<ValueChange>>,
    },
}

/// One process's blocks, variables and loops.
pub struct Gateway {
    role: Role,
    blocks: Vec<Arc<MemoryBlock>>,
    variables: HashMap<String, Arc<TypedVar>>,
    mode: Mode,
    running: bool,
}

impl Gateway {
    /// Starts a builder for `role`.
    pub fn builder(role: Role) -> GatewayBuilder {
        GatewayBuilder::new(role)
    }

    /// Builds a gateway from a configuration and, for the server role, a driver.
    ///
    /// # Errors
    ///
    /// See [`GatewayBuilder::from_config`] and [`GatewayBuilder::build`].
    pub fn from_config(config: &GatewayConfig, driver: Option<SharedDriver>) -> Result<Self> {
        let mut builder = GatewayBuilder::from_config(config)?;
        if let Some(driver) = driver {
            builder = builder.driver(driver);
        }
        builder.build()
    }

    /// Starts the server and the acquisition loop (server role).
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidParameter` if already running, or the
    /// server's bind error.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(GatewayError::invalid_parameter("gateway", "already started"));
        }
        match &mut self.mode {
            Mode::Server { server, .. } => {
                server.start()?;
                info!(
                    "Gateway serving {} block(s), {} variable(s)",
                    self.blocks.len(),
                    self.variables.len()
                );
            }
            Mode::Client { .. } => {
                info!(
                    "Gateway client ready: {} block(s), writes are queued",
                    self.blocks.len()
                );
            }
        }
        self.running = true;
        Ok(())
    }

    /// Stops whatever `start` started.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        if let Mode::Server { server, .. } = &mut self.mode {
            server.stop();
        }
        self.running = false;
        info!("Gateway stopped");
    }

    /// Returns whether `start` has been called without a matching `stop`.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Returns the role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Looks up a variable by name.
    pub fn variable(&self, name: &str) -> Option<&Arc<TypedVar>> {
        self.variables.get(name)
    }

    /// Returns every variable, in no particular order.
    pub fn variables(&self) -> impl Iterator<Item = &Arc<TypedVar>> {
        self.variables.values()
    }

    /// Returns the blocks in registration order.
    pub fn blocks(&self) -> &[Arc<MemoryBlock>] {
        &self.blocks
    }

    /// Returns the outbound write queue (client role).
    pub fn send_queue(&self) -> Option<&SendQueue> {
        match &self.mode {
            Mode::Client { queue, .. } => Some(queue),
            Mode::Server { .. } => None,
        }
    }

    /// Returns the acquisition loop (server role).
    pub fn acquisition(&self) -> Option<&Acquisition> {
        match &self.mode {
            Mode::Server { acquisition, .. } => Some(acquisition),
            Mode::Client { .. } => None,
        }
    }

    /// Returns the bound server address while running (server role).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.mode {
            Mode::Server { server, .. } => server.local_addr(),
            Mode::Client { .. } => None,
        }
    }

    /// Returns the number of connected TCP clients (server role).
    pub fn client_count(&self) -> usize {
        match &self.mode {
            Mode::Server { server, .. } => server.client_count(),
            Mode::Client { .. } => 0,
        }
    }

    /// Stores the blocks of a received broadcast frame and re-decodes their
    /// variables (client role).
    ///
    /// Chunks for unknown blocks are skipped. Returns the value changes,
    /// which are also published on the value-change channel if one was set.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidParameter` in the server role, which
    /// reads its blocks from the PLC, or `GatewayError::Protocol` for a
    /// malformed frame or a chunk whose length differs from its block. Such
    /// frames are rejected before any block is touched. If a variable fails
    /// to decode, the changes of the other variables are still published
    /// before the error is returned.
    pub fn apply_broadcast(&self, frame: &[u8]) -> Result<Vec<ValueChange>> {
        let changes_tx = match &self.mode {
            Mode::Client { changes, .. } => changes,
            Mode::Server { .. } => {
                return Err(GatewayError::invalid_parameter(
                    "role",
                    "broadcast frames are applied on clients",
                ))
            }
        };

        let mut updates = Vec::new();
        for chunk in decode_broadcast(frame)? {
            let Some(block) = self.blocks.iter().find(|b| b.num() == chunk.block) else {
                warn!("Broadcast carries unknown block {}", chunk.block);
                continue;
            };
            if chunk.payload.len() != block.len() {
                return Err(GatewayError::protocol(format!(
                    "block {} chunk has {} bytes, block has {}",
                    chunk.block,
                    chunk.payload.len(),
                    block.len()
                )));
            }
            updates.push((block, chunk.payload));
        }

        let mut changes = Vec::new();
        let mut failure = None;
        for (block, payload) in updates {
            block.update_bytes(payload);
            for var in self.variables.values().filter(|v| v.block().num() == block.num()) {
                match var.parse() {
                    Ok(Some(change)) => changes.push(change),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Cannot decode {}: {}", var.name(), e);
                        failure.get_or_insert(e);
                    }
                }
            }
        }
        changes.sort_by_key(|c| (c.block, c.bit_offset));

        if let Some(tx) = changes_tx {
            for change in &changes {
                let _ = tx.send(change.clone());
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(changes),
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("role", &self.role)
            .field("blocks", &self.blocks.len())
            .field("variables", &self.variables.len())
            .field("running", &self.running)
            .finish()
    }
}
