//! YAML configuration for the gateway binary.
//!
//! Every timing field has a default, so a minimal file only needs the listen
//! address, the allow list and the blocks:
//!
//! ```yaml
//! listen_address: 0.0.0.0
//! allowed_clients: [192.168.0.20]
//! blocks:
//!   - num: 10
//!     length: 8
//!     variables:
//!       - { name: running, kind: bool }
//!       - { name: speed, kind: int16 }
//! ```
//!
//! # Example
//!
//! ```
//! use plc_gateway::GatewayConfig;
//!
//! let config = GatewayConfig::from_yaml(
//!     "listen_address: 127.0.0.1\nblocks:\n  - { num: 1, length: 4 }\n",
//! )
//! .unwrap();
//! assert_eq!(config.port, 2102);
//! assert!(config.validate().is_ok());
//! ```

use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::acquisition::{AcquisitionConfig, DEFAULT_MIN_CYCLE, DEFAULT_RECONNECT_DELAY};
use crate::block::ChangeDetection;
use crate::error::{GatewayError, Result};
use crate::frame::MAX_CHUNK_PAYLOAD;
use crate::gateway::Role;
use crate::server::{
    ServerConfig, DEFAULT_ACCEPT_DELAY, DEFAULT_DISCONNECT_DELAY, DEFAULT_LISTENER_DELAY,
    DEFAULT_PORT,
};
use crate::utils::align_up;
use crate::value::ValueKind;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_accept_delay_ms() -> u64 {
    DEFAULT_ACCEPT_DELAY.as_millis() as u64
}

fn default_disconnect_delay_ms() -> u64 {
    DEFAULT_DISCONNECT_DELAY.as_millis() as u64
}

fn default_listener_delay_ms() -> u64 {
    DEFAULT_LISTENER_DELAY.as_millis() as u64
}

fn default_min_cycle_ms() -> u64 {
    DEFAULT_MIN_CYCLE.as_millis() as u64
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY.as_millis() as u64
}

fn default_plc_address() -> String {
    "127.0.0.1".to_string()
}

fn default_slot() -> u16 {
    1
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Whether this process owns the PLC connection or talks to a gateway.
    #[serde(default)]
    pub role: Role,

    /// Address the server binds to. Required.
    #[serde(default)]
    pub listen_address: Option<IpAddr>,

    /// TCP port. Default 2102.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client addresses allowed to connect. Empty rejects everyone.
    #[serde(default)]
    pub allowed_clients: Vec<IpAddr>,

    /// Pause between accept passes, in milliseconds.
    #[serde(default = "default_accept_delay_ms")]
    pub accept_delay_ms: u64,

    /// Pause between liveness passes, in milliseconds.
    #[serde(default = "default_disconnect_delay_ms")]
    pub disconnect_delay_ms: u64,

    /// Pause between receive passes, in milliseconds.
    #[serde(default = "default_listener_delay_ms")]
    pub listener_delay_ms: u64,

    /// Minimum scan cycle, in milliseconds.
    #[serde(default = "default_min_cycle_ms")]
    pub min_cycle_ms: u64,

    /// Wait after a failed PLC connection, in milliseconds.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Change detection for blocks that do not set their own.
    #[serde(default)]
    pub change_detection: ChangeDetection,

    /// Controller connection.
    #[serde(default)]
    pub plc: PlcConfig,

    /// Blocks to acquire, in broadcast order.
    #[serde(default)]
    pub blocks: Vec<BlockConfig>,
}

/// Controller connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlcConfig {
    /// Controller IP address or host name.
    #[serde(default = "default_plc_address")]
    pub address: String,
    /// Rack number.
    #[serde(default)]
    pub rack: u16,
    /// Slot number.
    #[serde(default = "default_slot")]
    pub slot: u16,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            address: default_plc_address(),
            rack: 0,
            slot: default_slot(),
        }
    }
}

/// One block and the variables laid out in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Block number on the controller.
    pub num: u16,
    /// Block length in bytes.
    pub length: usize,
    /// Overrides the top-level change detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_detection: Option<ChangeDetection>,
    /// Variables, in layout order.
    #[serde(default)]
    pub variables: Vec<VariableConfig>,
}

/// A named variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableConfig {
    /// Unique variable name.
    pub name: String,
    /// Value kind.
    pub kind: ValueKind,
}

impl GatewayConfig {
    /// Reads and parses a YAML file. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Io` if the file cannot be read or
    /// `GatewayError::Config` if it is not a valid configuration document.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents).map_err(|e| {
            GatewayError::config(format!("{}: {}", path.display(), e))
        })
    }

    /// Parses a YAML document. Does not validate.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yml::from_str(yaml).map_err(|e| GatewayError::config(e.to_string()))
    }

    /// Serializes the configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yml::to_string(self).map_err(|e| GatewayError::config(e.to_string()))
    }

    /// Checks everything that would make the gateway unable to start.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` when the listen address is missing, no
    /// block is configured, a block is empty, too large or listed twice, a
    /// variable name is reused, or a block's variables do not fit in it.
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.is_none() {
            return Err(GatewayError::config("listen_address is required"));
        }
        if self.blocks.is_empty() {
            return Err(GatewayError::config("at least one block is required"));
        }
        if self.allowed_clients.is_empty() {
            warn!("allowed_clients is empty, every client will be rejected");
        }

        let mut numbers = HashSet::new();
        let mut names = HashSet::new();
        for block in &self.blocks {
            if block.length == 0 || block.length > MAX_CHUNK_PAYLOAD {
                return Err(GatewayError::config(format!(
                    "block {} length must be 1-{}, got {}",
                    block.num, MAX_CHUNK_PAYLOAD, block.length
                )));
            }
            if !numbers.insert(block.num) {
                return Err(GatewayError::config(format!(
                    "block {} is listed twice",
                    block.num
                )));
            }
            for var in &block.variables {
                if !names.insert(var.name.as_str()) {
                    return Err(GatewayError::config(format!(
                        "variable '{}' is defined twice",
                        var.name
                    )));
                }
            }
            let used = block.bits_used();
            if used > block.length as u64 * 8 {
                return Err(GatewayError::config(format!(
                    "variables of block {} need {} bits, block has {}",
                    block.num,
                    used,
                    block.length * 8
                )));
            }
        }
        Ok(())
    }

    /// Returns the server settings.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if `listen_address` is missing.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let address = self
            .listen_address
            .ok_or_else(|| GatewayError::config("listen_address is required"))?;
        let mut config = ServerConfig::new(address, self.port)
            .with_accept_delay(Duration::from_millis(self.accept_delay_ms))
            .with_disconnect_delay(Duration::from_millis(self.disconnect_delay_ms))
            .with_listener_delay(Duration::from_millis(self.listener_delay_ms));
        config.allowed.extend(self.allowed_clients.iter().copied());
        Ok(config)
    }

    /// Returns the acquisition timings.
    pub fn acquisition_config(&self) -> AcquisitionConfig {
        AcquisitionConfig::new()
            .with_min_cycle(Duration::from_millis(self.min_cycle_ms))
            .with_reconnect_delay(Duration::from_millis(self.reconnect_delay_ms))
    }

    /// Returns the change detection that applies to `block`.
    pub fn detection_for(&self, block: &BlockConfig) -> ChangeDetection {
        block.change_detection.unwrap_or(self.change_detection)
    }

    /// A small working configuration, printed by `--print-sample`.
    pub fn sample() -> Self {
        let var = |name: &str, kind| VariableConfig {
            name: name.to_string(),
            kind,
        };
        Self {
            role: Role::Server,
            listen_address: Some(IpAddr::from([0, 0, 0, 0])),
            port: DEFAULT_PORT,
            allowed_clients: vec![IpAddr::from([127, 0, 0, 1])],
            accept_delay_ms: default_accept_delay_ms(),
            disconnect_delay_ms: default_disconnect_delay_ms(),
            listener_delay_ms: default_listener_delay_ms(),
            min_cycle_ms: default_min_cycle_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            change_detection: ChangeDetection::Differential,
            plc: PlcConfig {
                address: "192.168.0.1".to_string(),
                ..PlcConfig::default()
            },
            blocks: vec![
                BlockConfig {
                    num: 10,
                    length: 8,
                    change_detection: None,
                    variables: vec![
                        var("running", ValueKind::Bool),
                        var("fault", ValueKind::Bool),
                        var("speed", ValueKind::Int16),
                        var("setpoint", ValueKind::Float32),
                    ],
                },
                BlockConfig {
                    num: 20,
                    length: 4,
                    change_detection: None,
                    variables: vec![var("counter", ValueKind::Int32)],
                },
            ],
        }
    }
}

impl BlockConfig {
    /// Returns the first bit after the last variable once laid out.
    pub fn bits_used(&self) -> u64 {
        let mut cursor = 0u32;
        for var in &self.variables {
            cursor = align_up(cursor, var.kind.alignment()) + var.kind.bit_width() as u32;
        }
        cursor as u64
    }
}
