//! Pre-parsed configuration structures.
//!
//! The core consumes these directly; loading them from RON is offered as a
//! convenience. `cloned_from` lets a device inherit another device's entry
//! with overrides, and `default_connection` fills in the connection
//! description where a device omits its own.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::Params;
use crate::error::Error;

/// How the per-device log file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogMode {
    /// Truncate on start.
    #[default]
    Write,
    /// Append to an existing log.
    Append,
}

/// Logging layout consumed by [`crate::logging`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Directory receiving log files.
    pub path: PathBuf,
    /// Timestamp format of log lines.
    pub date_format: String,
    /// Truncate or append.
    pub mode: LogMode,
    /// Whether the raw inbound/outbound stream is logged too.
    pub raw_log: bool,
    /// Whether failures are logged with their full chain.
    pub error_log_stack: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./logs"),
            date_format: "%H:%M:%S%.3f".into(),
            mode: LogMode::Write,
            raw_log: true,
            error_log_stack: false,
        }
    }
}

/// Which transport binding a device connects through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDesc {
    /// Transport kind: `terminal`, `ssh`, `serial`, `mock`, ...
    pub io_type: String,
    /// Implementation variant of that kind.
    pub variant: String,
}

impl Default for ConnectionDesc {
    fn default() -> Self {
        Self {
            io_type: "terminal".into(),
            variant: "threaded".into(),
        }
    }
}

/// One configured hop of a device's state graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopConfig {
    /// Name of the command effecting the transition.
    pub execute_command: String,
    /// Parameters for that command; `expected_prompt` names the prompt of
    /// the state being entered.
    #[serde(default)]
    pub command_params: Params,
}

/// One device entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceConfig {
    /// Registered class id, e.g. `unix_remote`.
    pub device_class: String,
    /// State to enter right after construction.
    #[serde(default)]
    pub initial_state: Option<String>,
    /// Inherit another device's entry, overriding fields set here.
    #[serde(default)]
    pub cloned_from: Option<String>,
    /// Transport description; falls back to the config-wide default.
    #[serde(default)]
    pub connection_desc: Option<ConnectionDesc>,
    /// `from-state -> to-state -> hop` table.
    #[serde(default)]
    pub connection_hops: BTreeMap<String, BTreeMap<String, HopConfig>>,
    /// Load commands/events on first use instead of eagerly.
    #[serde(default)]
    pub lazy_cmds_events: bool,
    /// Class-specific options (prompts, auto-reconnect, ...).
    #[serde(default)]
    pub additional_params: Params,
}

/// The configuration consumed by the device factory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Logging layout.
    #[serde(default)]
    pub logger: LoggerConfig,
    /// Connection description applied where devices omit their own.
    #[serde(default)]
    pub default_connection: Option<ConnectionDesc>,
    /// Devices by name.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Panics if the input is not valid .ron.
    pub fn deserialize(input: &str) -> Self {
        Self::ron().from_str::<Config>(input).unwrap()
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact)
    /// fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap()
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Self {
        let s = std::fs::read_to_string(p).unwrap();

        Self::deserialize(&s)
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        let mut devices = BTreeMap::new();

        devices.insert(
            "workhorse".to_string(),
            DeviceConfig {
                device_class: "unix_local".into(),
                initial_state: Some("UNIX_LOCAL".into()),
                ..Default::default()
            },
        );

        let mut hops = BTreeMap::new();
        let mut ssh_params = Params::new();
        ssh_params.insert("host".into(), "lab-17".into());
        ssh_params.insert("login".into(), "tester".into());
        ssh_params.insert("password".into(), "secret".into());
        ssh_params.insert("expected_prompt".into(), r"lab-17\$ $".into());
        hops.insert(
            "UNIX_LOCAL".to_string(),
            BTreeMap::from([(
                "UNIX_REMOTE".to_string(),
                HopConfig {
                    execute_command: "ssh".into(),
                    command_params: ssh_params,
                },
            )]),
        );
        devices.insert(
            "lab-17".to_string(),
            DeviceConfig {
                device_class: "unix_remote".into(),
                initial_state: Some("UNIX_REMOTE".into()),
                connection_hops: hops,
                ..Default::default()
            },
        );

        devices.insert(
            "lab-18".to_string(),
            DeviceConfig {
                device_class: String::new(),
                cloned_from: Some("lab-17".into()),
                ..Default::default()
            },
        );

        Self {
            logger: LoggerConfig::default(),
            default_connection: Some(ConnectionDesc::default()),
            devices,
        }
    }

    fn check_device_classes(&self) -> Result<(), Error> {
        for (name, device) in &self.devices {
            if device.device_class.is_empty() && device.cloned_from.is_none() {
                return Err(Error::BadConfig(format!(
                    "device `{name}` has neither a device_class nor a cloned_from source"
                )));
            }
        }
        Ok(())
    }

    fn check_cloned_from(&self) -> Result<(), Error> {
        for name in self.devices.keys() {
            // Resolution walks the whole chain, so this flushes out
            // unknown sources and cycles.
            self.resolve_device(name)?;
        }
        Ok(())
    }

    fn check_hop_commands(&self) -> Result<(), Error> {
        for (name, device) in &self.devices {
            for (from, edges) in &device.connection_hops {
                for (to, hop) in edges {
                    if hop.execute_command.is_empty() {
                        return Err(Error::BadConfig(format!(
                            "device `{name}` hop `{from}` -> `{to}` names no command"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate cross-entry consistency.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_device_classes()?;
        self.check_hop_commands()?;
        self.check_cloned_from()?;

        Ok(())
    }

    /// The entry for `name` with `cloned_from` chains flattened and the
    /// default connection applied.
    pub fn resolve_device(&self, name: &str) -> Result<DeviceConfig, Error> {
        let mut chain = vec![name.to_string()];
        let mut resolved = self
            .devices
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BadConfig(format!("unknown device `{name}`")))?;

        while let Some(source_name) = resolved.cloned_from.take() {
            if chain.contains(&source_name) {
                return Err(Error::BadConfig(format!(
                    "cloned_from cycle involving `{source_name}`"
                )));
            }
            chain.push(source_name.clone());

            let source = self.devices.get(&source_name).cloned().ok_or_else(|| {
                Error::BadConfig(format!(
                    "device `{name}` is cloned from unknown `{source_name}`"
                ))
            })?;
            resolved = merge_device(source, resolved);
        }

        if resolved.connection_desc.is_none() {
            resolved.connection_desc = self.default_connection.clone();
        }
        Ok(resolved)
    }
}

/// Overlay `child` on top of `parent`: scalars set in the child win, maps
/// merge entry-wise.
fn merge_device(parent: DeviceConfig, child: DeviceConfig) -> DeviceConfig {
    let mut merged = parent;

    if !child.device_class.is_empty() {
        merged.device_class = child.device_class;
    }
    if child.initial_state.is_some() {
        merged.initial_state = child.initial_state;
    }
    if child.connection_desc.is_some() {
        merged.connection_desc = child.connection_desc;
    }
    merged.cloned_from = child.cloned_from;
    merged.lazy_cmds_events = child.lazy_cmds_events;

    for (from, edges) in child.connection_hops {
        merged
            .connection_hops
            .entry(from)
            .or_default()
            .extend(edges);
    }
    for (key, value) in child.additional_params {
        merged.additional_params.insert(key, value);
    }

    merged
}
