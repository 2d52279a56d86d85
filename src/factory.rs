//! The process-wide device registry.
//!
//! Maps device names to live [`Device`]s, constructing each on first use
//! from the configuration through an explicit class registry — no dynamic
//! loading, classes are registered at program init (see
//! [`crate::device::unix::register_classes`]). At most one device exists
//! per name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{Config, ConnectionDesc, DeviceConfig};
use crate::connection::TransportChannels;
use crate::device::{Device, TransportFactory, NOT_CONNECTED};
use crate::error::Error;
use crate::runner::Runner;

/// Everything a device class constructor receives.
pub struct DeviceSetup {
    /// The device's name.
    pub name: String,
    /// Its resolved configuration entry (clones flattened, default
    /// connection applied).
    pub config: DeviceConfig,
    /// The runner observers of this device submit to.
    pub runner: Arc<dyn Runner>,
    /// Produces the transport on open/reconnect.
    pub transport_factory: TransportFactory,
}

/// A registered device class.
pub type DeviceConstructor = Arc<dyn Fn(DeviceSetup) -> Result<Arc<Device>, Error> + Send + Sync>;

/// Turns a connection description into a live transport. This is the seam
/// where real transport bindings (or mock wires, in tests) plug in.
pub type TransportProvider =
    Arc<dyn Fn(&str, &ConnectionDesc) -> Result<TransportChannels, Error> + Send + Sync>;

/// Registry mapping device name -> live device.
pub struct DeviceFactory {
    runner: Arc<dyn Runner>,
    transport_provider: TransportProvider,
    config: Mutex<Config>,
    classes: Mutex<HashMap<String, DeviceConstructor>>,
    devices: Mutex<HashMap<String, Arc<Device>>>,
    initial_state_timeout: Duration,
}

impl DeviceFactory {
    /// Create a factory over a validated configuration.
    pub fn new(
        config: Config,
        runner: Arc<dyn Runner>,
        transport_provider: TransportProvider,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            runner,
            transport_provider,
            config: Mutex::new(config),
            classes: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            initial_state_timeout: Duration::from_secs(30),
        })
    }

    /// Map a `device_class` id to its constructor.
    pub fn register_class(&self, class: &str, constructor: DeviceConstructor) {
        debug!(%class, "Registering device class");
        self.classes
            .lock()
            .expect("class lock")
            .insert(class.into(), constructor);
    }

    /// The live device for `name`, constructed on first call.
    ///
    /// Construction happens outside the registry lock; when the entry
    /// declares an initial state, the device is driven there before being
    /// returned.
    pub async fn get_device(&self, name: &str) -> Result<Arc<Device>, Error> {
        if let Some(device) = self.devices.lock().expect("device lock").get(name) {
            return Ok(Arc::clone(device));
        }

        let resolved = self.config.lock().expect("config lock").resolve_device(name)?;

        let constructor = self
            .classes
            .lock()
            .expect("class lock")
            .get(&resolved.device_class)
            .cloned()
            .ok_or_else(|| {
                Error::BadConfig(format!(
                    "device class `{}` is not registered",
                    resolved.device_class
                ))
            })?;

        let desc = resolved.connection_desc.clone().unwrap_or_default();
        let provider = Arc::clone(&self.transport_provider);
        let device_name = name.to_string();
        let transport_factory: TransportFactory =
            Arc::new(move || provider(&device_name, &desc));

        let initial_state = resolved.initial_state.clone();
        let setup = DeviceSetup {
            name: name.into(),
            config: resolved,
            runner: Arc::clone(&self.runner),
            transport_factory,
        };
        let device = constructor(setup)?;

        // Another caller may have raced us; their device wins, ours was
        // never opened.
        let device = {
            let mut devices = self.devices.lock().expect("device lock");
            match devices.get(name) {
                Some(existing) => Arc::clone(existing),
                None => {
                    devices.insert(name.into(), Arc::clone(&device));
                    device
                }
            }
        };

        if let Some(initial) = initial_state {
            if initial != NOT_CONNECTED && device.current_state() == NOT_CONNECTED {
                info!(device = %name, %initial, "Entering initial state");
                if let Err(failure) = device
                    .goto_state(&initial, self.initial_state_timeout)
                    .await
                {
                    self.devices.lock().expect("device lock").remove(name);
                    device.close().await;
                    return Err(failure);
                }
            }
        }

        Ok(device)
    }

    /// Add a device entry at runtime. Fails with `NameInUse` when the
    /// name already exists.
    pub fn add_device(&self, name: &str, entry: DeviceConfig) -> Result<(), Error> {
        let mut config = self.config.lock().expect("config lock");
        if config.devices.contains_key(name) {
            return Err(Error::NameInUse(name.into()));
        }

        let mut candidate = config.clone();
        candidate.devices.insert(name.into(), entry);
        candidate.validate()?;
        *config = candidate;
        Ok(())
    }

    /// Close the device and drop its entry.
    pub async fn remove_device(&self, name: &str) -> Result<(), Error> {
        let device = self
            .devices
            .lock()
            .expect("device lock")
            .remove(name)
            .ok_or_else(|| Error::BadConfig(format!("no live device `{name}`")))?;

        device.close().await;
        self.config.lock().expect("config lock").devices.remove(name);
        info!(device = %name, "Removed");
        Ok(())
    }

    /// Names of all live devices.
    pub fn live_devices(&self) -> Vec<String> {
        self.devices
            .lock()
            .expect("device lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Close every live device.
    pub async fn shutdown(&self) {
        let devices: Vec<_> = {
            let mut map = self.devices.lock().expect("device lock");
            map.drain().collect()
        };
        for (_, device) in devices {
            device.close().await;
        }
    }
}

static DEFAULT_FACTORY: OnceLock<DeviceFactory> = OnceLock::new();

/// Install the process-wide default factory. Fails if one is already
/// installed.
pub fn configure_default(factory: DeviceFactory) -> Result<&'static DeviceFactory, Error> {
    DEFAULT_FACTORY
        .set(factory)
        .map_err(|_| Error::BadConfig("default device factory already configured".into()))?;
    Ok(DEFAULT_FACTORY.get().expect("just set"))
}

/// The process-wide default factory, if one was installed.
pub fn default_factory() -> Option<&'static DeviceFactory> {
    DEFAULT_FACTORY.get()
}
