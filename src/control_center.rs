//! The Control Center owns the devices.
//! It finds them (scan), hands out call control on them (dial, hangup),
//! and takes them out of service again (remove, reset, shutdown).

use std::{
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    call::CallContext,
    config::Config,
    device::{Device, DeviceInfo, DeviceSummary},
    dial::{self, DialString},
    error::Error,
    events::Events,
    probe::{self, ProbeFailure, ProbeSettings, Probed, ScanReport},
    registry::Registry,
    reset::{self, ResetTarget, Resetter},
    serial::PortOpener,
};

/// Owner of the configuration, the registry and every device in it.
pub struct ControlCenter {
    config: Config,
    opener: Arc<dyn PortOpener>,
    registry: RwLock<Registry<Arc<Device>>>,
    events: Arc<Events>,
    resetter: Resetter,

    // Scans run one at a time.
    scan_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ControlCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlCenter")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

impl ControlCenter {
    /// A control center without devices, opening ports through `opener`.
    ///
    /// The configuration is validated.
    pub fn new(config: Config, opener: Arc<dyn PortOpener>) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self {
            registry: RwLock::new(Registry::new(&config.devices)),
            resetter: Resetter::new(config.reset.clone()),
            events: Arc::new(Events::default()),
            scan_lock: tokio::sync::Mutex::new(()),
            opener,
            config,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry<Arc<Device>>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry<Arc<Device>>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Call events of every device.
    pub fn events(&self) -> Arc<Events> {
        self.events.clone()
    }

    /// Probe every candidate port not owned by a device already,
    /// and put every new modem in service.
    ///
    /// Finding nothing is not an error.
    pub async fn scan(&self) -> ScanReport {
        let _scan = self.scan_lock.lock().await;

        let candidates = self
            .opener
            .candidates(&self.config.discovery.prefix)
            .into_iter()
            .filter(|path| !self.read().owns_path(path))
            .collect::<Vec<_>>();

        debug!(?candidates, "Scanning");

        self.scan_and_attach(&candidates).await
    }

    /// As [`Self::scan`], but only the given paths.
    pub async fn scan_paths(&self, paths: &[String]) -> ScanReport {
        let _scan = self.scan_lock.lock().await;

        self.scan_and_attach(paths).await
    }

    async fn scan_and_attach(&self, paths: &[String]) -> ScanReport {
        let settings = ProbeSettings::from(&self.config.discovery);
        let probed = probe::scan(&*self.opener, paths, &settings).await;

        let mut report = ScanReport {
            duplicates: probed.duplicates,
            failures: probed.failures,
            ..Default::default()
        };

        for found in probed.found {
            match self.attach(&found).await {
                Ok(info) => {
                    info!(name = %info.name, path = %info.path, "Device attached");
                    report.found.push(found);
                }
                Err(Error::Duplicate { .. }) => {
                    info!(path = %found.path, imei = %found.imei, "Modem already in service, skipping");
                    report.duplicates.push(found);
                }
                Err(error) => {
                    warn!(path = %found.path, %error, "Could not attach");
                    report.failures.push(ProbeFailure {
                        path: found.path,
                        error,
                    });
                }
            }
        }

        report
    }

    async fn attach(&self, probed: &Probed) -> Result<DeviceInfo, Error> {
        let info = self.read().assign(&probed.imei, &probed.path)?;

        let transport = self.opener.open(&probed.path).await?;
        let device = Device::start(
            info.clone(),
            transport,
            self.events.clone(),
            &self.config.session,
            Duration::from_millis(self.config.discovery.flush_quiet_ms),
        )
        .await?;

        let inserted = self.write().insert(info.clone(), Arc::new(device));
        if let Err((e, device)) = inserted {
            device.shutdown().await;
            return Err(e);
        }

        Ok(info)
    }

    /// The device called `name`.
    pub fn device(&self, name: &str) -> Result<Arc<Device>, Error> {
        self.read().get(name).cloned()
    }

    /// Snapshots of every device, in registration order.
    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.read()
            .iter()
            .map(|(_, device)| device.summary())
            .collect()
    }

    /// Call `number` via the device called `name`.
    ///
    /// Bad numbers and unknown devices are rejected before any I/O.
    pub async fn dial(&self, name: &str, number: &str) -> Result<CallContext, Error> {
        dial::validate_number(number)?;
        let device = self.device(name)?;

        device.dial(number).await
    }

    /// Dial a `<device>/<number>` string.
    pub async fn dial_string(&self, dial_string: &str) -> Result<CallContext, Error> {
        let DialString { device, number } = dial_string.parse()?;

        self.dial(&device, &number).await
    }

    /// Hang up the call on the device called `name`.
    pub async fn hangup(&self, name: &str) -> Result<CallContext, Error> {
        self.device(name)?.hangup().await
    }

    /// Take the device called `name` out of service and close its port.
    pub async fn remove(&self, name: &str) -> Result<DeviceInfo, Error> {
        let (info, device) = self.write().remove(name)?;
        device.shutdown().await;

        info!(%name, "Device removed");

        Ok(info)
    }

    /// Power cycle a device through the reset program.
    ///
    /// A device using the path is taken out of service first.
    /// It will be found again by a later scan.
    /// Returns the path handed to the reset program.
    pub async fn reset(&self, target: ResetTarget) -> Result<String, Error> {
        let path = match &target {
            ResetTarget::Name(name) => self.read().info(name)?.path.clone(),
            ResetTarget::Path(path) => path.clone(),
        };

        reset::validate_path(&path, &self.config.discovery.prefix)?;

        let owner = self
            .read()
            .iter()
            .find(|(info, _)| info.path == path)
            .map(|(info, _)| info.name.clone());

        if let Some(name) = owner {
            self.remove(&name).await?;
        }

        info!(%target, %path, "Resetting");
        self.resetter.reset(&path)?;

        Ok(path)
    }

    /// Stop every session and close every port.
    pub async fn shutdown(&self) {
        let devices = self.write().drain();

        futures::future::join_all(devices.into_iter().map(|(info, device)| async move {
            debug!(name = %info.name, "Shutting down");
            device.shutdown().await;
        }))
        .await;

        info!("All devices shut down");
    }
}
