//! Registered devices, by name, IMEI and path.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{
    config::ConfigDevice,
    device::{DeviceInfo, Imei},
    error::Error,
};

#[derive(Debug)]
struct Entry<D> {
    info: DeviceInfo,
    device: D,
}

/// Owns whatever represents a device (`D`), keyed by the device's identity.
///
/// Names are unique. IMEIs are unique.
#[derive(Debug)]
pub struct Registry<D> {
    configured: HashMap<Imei, String>,
    entries: Vec<Entry<D>>,
}

impl<D> Registry<D> {
    /// An empty registry which names devices as configured.
    pub fn new(devices: &[ConfigDevice]) -> Self {
        let configured = devices
            .iter()
            .filter_map(|device| match Imei::parse(&device.imei) {
                Some(imei) => Some((imei, device.name.clone())),
                None => {
                    warn!(name = %device.name, imei = %device.imei, "Ignoring configured device with a bad IMEI");
                    None
                }
            })
            .collect();

        Self {
            configured,
            entries: vec![],
        }
    }

    fn name_taken(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.info.name == name)
    }

    fn default_name(&self) -> String {
        let mut n = self.entries.len();

        loop {
            let name = format!("dongle{n}");

            // Configured names stay free for their hardware, even when it is absent.
            if !self.name_taken(&name) && !self.configured.values().any(|c| *c == name) {
                return name;
            }

            n += 1;
        }
    }

    /// Decide the identity a probed port gets.
    ///
    /// Gives [`Error::Duplicate`] if the IMEI is registered already.
    pub fn assign(&self, imei: &Imei, path: &str) -> Result<DeviceInfo, Error> {
        if let Some(existing) = self.entries.iter().find(|entry| entry.info.imei == *imei) {
            debug!(%imei, %path, existing = %existing.info.path, "IMEI already registered");

            return Err(Error::Duplicate {
                imei: imei.to_string(),
                path: path.to_owned(),
            });
        }

        let name = match self.configured.get(imei) {
            Some(name) => name.clone(),
            None => self.default_name(),
        };

        Ok(DeviceInfo {
            name,
            imei: imei.clone(),
            path: path.to_owned(),
        })
    }

    /// Register a device under an identity from [`Self::assign`].
    ///
    /// On [`Error::Duplicate`] the device is handed back.
    pub fn insert(&mut self, info: DeviceInfo, device: D) -> Result<(), (Error, D)> {
        if self
            .entries
            .iter()
            .any(|entry| entry.info.imei == info.imei || entry.info.name == info.name)
        {
            return Err((
                Error::Duplicate {
                    imei: info.imei.to_string(),
                    path: info.path,
                },
                device,
            ));
        }

        debug!(name = %info.name, imei = %info.imei, path = %info.path, "Registered");
        self.entries.push(Entry { info, device });

        Ok(())
    }

    /// The device called `name`.
    pub fn get(&self, name: &str) -> Result<&D, Error> {
        self.entries
            .iter()
            .find(|entry| entry.info.name == name)
            .map(|entry| &entry.device)
            .ok_or_else(|| Error::NotFound(format!("no device named `{name}`")))
    }

    /// The identity of the device called `name`.
    pub fn info(&self, name: &str) -> Result<&DeviceInfo, Error> {
        self.entries
            .iter()
            .find(|entry| entry.info.name == name)
            .map(|entry| &entry.info)
            .ok_or_else(|| Error::NotFound(format!("no device named `{name}`")))
    }

    /// The device with this IMEI.
    pub fn by_imei(&self, imei: &Imei) -> Option<&D> {
        self.entries
            .iter()
            .find(|entry| entry.info.imei == *imei)
            .map(|entry| &entry.device)
    }

    /// Does a registered device own this path?
    pub fn owns_path(&self, path: &str) -> bool {
        self.entries.iter().any(|entry| entry.info.path == path)
    }

    /// Unregister the device called `name`.
    pub fn remove(&mut self, name: &str) -> Result<(DeviceInfo, D), Error> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.info.name == name)
            .ok_or_else(|| Error::NotFound(format!("no device named `{name}`")))?;

        let entry = self.entries.remove(index);
        debug!(%name, "Unregistered");

        Ok((entry.info, entry.device))
    }

    /// Unregister everything.
    pub fn drain(&mut self) -> Vec<(DeviceInfo, D)> {
        self.entries
            .drain(..)
            .map(|entry| (entry.info, entry.device))
            .collect()
    }

    /// Registered devices, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceInfo, &D)> {
        self.entries.iter().map(|entry| (&entry.info, &entry.device))
    }

    /// How many devices are registered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing registered?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
