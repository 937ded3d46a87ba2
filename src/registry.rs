//! A label-keyed registry of attached devices, with an optional "current" device

use anyhow::ensure;
use log::{debug, info};

/// A device held by a [Registry]
#[derive(Debug)]
pub struct Attached<D> {
    label: String,
    name: String,
    device: D,
}

impl<D> Attached<D> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The device name, derived from the label
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }
}

/// Devices by label; at most one device per label
#[derive(Debug)]
pub struct Registry<D> {
    devices: Vec<Attached<D>>,
    current: Option<String>,
}

impl<D> Default for Registry<D> {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            current: None,
        }
    }
}

impl<D> Registry<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The name a device with this label gets
    pub fn device_name(label: &str) -> String {
        format!("rkmtd-{label}")
    }

    /// Attach the device produced by `attach` under `label`
    ///
    /// Any device already registered under `label` is detached (and dropped) first. If `attach`
    /// fails, nothing is registered.
    pub fn create_attach<F>(
        &mut self,
        label: &str,
        attach: F,
    ) -> anyhow::Result<&mut Attached<D>>
    where
        F: FnOnce() -> anyhow::Result<D>,
    {
        ensure!(!label.is_empty(), "device label must not be empty");

        if self.detach(label).is_some() {
            info!("replaced existing device {label:?}");
        }

        let device = attach()?;
        let name = Self::device_name(label);
        debug!("attached {name}");

        self.devices.push(Attached {
            label: label.to_string(),
            name,
            device,
        });

        let index = self.devices.len() - 1;
        Ok(&mut self.devices[index])
    }

    pub fn find_by_label(&self, label: &str) -> Option<&Attached<D>> {
        self.devices.iter().find(|x| x.label == label)
    }

    pub fn find_by_label_mut(&mut self, label: &str) -> Option<&mut Attached<D>> {
        self.devices.iter_mut().find(|x| x.label == label)
    }

    /// Remove the device registered under `label`, returning it
    ///
    /// If it was the current device, there is no current device afterward.
    pub fn detach(&mut self, label: &str) -> Option<D> {
        let index = self.devices.iter().position(|x| x.label == label)?;
        if self.current.as_deref() == Some(label) {
            self.current = None;
        }

        let attached = self.devices.remove(index);
        debug!("detached {}", attached.name);
        Some(attached.device)
    }

    /// Make the device registered under `label` the current one
    pub fn set_current(&mut self, label: &str) -> anyhow::Result<()> {
        ensure!(
            self.find_by_label(label).is_some(),
            "no device with label {label:?}"
        );
        self.current = Some(label.to_string());
        Ok(())
    }

    /// Forget the current device, without detaching it
    pub fn clear_current(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<&Attached<D>> {
        self.find_by_label(self.current.as_deref()?)
    }

    pub fn current_mut(&mut self) -> Option<&mut Attached<D>> {
        let label = self.current.clone()?;
        self.find_by_label_mut(&label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attached<D>> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[test]
fn test_create_find_detach() -> anyhow::Result<()> {
    let mut registry = Registry::new();
    let attached = registry.create_attach("nand", || Ok(1))?;
    assert_eq!(attached.name(), "rkmtd-nand");
    assert_eq!(*attached.device(), 1);

    registry.create_attach("spare", || Ok(2))?;
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.find_by_label("spare").map(|x| *x.device()), Some(2));
    assert!(registry.find_by_label("other").is_none());

    assert_eq!(registry.detach("nand"), Some(1));
    assert_eq!(registry.detach("nand"), None);
    assert_eq!(registry.len(), 1);
    Ok(())
}

#[test]
fn test_create_replaces() -> anyhow::Result<()> {
    let mut registry = Registry::new();
    registry.create_attach("nand", || Ok("old"))?;
    registry.set_current("nand")?;

    registry.create_attach("nand", || Ok("new"))?;
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.find_by_label("nand").map(|x| *x.device()), Some("new"));

    // The replaced device was detached, so it is no longer current
    assert!(registry.current().is_none());
    Ok(())
}

#[test]
fn test_failed_attach() {
    let mut registry: Registry<u32> = Registry::new();
    assert!(registry
        .create_attach("nand", || anyhow::bail!("no flash"))
        .is_err());
    assert!(registry.is_empty());
    assert!(registry.create_attach("", || Ok(1)).is_err());
}

#[test]
fn test_current() -> anyhow::Result<()> {
    let mut registry = Registry::new();
    assert!(registry.set_current("nand").is_err());

    registry.create_attach("nand", || Ok(7))?;
    registry.set_current("nand")?;
    assert_eq!(registry.current().map(|x| x.label()), Some("nand"));

    if let Some(current) = registry.current_mut() {
        *current.device_mut() += 1;
    }
    assert_eq!(registry.current().map(|x| *x.device()), Some(8));

    registry.detach("nand");
    assert!(registry.current().is_none());
    Ok(())
}
