//! Hypervisor backends and the machine lifecycle they share
//!
//! Every backend implements [`Hypervisor`] and hands out
//! [`MachineInstance`]s. Backends are independent types selected by name
//! through the [`ImageLibrary`](crate::ImageLibrary) registry.

pub mod qemu_img;
pub mod vbox;
pub mod vmware;

use crate::cloudinit::{CloudConfig, SeedBuilder};
use crate::config::MachineSpec;
use crate::image::ImageFetcher;
use crate::process::Executor;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of a machine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Running,
    Stopped,
    Destroyed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Created => write!(f, "Created"),
            InstanceState::Running => write!(f, "Running"),
            InstanceState::Stopped => write!(f, "Stopped"),
            InstanceState::Destroyed => write!(f, "Destroyed"),
        }
    }
}

/// One provisioned virtual machine
pub trait MachineInstance: Send + Sync {
    fn id(&self) -> &str;

    /// Name of the backend that owns this instance
    fn backend(&self) -> &str;

    /// The instance directory
    fn directory(&self) -> &Path;

    fn state(&self) -> InstanceState;

    fn start(&self, gui: bool) -> Result<()>;

    /// `force` powers off immediately instead of pressing the power button.
    fn stop(&self, force: bool) -> Result<()>;

    /// Deregister from the backend and remove the instance directory.
    fn destroy(&self) -> Result<()>;

    /// Guest IP address, or `None` while the guest has not reported one.
    fn get_ip(&self) -> Result<Option<IpAddr>>;

    /// Like [`get_ip`](Self::get_ip) but a missing address is an error.
    fn ip(&self) -> Result<IpAddr> {
        self.get_ip()?
            .ok_or_else(|| Error::GuestPropertyUnavailable(self.id().to_string()))
    }
}

impl std::fmt::Debug for dyn MachineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineInstance")
            .field("backend", &self.backend())
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Lazy walk over a backend's instance directory
pub type Instances<'a> = Box<dyn Iterator<Item = Result<Box<dyn MachineInstance>>> + 'a>;

/// A virtualization product driver
pub trait Hypervisor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the management tooling is installed and answering
    fn present(&self) -> bool;

    fn create(&self, spec: &MachineSpec) -> Result<Box<dyn MachineInstance>>;

    fn load(&self, instance_id: &str) -> Result<Box<dyn MachineInstance>>;

    /// Every instance currently on disk. Call again to restart.
    fn instances(&self) -> Result<Instances<'_>>;
}

/// Collaborators and directories a backend is built with
#[derive(Clone)]
pub struct BackendContext {
    pub executor: Arc<dyn Executor>,
    pub seeds: Arc<dyn SeedBuilder>,
    pub images: Arc<dyn ImageFetcher>,
    /// `root/instances/{backend}`
    pub instance_dir: PathBuf,
    /// `root/library`
    pub image_dir: PathBuf,
    /// `root/temp`
    pub temp_dir: PathBuf,
}

/// Deadlines for backend commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Plain management calls
    pub management: Duration,
    /// Calls that wait on the guest, e.g. start with tools
    pub guest: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            management: crate::process::DEFAULT_TIMEOUT,
            guest: Duration::from_secs(300),
        }
    }
}

/// Distro to backend OS-type table with a generic fallback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsTypes {
    types: HashMap<String, String>,
    fallback: String,
}

impl OsTypes {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            types: HashMap::new(),
            fallback: fallback.into(),
        }
    }

    pub fn with(mut self, distro: impl Into<String>, os_type: impl Into<String>) -> Self {
        self.types.insert(distro.into(), os_type.into());
        self
    }

    pub fn lookup(&self, distro: &str) -> &str {
        self.types.get(distro).unwrap_or(&self.fallback)
    }
}

/// Per-backend tables, passed in at construction
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub os_types: OsTypes,
    /// cloud-config template per distro
    pub cloud_configs: HashMap<String, CloudConfig>,
    /// Guest tools medium attached next to the seed
    pub guest_tools: Option<PathBuf>,
    pub timeouts: Timeouts,
}

impl BackendSettings {
    /// cloud-config for `distro`; unknown distros are a hard error
    pub fn cloud_config(&self, distro: &str) -> Result<&CloudConfig> {
        self.cloud_configs
            .get(distro)
            .ok_or_else(|| Error::SystemNotKnown(format!("distro {}", distro)))
    }
}

/// Shared state cell of an instance
#[derive(Debug, Clone)]
pub(crate) struct Lifecycle {
    instance_id: String,
    state: Arc<RwLock<InstanceState>>,
}

impl Lifecycle {
    pub(crate) fn new(instance_id: &str, state: InstanceState) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub(crate) fn state(&self) -> InstanceState {
        *self.state.read()
    }

    pub(crate) fn set(&self, state: InstanceState) {
        *self.state.write() = state;
    }

    /// Destroyed is terminal
    pub(crate) fn ensure_live(&self) -> Result<()> {
        let current = self.state();
        if current == InstanceState::Destroyed {
            Err(Error::InvalidState {
                instance: self.instance_id.clone(),
                current: current.to_string(),
                expected: "Created, Running or Stopped".into(),
            })
        } else {
            Ok(())
        }
    }

    /// Deregister, then remove `directory` even if deregistration failed.
    ///
    /// The first failure is returned and the instance stays live so the
    /// caller can retry; it is only marked destroyed when both steps succeed.
    pub(crate) fn teardown(
        &self,
        directory: &Path,
        deregister: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        self.ensure_live()?;
        tracing::info!(instance = %self.instance_id, "destroying");

        let deregistered = deregister();
        if let Err(e) = &deregistered {
            tracing::warn!(instance = %self.instance_id, error = %e, "deregistration failed, removing files anyway");
        }

        let removed = remove_tree(directory);
        if let Err(e) = &removed {
            tracing::warn!(instance = %self.instance_id, path = %directory.display(), error = %e, "could not remove instance directory");
        }

        deregistered?;
        removed?;
        self.set(InstanceState::Destroyed);
        Ok(())
    }
}

fn remove_tree(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Lazily load every subdirectory of `directory` as an instance.
pub(crate) fn scan<'a, F>(directory: &Path, load: F) -> Result<Instances<'a>>
where
    F: Fn(&str) -> Result<Box<dyn MachineInstance>> + 'a,
{
    let entries = std::fs::read_dir(directory)?;
    Ok(Box::new(entries.filter_map(move |entry| {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e.into())),
        };
        match entry.file_type() {
            Ok(t) if t.is_dir() => {}
            Ok(_) => return None,
            Err(e) => return Some(Err(e.into())),
        }
        let name = entry.file_name();
        match name.to_str() {
            Some(id) => Some(load(id)),
            None => {
                tracing::warn!(entry = ?name, "skipping non UTF-8 instance directory");
                None
            }
        }
    })))
}
