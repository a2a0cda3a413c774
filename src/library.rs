//! Image library: backend registry and owner of the on-disk layout
//!
//! ```text
//! root/
//!   library/                  cached base images
//!   instances/{backend}/{id}/ one directory per machine
//!   temp/                     scratch space for disk conversion
//! ```

use crate::cloudinit::{GenIsoImage, SeedBuilder};
use crate::config::MachineSpec;
use crate::hypervisor::vbox::{self, VirtualBox};
use crate::hypervisor::vmware::{self, Vmware};
use crate::hypervisor::{BackendContext, Hypervisor, MachineInstance};
use crate::image::{CachingFetcher, ImageFetcher};
use crate::process::{Executor, SystemExecutor};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable overriding the default root
pub const ROOT_ENV: &str = "HYPERKIT_ROOT";

/// Builds a backend for the directories and collaborators of a library
pub type BackendFactory = Arc<dyn Fn(BackendContext) -> Box<dyn Hypervisor> + Send + Sync>;

/// Library configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Root of the directory tree
    pub root: PathBuf,
    /// Program used to master seed images
    pub genisoimage: String,
    /// Download timeout for remote base images, in seconds
    pub download_timeout_secs: u64,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            genisoimage: "genisoimage".to_string(),
            download_timeout_secs: 3600,
        }
    }
}

impl LibraryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON config file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn genisoimage(mut self, program: impl Into<String>) -> Self {
        self.genisoimage = program.into();
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.download_timeout_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(Error::Config("root directory cannot be empty".into()));
        }
        if self.genisoimage.is_empty() {
            return Err(Error::Config("genisoimage program cannot be empty".into()));
        }
        Ok(())
    }
}

/// `$HYPERKIT_ROOT`, else `~/.hyperkit`
fn default_root() -> PathBuf {
    if let Some(root) = std::env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(root);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hyperkit")
}

/// Registry of hypervisor backends sharing one root directory
pub struct ImageLibrary {
    config: LibraryConfig,
    registry: RwLock<BTreeMap<String, BackendFactory>>,
    executor: Arc<dyn Executor>,
    seeds: Option<Arc<dyn SeedBuilder>>,
    images: Arc<dyn ImageFetcher>,
}

impl ImageLibrary {
    /// Library at the default root with the built-in backends
    pub fn new() -> Result<Self> {
        Self::with_config(LibraryConfig::default())
    }

    pub fn with_config(config: LibraryConfig) -> Result<Self> {
        let executor = Arc::new(SystemExecutor::new()?);
        Self::with_executor(config, executor)
    }

    /// Run every external command through `executor`
    pub fn with_executor(config: LibraryConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;
        let images = Arc::new(
            CachingFetcher::new()
                .timeout(std::time::Duration::from_secs(config.download_timeout_secs)),
        );
        let library = Self {
            config,
            registry: RwLock::new(BTreeMap::new()),
            executor,
            seeds: None,
            images,
        };
        library.register(vbox::NAME, |context| Box::new(VirtualBox::new(context)));
        library.register(vmware::NAME, |context| Box::new(Vmware::new(context)));
        Ok(library)
    }

    /// Replace the seed builder (defaults to genisoimage on the executor)
    pub fn seeds(mut self, seeds: Arc<dyn SeedBuilder>) -> Self {
        self.seeds = Some(seeds);
        self
    }

    pub fn images(mut self, images: Arc<dyn ImageFetcher>) -> Self {
        self.images = images;
        self
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn image_dir(&self) -> PathBuf {
        self.config.root.join("library")
    }

    pub fn instance_dir(&self, backend: &str) -> PathBuf {
        self.config.root.join("instances").join(backend)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.config.root.join("temp")
    }

    /// Add or replace a backend under `name`
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(BackendContext) -> Box<dyn Hypervisor> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(backend = %name, "registering backend");
        self.registry.write().insert(name, Arc::new(factory));
    }

    /// Registered backend names, sorted
    pub fn backends(&self) -> Vec<String> {
        self.registry.read().keys().cloned().collect()
    }

    /// Build the backend registered under `backend`.
    ///
    /// The directory tree is created on first use; an unknown name fails
    /// before anything touches the disk.
    pub fn get_builder(&self, backend: &str) -> Result<Box<dyn Hypervisor>> {
        let factory = self
            .registry
            .read()
            .get(backend)
            .cloned()
            .ok_or_else(|| Error::SystemNotKnown(backend.to_string()))?;
        self.setup_dirs()?;
        Ok(factory(self.context(backend)))
    }

    pub fn create(&self, backend: &str, spec: &MachineSpec) -> Result<Box<dyn MachineInstance>> {
        tracing::info!(backend, name = %spec.name, "creating machine");
        self.get_builder(backend)?.create(spec)
    }

    /// Every instance of `backend` currently on disk
    pub fn instances(&self, backend: &str) -> Result<Vec<Box<dyn MachineInstance>>> {
        let hypervisor = self.get_builder(backend)?;
        hypervisor
            .instances()
            .and_then(|machines| machines.collect())
    }

    pub fn load(&self, backend: &str, instance_id: &str) -> Result<Box<dyn MachineInstance>> {
        self.get_builder(backend)?.load(instance_id)
    }

    fn setup_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.image_dir())?;
        std::fs::create_dir_all(self.temp_dir())?;
        for backend in self.registry.read().keys() {
            std::fs::create_dir_all(self.instance_dir(backend))?;
        }
        Ok(())
    }

    fn context(&self, backend: &str) -> BackendContext {
        let seeds: Arc<dyn SeedBuilder> = match &self.seeds {
            Some(seeds) => seeds.clone(),
            None => Arc::new(
                GenIsoImage::new(self.executor.clone()).program(self.config.genisoimage.clone()),
            ),
        };
        BackendContext {
            executor: self.executor.clone(),
            seeds,
            images: self.images.clone(),
            instance_dir: self.instance_dir(backend),
            image_dir: self.image_dir(),
            temp_dir: self.temp_dir(),
        }
    }
}

impl std::fmt::Debug for ImageLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLibrary")
            .field("root", &self.config.root)
            .field("backends", &self.backends())
            .finish()
    }
}
