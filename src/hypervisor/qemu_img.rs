//! `qemu-img` wrappers for turning a base image into a backend disk

use crate::process::{Executor, Invocation};
use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Conversions of multi-gigabyte images are slow
const CONVERT_TIMEOUT: Duration = Duration::from_secs(1800);

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    pub format: Option<String>,
}

pub struct QemuImg {
    executor: Arc<dyn Executor>,
}

impl QemuImg {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub fn info(&self, image: &Path) -> Result<ImageInfo> {
        let invocation = Invocation::new("qemu-img")
            .args(["info", "--output=json"])
            .arg(image.to_string_lossy());
        let output = self.executor.run(&invocation)?.check(&invocation)?;
        Ok(serde_json::from_str(&output.stdout)?)
    }

    pub fn convert(&self, source: &Path, destination: &Path, format: &str) -> Result<()> {
        let invocation = Invocation::new("qemu-img")
            .args(["convert", "-O", format])
            .arg(source.to_string_lossy())
            .arg(destination.to_string_lossy())
            .timeout(CONVERT_TIMEOUT);
        self.executor.run(&invocation)?.check(&invocation)?;
        Ok(())
    }

    pub fn resize(&self, image: &Path, size_gb: u64) -> Result<()> {
        let invocation = Invocation::new("qemu-img")
            .arg("resize")
            .arg(image.to_string_lossy())
            .arg(format!("{}G", size_gb));
        self.executor.run(&invocation)?.check(&invocation)?;
        Ok(())
    }

    /// Write `source` to `destination` in `format`, grown to at least `size_gb`.
    ///
    /// Images already large enough are converted directly. Smaller ones go
    /// through a qcow2 copy in `scratch_dir` that is resized first, since
    /// not every target format can be resized in place.
    pub fn prepare_disk(
        &self,
        source: &Path,
        destination: &Path,
        format: &str,
        size_gb: u64,
        scratch_dir: &Path,
    ) -> Result<()> {
        let info = self.info(source)?;
        if info.virtual_size >= size_gb.saturating_mul(GIB) {
            return self.convert(source, destination, format);
        }

        let stem = destination
            .file_stem()
            .ok_or_else(|| Error::Config(format!("bad disk path {}", destination.display())))?;
        let scratch = scratch_dir.join(format!("{}.qcow2", stem.to_string_lossy()));
        tracing::debug!(size_gb, scratch = %scratch.display(), "growing base image");

        self.convert(source, &scratch, "qcow2")?;
        let result = self
            .resize(&scratch, size_gb)
            .and_then(|()| self.convert(&scratch, destination, format));
        if let Err(e) = std::fs::remove_file(&scratch) {
            tracing::warn!(path = %scratch.display(), error = %e, "could not remove scratch image");
        }
        result
    }
}
