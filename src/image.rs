//! Base image retrieval into the image cache

use crate::config::{ImageSource, ImageSpec};
use crate::{Error, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolves an image spec to a local file
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, image: &ImageSpec, cache_directory: &Path) -> Result<PathBuf>;
}

/// Returns local images in place; downloads remote ones once into the cache
#[derive(Debug, Clone)]
pub struct CachingFetcher {
    timeout: Duration,
}

impl Default for CachingFetcher {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
        }
    }
}

impl CachingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn download(&self, url: &str, destination: &Path) -> Result<()> {
        tracing::info!(%url, path = %destination.display(), "downloading base image");
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let mut response = client.get(url).send()?.error_for_status()?;

        // Stream to a side file so an interrupted download never looks cached
        let partial = destination.with_extension("part");
        let mut file = File::create(&partial)?;
        io::copy(&mut response, &mut file)?;
        file.sync_all()?;
        fs::rename(&partial, destination)?;
        Ok(())
    }
}

impl ImageFetcher for CachingFetcher {
    fn fetch(&self, image: &ImageSpec, cache_directory: &Path) -> Result<PathBuf> {
        match &image.source {
            None => Err(Error::Config(format!(
                "no image source given for {} {} {}",
                image.distro, image.release, image.arch
            ))),
            Some(ImageSource::Local(path)) => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(Error::Config(format!(
                        "base image {} does not exist",
                        path.display()
                    )))
                }
            }
            Some(ImageSource::Url(url)) => {
                let cached = cache_directory.join(cache_name(image, url));
                if cached.is_file() {
                    tracing::debug!(path = %cached.display(), "using cached base image");
                } else {
                    self.download(url, &cached)?;
                }
                Ok(cached)
            }
        }
    }
}

/// `{distro}-{release}-{arch}-{basename of url}`
pub fn cache_name(image: &ImageSpec, url: &str) -> String {
    let basename = url
        .split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').find(|segment| !segment.is_empty()))
        .unwrap_or("image");
    format!("{}-{}-{}-{}", image.distro, image.release, image.arch, basename)
}
