//! Machine spec with builder pattern

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything needed to provision one machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    pub image: ImageSpec,
    pub hardware: Hardware,
    pub auth: Auth,
}

/// Which base image to boot, and where to get it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub distro: String,
    pub release: String,
    pub arch: String,
    pub source: Option<ImageSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    /// A disk image already on this machine
    Local(PathBuf),
    /// A disk image to download into the image cache
    Url(String),
}

impl ImageSource {
    /// Interpret `http(s)://` as a download, anything else as a local path.
    pub fn parse(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            ImageSource::Url(s.to_string())
        } else {
            ImageSource::Local(PathBuf::from(s))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hardware {
    pub memory_mb: u64,
    pub cpu_count: u32,
    pub disk_gb: u64,
}

/// Credentials handed to cloud-init
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    pub username: String,
    pub password: Option<String>,
    pub ssh_keys: Vec<String>,
}

/// Smallest memory size that boots a cloud image
pub const MIN_MEMORY_MB: u64 = 256;

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            image: ImageSpec {
                distro: "ubuntu".to_string(),
                release: "14.04".to_string(),
                arch: "amd64".to_string(),
                source: None,
            },
            hardware: Hardware {
                memory_mb: 1024,
                cpu_count: 1,
                disk_gb: 20,
            },
            auth: Auth {
                username: "hyperkit".to_string(),
                password: None,
                ssh_keys: Vec::new(),
            },
        }
    }
}

impl MachineSpec {
    pub fn builder() -> MachineSpecBuilder {
        MachineSpecBuilder::default()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::Error::Config("name cannot be empty".into()));
        }
        if self.name.contains(['/', '\\']) || self.name.starts_with('.') {
            return Err(crate::Error::Config(format!(
                "name {:?} is not a valid directory name",
                self.name
            )));
        }
        if self.image.distro.is_empty() {
            return Err(crate::Error::Config("distro cannot be empty".into()));
        }
        if self.hardware.memory_mb < MIN_MEMORY_MB {
            return Err(crate::Error::Config(format!(
                "memory must be at least {}MB",
                MIN_MEMORY_MB
            )));
        }
        if self.hardware.cpu_count < 1 {
            return Err(crate::Error::Config("cpu_count must be at least 1".into()));
        }
        if self.auth.username.is_empty() {
            return Err(crate::Error::Config("username cannot be empty".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MachineSpecBuilder {
    spec: MachineSpec,
}

impl MachineSpecBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = name.into();
        self
    }

    pub fn distro(mut self, distro: impl Into<String>) -> Self {
        self.spec.image.distro = distro.into();
        self
    }

    pub fn release(mut self, release: impl Into<String>) -> Self {
        self.spec.image.release = release.into();
        self
    }

    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.spec.image.arch = arch.into();
        self
    }

    pub fn source(mut self, source: ImageSource) -> Self {
        self.spec.image.source = Some(source);
        self
    }

    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.spec.hardware.memory_mb = mb;
        self
    }

    pub fn cpu_count(mut self, count: u32) -> Self {
        self.spec.hardware.cpu_count = count;
        self
    }

    pub fn disk_gb(mut self, gb: u64) -> Self {
        self.spec.hardware.disk_gb = gb;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.spec.auth.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.spec.auth.password = Some(password.into());
        self
    }

    pub fn ssh_key(mut self, key: impl Into<String>) -> Self {
        self.spec.auth.ssh_keys.push(key.into());
        self
    }

    pub fn build(self) -> MachineSpec {
        self.spec
    }

    pub fn build_validated(self) -> crate::Result<MachineSpec> {
        let spec = self.build();
        spec.validate()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = MachineSpec::builder()
            .name("test1")
            .distro("fedora")
            .release("20")
            .arch("x86_64")
            .memory_mb(2048)
            .cpu_count(2)
            .ssh_key("ssh-ed25519 AAAA test@host")
            .build();

        assert_eq!(spec.name, "test1");
        assert_eq!(spec.image.distro, "fedora");
        assert_eq!(spec.image.release, "20");
        assert_eq!(spec.hardware.memory_mb, 2048);
        assert_eq!(spec.hardware.cpu_count, 2);
        assert_eq!(spec.auth.ssh_keys.len(), 1);
    }

    #[test]
    fn test_spec_validation() {
        assert!(MachineSpec::builder().build().validate().is_err());
        assert!(MachineSpec::builder().name("a/b").build().validate().is_err());
        assert!(MachineSpec::builder()
            .name("test")
            .memory_mb(128)
            .build()
            .validate()
            .is_err());
        assert!(MachineSpec::builder().name("test").build_validated().is_ok());
    }

    #[test]
    fn test_image_source_parse() {
        assert_eq!(
            ImageSource::parse("https://cloud-images.ubuntu.com/x.img"),
            ImageSource::Url("https://cloud-images.ubuntu.com/x.img".into())
        );
        assert_eq!(
            ImageSource::parse("/var/images/base.qcow2"),
            ImageSource::Local(PathBuf::from("/var/images/base.qcow2"))
        );
    }

    #[test]
    fn test_spec_serialization() {
        let spec = MachineSpec::builder()
            .name("test")
            .source(ImageSource::Url("http://example.com/a.img".into()))
            .build();

        let json = serde_json::to_string(&spec).unwrap();
        let deserialized: MachineSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, spec);
    }
}
