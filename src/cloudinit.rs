//! cloud-init NoCloud seed generation
//!
//! `user-data` is written as `#cloud-config` followed by a JSON document,
//! which cloud-init's YAML loader accepts as-is.

use crate::config::Auth;
use crate::process::{Executor, Invocation};
use crate::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the seed medium inside an instance directory
pub const SEED_ISO_NAME: &str = "seed.iso";

/// The `#cloud-config` user-data document
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CloudConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_upgrade: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runcmd: Vec<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_pwauth: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub name: String,
    pub sudo: String,
    pub shell: String,
    pub lock_passwd: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plain_text_passwd: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
}

impl CloudConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn package(mut self, name: impl Into<String>) -> Self {
        self.packages.push(name.into());
        self
    }

    pub fn runcmd<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runcmd.push(argv.into_iter().map(Into::into).collect());
        self
    }

    pub fn package_update(mut self, update: bool) -> Self {
        self.package_update = Some(update);
        self
    }

    /// Copy of this template with a login for `auth` added.
    pub fn with_auth(&self, auth: &Auth) -> Self {
        let mut config = self.clone();
        config.users.push(User {
            name: auth.username.clone(),
            sudo: "ALL=(ALL) NOPASSWD:ALL".to_string(),
            shell: "/bin/bash".to_string(),
            lock_passwd: auth.password.is_none(),
            plain_text_passwd: auth.password.clone(),
            ssh_authorized_keys: auth.ssh_keys.clone(),
        });
        if auth.password.is_some() {
            config.ssh_pwauth = Some(true);
        }
        config
    }

    pub fn render(&self) -> Result<String> {
        Ok(format!("#cloud-config\n{}\n", serde_json::to_string_pretty(self)?))
    }
}

/// The NoCloud `meta-data` document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaData {
    #[serde(rename = "instance-id")]
    pub instance_id: String,
    #[serde(rename = "local-hostname")]
    pub local_hostname: String,
}

impl MetaData {
    pub fn new(instance_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            local_hostname: hostname.into(),
        }
    }

    pub fn render(&self) -> Result<String> {
        Ok(format!("{}\n", serde_json::to_string_pretty(self)?))
    }
}

/// Builds the seed medium presented to the guest on first boot
pub trait SeedBuilder: Send + Sync {
    /// Returns the path of the built medium, placed inside `directory`.
    fn build(&self, directory: &Path, cloud_config: &CloudConfig, meta_data: &MetaData)
        -> Result<PathBuf>;
}

/// Masters the seed ISO with `genisoimage`
pub struct GenIsoImage {
    executor: Arc<dyn Executor>,
    program: String,
}

impl GenIsoImage {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            program: "genisoimage".to_string(),
        }
    }

    /// Use a different mastering tool with the same flags (e.g. `mkisofs`).
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

impl SeedBuilder for GenIsoImage {
    fn build(
        &self,
        directory: &Path,
        cloud_config: &CloudConfig,
        meta_data: &MetaData,
    ) -> Result<PathBuf> {
        let user_data_path = directory.join("user-data");
        let meta_data_path = directory.join("meta-data");
        std::fs::write(&user_data_path, cloud_config.render()?)?;
        std::fs::write(&meta_data_path, meta_data.render()?)?;

        let seed = directory.join(SEED_ISO_NAME);
        let invocation = Invocation::new(&self.program)
            .arg("-output")
            .arg(seed.to_string_lossy())
            .args(["-volid", "cidata", "-joliet", "-rock", "-graft-points"])
            .arg(format!("user-data={}", user_data_path.display()))
            .arg(format!("meta-data={}", meta_data_path.display()));
        self.executor.run(&invocation)?.check(&invocation)?;

        tracing::info!(path = %seed.display(), "built cloud-init seed");
        Ok(seed)
    }
}
