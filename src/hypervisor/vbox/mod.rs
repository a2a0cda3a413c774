//! VirtualBox backend, driven entirely through `VBoxManage`

mod commands;

pub use commands::{parse_ip_property, VBoxManage, IP_PROPERTY};

use super::qemu_img::QemuImg;
use super::{
    scan, BackendContext, BackendSettings, Hypervisor, InstanceState, Instances, Lifecycle,
    MachineInstance, OsTypes, Timeouts,
};
use crate::cloudinit::{CloudConfig, MetaData};
use crate::config::MachineSpec;
use crate::identity;
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const NAME: &str = "vbox";

/// Guest additions take a long time to come up
pub const GUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub const GUEST_ADDITIONS_ISO: &str = "/usr/share/virtualbox/VBoxGuestAdditions.iso";

/// A VirtualBox machine living in `{instance_dir}/{id}`
pub struct VBoxMachine {
    id: String,
    directory: PathBuf,
    manage: VBoxManage,
    timeouts: Timeouts,
    lifecycle: Lifecycle,
}

impl VBoxMachine {
    fn new(instance_dir: &Path, instance_id: &str, manage: VBoxManage, timeouts: Timeouts) -> Self {
        Self {
            id: instance_id.to_string(),
            directory: instance_dir.join(instance_id),
            manage,
            timeouts,
            lifecycle: Lifecycle::new(instance_id, InstanceState::Created),
        }
    }
}

impl MachineInstance for VBoxMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn backend(&self) -> &str {
        NAME
    }

    fn directory(&self) -> &Path {
        &self.directory
    }

    fn state(&self) -> InstanceState {
        self.lifecycle.state()
    }

    fn start(&self, gui: bool) -> Result<()> {
        self.lifecycle.ensure_live()?;
        tracing::info!(instance = %self.id, gui, "starting");
        self.manage.startvm(&self.id, gui, self.timeouts.guest)?;
        self.lifecycle.set(InstanceState::Running);
        Ok(())
    }

    fn stop(&self, force: bool) -> Result<()> {
        self.lifecycle.ensure_live()?;
        tracing::info!(instance = %self.id, force, "stopping");
        self.manage.controlvm(&self.id, force)?;
        self.lifecycle.set(InstanceState::Stopped);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.lifecycle
            .teardown(&self.directory, || self.manage.unregistervm(&self.id))
    }

    fn get_ip(&self) -> Result<Option<IpAddr>> {
        self.lifecycle.ensure_live()?;
        let raw = self.manage.guestproperty(&self.id, IP_PROPERTY)?;
        Ok(parse_ip_property(&raw))
    }
}

/// The VirtualBox hypervisor
pub struct VirtualBox {
    context: BackendContext,
    settings: BackendSettings,
    manage: VBoxManage,
    qemu_img: QemuImg,
}

impl VirtualBox {
    pub fn new(context: BackendContext) -> Self {
        Self::with_settings(context, Self::default_settings())
    }

    pub fn with_settings(context: BackendContext, settings: BackendSettings) -> Self {
        let manage = VBoxManage::new(context.executor.clone(), settings.timeouts.management);
        let qemu_img = QemuImg::new(context.executor.clone());
        Self {
            context,
            settings,
            manage,
            qemu_img,
        }
    }

    pub fn default_settings() -> BackendSettings {
        // Mount the additions medium attached on the second IDE slot and install
        let base = CloudConfig::new()
            .runcmd(["mount", "/dev/sr1", "/mnt"])
            .runcmd(["/mnt/VBoxLinuxAdditions.run"])
            .runcmd(["umount", "/mnt"]);

        let mut cloud_configs = HashMap::new();
        cloud_configs.insert("ubuntu".to_string(), base.clone().package("build-essential"));
        cloud_configs.insert("fedora".to_string(), base);

        BackendSettings {
            os_types: OsTypes::new("Linux_64")
                .with("ubuntu", "Ubuntu_64")
                .with("fedora", "Fedora_64"),
            cloud_configs,
            guest_tools: Some(PathBuf::from(GUEST_ADDITIONS_ISO)),
            timeouts: Timeouts {
                guest: GUEST_TIMEOUT,
                ..Timeouts::default()
            },
        }
    }

    fn machine(&self, instance_id: &str) -> VBoxMachine {
        VBoxMachine::new(
            &self.context.instance_dir,
            instance_id,
            self.manage.clone(),
            self.settings.timeouts,
        )
    }
}

impl Hypervisor for VirtualBox {
    fn name(&self) -> &str {
        NAME
    }

    fn present(&self) -> bool {
        match self.manage.version() {
            Ok(version) => {
                tracing::debug!(%version, "VBoxManage found");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "VBoxManage not usable");
                false
            }
        }
    }

    fn create(&self, spec: &MachineSpec) -> Result<Box<dyn MachineInstance>> {
        spec.validate()?;
        // Fail on an unknown distro before anything is written
        let cloud_config = self.settings.cloud_config(&spec.image.distro)?;

        let (instance_id, instance_dir) =
            identity::claim(&self.context.instance_dir, &spec.name, identity::today())?;
        tracing::info!(instance = %instance_id, path = %instance_dir.display(), "created directory");

        tracing::info!(instance = %instance_id, "creating virtual machine");
        self.manage.createvm(
            &instance_id,
            &self.context.instance_dir,
            self.settings.os_types.lookup(&spec.image.distro),
        )?;
        self.manage
            .configurevm(&instance_id, spec.hardware.memory_mb, spec.hardware.cpu_count)?;

        tracing::info!(instance = %instance_id, distro = %spec.image.distro, "creating disk image");
        let base = self.context.images.fetch(&spec.image, &self.context.image_dir)?;
        let disk = instance_dir.join(format!("{}_disk1.vdi", instance_id));
        self.qemu_img.prepare_disk(
            &base,
            &disk,
            "vdi",
            spec.hardware.disk_gb,
            &self.context.temp_dir,
        )?;
        self.manage.create_sata(&instance_id)?;
        self.manage.attach_disk(&instance_id, &disk)?;

        tracing::info!(instance = %instance_id, "creating cloud-init seed");
        let seed = self.context.seeds.build(
            &instance_dir,
            &cloud_config.with_auth(&spec.auth),
            &MetaData::new(&instance_id, &spec.name),
        )?;

        tracing::info!(instance = %instance_id, "attaching devices");
        self.manage.create_ide(&instance_id)?;
        self.manage.attach_ide(&instance_id, 0, 0, &seed)?;
        if let Some(tools) = &self.settings.guest_tools {
            self.manage.attach_ide(&instance_id, 0, 1, tools)?;
        }

        tracing::info!(instance = %instance_id, "machine created");
        self.load(&instance_id)
    }

    fn load(&self, instance_id: &str) -> Result<Box<dyn MachineInstance>> {
        let machine = self.machine(instance_id);
        if !machine.directory.is_dir() {
            return Err(Error::InstanceNotFound(instance_id.to_string()));
        }
        Ok(Box::new(machine))
    }

    fn instances(&self) -> Result<Instances<'_>> {
        scan(&self.context.instance_dir, move |id| {
            Ok(Box::new(self.machine(id)) as Box<dyn MachineInstance>)
        })
    }
}
