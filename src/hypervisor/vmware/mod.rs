//! VMware Workstation backend
//!
//! The machine definition is a `.vmx` descriptor written directly into the
//! instance directory; `vmrun` only drives power state and deletion.

mod commands;

pub use commands::VmRun;

use super::qemu_img::QemuImg;
use super::{
    scan, BackendContext, BackendSettings, Hypervisor, InstanceState, Instances, Lifecycle,
    MachineInstance, OsTypes, Timeouts,
};
use crate::cloudinit::{CloudConfig, MetaData};
use crate::config::MachineSpec;
use crate::identity;
use crate::vmx::{self, Vmx};
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

pub const NAME: &str = "vmware";

pub const TOOLS_ISO: &str = "/usr/lib/vmware/isoimages/linux.iso";

const CONFIG_VERSION: u64 = 8;
const HARDWARE_VERSION: u64 = 10;

/// A VMware machine described by `{instance_dir}/{id}/{id}.vmx`
pub struct VmwareMachine {
    id: String,
    directory: PathBuf,
    descriptor: PathBuf,
    vmrun: VmRun,
    timeouts: Timeouts,
    lifecycle: Lifecycle,
}

impl VmwareMachine {
    fn new(instance_dir: &Path, instance_id: &str, vmrun: VmRun, timeouts: Timeouts) -> Self {
        let directory = instance_dir.join(instance_id);
        Self {
            id: instance_id.to_string(),
            descriptor: vmx::descriptor_path(&directory, instance_id),
            directory,
            vmrun,
            timeouts,
            lifecycle: Lifecycle::new(instance_id, InstanceState::Created),
        }
    }

    /// Load the descriptor as it currently is on disk
    pub fn descriptor(&self) -> Result<Vmx> {
        Vmx::open(&self.directory, &self.id)
    }
}

impl MachineInstance for VmwareMachine {
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
        self.vmrun.start(&self.descriptor, gui, self.timeouts.guest)?;
        self.lifecycle.set(InstanceState::Running);
        Ok(())
    }

    fn stop(&self, force: bool) -> Result<()> {
        self.lifecycle.ensure_live()?;
        tracing::info!(instance = %self.id, force, "stopping");
        self.vmrun.stop(&self.descriptor, force)?;
        self.lifecycle.set(InstanceState::Stopped);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.lifecycle
            .teardown(&self.directory, || self.vmrun.delete_vm(&self.descriptor))
    }

    fn get_ip(&self) -> Result<Option<IpAddr>> {
        self.lifecycle.ensure_live()?;
        self.vmrun.guest_ip(&self.descriptor)
    }
}

pub struct Vmware {
    context: BackendContext,
    settings: BackendSettings,
    vmrun: VmRun,
    qemu_img: QemuImg,
}

impl Vmware {
    pub fn new(context: BackendContext) -> Self {
        Self::with_settings(context, Self::default_settings())
    }

    pub fn with_settings(context: BackendContext, settings: BackendSettings) -> Self {
        let vmrun = VmRun::new(context.executor.clone(), settings.timeouts.management);
        let qemu_img = QemuImg::new(context.executor.clone());
        Self {
            context,
            settings,
            vmrun,
            qemu_img,
        }
    }

    pub fn default_settings() -> BackendSettings {
        let tools = CloudConfig::new()
            .package_update(true)
            .package("open-vm-tools");

        let mut cloud_configs = HashMap::new();
        cloud_configs.insert("ubuntu".to_string(), tools.clone());
        cloud_configs.insert("fedora".to_string(), tools);

        BackendSettings {
            os_types: OsTypes::new("otherlinux-64")
                .with("ubuntu", "ubuntu-64")
                .with("fedora", "fedora-64"),
            cloud_configs,
            guest_tools: Some(PathBuf::from(TOOLS_ISO)),
            timeouts: Timeouts::default(),
        }
    }

    fn machine(&self, instance_id: &str) -> VmwareMachine {
        VmwareMachine::new(
            &self.context.instance_dir,
            instance_id,
            self.vmrun.clone(),
            self.settings.timeouts,
        )
    }

    /// Initial descriptor: hardware, boot disk, seed and tools media, NAT NIC
    fn describe(
        &self,
        instance_id: &str,
        directory: &Path,
        spec: &MachineSpec,
        disk: &str,
        seed: &Path,
    ) -> Vmx {
        let mut doc = Vmx::new(directory, instance_id);
        doc.set(".encoding", "UTF-8");
        doc.set("config.version", CONFIG_VERSION);
        doc.set("virtualHW.version", HARDWARE_VERSION);
        doc.set("displayName", instance_id);
        doc.set("guestOS", self.settings.os_types.lookup(&spec.image.distro));
        doc.set("memsize", spec.hardware.memory_mb);
        doc.set("numvcpus", spec.hardware.cpu_count);

        doc.set("scsi0.present", true);
        doc.set("scsi0.virtualDev", "lsilogic");
        doc.set("scsi0:0.present", true);
        doc.set("scsi0:0.fileName", disk);

        doc.set("ide1:0.present", true);
        doc.set("ide1:0.deviceType", "cdrom-image");
        doc.set("ide1:0.fileName", seed);
        if let Some(tools) = &self.settings.guest_tools {
            doc.set("ide1:1.present", true);
            doc.set("ide1:1.deviceType", "cdrom-image");
            doc.set("ide1:1.fileName", tools.as_path());
        }

        doc.set("ethernet0.present", true);
        doc.set("ethernet0.connectionType", "nat");
        doc.set("ethernet0.virtualDev", "e1000");
        doc
    }
}

impl Hypervisor for Vmware {
    fn name(&self) -> &str {
        NAME
    }

    fn present(&self) -> bool {
        match self.vmrun.list() {
            Ok(running) => {
                tracing::debug!(running = running.len(), "vmrun found");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "vmrun not usable");
                false
            }
        }
    }

    fn create(&self, spec: &MachineSpec) -> Result<Box<dyn MachineInstance>> {
        spec.validate()?;
        let cloud_config = self.settings.cloud_config(&spec.image.distro)?;

        let (instance_id, instance_dir) =
            identity::claim(&self.context.instance_dir, &spec.name, identity::today())?;
        tracing::info!(instance = %instance_id, path = %instance_dir.display(), "created directory");

        tracing::info!(instance = %instance_id, distro = %spec.image.distro, "creating disk image");
        let base = self.context.images.fetch(&spec.image, &self.context.image_dir)?;
        let disk = format!("{}.vmdk", instance_id);
        self.qemu_img.prepare_disk(
            &base,
            &instance_dir.join(&disk),
            "vmdk",
            spec.hardware.disk_gb,
            &self.context.temp_dir,
        )?;

        tracing::info!(instance = %instance_id, "creating cloud-init seed");
        let seed = self.context.seeds.build(
            &instance_dir,
            &cloud_config.with_auth(&spec.auth),
            &MetaData::new(&instance_id, &spec.name),
        )?;

        let doc = self.describe(&instance_id, &instance_dir, spec, &disk, &seed);
        tracing::info!(instance = %instance_id, path = %doc.pathname().display(), "writing descriptor");
        doc.write()?;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudinit::SeedBuilder;
    use crate::config::ImageSpec;
    use crate::image::ImageFetcher;
    use crate::process::{CommandOutput, MockExecutor};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct StaticImage(PathBuf);

    impl ImageFetcher for StaticImage {
        fn fetch(&self, _image: &ImageSpec, _cache: &Path) -> Result<PathBuf> {
            Ok(self.0.clone())
        }
    }

    struct TouchSeed;

    impl SeedBuilder for TouchSeed {
        fn build(&self, directory: &Path, _c: &CloudConfig, _m: &MetaData) -> Result<PathBuf> {
            let path = directory.join("seed.iso");
            std::fs::write(&path, b"iso")?;
            Ok(path)
        }
    }

    fn context(temp: &TempDir, exec: MockExecutor) -> BackendContext {
        let instance_dir = temp.path().join("instances");
        std::fs::create_dir_all(&instance_dir).unwrap();
        BackendContext {
            executor: Arc::new(exec),
            seeds: Arc::new(TouchSeed),
            images: Arc::new(StaticImage(temp.path().join("base.img"))),
            instance_dir,
            image_dir: temp.path().to_path_buf(),
            temp_dir: temp.path().to_path_buf(),
        }
    }

    fn disk_executor() -> MockExecutor {
        let mut exec = MockExecutor::new();
        exec.expect_run().returning(|inv| {
            if inv.program == "qemu-img" && inv.args[0] == "info" {
                Ok(CommandOutput::success(r#"{"virtual-size": 107374182400}"#))
            } else {
                Ok(CommandOutput::success(""))
            }
        });
        exec
    }

    #[test]
    fn test_create_writes_descriptor() {
        let temp = TempDir::new().unwrap();
        let vmware = Vmware::new(context(&temp, disk_executor()));
        let spec = MachineSpec::builder()
            .name("test1")
            .distro("ubuntu")
            .memory_mb(512)
            .cpu_count(2)
            .build();

        let machine = vmware.create(&spec).unwrap();
        let id = machine.id().to_string();
        assert_eq!(id, format!("test1-{}", identity::today().format("%Y-%m-%d")));

        let doc = Vmx::open(machine.directory(), &id).unwrap();
        assert_eq!(doc["guestOS"].as_str(), Some("ubuntu-64"));
        assert_eq!(doc["memsize"].as_int(), Some(512));
        assert_eq!(doc["numvcpus"].as_int(), Some(2));
        assert_eq!(doc["displayName"].as_str(), Some(id.as_str()));
        assert_eq!(doc.section("ethernet0")["connectionType"].as_str(), Some("nat"));
        assert_eq!(doc["scsi0:0.fileName"].as_str(), Some(format!("{}.vmdk", id).as_str()));
        assert_eq!(doc["ide1:1.fileName"].as_str(), Some(TOOLS_ISO));
        assert!(doc["ide1:0.fileName"].as_str().unwrap().ends_with("seed.iso"));

        let text = std::fs::read_to_string(doc.pathname()).unwrap();
        assert!(text.contains("guestOS = \"ubuntu-64\""));
        assert!(machine.directory().join("seed.iso").exists());
    }

    #[test]
    fn test_unlisted_distro_os_type_falls_back() {
        let mut settings = Vmware::default_settings();
        settings
            .cloud_configs
            .insert("arch".to_string(), CloudConfig::new());

        let temp = TempDir::new().unwrap();
        let vmware = Vmware::with_settings(context(&temp, disk_executor()), settings);
        let spec = MachineSpec::builder().name("a").distro("arch").build();
        let machine = vmware.create(&spec).unwrap();

        let doc = Vmx::open(machine.directory(), machine.id()).unwrap();
        assert_eq!(doc["guestOS"].as_str(), Some("otherlinux-64"));
    }

    #[test]
    fn test_second_create_gets_counter_suffix() {
        let temp = TempDir::new().unwrap();
        let vmware = Vmware::new(context(&temp, disk_executor()));
        let spec = MachineSpec::builder().name("web").build();

        let first = vmware.create(&spec).unwrap();
        let second = vmware.create(&spec).unwrap();
        assert_eq!(second.id(), format!("{}-01", first.id()));
    }

    #[test]
    fn test_lifecycle_uses_descriptor_path() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let recorded = calls.clone();
        let mut exec = MockExecutor::new();
        exec.expect_run().returning(move |inv| {
            recorded.lock().push(inv.args[2..].join(" "));
            if inv.args[2] == "getGuestIPAddress" {
                return Ok(CommandOutput::success("172.16.5.130\n"));
            }
            Ok(CommandOutput::success(""))
        });

        let ctx = context(&temp, exec);
        let dir = ctx.instance_dir.join("vm1");
        std::fs::create_dir(&dir).unwrap();
        let vmx = dir.join("vm1.vmx").to_string_lossy().into_owned();
        let machine = Vmware::new(ctx).load("vm1").unwrap();

        machine.start(false).unwrap();
        assert_eq!(machine.ip().unwrap(), "172.16.5.130".parse::<IpAddr>().unwrap());
        machine.stop(true).unwrap();
        machine.destroy().unwrap();
        assert!(!dir.exists());
        assert_eq!(machine.state(), InstanceState::Destroyed);

        assert_eq!(
            *calls.lock(),
            vec![
                format!("start {} nogui", vmx),
                format!("getGuestIPAddress {}", vmx),
                format!("stop {} hard", vmx),
                format!("deleteVM {}", vmx),
            ]
        );
    }

    #[test]
    fn test_instances_lists_directories() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, disk_executor());
        std::fs::create_dir(ctx.instance_dir.join("a")).unwrap();
        std::fs::create_dir(ctx.instance_dir.join("b")).unwrap();
        std::fs::write(ctx.instance_dir.join("notes.txt"), b"").unwrap();
        let vmware = Vmware::new(ctx);

        let mut ids: Vec<String> = vmware
            .instances()
            .unwrap()
            .map(|m| m.unwrap().id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        // restartable
        assert_eq!(vmware.instances().unwrap().count(), 2);
    }
}
