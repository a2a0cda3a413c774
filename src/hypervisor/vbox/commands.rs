//! VBoxManage wrappers

use crate::process::{CommandOutput, Executor, Invocation};
use crate::Result;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Guest property holding the first NIC's IPv4 address
pub const IP_PROPERTY: &str = "/VirtualBox/GuestInfo/Net/0/V4/IP";

const SATA: &str = "SATA";
const IDE: &str = "IDE";

/// VBoxManage operations
#[derive(Clone)]
pub struct VBoxManage {
    executor: Arc<dyn Executor>,
    timeout: Duration,
}

impl VBoxManage {
    pub fn new(executor: Arc<dyn Executor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    fn invocation(&self) -> Invocation {
        Invocation::new("VBoxManage").timeout(self.timeout)
    }

    fn run(&self, invocation: Invocation) -> Result<CommandOutput> {
        self.executor.run(&invocation)?.check(&invocation)
    }

    pub fn version(&self) -> Result<String> {
        let output = self.run(self.invocation().arg("--version"))?;
        Ok(output.stdout.trim().to_string())
    }

    /// Define and register a VM whose settings live in `{basefolder}/{name}`
    pub fn createvm(&self, name: &str, basefolder: &Path, ostype: &str) -> Result<()> {
        self.run(
            self.invocation()
                .args(["createvm", "--name", name, "--basefolder"])
                .arg(basefolder.to_string_lossy())
                .args(["--ostype", ostype, "--register"]),
        )?;
        Ok(())
    }

    pub fn configurevm(&self, name: &str, memory_mb: u64, cpus: u32) -> Result<()> {
        self.run(
            self.invocation()
                .args(["modifyvm", name, "--memory"])
                .arg(memory_mb.to_string())
                .arg("--cpus")
                .arg(cpus.to_string())
                .args(["--nic1", "nat", "--ioapic", "on"]),
        )?;
        Ok(())
    }

    pub fn create_sata(&self, name: &str) -> Result<()> {
        self.run(self.invocation().args([
            "storagectl",
            name,
            "--name",
            SATA,
            "--add",
            "sata",
            "--controller",
            "IntelAhci",
        ]))?;
        Ok(())
    }

    pub fn attach_disk(&self, name: &str, disk: &Path) -> Result<()> {
        self.run(
            self.invocation()
                .args(["storageattach", name, "--storagectl", SATA])
                .args(["--port", "0", "--device", "0", "--type", "hdd", "--medium"])
                .arg(disk.to_string_lossy()),
        )?;
        Ok(())
    }

    pub fn create_ide(&self, name: &str) -> Result<()> {
        self.run(
            self.invocation()
                .args(["storagectl", name, "--name", IDE, "--add", "ide"]),
        )?;
        Ok(())
    }

    pub fn attach_ide(&self, name: &str, port: u32, device: u32, filename: &Path) -> Result<()> {
        self.run(
            self.invocation()
                .args(["storageattach", name, "--storagectl", IDE, "--port"])
                .arg(port.to_string())
                .arg("--device")
                .arg(device.to_string())
                .args(["--type", "dvddrive", "--medium"])
                .arg(filename.to_string_lossy()),
        )?;
        Ok(())
    }

    pub fn startvm(&self, name: &str, gui: bool, timeout: Duration) -> Result<()> {
        let kind = if gui { "gui" } else { "headless" };
        self.run(
            self.invocation()
                .args(["startvm", name, "--type", kind])
                .timeout(timeout),
        )?;
        Ok(())
    }

    /// `acpipowerbutton` unless `force`, then `poweroff`
    pub fn controlvm(&self, name: &str, force: bool) -> Result<()> {
        let button = if force { "poweroff" } else { "acpipowerbutton" };
        self.run(self.invocation().args(["controlvm", name, button]))?;
        Ok(())
    }

    /// Deregister only; disk files are left for the caller to remove
    pub fn unregistervm(&self, name: &str) -> Result<()> {
        self.run(self.invocation().args(["unregistervm", name]))?;
        Ok(())
    }

    pub fn guestproperty(&self, name: &str, property: &str) -> Result<String> {
        let output = self.run(
            self.invocation()
                .args(["guestproperty", "get", name, property]),
        )?;
        Ok(output.stdout)
    }
}

/// `Value: <ip>` yields the address; anything else means not yet known.
pub fn parse_ip_property(raw: &str) -> Option<IpAddr> {
    raw.trim()
        .strip_prefix("Value: ")
        .and_then(|value| value.trim().parse().ok())
}
