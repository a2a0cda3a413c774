//! `vmrun -T ws` wrappers

use crate::process::{CommandOutput, Executor, Invocation};
use crate::Result;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Host type passed to every vmrun call
const HOST_TYPE: &str = "ws";

#[derive(Clone)]
pub struct VmRun {
    executor: Arc<dyn Executor>,
    timeout: Duration,
}

impl VmRun {
    pub fn new(executor: Arc<dyn Executor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    fn invocation(&self, command: &str) -> Invocation {
        Invocation::new("vmrun")
            .args(["-T", HOST_TYPE, command])
            .timeout(self.timeout)
    }

    fn run(&self, invocation: Invocation) -> Result<CommandOutput> {
        self.executor.run(&invocation)?.check(&invocation)
    }

    /// Running VMs, one descriptor path per line after the count header
    pub fn list(&self) -> Result<Vec<String>> {
        let output = self.run(self.invocation("list"))?;
        Ok(output
            .stdout
            .lines()
            .skip(1)
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    pub fn start(&self, vmx: &Path, gui: bool, timeout: Duration) -> Result<()> {
        let mode = if gui { "gui" } else { "nogui" };
        self.run(
            self.invocation("start")
                .arg(vmx.to_string_lossy())
                .arg(mode)
                .timeout(timeout),
        )?;
        Ok(())
    }

    /// `soft` asks the guest to shut down, `hard` cuts power
    pub fn stop(&self, vmx: &Path, force: bool) -> Result<()> {
        let mode = if force { "hard" } else { "soft" };
        self.run(self.invocation("stop").arg(vmx.to_string_lossy()).arg(mode))?;
        Ok(())
    }

    pub fn delete_vm(&self, vmx: &Path) -> Result<()> {
        self.run(self.invocation("deleteVM").arg(vmx.to_string_lossy()))?;
        Ok(())
    }

    /// `None` while VMware Tools in the guest has not reported an address.
    pub fn guest_ip(&self, vmx: &Path) -> Result<Option<IpAddr>> {
        let invocation = self.invocation("getGuestIPAddress").arg(vmx.to_string_lossy());
        let output = self.executor.run(&invocation)?;
        if output.timed_out {
            return output.check(&invocation).map(|_| None);
        }
        if !output.is_success() {
            tracing::debug!(vmx = %vmx.display(), stdout = %output.stdout.trim(), "guest address not available");
            return Ok(None);
        }
        Ok(output.stdout.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MockExecutor;

    fn vmrun(exec: MockExecutor) -> VmRun {
        VmRun::new(Arc::new(exec), Duration::from_secs(60))
    }

    #[test]
    fn test_list() {
        let mut exec = MockExecutor::new();
        exec.expect_run()
            .withf(|inv| inv.program == "vmrun" && inv.args == ["-T", "ws", "list"])
            .returning(|_| {
                Ok(CommandOutput::success(
                    "Total running VMs: 2\n/vms/a/a.vmx\n/vms/b/b.vmx\n",
                ))
            });

        assert_eq!(vmrun(exec).list().unwrap(), vec!["/vms/a/a.vmx", "/vms/b/b.vmx"]);
    }

    #[test]
    fn test_start_and_stop_modes() {
        let mut exec = MockExecutor::new();
        exec.expect_run()
            .withf(|inv| {
                inv.args == ["-T", "ws", "start", "/vms/a/a.vmx", "nogui"]
                    && inv.timeout == Duration::from_secs(300)
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::success("")));
        exec.expect_run()
            .withf(|inv| inv.args == ["-T", "ws", "stop", "/vms/a/a.vmx", "hard"])
            .times(1)
            .returning(|_| Ok(CommandOutput::success("")));

        let run = vmrun(exec);
        let vmx = Path::new("/vms/a/a.vmx");
        run.start(vmx, false, Duration::from_secs(300)).unwrap();
        run.stop(vmx, true).unwrap();
    }

    #[test]
    fn test_guest_ip() {
        let mut exec = MockExecutor::new();
        exec.expect_run()
            .times(1)
            .returning(|_| Ok(CommandOutput::success("172.16.5.130\n")));
        exec.expect_run()
            .times(1)
            .returning(|_| Ok(CommandOutput::failure(255, "")));

        let run = vmrun(exec);
        let vmx = Path::new("/vms/a/a.vmx");
        assert_eq!(run.guest_ip(vmx).unwrap(), Some("172.16.5.130".parse().unwrap()));
        assert_eq!(run.guest_ip(vmx).unwrap(), None);
    }

    #[test]
    fn test_guest_ip_timeout_is_error() {
        let mut exec = MockExecutor::new();
        exec.expect_run().returning(|_| {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                timed_out: true,
            })
        });

        let err = vmrun(exec).guest_ip(Path::new("/vms/a/a.vmx")).unwrap_err();
        assert!(err.is_timeout());
    }
}
