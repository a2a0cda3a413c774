//! hyperkit
//!
//! Provision disposable Linux virtual machines from cloud images on local
//! desktop hypervisors. Each machine gets a dated instance id, a disk
//! converted from a base image, and a cloud-init seed medium that sets up
//! users and guest tools on first boot.
//!
//! # Backends
//!
//! - **vbox** - VirtualBox, configured through `VBoxManage`
//! - **vmware** - VMware Workstation, a `.vmx` descriptor driven by `vmrun`
//!
//! # Example
//!
//! ```no_run
//! use hyperkit::{ImageLibrary, ImageSource, MachineSpec};
//!
//! let library = ImageLibrary::new()?;
//!
//! let spec = MachineSpec::builder()
//!     .name("web")
//!     .distro("ubuntu")
//!     .release("14.04")
//!     .source(ImageSource::parse("/srv/images/trusty-server-cloudimg-amd64-disk1.img"))
//!     .memory_mb(2048)
//!     .build_validated()?;
//!
//! let machine = library.create("vbox", &spec)?;
//! machine.start(false)?;
//!
//! // Wait for the guest to report its address...
//!
//! machine.destroy()?;
//! # Ok::<(), hyperkit::Error>(())
//! ```

pub mod cloudinit;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod identity;
pub mod image;
pub mod library;
pub mod process;
pub mod vmx;

pub use config::{ImageSource, MachineSpec};
pub use error::{Error, Result};
pub use hypervisor::{Hypervisor, InstanceState, MachineInstance};
pub use library::{ImageLibrary, LibraryConfig};
pub use vmx::Vmx;
