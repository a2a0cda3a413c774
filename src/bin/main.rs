//! hyperkit CLI

use clap::{Parser, Subcommand};
use hyperkit::{ImageLibrary, ImageSource, LibraryConfig, MachineInstance, MachineSpec};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hyperkit")]
#[command(about = "Disposable cloud-init machines on VirtualBox and VMware", long_about = None)]
struct Cli {
    /// Root directory (default: $HYPERKIT_ROOT or ~/.hyperkit)
    #[arg(long, global = true)]
    directory: Option<PathBuf>,

    /// JSON library config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hypervisor backend
    #[arg(long, global = true, default_value = "vbox")]
    hypervisor: String,

    /// Log hyperkit internals at debug level
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new machine (does not start it)
    Create {
        /// Base name; the instance id adds the date
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value = "ubuntu")]
        distro: String,
        #[arg(long, default_value = "14.04")]
        release: String,
        #[arg(long, default_value = "amd64")]
        arch: String,
        /// Base image path or http(s) URL
        #[arg(long)]
        source: Option<String>,
        /// Memory in MB
        #[arg(short, long, default_value = "1024")]
        memory: u64,
        #[arg(short, long, default_value = "1")]
        cpus: u32,
        /// Disk size in GB
        #[arg(long, default_value = "20")]
        disk: u64,
        /// Public key to authorize; repeatable
        #[arg(long = "ssh-key")]
        ssh_keys: Vec<String>,
    },
    /// Start a machine
    Start {
        id: String,
        /// Open a console window
        #[arg(long)]
        gui: bool,
    },
    /// Stop a machine
    Stop {
        id: String,
        /// Power off instead of a clean shutdown
        #[arg(long)]
        force: bool,
    },
    /// Deregister a machine and delete its files
    Destroy { id: String },
    /// List machines of the selected backend
    List,
    /// Print the guest IP address
    Ip { id: String },
    /// Show registered backends and whether their tools are installed
    Backends,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("hyperkit=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hyperkit=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => LibraryConfig::load(path)?,
        None => LibraryConfig::new(),
    };
    if let Some(directory) = cli.directory {
        config = config.root(directory);
    }
    let library = ImageLibrary::with_config(config)?;
    let backend = cli.hypervisor.as_str();

    match cli.command {
        Commands::Create {
            name,
            distro,
            release,
            arch,
            source,
            memory,
            cpus,
            disk,
            ssh_keys,
        } => {
            let mut builder = MachineSpec::builder()
                .name(name)
                .distro(distro)
                .release(release)
                .arch(arch)
                .memory_mb(memory)
                .cpu_count(cpus)
                .disk_gb(disk);
            if let Some(source) = source {
                builder = builder.source(ImageSource::parse(&source));
            }
            for key in ssh_keys {
                builder = builder.ssh_key(key);
            }
            let spec = builder.build_validated()?;

            let machine = library.create(backend, &spec)?;
            println!("{}", machine.id());
        }
        Commands::Start { id, gui } => {
            library.load(backend, &id)?.start(gui)?;
            println!("Machine '{}' started", id);
        }
        Commands::Stop { id, force } => {
            library.load(backend, &id)?.stop(force)?;
            println!("Machine '{}' stopped", id);
        }
        Commands::Destroy { id } => {
            library.load(backend, &id)?.destroy()?;
            println!("Machine '{}' destroyed", id);
        }
        Commands::List => {
            let machines = library.instances(backend)?;
            print_machines(&machines);
        }
        Commands::Ip { id } => {
            let ip = library.load(backend, &id)?.ip()?;
            println!("{}", ip);
        }
        Commands::Backends => {
            println!("{:<10} {:<10}", "BACKEND", "PRESENT");
            for name in library.backends() {
                let present = library.get_builder(&name)?.present();
                println!("{:<10} {:<10}", name, if present { "yes" } else { "no" });
            }
        }
    }

    Ok(())
}

fn print_machines(machines: &[Box<dyn MachineInstance>]) {
    if machines.is_empty() {
        println!("No machines found.");
        return;
    }
    println!("{:<40} {:<10} {}", "ID", "BACKEND", "DIRECTORY");
    println!("{}", "-".repeat(70));
    for machine in machines {
        println!(
            "{:<40} {:<10} {}",
            machine.id(),
            machine.backend(),
            machine.directory().display()
        );
    }
}
