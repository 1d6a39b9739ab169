mod cmd;
mod imgbuilder;
mod nettap;
mod osspecifics;
mod qemucli;
mod share;
mod storage;
mod util;
mod vm;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{CommonFlags, LuksContainerFlags};

#[derive(Parser)]
#[command(
    name = "linsk",
    version,
    about = "Access Linux-native file system infrastructure (including LVM and LUKS) on macOS and \
             Windows. Powered by a lightweight Alpine Linux VM.",
    long_about = "Linsk is a utility that allows you to access Linux-native file system \
                  infrastructure, including device mapping technologies like LVM and LUKS, on \
                  operating systems that have little to no support for Linux's wide range of file \
                  systems. Linsk does not reimplement any file system. Instead, it utilizes a \
                  lightweight Alpine Linux VM to tap into the native Linux software ecosystem, \
                  exposing the files to the host over FTP, SMB or AFP."
)]
struct Cli {
    #[command(flatten)]
    common: CommonFlags,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (set up) a VM image for local use. This needs to be run after
    /// the initial installation.
    Build {
        /// Overwrite the existing VM image with the new build.
        #[arg(long)]
        overwrite: bool,
    },

    /// Start a VM, mount a device and expose it over a network file share.
    Run {
        /// Device passthrough spec: 'usb:<vendor_hex>,<product_hex>',
        /// 'dev:<path>' or 'dev_faulty_bs:<path>'.
        passthrough: String,

        /// Name of the device to mount inside the VM.
        #[arg(default_value = cmd::DEFAULT_VM_MOUNT_DEV_NAME)]
        dev_name: String,

        /// Filesystem type override; omit to autodetect.
        fs_type: Option<String>,

        #[command(flatten)]
        flags: cmd::RunFlags,
    },

    /// Start a VM and list all user drives within the VM. Uses the lsblk
    /// command under the hood.
    Ls {
        /// Device passthrough spec: 'usb:<vendor_hex>,<product_hex>',
        /// 'dev:<path>' or 'dev_faulty_bs:<path>'.
        passthrough: String,

        #[command(flatten)]
        luks_container: LuksContainerFlags,
    },

    /// Start a VM and access its shell. Useful for formatting drives and
    /// debugging.
    Shell {
        /// Optional device passthrough spec.
        passthrough: Option<String>,

        /// Extra TCP port forwarding rules: '<HOST PORT>:<VM PORT>' or
        /// '<HOST BIND IP>:<HOST PORT>:<VM PORT>', comma-separated.
        #[arg(long)]
        forward_ports: Option<String>,

        /// Enable host-VM tap networking.
        #[arg(long)]
        enable_net_tap: bool,
    },

    /// Remove the linsk data directory.
    Clean,

    /// Show the linsk version.
    Version,

    /// Show copyright information.
    Copyright,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Build { overwrite } => cmd::cmd_build(&cli.common, overwrite).await,
        Commands::Run {
            passthrough,
            dev_name,
            fs_type,
            flags,
        } => cmd::cmd_run(&cli.common, flags, passthrough, dev_name, fs_type).await,
        Commands::Ls {
            passthrough,
            luks_container,
        } => cmd::cmd_ls(&cli.common, luks_container, passthrough).await,
        Commands::Shell {
            passthrough,
            forward_ports,
            enable_net_tap,
        } => cmd::cmd_shell(&cli.common, passthrough, forward_ports, enable_net_tap).await,
        Commands::Clean => cmd::cmd_clean(&cli.common).await,
        Commands::Version => cmd::cmd_version(),
        Commands::Copyright => cmd::cmd_copyright(),
    };

    std::process::exit(exit_code);
}
