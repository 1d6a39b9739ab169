//! CLI command bodies and the orchestration shared between them.

pub mod passthrough;
pub mod prompt;
pub mod runvm;

mod build;
mod clean;
mod ls;
mod run;
mod shell;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use ls::cmd_ls;
pub use run::{cmd_run, RunFlags};
pub use shell::cmd_shell;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::{error, info, warn};

use crate::nettap::{self, TapManager};
use crate::osspecifics;
use crate::share::NetTapRuntime;
use crate::storage::Storage;
use crate::vm::{Config, DriveConfig, FileManager, PortForwardingRule, TapConfig, Vm};
use runvm::{VmHandles, EXIT_ERROR};

pub const DEFAULT_MEM_ALLOC: u32 = 512;
pub const DEFAULT_MEM_ALLOC_LUKS: u32 = 2048;
pub const DEFAULT_VM_MOUNT_DEV_NAME: &str = "vdb";

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct CommonFlags {
    /// Data directory (folder) to use. VM images and related work files are
    /// stored here.
    #[arg(long, short = 'd', global = true)]
    pub data_dir: Option<PathBuf>,

    /// Enable VM debug mode: shows the VM display and passes QEMU
    /// warnings/errors through to stderr. You can log in with the root user
    /// and no password.
    #[arg(long, global = true)]
    pub vm_debug: bool,

    /// Allow the VM to connect to the internet.
    #[arg(long, global = true)]
    pub vm_unrestricted_networking: bool,

    /// VM memory allocation in MiB (raised to 2048 in LUKS mode).
    #[arg(long, global = true, default_value_t = DEFAULT_MEM_ALLOC)]
    pub vm_mem_alloc: u32,

    /// VM OS-up timeout in seconds.
    #[arg(long, global = true, default_value_t = 30)]
    pub vm_os_up_timeout: u32,

    /// VM SSH server setup timeout in seconds. Cannot be lower than the
    /// OS-up timeout.
    #[arg(long, global = true, default_value_t = 60)]
    pub vm_ssh_setup_timeout: u32,
}

impl CommonFlags {
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        default_data_dir()
    }
}

/// LUKS container selection shared by `run` and `ls`.
#[derive(Args, Debug, Clone)]
pub struct LuksContainerFlags {
    /// Device path (without the "dev/" prefix) to preopen as a LUKS
    /// container (password will be prompted). Useful for accessing LVM
    /// partitions behind LUKS.
    #[arg(long)]
    pub luks_container: Option<String>,

    /// Like --luks-container, but assumes the entire passed-through volume
    /// is a LUKS container (password will be prompted).
    #[arg(long, short = 'c')]
    pub luks_container_entire_drive: bool,

    /// Allow VM memory allocation lower than 2048 MiB when LUKS is enabled.
    #[arg(long)]
    pub allow_luks_low_memory: bool,
}

impl LuksContainerFlags {
    /// Resolve the container device, if any. The explicit and
    /// entire-drive forms are mutually exclusive.
    pub fn container_device(&self) -> Result<Option<String>> {
        if self.luks_container.is_some() && self.luks_container_entire_drive {
            bail!("--luks-container and --luks-container-entire-drive (-c) cannot be both specified at once");
        }

        if let Some(container) = &self.luks_container {
            return Ok(Some(container.clone()));
        }
        if self.luks_container_entire_drive {
            return Ok(Some(DEFAULT_VM_MOUNT_DEV_NAME.to_string()));
        }

        Ok(None)
    }
}

/// `~/Linsk` on Windows, `~/.linsk` elsewhere; a local directory as the
/// last resort when no home directory can be determined.
pub fn default_data_dir() -> PathBuf {
    let home_var = if osspecifics::is_windows() {
        "USERPROFILE"
    } else {
        "HOME"
    };

    match std::env::var_os(home_var) {
        Some(home) if !home.is_empty() => {
            let dir_name = if osspecifics::is_windows() {
                "Linsk"
            } else {
                ".linsk"
            };
            PathBuf::from(home).join(dir_name)
        }
        _ => {
            let fallback = PathBuf::from("linsk-data-dir");
            error!(
                dir = %fallback.display(),
                "failed to get user home directory, will use a local directory as a fallback"
            );
            fallback
        }
    }
}

/// The OS-native share backend: the one the host can mount without extra
/// client software or port gymnastics.
pub fn default_share_backend() -> &'static str {
    if osspecifics::is_windows() {
        "smb"
    } else if osspecifics::is_macos() {
        "afp"
    } else {
        "ftp"
    }
}

/// Memory floor for LUKS: Argon2-based key derivation routinely needs more
/// than the default allocation, so the minimum is raised silently unless
/// the user opted out.
pub fn enforce_luks_memory_floor(luks_active: bool, allow_low_memory: bool, mem_alloc: &mut u32) {
    if !luks_active || allow_low_memory {
        return;
    }

    if *mem_alloc < DEFAULT_MEM_ALLOC_LUKS {
        if *mem_alloc != DEFAULT_MEM_ALLOC {
            warn!(
                min = DEFAULT_MEM_ALLOC_LUKS,
                specified = *mem_alloc,
                "enforcing minimum LUKS memory allocation. Please add --allow-luks-low-memory to disable this"
            );
        }
        *mem_alloc = DEFAULT_MEM_ALLOC_LUKS;
    }
}

pub fn create_storage(common: &CommonFlags) -> Result<Storage> {
    let data_dir = common.resolved_data_dir();
    Storage::new(&data_dir).with_context(|| {
        format!("create linsk data storage (data dir '{}')", data_dir.display())
    })
}

struct TapState {
    manager: TapManager,
    name: String,
    runtime: Arc<NetTapRuntime>,
}

/// Allocate, create and address a tap interface for this run, pruning any
/// interfaces left behind by dead processes first.
async fn setup_tap(storage: &Storage) -> Result<TapState> {
    let manager = TapManager::new().context("create network tap manager")?;

    let known_allocs = storage
        .list_net_tap_allocations()
        .context("list net tap allocations")?;

    match manager.prune_taps(&known_allocs).await {
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to prune dangling network taps");
        }
        Ok(removed) => {
            for tap_name in removed {
                if let Err(err) = storage.release_net_tap_allocation(&tap_name) {
                    error!(
                        error = %format!("{err:#}"),
                        tap = %tap_name,
                        "failed to release a dangling net tap allocation"
                    );
                }
            }
        }
    }

    let tap_name = nettap::new_unique_name().await;

    storage
        .save_net_tap_allocation(&tap_name, std::process::id())
        .context("save net tap allocation")?;

    if let Err(err) = manager.create_tap(&tap_name).await {
        if let Err(release_err) = storage.release_net_tap_allocation(&tap_name) {
            error!(
                error = %format!("{release_err:#}"),
                tap = %tap_name,
                "failed to release net tap allocation"
            );
        }
        return Err(err).context("create new tap");
    }

    let net = nettap::generate_net();

    if let Err(err) = manager.configure_net(&tap_name, &net.host_cidr).await {
        teardown_tap_interface(&manager, storage, &tap_name).await;
        return Err(err).context("configure tap net");
    }

    Ok(TapState {
        manager,
        runtime: Arc::new(NetTapRuntime {
            name: tap_name.clone(),
            net,
        }),
        name: tap_name,
    })
}

async fn teardown_tap_interface(manager: &TapManager, storage: &Storage, tap_name: &str) {
    if let Err(err) = manager.delete_tap(tap_name).await {
        error!(
            error = %format!("{err:#}"),
            tap = %tap_name,
            "failed to clean up net tap"
        );
        return;
    }

    if let Err(err) = storage.release_net_tap_allocation(tap_name) {
        error!(
            error = %format!("{err:#}"),
            tap = %tap_name,
            "failed to release net tap allocation"
        );
    }
}

/// The orchestration every VM-running command shares: locate the built
/// image, resolve passthrough, set up tap networking when requested, boot
/// the VM and run `op` against it.
pub async fn prepare_and_run_vm<F, Fut>(
    common: &CommonFlags,
    passthrough_arg: Option<&str>,
    extra_port_forwarding_rules: Vec<PortForwardingRule>,
    unrestricted_networking: bool,
    with_net_tap: bool,
    init_file_manager: bool,
    op: F,
) -> i32
where
    F: FnOnce(VmHandles) -> Fut,
    Fut: Future<Output = i32>,
{
    let storage = match create_storage(common) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to create linsk data storage");
            return EXIT_ERROR;
        }
    };

    let vm_image_path = match storage.check_vm_image_exists() {
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to check whether VM image exists");
            return EXIT_ERROR;
        }
        Ok(None) => {
            error!(
                "VM image does not exist. You need to build it first before attempting to start \
                 linsk. Please run `linsk build` first."
            );
            return EXIT_ERROR;
        }
        Ok(Some(path)) => path,
    };

    let bios_path = match storage.check_vm_bios() {
        Ok(p) => p,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to check VM BIOS");
            return EXIT_ERROR;
        }
    };

    let passthrough_config = match passthrough_arg {
        None => Default::default(),
        Some(arg) => {
            match osspecifics::check_run_as_root().await {
                Err(err) => {
                    error!(error = %format!("{err:#}"), "failed to check whether the program is run as root");
                    return EXIT_ERROR;
                }
                Ok(false) => {
                    error!("device passthrough of any type requires root (admin) privileges");
                    return EXIT_ERROR;
                }
                Ok(true) => {}
            }

            match passthrough::parse_spec(arg) {
                Ok(cfg) => {
                    passthrough::warn_usb_quirks(&cfg);
                    cfg
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "failed to get device passthrough config");
                    return EXIT_ERROR;
                }
            }
        }
    };

    let tap_state = if with_net_tap {
        match setup_tap(&storage).await {
            Ok(state) => Some(state),
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to set up tap networking");
                return EXIT_ERROR;
            }
        }
    } else {
        None
    };

    let vm_cfg = Config {
        cdrom_image_path: None,
        bios_path,
        drives: vec![DriveConfig {
            path: vm_image_path,
            snapshot_mode: true,
        }],
        memory_alloc: common.vm_mem_alloc,
        passthrough: passthrough_config,
        extra_port_forwarding_rules,
        unrestricted_networking,
        taps: tap_state
            .as_ref()
            .map(|ts| {
                vec![TapConfig {
                    name: ts.name.clone(),
                }]
            })
            .unwrap_or_default(),
        os_up_timeout: Some(Duration::from_secs(common.vm_os_up_timeout as u64)),
        ssh_up_timeout: Some(Duration::from_secs(common.vm_ssh_setup_timeout as u64)),
        debug: common.vm_debug,
        install_base_utilities: false,
    };

    let vm_instance = match Vm::new(vm_cfg).await {
        Ok(vm) => vm,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to create vm instance");
            if let Some(ts) = &tap_state {
                teardown_tap_interface(&ts.manager, &storage, &ts.name).await;
            }
            return EXIT_ERROR;
        }
    };

    let file_manager = init_file_manager.then(|| {
        Arc::new(FileManager::new(
            vm_instance.clone(),
            Box::new(|question: &str| prompt::read_password(question)),
        ))
    });

    let net_tap_runtime = tap_state.as_ref().map(|ts| ts.runtime.clone());

    let exit_code = runvm::run_vm(vm_instance, file_manager, net_tap_runtime, op).await;

    if let Some(ts) = tap_state {
        teardown_tap_interface(&ts.manager, &storage, &ts.name).await;
    }

    exit_code
}

/// The `version` command body.
pub fn cmd_version() -> i32 {
    println!(
        "Linsk {} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    0
}

/// The `copyright` command body.
pub fn cmd_copyright() -> i32 {
    println!(
        "Linsk - A utility to access Linux-native file systems on non-Linux operating systems.\n\
         Copyright (C) 2023 The Linsk Authors.\n\
         \n\
         This program is free software: you can redistribute it and/or modify\n\
         it under the terms of the GNU General Public License as published by\n\
         the Free Software Foundation, either version 3 of the License, or\n\
         (at your option) any later version.\n\
         \n\
         This program is distributed in the hope that it will be useful,\n\
         but WITHOUT ANY WARRANTY; without even the implied warranty of\n\
         MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the\n\
         GNU General Public License for more details."
    );
    0
}

/// Parse a comma-separated list of port forwarding rules.
pub fn parse_forward_port_rules(spec: &str) -> Result<Vec<PortForwardingRule>> {
    let mut rules = Vec::new();
    for (i, part) in spec.split(',').enumerate() {
        if part.is_empty() {
            continue;
        }
        let rule = PortForwardingRule::parse(part)
            .with_context(|| format!("parse port forwarding rule #{i} '{part}'"))?;
        rules.push(rule);
    }
    Ok(rules)
}

/// Log tap link details when active; shared by `run --debug-shell` and
/// `shell`.
pub fn log_tap_link(net_tap: Option<&NetTapRuntime>) {
    if let Some(tap) = net_tap {
        info!(
            host_ip = %tap.net.host_ip,
            vm_ip = %tap.net.guest_ip,
            "tap host-VM networking is active"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luks_memory_floor_is_enforced() {
        let mut mem = DEFAULT_MEM_ALLOC;
        enforce_luks_memory_floor(true, false, &mut mem);
        assert_eq!(mem, DEFAULT_MEM_ALLOC_LUKS);
    }

    #[test]
    fn luks_memory_floor_respects_opt_out() {
        let mut mem = 512;
        enforce_luks_memory_floor(true, true, &mut mem);
        assert_eq!(mem, 512);
    }

    #[test]
    fn luks_memory_floor_ignores_non_luks_runs() {
        let mut mem = 512;
        enforce_luks_memory_floor(false, false, &mut mem);
        assert_eq!(mem, 512);
    }

    #[test]
    fn luks_memory_floor_keeps_larger_allocations() {
        let mut mem = 4096;
        enforce_luks_memory_floor(true, false, &mut mem);
        assert_eq!(mem, 4096);
    }

    #[test]
    fn container_device_resolution() {
        let explicit = LuksContainerFlags {
            luks_container: Some("vdb1".into()),
            luks_container_entire_drive: false,
            allow_luks_low_memory: false,
        };
        assert_eq!(explicit.container_device().unwrap(), Some("vdb1".into()));

        let entire = LuksContainerFlags {
            luks_container: None,
            luks_container_entire_drive: true,
            allow_luks_low_memory: false,
        };
        assert_eq!(
            entire.container_device().unwrap(),
            Some(DEFAULT_VM_MOUNT_DEV_NAME.into())
        );

        let neither = LuksContainerFlags {
            luks_container: None,
            luks_container_entire_drive: false,
            allow_luks_low_memory: false,
        };
        assert_eq!(neither.container_device().unwrap(), None);

        let both = LuksContainerFlags {
            luks_container: Some("vdb1".into()),
            luks_container_entire_drive: true,
            allow_luks_low_memory: false,
        };
        assert!(both.container_device().is_err());
    }

    #[test]
    fn forward_port_rules_parse_lists() {
        let rules = parse_forward_port_rules("9000:22,127.0.0.1:9001:445").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].host_port, 9000);
        assert_eq!(rules[1].host_ip, Some("127.0.0.1".parse().unwrap()));

        assert!(parse_forward_port_rules("").unwrap().is_empty());
        assert!(parse_forward_port_rules("bogus").is_err());
    }

    #[test]
    fn default_backend_matches_host_os() {
        let backend = default_share_backend();
        if cfg!(windows) {
            assert_eq!(backend, "smb");
        } else if cfg!(target_os = "macos") {
            assert_eq!(backend, "afp");
        } else {
            assert_eq!(backend, "ftp");
        }
    }

    #[test]
    fn default_data_dir_is_under_home() {
        let dir = default_data_dir();
        let name = dir.file_name().unwrap().to_string_lossy();
        assert!(name == ".linsk" || name == "Linsk" || name == "linsk-data-dir");
    }
}
