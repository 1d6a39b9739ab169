//! `linsk run`: boot, mount the target filesystem and expose it over the
//! selected share backend until interrupted.

use clap::Args;
use tracing::{error, info};

use super::runvm::{self, EXIT_ERROR, EXIT_OK};
use super::{
    default_share_backend, enforce_luks_memory_floor, log_tap_link, prepare_and_run_vm,
    CommonFlags, LuksContainerFlags,
};
use crate::share::{self, Backend, RawUserConfig, ShareContext};
use crate::vm::MountConfig;

#[derive(Args, Debug, Clone)]
pub struct RunFlags {
    /// Use cryptsetup to open a LUKS volume (password will be prompted).
    #[arg(long, short = 'l')]
    pub luks: bool,

    #[command(flatten)]
    pub luks_container: LuksContainerFlags,

    /// Mount options passed to the in-guest `mount -o`.
    #[arg(long)]
    pub mount_options: Option<String>,

    /// The file share backend to use; the default is OS-specific.
    /// (available: "smb", "afp", "ftp")
    #[arg(long)]
    pub share_backend: Option<String>,

    /// IP to bind the network share port to. NOTE: for FTP, changing the
    /// bind address is not enough to connect remotely; also specify
    /// --ftp-extip.
    #[arg(long, default_value = "127.0.0.1")]
    pub share_listen: String,

    /// External IP the FTP server should advertise.
    #[arg(long, default_value = "127.0.0.1")]
    pub ftp_extip: String,

    /// Emulate external networking for the VM's SMB server. The default on
    /// Windows, whose SMB client cannot address a nonstandard port.
    #[arg(long)]
    pub smb_extern: bool,

    /// Start a VM shell while the network file share is active.
    #[arg(long)]
    pub debug_shell: bool,
}

pub async fn cmd_run(
    common: &CommonFlags,
    flags: RunFlags,
    passthrough: String,
    dev_name: String,
    fs_type: Option<String>,
) -> i32 {
    let container_device = match flags.luks_container.container_device() {
        Ok(dev) => dev,
        Err(err) => {
            error!(error = %err, "bad LUKS container flags");
            return EXIT_ERROR;
        }
    };

    let backend_id = flags
        .share_backend
        .clone()
        .unwrap_or_else(|| default_share_backend().to_string());

    let user_config = match (RawUserConfig {
        listen_ip: flags.share_listen.clone(),
        ftp_ext_ip: flags.ftp_extip.clone(),
        smb_ext_mode: flags.smb_extern || share::is_smb_ext_mode_default(),
    })
    .process(&backend_id)
    {
        Ok(uc) => uc,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to process share configuration");
            return EXIT_ERROR;
        }
    };

    let (backend, share_opts) = match Backend::new(&backend_id, &user_config) {
        Ok(v) => v,
        Err(err) => {
            error!(
                backend = %backend_id,
                error = %format!("{err:#}"),
                "failed to initialize share backend"
            );
            return EXIT_ERROR;
        }
    };

    let mut common = common.clone();
    enforce_luks_memory_floor(
        flags.luks || container_device.is_some(),
        flags.luks_container.allow_luks_low_memory,
        &mut common.vm_mem_alloc,
    );

    let unrestricted = common.vm_unrestricted_networking;
    let debug_shell = flags.debug_shell;
    let luks = flags.luks;
    let mount_options = flags.mount_options.clone();

    prepare_and_run_vm(
        &common,
        Some(&passthrough),
        share_opts.ports.clone(),
        unrestricted,
        share_opts.enable_tap,
        true,
        |handles| async move {
            let fm = handles
                .file_manager
                .as_ref()
                .expect("run always initializes the file manager");

            info!(dev = %dev_name, fs = ?fs_type, luks, "mounting the device");

            if let Err(err) = fm
                .mount(
                    &dev_name,
                    MountConfig {
                        luks_container_preopen: container_device,
                        fs_type_override: fs_type,
                        luks,
                        mount_options,
                    },
                )
                .await
            {
                error!(error = %format!("{err:#}"), "failed to mount the disk inside the VM");
                return EXIT_ERROR;
            }

            let share_pwd = share::generate_share_password();

            let share_url = match backend
                .apply(
                    &share_pwd,
                    &ShareContext {
                        file_manager: fm,
                        net_tap: handles.net_tap.as_deref(),
                    },
                )
                .await
            {
                Ok(url) => url,
                Err(err) => {
                    error!(
                        backend = %backend_id,
                        error = %format!("{err:#}"),
                        "failed to apply (start) file share backend"
                    );
                    return EXIT_ERROR;
                }
            };

            info!(backend = %backend_id, "started the network share successfully");
            runvm::print_share_banner(&backend_id, &share_url, &share_pwd);

            let mut wait_for_run = true;

            if debug_shell {
                tracing::warn!("starting a debug VM shell");
                log_tap_link(handles.net_tap.as_deref());

                let shell_result = match handles.vm.ssh() {
                    Ok(access) => access.interactive_shell().await,
                    Err(err) => Err(err),
                };

                match shell_result {
                    Ok(()) => wait_for_run = false,
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "failed to run VM shell");
                    }
                }
            }

            if wait_for_run {
                runvm::wait_until_run_done(handles.run_done).await;
            }

            EXIT_OK
        },
    )
    .await
}
