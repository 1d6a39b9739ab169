//! `linsk ls`: boot with the device passed through and list the block
//! devices the guest sees.

use tracing::error;

use super::runvm::{EXIT_ERROR, EXIT_OK};
use super::{enforce_luks_memory_floor, prepare_and_run_vm, CommonFlags, LuksContainerFlags};

pub async fn cmd_ls(
    common: &CommonFlags,
    luks_flags: LuksContainerFlags,
    passthrough: String,
) -> i32 {
    let container_device = match luks_flags.container_device() {
        Ok(dev) => dev,
        Err(err) => {
            error!(error = %err, "bad LUKS container flags");
            return EXIT_ERROR;
        }
    };

    let mut common = common.clone();
    enforce_luks_memory_floor(
        container_device.is_some(),
        luks_flags.allow_luks_low_memory,
        &mut common.vm_mem_alloc,
    );

    prepare_and_run_vm(
        &common,
        Some(&passthrough),
        Vec::new(),
        false,
        false,
        true,
        |handles| async move {
            let fm = handles
                .file_manager
                .as_ref()
                .expect("ls always initializes the file manager");

            if let Some(container) = &container_device {
                if let Err(err) = fm.preopen_luks_container(container).await {
                    error!(error = %format!("{err:#}"), "failed to preopen LUKS container");
                    return EXIT_ERROR;
                }
            }

            match fm.lsblk().await {
                Err(err) => {
                    error!(error = %format!("{err:#}"), "failed to list block devices in the VM");
                    EXIT_ERROR
                }
                Ok(out) if out.is_empty() => {
                    println!("<empty lsblk output>");
                    EXIT_OK
                }
                Ok(out) => {
                    print!("{out}");
                    EXIT_OK
                }
            }
        },
    )
    .await
}
