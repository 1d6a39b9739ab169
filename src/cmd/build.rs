//! `linsk build`: one-shot VM image build from the Alpine installer ISO.

use tracing::{error, info};

use super::runvm::EXIT_ERROR;
use super::{create_storage, CommonFlags};
use crate::imgbuilder::BuildContext;
use crate::storage::{constants, Storage};

pub async fn cmd_build(common: &CommonFlags, overwrite: bool) -> i32 {
    let storage = match create_storage(common) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to create linsk data storage");
            return EXIT_ERROR;
        }
    };

    let vm_image_path = storage.vm_image_path();

    let removed = match Storage::check_exists_or_remove(&vm_image_path, overwrite) {
        Ok(removed) => removed,
        Err(err) => {
            error!(
                error = %format!("{err:#}"),
                "failed to check for (or remove if overwrite mode is on) existing VM image"
            );
            return EXIT_ERROR;
        }
    };

    let base_image_path = match storage.check_base_image() {
        Ok(p) => p,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to check base VM image");
            return EXIT_ERROR;
        }
    };

    let bios_path = match storage.check_vm_bios() {
        Ok(p) => p,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to check VM BIOS");
            return EXIT_ERROR;
        }
    };

    info!(
        tags = %constants::alpine_base_image_tags(),
        overwriting = removed,
        dst = %vm_image_path.display(),
        "building VM image"
    );

    let build_ctx = match BuildContext::new(
        &base_image_path,
        &vm_image_path,
        common.vm_debug,
        bios_path,
    )
    .await
    {
        Ok(ctx) => ctx,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to create new image build context");
            return EXIT_ERROR;
        }
    };

    let exit_code = build_ctx.run_cli_build().await;
    if exit_code != 0 {
        return exit_code;
    }

    info!(path = %vm_image_path.display(), "VM image built successfully");
    0
}
