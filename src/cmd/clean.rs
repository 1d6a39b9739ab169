//! `linsk clean`: prune dangling tap interfaces, then remove the data
//! directory after confirmation.

use tracing::{error, info};

use super::runvm::{EXIT_CANCELED, EXIT_ERROR, EXIT_OK};
use super::{create_storage, prompt, CommonFlags};
use crate::nettap::{self, TapManager};

pub async fn cmd_clean(common: &CommonFlags) -> i32 {
    let storage = match create_storage(common) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to create linsk data storage");
            return EXIT_ERROR;
        }
    };

    if nettap::available() {
        match TapManager::new() {
            Err(err) => {
                error!(
                    error = %format!("{err:#}"),
                    "failed to create network tap manager, will not attempt to remove dangling tap interfaces"
                );
            }
            Ok(manager) => match storage.list_net_tap_allocations() {
                Err(err) => {
                    error!(
                        error = %format!("{err:#}"),
                        "failed to list net tap allocations, will not attempt to remove dangling tap interfaces"
                    );
                }
                Ok(allocs) => match manager.prune_taps(&allocs).await {
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "failed to prune dangling network taps");
                    }
                    Ok(removed) => {
                        if !removed.is_empty() {
                            info!(count = removed.len(), "removed dangling network taps");
                        }
                        for tap_name in removed {
                            if let Err(err) = storage.release_net_tap_allocation(&tap_name) {
                                error!(
                                    error = %format!("{err:#}"),
                                    tap = %tap_name,
                                    "failed to release removed network tap allocation"
                                );
                            }
                        }
                    }
                },
            },
        }
    }

    let rm_path = storage.data_dir_path().to_path_buf();

    let confirmed = match prompt::confirm(&format!("Will permanently remove '{}'. Proceed?", rm_path.display())) {
        Ok(v) => v,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to read answer");
            return EXIT_ERROR;
        }
    };

    if !confirmed {
        eprintln!("Aborted.");
        return EXIT_CANCELED;
    }

    if let Err(err) = std::fs::remove_dir_all(&rm_path) {
        error!(error = %err, path = %rm_path.display(), "failed to remove data directory");
        return EXIT_ERROR;
    }

    info!(path = %rm_path.display(), "deleted data directory");
    EXIT_OK
}
