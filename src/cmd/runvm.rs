//! The shared VM run loop: boots the supervisor, handles host interrupts,
//! waits for SSH readiness, hands control to the command-specific operation
//! and tears everything down in order.

use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::share::NetTapRuntime;
use crate::util::wait_for_true;
use crate::vm::{FileManager, Vm};

/// Exit code for a clean run.
pub const EXIT_OK: i32 = 0;
/// Exit code for fatal errors.
pub const EXIT_ERROR: i32 = 1;
/// Exit code when the user aborted the operation.
pub const EXIT_CANCELED: i32 = 2;

/// Everything a command operation gets to work with once the VM is ready.
pub struct VmHandles {
    pub vm: Arc<Vm>,
    pub file_manager: Option<Arc<FileManager>>,
    pub net_tap: Option<Arc<NetTapRuntime>>,
    /// Flips to `true` when the VM run is over (QEMU exited, whether from an
    /// interrupt-initiated shutdown or on its own). Long-running operations
    /// wait on this instead of polling.
    pub run_done: watch::Receiver<bool>,
}

/// Boot `vm` and, once SSH is ready, hand off to `op`. Returns the process
/// exit code. The interrupt counter runs for the whole duration: the first
/// SIGINT/SIGTERM cancels the VM gracefully, repeats warn, the tenth gives
/// up and exits on the spot.
pub async fn run_vm<F, Fut>(
    vm: Arc<Vm>,
    file_manager: Option<Arc<FileManager>>,
    net_tap: Option<Arc<NetTapRuntime>>,
    op: F,
) -> i32
where
    F: FnOnce(VmHandles) -> Fut,
    Fut: Future<Output = i32>,
{
    let (run_done_tx, run_done_rx) = watch::channel(false);
    let run_result: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));

    {
        let vm = vm.clone();
        let run_result = run_result.clone();
        tokio::spawn(async move {
            let result = vm.run().await;
            *run_result.lock().unwrap() = Some(result);
            let _ = run_done_tx.send(true);
        });
    }

    spawn_interrupt_handler(vm.clone(), run_done_rx.clone());

    let mut ssh_ready = vm.ssh_ready();
    let mut run_done = run_done_rx.clone();

    tokio::select! {
        _ = wait_for_true(&mut run_done) => {
            // QEMU is gone before the guest ever became usable.
            let result = run_result.lock().unwrap().take();
            return match result {
                Some(Err(err)) => {
                    error!(error = %format!("{err:#}"), "failed to start the VM");
                    EXIT_ERROR
                }
                _ => {
                    error!("operation canceled by user");
                    EXIT_CANCELED
                }
            };
        }
        _ = wait_for_true(&mut ssh_ready) => {}
    }

    let mut startup_failed = false;

    if let Some(fm) = &file_manager {
        if let Err(err) = fm.init_lvm().await {
            error!(error = %format!("{err:#}"), "failed to initialize file manager LVM");
            startup_failed = true;
        }
    }

    if !startup_failed {
        if let Some(tap) = &net_tap {
            if let Err(err) = vm
                .configure_interface_static_net("eth1", &tap.net.guest_cidr)
                .await
            {
                error!(error = %format!("{err:#}"), "failed to configure tap interface network");
                startup_failed = true;
            }
        }
    }

    let exit_code = if startup_failed {
        EXIT_ERROR
    } else {
        op(VmHandles {
            vm: vm.clone(),
            file_manager: file_manager.clone(),
            net_tap: net_tap.clone(),
            run_done: run_done_rx.clone(),
        })
        .await
    };

    if let Err(err) = vm.cancel().await {
        error!(error = %format!("{err:#}"), "failed to cancel VM");
        return EXIT_ERROR;
    }

    let mut run_done = run_done_rx;
    let _ = run_done.wait_for(|v| *v).await;

    if let Some(Err(err)) = run_result.lock().unwrap().take() {
        error!(error = %format!("{err:#}"), "failed to run the VM");
        return EXIT_ERROR;
    }

    exit_code
}

/// Count SIGINT/SIGTERM deliveries. Each one initiates (idempotent)
/// cancellation; the tenth aborts the process without waiting for anything.
fn spawn_interrupt_handler(vm: Arc<Vm>, mut done: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut count = 0u32;

        #[cfg(unix)]
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    error!(error = %err, "failed to register SIGTERM handler");
                    return;
                }
            };

        loop {
            #[cfg(unix)]
            let signal = tokio::select! {
                _ = wait_for_true(&mut done) => return,
                r = tokio::signal::ctrl_c() => r.map(|_| "SIGINT"),
                _ = sigterm.recv() => Ok("SIGTERM"),
            };
            #[cfg(not(unix))]
            let signal = tokio::select! {
                _ = wait_for_true(&mut done) => return,
                r = tokio::signal::ctrl_c() => r.map(|_| "SIGINT"),
            };

            let signal = match signal {
                Ok(name) => name,
                Err(err) => {
                    error!(error = %err, "failed to listen for interrupts");
                    return;
                }
            };

            count += 1;
            match count {
                1 => warn!(signal, "caught interrupt, safely shutting down"),
                2..=9 => warn!(
                    signal,
                    n = 10 - count,
                    "caught subsequent interrupt, please interrupt n more times to panic"
                ),
                _ => {
                    eprintln!("force interrupt");
                    std::process::exit(EXIT_CANCELED);
                }
            }

            if let Err(err) = vm.cancel().await {
                warn!(signal, error = %format!("{err:#}"), "failed to cancel VM");
            }
        }
    });
}

/// Print the share banner with the connection credentials. Written to
/// stderr so share URLs stay visible alongside log output.
pub fn print_share_banner(backend_id: &str, share_url: &str, share_pwd: &str) {
    eprintln!(
        "===========================\n\
         [Network File Share Config]\n\
         The network file share was started. Please use the credentials below to connect to the file server.\n\
         \n\
         Type: {}\n\
         URL: {share_url}\n\
         Username: linsk\n\
         Password: {share_pwd}\n\
         ===========================",
        backend_id.to_uppercase(),
    );
}

/// Wait for either the run to finish (interrupt path) or the operation to
/// be done; used by `run` to keep the share alive until the user stops it.
pub async fn wait_until_run_done(mut run_done: watch::Receiver<bool>) {
    let _ = run_done.wait_for(|v| *v).await;
    info!("the VM run is over, shutting down");
}
