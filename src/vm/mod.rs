//! The VM supervisor.
//!
//! Owns the QEMU child from spawn to reap: builds the command line, detaches
//! the child into its own process group, drives the guest from power-on
//! through serial login to a bootstrapped, host-key-pinned SSH server, and
//! tears everything down gracefully first, forcibly second. While any block
//! device is passed through, a safety poller watches the host mount table
//! and kills the whole process on a double-mount.

pub mod cfg;
pub mod filemanager;
pub mod serial;
pub mod ssh;

use std::net::TcpListener;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use cfg::{
    BlockDevicePassthrough, Config, DriveConfig, PassthroughConfig, PortForwardingRule, TapConfig,
    UsbDevicePassthrough,
};
pub use filemanager::{FileManager, MountConfig};

use crate::osspecifics;
use crate::util::{log_err_msg, shell_quote, wait_for_true};
use serial::SerialConsole;
use ssh::{PinnedHostKeys, SshAccess};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VmError {
    /// SSH was requested before bootstrap completed or after cancellation.
    /// Callers check for this instead of logging it.
    #[error("ssh unavailable")]
    SshUnavailable,
    /// The instance already ran (or was canceled); a `Vm` is single-use.
    #[error("vm disposed")]
    Disposed,
}

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);
const KEYSCAN_TIMEOUT: Duration = Duration::from_secs(5);
const CANCEL_GRACE: Duration = Duration::from_secs(10);
const HOST_MOUNT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Vm {
    cfg: Config,
    binary: String,
    args: Vec<String>,

    ssh_port: u16,
    os_up_timeout: Duration,
    ssh_up_timeout: Duration,

    serial: Arc<SerialConsole>,
    ssh_access: RwLock<Option<Arc<SshAccess>>>,
    qemu_stderr: Arc<Mutex<Vec<u8>>>,

    boot_ready_tx: watch::Sender<bool>,
    ssh_ready_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
    child_exit_tx: watch::Sender<bool>,

    started: AtomicBool,
    canceled: AtomicBool,
    child_pid: AtomicU32,
}

/// A free TCP port on the loopback interface, found by binding to port zero.
fn get_free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind ephemeral listener")?;
    let port = listener.local_addr().context("get ephemeral listener addr")?.port();
    Ok(port)
}

impl Vm {
    /// Validate the config and assemble the QEMU invocation. Nothing is
    /// spawned until [`run`](Self::run).
    pub async fn new(cfg: Config) -> Result<Arc<Self>> {
        let ssh_port = get_free_port().context("get free port for ssh server")?;

        if cfg.install_base_utilities && !cfg.unrestricted_networking {
            bail!("installation of base utilities is impossible with unrestricted networking disabled");
        }

        // These defaults are deliberately conservative and are independent of
        // the CLI's own defaults; they apply when the config carries none.
        let os_up_timeout = cfg.os_up_timeout.unwrap_or(cfg::DEFAULT_OS_UP_TIMEOUT);
        let ssh_up_timeout = cfg.ssh_up_timeout.unwrap_or(cfg::DEFAULT_SSH_UP_TIMEOUT);

        if ssh_up_timeout < os_up_timeout {
            bail!("vm ssh setup timeout cannot be lower than os up timeout");
        }

        let (binary, args) = cfg::build_vm_command(&cfg, ssh_port).await?;

        let (boot_ready_tx, _) = watch::channel(false);
        let (ssh_ready_tx, _) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);
        let (child_exit_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            cfg,
            binary,
            args,
            ssh_port,
            os_up_timeout,
            ssh_up_timeout,
            serial: Arc::new(SerialConsole::new()),
            ssh_access: RwLock::new(None),
            qemu_stderr: Arc::new(Mutex::new(Vec::new())),
            boot_ready_tx,
            ssh_ready_tx,
            cancel_tx,
            child_exit_tx,
            started: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            child_pid: AtomicU32::new(0),
        }))
    }

    /// Signal that flips to `true` once SSH access is fully configured.
    /// Observers that see it may dial without racing the bootstrap.
    pub fn ssh_ready(&self) -> watch::Receiver<bool> {
        self.ssh_ready_tx.subscribe()
    }

    /// Signal that flips to `true` when the supervisor starts tearing the
    /// instance down.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    /// Authenticated SSH access, once bootstrap has completed.
    pub fn ssh(&self) -> Result<Arc<SshAccess>> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(VmError::SshUnavailable.into());
        }

        self.ssh_access
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| VmError::SshUnavailable.into())
    }

    fn serial_log_excerpt(&self) -> String {
        log_err_msg(&self.serial.scan_log(), "serial log")
    }

    fn qemu_stderr_excerpt(&self) -> String {
        let buf = self.qemu_stderr.lock().unwrap();
        log_err_msg(&String::from_utf8_lossy(&buf), "qemu stderr log")
    }

    /// Boot the VM and block until QEMU exits. Single-use: a second call (or
    /// a call after [`cancel`](Self::cancel)) returns [`VmError::Disposed`].
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) || self.canceled.load(Ordering::SeqCst) {
            return Err(VmError::Disposed.into());
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.kill_on_drop(false);
        osspecifics::set_new_process_group(&mut cmd);

        let mut child = cmd.spawn().context("start qemu cmd")?;
        let pid = child.id().context("qemu process exited immediately after spawn")?;
        self.child_pid.store(pid, Ordering::SeqCst);

        let stdin = child.stdin.take().context("take qemu stdin")?;
        let stdout = child.stdout.take().context("take qemu stdout")?;
        let stderr = child.stderr.take().context("take qemu stderr")?;

        self.serial.attach_writer(stdin).await;

        // Reader task; when the serial pipe dies the VM is going down anyway.
        let reader_handle = self
            .serial
            .spawn_reader(stdout, self.cancel_tx.subscribe());
        {
            let vm = self.clone();
            tokio::spawn(async move {
                let _ = reader_handle.await;
                let _ = vm.cancel().await;
            });
        }

        // Capture QEMU stderr; in debug mode it is tee'd to the host.
        {
            let buf = self.qemu_stderr.clone();
            let debug = self.cfg.debug;
            let mut stderr = stderr;
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            buf.lock().unwrap().extend_from_slice(&chunk[..n]);
                            if debug {
                                eprint!("{}", String::from_utf8_lossy(&chunk[..n]));
                            }
                        }
                    }
                }
            });
        }

        self.spawn_host_mount_checker();

        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        // Boot watchdog.
        {
            let vm = self.clone();
            let errors = errors.clone();
            let mut boot_ready = self.boot_ready_tx.subscribe();
            let mut cancel = self.cancel_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(vm.os_up_timeout) => {
                        warn!("a VM boot timeout detected, consider running with --vm-debug to investigate");
                        vm.record_error(
                            &errors,
                            format!("vm boot timeout {}", vm.serial_log_excerpt()),
                        )
                        .await;
                    }
                    _ = wait_for_true(&mut boot_ready) => {
                        info!("the VM is up, setting it up");
                    }
                    _ = wait_for_true(&mut cancel) => {}
                }
            });
        }

        // SSH-up watchdog.
        {
            let vm = self.clone();
            let errors = errors.clone();
            let mut ssh_ready = self.ssh_ready_tx.subscribe();
            let mut cancel = self.cancel_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(vm.ssh_up_timeout) => {
                        vm.record_error(
                            &errors,
                            format!("vm setup timeout {}", vm.serial_log_excerpt()),
                        )
                        .await;
                    }
                    _ = wait_for_true(&mut ssh_ready) => {
                        info!("the VM is ready");
                    }
                    _ = wait_for_true(&mut cancel) => {}
                }
            });
        }

        info!("booting the VM");

        // Login, bootstrap, key scan.
        {
            let vm = self.clone();
            let errors = errors.clone();
            tokio::spawn(async move {
                if let Err(err) = vm.provision().await {
                    vm.record_error(&errors, format!("{err:#}")).await;
                }
            });
        }

        let wait_result = child.wait().await;
        let _ = self.child_exit_tx.send(true);

        let cancel_result = self.cancel().await;

        match wait_result {
            Err(err) => {
                let mut msgs = vec![format!("wait for cmd to finish execution: {err}")];
                if let Err(cancel_err) = cancel_result {
                    msgs.push(format!("cancel: {cancel_err:#}"));
                }
                bail!("{} {}", msgs.join("; "), self.qemu_stderr_excerpt());
            }
            Ok(_status) => {
                let mut msgs = errors.lock().unwrap().clone();
                if let Err(cancel_err) = cancel_result {
                    msgs.push(format!("cancel on exit: {cancel_err:#}"));
                }
                if !msgs.is_empty() {
                    bail!("{} {}", msgs.join("; "), self.qemu_stderr_excerpt());
                }
                Ok(())
            }
        }
    }

    async fn record_error(&self, errors: &Mutex<Vec<String>>, msg: String) {
        errors.lock().unwrap().push(msg);
        if let Err(err) = self.cancel().await {
            errors
                .lock()
                .unwrap()
                .push(format!("cancel on error: {err:#}"));
        }
    }

    /// Tear the instance down: attempt a graceful in-guest `poweroff`, wait
    /// out a grace period, then terminate the process group. Idempotent; the
    /// second and later calls return `Ok` immediately.
    pub async fn cancel(&self) -> Result<()> {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        warn!("canceling the VM");

        let mut graceful = false;
        let access = self.ssh_access.read().unwrap().clone();
        if let Some(access) = access {
            warn!("sending poweroff command to the VM");
            match access.run_command("poweroff").await {
                Ok(_) => {
                    info!("shutting the VM down safely");
                    graceful = true;
                }
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "could not power off the VM safely");
                }
            }
        }

        let mut terminate_result = Ok(());

        let mut child_exit = self.child_exit_tx.subscribe();
        let exited = if graceful {
            tokio::time::timeout(CANCEL_GRACE, child_exit.wait_for(|v| *v))
                .await
                .is_ok()
        } else {
            *child_exit.borrow()
        };

        if !exited {
            let pid = self.child_pid.load(Ordering::SeqCst);
            if pid == 0 {
                if self.started.load(Ordering::SeqCst) {
                    terminate_result = Err(anyhow::anyhow!("process is not started"));
                }
            } else {
                terminate_result = osspecifics::terminate_process(pid)
                    .await
                    .context("interrupt cmd");
            }
        }

        let _ = self.cancel_tx.send(true);
        self.serial.close_writer().await;

        terminate_result
    }

    /// Serial-side provisioning: wait for `login:`, log in as root, bring up
    /// networking and sshd with the generated key, then scan and pin the
    /// guest host keys.
    async fn provision(self: &Arc<Self>) -> Result<()> {
        let mut cancel = self.cancel_tx.subscribe();

        // Login watcher.
        loop {
            tokio::select! {
                _ = wait_for_true(&mut cancel) => bail!("vm canceled during login wait"),
                _ = tokio::time::sleep(LOGIN_POLL_INTERVAL) => {
                    if self.serial.scan_contains("login:") {
                        self.serial
                            .write(b"root\n")
                            .await
                            .context("stdio write login")?;
                        debug!("logged into the VM serial");
                        break;
                    }
                }
            }
        }

        let _ = self.boot_ready_tx.send(true);

        // SSH bootstrap.
        let key_dir = tempfile::tempdir().context("create ephemeral ssh key dir")?;
        let (key_path, public_key) = ssh::generate_keypair(key_dir.path())
            .await
            .context("generate ssh key")?;

        let install_sshd_cmd = if self.cfg.install_base_utilities {
            "apk add openssh; "
        } else {
            ""
        };

        // The sentinel echo lives inside the function body so that the
        // guest's echo of the command being typed cannot satisfy the match.
        let setup_cmd = format!(
            r#"do_setup () {{ sh -c "set -ex; ifconfig eth0 up && ifconfig lo up && udhcpc; {install_sshd_cmd}mkdir -p ~/.ssh; echo {pubkey} > ~/.ssh/authorized_keys; rc-update add sshd; rc-service sshd start"; echo "SERIAL"" ""STATUS: $?"; }}; do_setup"#,
            pubkey = shell_quote(&public_key),
        );

        self.serial
            .run_script(&setup_cmd, BOOTSTRAP_TIMEOUT, &mut cancel, |_| {})
            .await
            .context("set up ssh")?;

        debug!("set up SSH server successfully");

        // Host key scan, over the same trusted serial channel. Targets the
        // loopback IP literal so the hashed hostname never depends on
        // resolver behavior. Shell history is wiped afterwards.
        let mut scan = String::new();
        self.serial
            .run_command(
                "ssh-keyscan -H 127.0.0.1 && rm /root/.ash_history",
                KEYSCAN_TIMEOUT,
                &mut cancel,
                |line| {
                    if line.starts_with('|') {
                        scan.push_str(line);
                        scan.push('\n');
                    }
                },
            )
            .await
            .context("scan ssh identity")?;

        debug!("scanned SSH identity");

        let pinned = PinnedHostKeys::parse(&scan).context("parse ssh key scan")?;

        let access = SshAccess::new(
            self.ssh_port,
            key_dir,
            key_path,
            &pinned,
            self.cancel_tx.subscribe(),
        )
        .context("configure ssh access")?;

        *self.ssh_access.write().unwrap() = Some(Arc::new(access));

        // Populated before the signal: observers that see `ssh_ready` may
        // dial immediately.
        let _ = self.ssh_ready_tx.send(true);

        Ok(())
    }

    /// While any block device is passed through, poll the host mount table
    /// once a second. A positive hit is unconditional data-corruption
    /// prevention: kill QEMU and abort the whole process.
    fn spawn_host_mount_checker(self: &Arc<Self>) {
        if self.cfg.passthrough.block.is_empty() {
            return;
        }

        let vm = self.clone();
        let mut cancel = self.cancel_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wait_for_true(&mut cancel) => return,
                    _ = tokio::time::sleep(HOST_MOUNT_POLL_INTERVAL) => {
                        for dev in &vm.cfg.passthrough.block {
                            let dev_path = dev.path.to_string_lossy();
                            let seems_mounted =
                                match osspecifics::check_device_seems_mounted(&dev_path).await {
                                    Ok(v) => v,
                                    Err(_) => {
                                        warn!(dev_path = %dev_path, "failed to check if a passed device seems to be mounted");
                                        continue;
                                    }
                                };

                            if seems_mounted {
                                let pid = vm.child_pid.load(Ordering::SeqCst);
                                if pid != 0 {
                                    let _ = osspecifics::terminate_process(pid).await;
                                }
                                eprintln!(
                                    "CRITICAL: Passed-through device '{dev_path}' appears to have been mounted on the host OS. Forcefully exiting now to prevent data corruption."
                                );
                                std::process::exit(1);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Bring up a guest interface with a static IPv6 address; used for the
    /// tap-facing second NIC.
    pub async fn configure_interface_static_net(&self, iface: &str, cidr: &str) -> Result<()> {
        let (addr, _prefix) = cidr
            .split_once('/')
            .with_context(|| format!("invalid cidr '{cidr}'"))?;
        let ip: std::net::IpAddr = addr.parse().with_context(|| format!("invalid cidr '{cidr}'"))?;
        if !ip.is_ipv6() {
            bail!("ipv6 addresses accepted only (have '{ip}')");
        }

        let access = self.ssh()?;
        access
            .run_command(&format!(
                "ifconfig {iface} up && ip addr add {cidr} dev {iface}",
                iface = shell_quote(iface),
                cidr = shell_quote(cidr),
            ))
            .await
            .context("run net conf cmds")?;

        Ok(())
    }
}
