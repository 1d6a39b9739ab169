//! One-shot VM image builder.
//!
//! Boots the stock Alpine installer ISO with unrestricted networking
//! against a freshly created qcow2 disk, reuses the regular supervisor to
//! reach SSH (installing OpenSSH over serial on the way), then runs the
//! Alpine installation: repositories, `setup-disk`, the filesystem tooling
//! packages and the unprivileged `linsk` share account.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{error, info};

use crate::cmd::runvm::{self, EXIT_ERROR, EXIT_OK};
use crate::osspecifics;
use crate::util::{log_err_msg, shell_quote};
use crate::vm::{Config, DriveConfig, Vm};

/// Packages baked into the image: sshd, LVM, blkid/lsblk, LUKS and the
/// three share daemons.
const BASE_PACKAGES: &[&str] = &[
    "openssh",
    "lvm2",
    "util-linux",
    "cryptsetup",
    "vsftpd",
    "samba",
    "netatalk",
];

/// Package installation pulls from the network; everything else in the
/// setup is local disk work.
const SETUP_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug)]
pub struct BuildContext {
    vm: Arc<Vm>,
}

impl BuildContext {
    pub async fn new(
        base_iso_path: &Path,
        out_path: &Path,
        debug: bool,
        bios_path: Option<PathBuf>,
    ) -> Result<Self> {
        match std::fs::metadata(out_path) {
            Ok(_) => bail!("output file already exists"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).context("stat output file"),
        }

        create_qemu_img(out_path).await.context("create temporary qemu image")?;

        let vm = Vm::new(Config {
            cdrom_image_path: Some(base_iso_path.to_path_buf()),
            bios_path,
            drives: vec![DriveConfig {
                path: out_path.to_path_buf(),
                snapshot_mode: false,
            }],
            memory_alloc: 512,
            unrestricted_networking: true,
            debug,
            install_base_utilities: true,
            ..Config::default()
        })
        .await
        .context("create vm instance")?;

        Ok(Self { vm })
    }

    /// Run the build to completion, interrupt handling included. Returns a
    /// process exit code.
    pub async fn run_cli_build(self) -> i32 {
        runvm::run_vm(self.vm.clone(), None, None, |handles| async move {
            let access = match handles.vm.ssh() {
                Ok(access) => access,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "failed to dial VM SSH");
                    return EXIT_ERROR;
                }
            };

            info!("VM OS installation in progress");

            let setup_cmd = alpine_setup_cmd(BASE_PACKAGES);
            if let Err(err) = access
                .run_command_with_timeout(&setup_cmd, SETUP_TIMEOUT)
                .await
            {
                error!(error = %format!("{err:#}"), "failed to set up Alpine Linux");
                return EXIT_ERROR;
            }

            EXIT_OK
        })
        .await
    }
}

async fn create_qemu_img(out_path: &Path) -> Result<()> {
    let mut base_cmd = String::from("qemu-img");
    if osspecifics::is_windows() {
        base_cmd.push_str(".exe");
    }

    let out = Command::new(&base_cmd)
        .args(["create", "-f", "qcow2"])
        .arg(out_path)
        .arg("1G")
        .output()
        .await
        .context("run qemu-img create cmd")?;
    if !out.status.success() {
        bail!(
            "qemu-img create failed {}",
            log_err_msg(&String::from_utf8_lossy(&out.stderr), "stderr log")
        );
    }

    Ok(())
}

/// The full in-guest installation command: network up, apk repositories,
/// disk installation, chroot package installation, and share account setup
/// with password authentication disabled for sshd.
fn alpine_setup_cmd(packages: &[&str]) -> String {
    let mut cmd = String::from(
        "ifconfig eth0 up && ifconfig lo up && udhcpc && true > /etc/apk/repositories && \
         setup-apkrepos -c -1 && printf 'y' | setup-disk -m sys /dev/vda",
    );

    if !packages.is_empty() {
        let quoted: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
        cmd.push_str(&format!(
            " && mount /dev/vda3 /mnt && chroot /mnt apk add {}",
            quoted.join(" ")
        ));
    }

    cmd.push_str(
        " && chroot /mnt ash -c 'echo \"PasswordAuthentication no\" >> /etc/ssh/sshd_config && \
         addgroup -g 1000 linsk && adduser -D -h /mnt -G linsk linsk -u 1000 && \
         touch /etc/network/interfaces'",
    );

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_cmd_installs_and_configures() {
        let cmd = alpine_setup_cmd(BASE_PACKAGES);

        assert!(cmd.contains("setup-apkrepos -c -1"));
        assert!(cmd.contains("printf 'y' | setup-disk -m sys /dev/vda"));
        assert!(cmd.contains("chroot /mnt apk add openssh lvm2 util-linux cryptsetup vsftpd samba netatalk"));
        assert!(cmd.contains("PasswordAuthentication no"));
        assert!(cmd.contains("adduser -D -h /mnt -G linsk linsk -u 1000"));
        assert!(cmd.contains("touch /etc/network/interfaces"));
    }

    #[test]
    fn setup_cmd_without_packages_skips_chroot_install() {
        let cmd = alpine_setup_cmd(&[]);
        assert!(!cmd.contains("apk add"));
        assert!(cmd.contains("setup-disk"));
    }

    #[tokio::test]
    async fn build_context_refuses_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("base.iso");
        let out = dir.path().join("out.qcow2");
        std::fs::write(&iso, b"iso").unwrap();
        std::fs::write(&out, b"existing").unwrap();

        let err = BuildContext::new(&iso, &out, false, None).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
