//! High-level in-guest operations, one SSH session per call.
//!
//! Every operation validates its inputs against strict patterns before they
//! are templated into a shell command; device names, filesystem types and
//! mount options never reach the guest unchecked.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rand::RngCore;
use tracing::{info, warn};

use super::ssh::{DEFAULT_CMD_TIMEOUT, PASSWD_TIMEOUT};
use super::Vm;
use crate::util::{
    log_err_msg, shell_quote, validate_dev_name, validate_fs_type, validate_mount_options,
    validate_unix_username,
};

/// Produces a password from the operator, without echo. Kept as a callback
/// so the supervisor owns terminal handling and tests can inject fixtures.
pub type PasswordPrompt = Box<dyn Fn(&str) -> Result<Vec<u8>> + Send + Sync>;

/// The account whose credentials are set for every share backend.
pub const SHARE_USER: &str = "linsk";

const LUKS_LOW_MEMORY_STDERR: &str = "Not enough available memory to open a keyslot.";

pub struct FileManager {
    vm: Arc<Vm>,
    password_prompt: PasswordPrompt,
}

#[derive(Default)]
pub struct MountConfig {
    /// Device to open as a LUKS container before mounting, for LVM-behind-
    /// LUKS setups.
    pub luks_container_preopen: Option<String>,
    /// Filesystem type passed to `mount -t`; `None` lets the guest kernel
    /// autodetect.
    pub fs_type_override: Option<String>,
    /// Treat the device itself as a LUKS volume.
    pub luks: bool,
    pub mount_options: Option<String>,
}

enum PassChange {
    Unix,
    Samba,
}

impl PassChange {
    fn command(&self) -> &'static str {
        match self {
            PassChange::Unix => "passwd",
            PassChange::Samba => "smbpasswd -a",
        }
    }
}

/// Overwrite a secret buffer with zeros, then random bytes, before it is
/// freed.
fn scrub(buf: &mut [u8]) {
    buf.fill(0);
    rand::thread_rng().fill_bytes(buf);
    rand::thread_rng().fill_bytes(buf);
}

impl FileManager {
    pub fn new(vm: Arc<Vm>, password_prompt: PasswordPrompt) -> Self {
        Self {
            vm,
            password_prompt,
        }
    }

    /// Activate all LVM volume groups.
    pub async fn init_lvm(&self) -> Result<()> {
        let access = self.vm.ssh().context("dial vm ssh")?;
        access
            .run_command("vgchange -ay")
            .await
            .context("run vgchange cmd")?;
        Ok(())
    }

    /// List guest block devices, excluding loop, ram and floppy devices.
    pub async fn lsblk(&self) -> Result<String> {
        let access = self.vm.ssh().context("dial vm ssh")?;
        let out = access
            .run_command("lsblk -o NAME,SIZE,FSTYPE,LABEL -e 7,11,2")
            .await
            .context("run lsblk")?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    async fn luks_open(&self, full_dev_path: &str, luks_dm_name: &str) -> Result<()> {
        let access = self.vm.ssh().context("dial vm ssh")?;

        let mut child = access.spawn(&format!(
            "cryptsetup luksOpen {} {}",
            shell_quote(full_dev_path),
            shell_quote(luks_dm_name),
        ))?;

        info!(vm_path = %full_dev_path, "attempting to open a LUKS device");

        let mut password = (self.password_prompt)("Enter Password: ")?;

        let write_result = async {
            child.write_stdin(&password).await?;
            child.write_stdin(b"\n").await
        }
        .await;
        child.close_stdin();
        scrub(&mut password);
        write_result.context("write password to stdin")?;

        // The deadline clock starts only now, after the password has been
        // submitted; the operator's typing time never counts against it.
        let dev = full_dev_path.to_string();
        let out = child
            .wait(
                DEFAULT_CMD_TIMEOUT,
                Some(Box::new(move || {
                    warn!(
                        vm_path = %dev,
                        "LUKS open command timed out. If you are using a large-memory key \
                         derivation function, try increasing the VM memory allocation using the \
                         --vm-mem-alloc flag."
                    );
                })),
            )
            .await?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if stderr.contains(LUKS_LOW_MEMORY_STDERR) {
                warn!(
                    "detected not enough memory to open a LUKS device, please allocate more \
                     memory using the --vm-mem-alloc flag"
                );
            }
            bail!(
                "wait for cryptsetup luksopen cmd to finish {}",
                log_err_msg(&stderr, "stderr log")
            );
        }

        info!(vm_path = %full_dev_path, "LUKS device opened successfully");
        Ok(())
    }

    /// Open a LUKS container device as `cryptcontainer` and re-activate LVM
    /// so volume groups living inside it appear.
    pub async fn preopen_luks_container(&self, container_dev: &str) -> Result<()> {
        if !validate_dev_name(container_dev) {
            bail!("bad luks container device name");
        }

        let full_path = format!("/dev/{container_dev}");
        info!(container = %full_path, "preopening a LUKS container");

        self.luks_open(&full_path, "cryptcontainer")
            .await
            .context("luks (pre)open container")?;

        self.init_lvm().await.context("reinit lvm")?;

        Ok(())
    }

    /// Mount a guest device on `/mnt`, optionally unlocking LUKS first.
    pub async fn mount(&self, dev_name: &str, mc: MountConfig) -> Result<()> {
        if dev_name.is_empty() {
            bail!("device name is empty");
        }
        // The "mapper/" prefix is allowed so LVM and LUKS mapped devices can
        // be mounted directly.
        if !validate_dev_name(dev_name) {
            bail!("bad device name");
        }

        // Deliberately no path normalization here: the target is always the
        // Linux guest, and host-side path cleaning (notably on Windows)
        // would mangle it.
        let mut full_dev_path = format!("/dev/{dev_name}");

        let fs_override = match &mc.fs_type_override {
            None => None,
            Some(s) if s.is_empty() => bail!("fs type empty"),
            Some(s) => {
                if !validate_fs_type(s) {
                    bail!("bad fs type override (contains illegal characters)");
                }
                Some(s.clone())
            }
        };

        let mount_options = match &mc.mount_options {
            None => None,
            Some(s) => {
                if !validate_mount_options(s) {
                    bail!("invalid mount options (contains illegal characters)");
                }
                Some(s.clone())
            }
        };

        if let Some(container) = &mc.luks_container_preopen {
            self.preopen_luks_container(container)
                .await
                .context("preopen luks container")?;
        }

        if mc.luks {
            let luks_dm_name = "cryptmnt";
            self.luks_open(&full_dev_path, luks_dm_name)
                .await
                .context("luks open")?;
            full_dev_path = format!("/dev/mapper/{luks_dm_name}");
        }

        let mut cmd = String::from("mount ");
        if let Some(fs) = &fs_override {
            cmd.push_str(&format!("-t {} ", shell_quote(fs)));
        }
        if let Some(opts) = &mount_options {
            cmd.push_str(&format!("-o {} ", shell_quote(opts)));
        }
        cmd.push_str(&format!("{} /mnt", shell_quote(&full_dev_path)));

        let access = self.vm.ssh().context("dial vm ssh")?;
        access.run_command(&cmd).await.context("run mount cmd")?;

        Ok(())
    }

    /// Start vsftpd with the given passive port window and advertised
    /// external IP, and set the share account password.
    pub async fn start_ftp(
        &self,
        share_pwd: &str,
        passive_port_start: u16,
        passive_port_count: u16,
        ext_ip: IpAddr,
    ) -> Result<()> {
        let cfg = vsftpd_config(passive_port_start, passive_port_count, ext_ip);
        self.start_generic_share(share_pwd, &cfg, "/etc/vsftpd/vsftpd.conf", "vsftpd", PassChange::Unix)
            .await
    }

    /// Start Samba exposing `/mnt` as `[linsk]` and set the share account
    /// password.
    pub async fn start_smb(&self, share_pwd: &str) -> Result<()> {
        self.start_generic_share(
            share_pwd,
            SAMBA_CONFIG,
            "/etc/samba/smb.conf",
            "samba",
            PassChange::Samba,
        )
        .await
    }

    /// Start Netatalk exposing `/mnt` as `[linsk]` and set the share account
    /// password.
    pub async fn start_afp(&self, share_pwd: &str) -> Result<()> {
        self.start_generic_share(share_pwd, AFP_CONFIG, "/etc/afp.conf", "netatalk", PassChange::Unix)
            .await
    }

    async fn start_generic_share(
        &self,
        share_pwd: &str,
        cfg: &str,
        cfg_path: &str,
        rc_service: &str,
        pass_change: PassChange,
    ) -> Result<()> {
        let access = self.vm.ssh().context("dial vm ssh")?;

        access
            .upload_config(cfg, cfg_path)
            .await
            .context("copy config file")?;

        access
            .run_command(&format!(
                "rc-update add {service} && rc-service {service} start",
                service = shell_quote(rc_service),
            ))
            .await
            .context("add and start rc service")?;

        self.change_pass(pass_change, SHARE_USER, share_pwd)
            .await
            .context("change pass")?;

        Ok(())
    }

    /// Set an account password by feeding it twice to the change command's
    /// stdin (entry plus confirmation), then scrub the buffer.
    async fn change_pass(&self, kind: PassChange, user: &str, pwd: &str) -> Result<()> {
        if !validate_unix_username(user) {
            bail!("invalid unix username");
        }

        let access = self.vm.ssh().context("dial vm ssh")?;

        let mut child =
            access.spawn(&format!("{} {}", kind.command(), shell_quote(user)))?;

        let mut pwd_line = Vec::with_capacity(pwd.len() + 1);
        pwd_line.extend_from_slice(pwd.as_bytes());
        pwd_line.push(b'\n');

        let write_result = async {
            child.write_stdin(&pwd_line).await?;
            child.write_stdin(&pwd_line).await
        }
        .await;
        child.close_stdin();
        scrub(&mut pwd_line);
        write_result.context("write password to stdin")?;

        let out = child.wait(PASSWD_TIMEOUT, None).await?;
        if !out.status.success() {
            bail!(
                "wait for change user password cmd {}",
                log_err_msg(&String::from_utf8_lossy(&out.stderr), "stderr log")
            );
        }

        Ok(())
    }
}

fn vsftpd_config(passive_port_start: u16, passive_port_count: u16, ext_ip: IpAddr) -> String {
    format!(
        "anonymous_enable=NO\n\
         local_enable=YES\n\
         write_enable=YES\n\
         local_umask=022\n\
         chroot_local_user=YES\n\
         allow_writeable_chroot=YES\n\
         listen=YES\n\
         seccomp_sandbox=NO\n\
         pasv_min_port={min}\n\
         pasv_max_port={max}\n\
         pasv_address={ext_ip}\n",
        min = passive_port_start,
        max = passive_port_start + passive_port_count,
    )
}

const SAMBA_CONFIG: &str = "[global]
workgroup = WORKGROUP
dos charset = cp866
unix charset = utf-8
client min protocol = SMB2
client max protocol = SMB3

read raw = yes
write raw = yes
socket options = TCP_NODELAY IPTOS_LOWDELAY SO_RCVBUF=131072 SO_SNDBUF=131072
min receivefile size = 16384
use sendfile = true
aio read size = 16384
aio write size = 16384
server signing = no

[linsk]
browseable = yes
writeable = yes
path = /mnt
force user = linsk
force group = linsk
create mask = 0664
";

const AFP_CONFIG: &str = "[Global]

[linsk]
path = /mnt
file perm = 0664
directory perm = 0775
valid users = linsk
force user = linsk
force group = linsk
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Config, Vm};

    async fn offline_fm() -> FileManager {
        let vm = Vm::new(Config {
            memory_alloc: 512,
            ..Config::default()
        })
        .await
        .unwrap();
        FileManager::new(vm, Box::new(|_| Ok(b"test-password".to_vec())))
    }

    #[tokio::test]
    async fn mount_rejects_empty_device_name() {
        let fm = offline_fm().await;
        let err = fm.mount("", MountConfig::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "device name is empty");
    }

    #[tokio::test]
    async fn mount_rejects_bad_device_name() {
        let fm = offline_fm().await;
        for dev in ["vdb;reboot", "../dev/vda", "vdb b"] {
            let err = fm.mount(dev, MountConfig::default()).await.unwrap_err();
            assert_eq!(err.to_string(), "bad device name", "dev: {dev}");
        }
    }

    #[tokio::test]
    async fn mount_rejects_empty_fs_override() {
        let fm = offline_fm().await;
        let err = fm
            .mount(
                "vdb",
                MountConfig {
                    fs_type_override: Some(String::new()),
                    ..MountConfig::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "fs type empty");
    }

    #[tokio::test]
    async fn mount_rejects_bad_fs_override_and_options() {
        let fm = offline_fm().await;

        let err = fm
            .mount(
                "vdb",
                MountConfig {
                    fs_type_override: Some("ext4; reboot".into()),
                    ..MountConfig::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad fs type override"));

        let err = fm
            .mount(
                "vdb",
                MountConfig {
                    mount_options: Some("ro; rm -rf /".into()),
                    ..MountConfig::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid mount options"));
    }

    #[tokio::test]
    async fn preopen_rejects_bad_container_name() {
        let fm = offline_fm().await;
        let err = fm.preopen_luks_container("../sda").await.unwrap_err();
        assert_eq!(err.to_string(), "bad luks container device name");
    }

    #[test]
    fn vsftpd_config_renders_passive_window() {
        let cfg = vsftpd_config(9001, 9, "203.0.113.7".parse().unwrap());
        assert!(cfg.contains("pasv_min_port=9001\n"));
        assert!(cfg.contains("pasv_max_port=9010\n"));
        assert!(cfg.contains("pasv_address=203.0.113.7\n"));
        assert!(cfg.contains("anonymous_enable=NO"));
    }

    #[test]
    fn share_configs_export_mnt_as_linsk() {
        assert!(SAMBA_CONFIG.contains("[linsk]"));
        assert!(SAMBA_CONFIG.contains("path = /mnt"));
        assert!(SAMBA_CONFIG.contains("client min protocol = SMB2"));
        assert!(SAMBA_CONFIG.contains("client max protocol = SMB3"));
        assert!(AFP_CONFIG.contains("[linsk]"));
        assert!(AFP_CONFIG.contains("path = /mnt"));
        assert!(AFP_CONFIG.contains("valid users = linsk"));
    }

    #[test]
    fn scrub_clears_plaintext() {
        let mut buf = b"super secret".to_vec();
        scrub(&mut buf);
        assert_ne!(buf, b"super secret");
    }

    #[test]
    fn pass_change_commands() {
        assert_eq!(PassChange::Unix.command(), "passwd");
        assert_eq!(PassChange::Samba.command(), "smbpasswd -a");
    }
}
