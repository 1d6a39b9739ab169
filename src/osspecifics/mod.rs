//! Host OS specifics: process-group control, device checks and privilege
//! detection. The full Unix and Windows implementations live in per-platform
//! `imp` modules with a shared surface re-exported below.

pub fn is_windows() -> bool {
    cfg!(windows)
}

pub fn is_macos() -> bool {
    cfg!(target_os = "macos")
}

#[cfg(unix)]
mod imp {
    use anyhow::{bail, Context, Result};
    use tokio::process::Command;

    /// Detach the child into its own process group so that a Ctrl+C aimed at
    /// the supervisor does not propagate to QEMU before we had a chance to
    /// shut it down in order.
    pub fn set_new_process_group(cmd: &mut Command) {
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    /// Terminate the whole process group rooted at `pid`.
    pub async fn terminate_process(pid: u32) -> Result<()> {
        let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("send sigterm to process group {pid}"));
        }
        Ok(())
    }

    /// Best-effort check whether a device path shows up in `mount` output.
    ///
    /// This is a failsafe band-aid, not an authoritative mount table query:
    /// the user remains responsible for never mounting a passed-through
    /// device on both sides at once.
    pub async fn check_device_seems_mounted(dev_path: &str) -> Result<bool> {
        let abs = std::fs::canonicalize(dev_path)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| dev_path.to_string());

        let out = Command::new("mount")
            .output()
            .await
            .context("run mount command")?;

        let mounts = String::from_utf8_lossy(&out.stdout);
        for line in mounts.lines() {
            if line.starts_with(dev_path) || line.starts_with(&abs) {
                return Ok(true);
            }
        }

        Ok(false)
    }

    pub fn check_valid_device_path(dev_path: &str) -> Result<()> {
        use std::os::unix::fs::FileTypeExt;

        let meta = std::fs::metadata(dev_path).context("stat path")?;
        let ft = meta.file_type();
        if !ft.is_block_device() && !ft.is_char_device() {
            bail!("file mode is not device ({ft:?})");
        }

        Ok(())
    }

    pub async fn check_run_as_root() -> Result<bool> {
        Ok(unsafe { libc::geteuid() } == 0)
    }

    #[cfg(target_os = "linux")]
    fn logical_block_size_ioctl(fd: libc::c_int) -> Result<i64> {
        // BLKSSZGET
        const BLKSSZGET: libc::c_ulong = 0x1268;

        let mut bs: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(fd, BLKSSZGET as _, &mut bs) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error()).context("ioctl get logical block size");
        }
        Ok(bs as i64)
    }

    #[cfg(target_os = "macos")]
    fn logical_block_size_ioctl(fd: libc::c_int) -> Result<i64> {
        // DKIOCGETBLOCKSIZE
        const DKIOCGETBLOCKSIZE: libc::c_ulong = 0x4004_6418;

        let mut bs: u32 = 0;
        let ret = unsafe { libc::ioctl(fd, DKIOCGETBLOCKSIZE as _, &mut bs) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error()).context("ioctl get logical block size");
        }
        Ok(bs as i64)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn logical_block_size_ioctl(_fd: libc::c_int) -> Result<i64> {
        bail!("logical block size query is not supported on this platform")
    }

    pub fn get_device_logical_block_size(dev_path: &str) -> Result<u64> {
        use std::os::fd::AsRawFd;

        let f = std::fs::File::open(dev_path).context("open device")?;
        let bs = logical_block_size_ioctl(f.as_raw_fd()).context("get block size inner")?;

        if bs <= 0 {
            bail!("retrieved block size is zero (or negative): '{bs}'");
        }

        Ok(bs as u64)
    }
}

#[cfg(windows)]
mod imp {
    use anyhow::{bail, Context, Result};
    use once_cell::sync::Lazy;
    use regex::Regex;
    use tokio::process::Command;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    static PHYSICAL_DRIVE_CHECK: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\\\\\.\\PhysicalDrive(\d+)$").unwrap());
    static PHYSICAL_DRIVE_FIND: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"PhysicalDrive(\d+)").unwrap());

    /// Detach the child into its own process group so that a Ctrl+C aimed at
    /// the supervisor does not propagate to QEMU before we had a chance to
    /// shut it down in order.
    pub fn set_new_process_group(cmd: &mut Command) {
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    /// Terminate the whole process tree rooted at `pid`.
    pub async fn terminate_process(pid: u32) -> Result<()> {
        let status = Command::new("TASKKILL")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .status()
            .await
            .context("run taskkill")?;
        if !status.success() {
            bail!("taskkill exited with {status}");
        }
        Ok(())
    }

    /// Best-effort check whether the physical drive has any logical disk
    /// (i.e. mounted partition) associated with it.
    pub async fn check_device_seems_mounted(dev_path: &str) -> Result<bool> {
        let caps = PHYSICAL_DRIVE_FIND
            .captures(dev_path)
            .with_context(|| format!("bad device path '{dev_path}'"))?;
        let drive_index = &caps[1];

        let out = Command::new("wmic")
            .args(["path", "Win32_LogicalDiskToPartition", "get", "Antecedent"])
            .output()
            .await
            .context("run wmic cmd")?;

        let listing = String::from_utf8_lossy(&out.stdout);
        Ok(listing.contains(&format!("Disk #{drive_index}")))
    }

    pub fn check_valid_device_path(dev_path: &str) -> Result<()> {
        if !PHYSICAL_DRIVE_CHECK.is_match(dev_path) {
            // The path itself is reported by the caller together with this error.
            bail!("invalid device path (expected \\\\.\\PhysicalDriveN)");
        }
        Ok(())
    }

    /// Administrator detection: `net session` fails with access-denied for
    /// non-elevated shells.
    pub async fn check_run_as_root() -> Result<bool> {
        let status = Command::new("net")
            .args(["session"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .context("run net session")?;
        Ok(status.success())
    }

    pub fn get_device_logical_block_size(dev_path: &str) -> Result<u64> {
        let caps = PHYSICAL_DRIVE_FIND
            .captures(dev_path)
            .with_context(|| format!("bad device path '{dev_path}'"))?;
        let device_id = format!("\\\\\\\\.\\\\PHYSICALDRIVE{}", &caps[1]);

        let out = std::process::Command::new("wmic")
            .args([
                "diskdrive",
                "where",
                &format!("DeviceID='{device_id}'"),
                "get",
                "BytesPerSector",
                "/value",
            ])
            .output()
            .context("run wmic diskdrive cmd")?;

        let listing = String::from_utf8_lossy(&out.stdout);
        for line in listing.lines() {
            if let Some(value) = line.trim().strip_prefix("BytesPerSector=") {
                let bs: u64 = value.trim().parse().context("parse BytesPerSector")?;
                if bs == 0 {
                    bail!("retrieved block size is zero");
                }
                return Ok(bs);
            }
        }

        bail!("no BytesPerSector reported for '{dev_path}'")
    }
}

pub use imp::{
    check_device_seems_mounted, check_run_as_root, check_valid_device_path,
    get_device_logical_block_size, set_new_process_group, terminate_process,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_helpers_agree_with_cfg() {
        assert_eq!(is_windows(), cfg!(windows));
        assert_eq!(is_macos(), cfg!(target_os = "macos"));
    }

    #[cfg(unix)]
    #[test]
    fn regular_file_is_not_a_device() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let err = check_valid_device_path(f.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("not device"));
    }

    #[cfg(unix)]
    #[test]
    fn missing_path_is_not_a_device() {
        assert!(check_valid_device_path("/definitely/not/here").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn null_device_passes_device_check() {
        // /dev/null is a character device; the validator accepts both block
        // and character devices (USB passthrough paths can be either).
        assert!(check_valid_device_path("/dev/null").is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ordinary_file_does_not_seem_mounted() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let mounted = check_device_seems_mounted(f.path().to_str().unwrap())
            .await
            .unwrap();
        assert!(!mounted);
    }
}
