//! The data directory: built VM images, the aarch64 firmware blob and
//! transient tap-interface allocation records. Everything lives in one flat
//! directory so `clean` can simply remove it.

pub mod constants;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::nettap::{self, Alloc};

const TAP_ALLOC_PREFIX: &str = "tap_alloc_";

pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let path: PathBuf = data_dir.into();

        fs::create_dir_all(&path)
            .with_context(|| format!("mkdir all data dir '{}'", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o700))
                .context("set data dir permissions")?;
        }

        Ok(Self { path })
    }

    pub fn data_dir_path(&self) -> &Path {
        &self.path
    }

    pub fn vm_image_path(&self) -> PathBuf {
        self.path
            .join(format!("{}.qcow2", constants::vm_image_tags()))
    }

    /// The built VM image path if present, `None` if it still needs to be
    /// built with `linsk build`.
    pub fn check_vm_image_exists(&self) -> Result<Option<PathBuf>> {
        let p = self.vm_image_path();
        match fs::metadata(&p) {
            Ok(_) => Ok(Some(p)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("stat vm image path"),
        }
    }

    pub fn base_image_path(&self) -> PathBuf {
        self.path.join(constants::alpine_base_image_file_name())
    }

    /// Locate and hash-validate the Alpine installer ISO. Fetching the ISO is
    /// outside this tool; a missing file produces an error naming the
    /// expected path and the upstream URL.
    pub fn check_base_image(&self) -> Result<PathBuf> {
        let p = self.base_image_path();
        match fs::metadata(&p) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                bail!(
                    "base Alpine image not found at '{}'; download it from {} and place it there",
                    p.display(),
                    constants::alpine_base_image_url(),
                );
            }
            Err(err) => return Err(err).context("stat base image path"),
        }

        validate_file_hash(&p, constants::alpine_base_image_sha256())
            .context("validate hash of existing base image")?;

        Ok(p)
    }

    pub fn aarch64_efi_image_path(&self) -> PathBuf {
        self.path.join(constants::AARCH64_EFI_IMAGE_NAME)
    }

    /// The firmware blob required to boot the VM, if this arch needs one.
    /// x86_64 boots on QEMU's default BIOS; aarch64 requires the EDK2 image.
    pub fn check_vm_bios(&self) -> Result<Option<PathBuf>> {
        if !cfg!(target_arch = "aarch64") {
            return Ok(None);
        }

        let p = self.aarch64_efi_image_path();
        match fs::metadata(&p) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                bail!(
                    "aarch64 EFI image not found at '{}'; download and decompress {} and place it there",
                    p.display(),
                    constants::AARCH64_EFI_IMAGE_BZ2_URL,
                );
            }
            Err(err) => return Err(err).context("stat efi image path"),
        }

        validate_file_hash(&p, constants::AARCH64_EFI_IMAGE_SHA256)
            .context("validate hash of existing efi image")?;

        Ok(Some(p))
    }

    fn alloc_file_path(&self, tap_name: &str) -> Result<PathBuf> {
        nettap::validate_tap_name(tap_name).context("validate tap name")?;
        Ok(self.path.join(format!("{TAP_ALLOC_PREFIX}{tap_name}")))
    }

    pub fn save_net_tap_allocation(&self, tap_name: &str, pid: u32) -> Result<()> {
        let alloc_path = self.alloc_file_path(tap_name)?;

        fs::write(&alloc_path, pid.to_string()).context("write alloc file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&alloc_path, fs::Permissions::from_mode(0o400))
                .context("set alloc file permissions")?;
        }

        Ok(())
    }

    pub fn release_net_tap_allocation(&self, tap_name: &str) -> Result<()> {
        let alloc_path = self.alloc_file_path(tap_name)?;

        match fs::remove_file(&alloc_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(tap = %tap_name, "attempted to remove non-existent tap allocation");
                Ok(())
            }
            Err(err) => Err(err).context("remove alloc file"),
        }
    }

    pub fn list_net_tap_allocations(&self) -> Result<Vec<Alloc>> {
        let entries = fs::read_dir(&self.path).context("read data dir")?;

        let mut allocs = Vec::new();
        for entry in entries {
            let entry = entry.context("read data dir entry")?;
            let name = entry.file_name().to_string_lossy().into_owned();

            let Some(tap_name) = name.strip_prefix(TAP_ALLOC_PREFIX) else {
                continue;
            };

            if let Err(err) = nettap::validate_tap_name(tap_name) {
                error!(
                    error = %err,
                    name = %tap_name,
                    path = %entry.path().display(),
                    "failed to validate network tap name in tap allocation file, skipping. External interference?"
                );
                continue;
            }

            let data = fs::read_to_string(entry.path())
                .with_context(|| format!("read tap alloc file '{}'", entry.path().display()))?;
            let pid: u32 = data
                .trim()
                .parse()
                .with_context(|| format!("parse pid (alloc file '{}')", entry.path().display()))?;

            allocs.push(Alloc {
                tap_name: tap_name.to_string(),
                pid,
            });
        }

        Ok(allocs)
    }

    /// For `build --overwrite`: remove an existing image if overwriting is
    /// allowed, otherwise refuse. Returns whether a file was removed.
    pub fn check_exists_or_remove(path: &Path, overwrite: bool) -> Result<bool> {
        match fs::metadata(path) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context("stat file"),
            Ok(_) => {
                if !overwrite {
                    bail!(
                        "image '{}' already exists (pass --overwrite to rebuild)",
                        path.display()
                    );
                }
                fs::remove_file(path).context("remove file")?;
                Ok(true)
            }
        }
    }
}

/// Stream a file through SHA-256 and compare against the expected digest.
pub fn validate_file_hash(path: &Path, want_hex: &str) -> Result<()> {
    let mut f = fs::File::open(path).context("open file")?;

    let mut hasher = Sha256::new();
    let mut block = [0u8; 65536];
    loop {
        let read = f.read(&mut block).context("read file block")?;
        if read == 0 {
            break;
        }
        hasher.update(&block[..read]);
    }

    let have_hex = format!("{:x}", hasher.finalize());
    if !have_hex.eq_ignore_ascii_case(want_hex) {
        bail!(
            "hash mismatch: want '{want_hex}', have '{have_hex}' (path '{}')",
            path.display()
        );
    }

    Ok(())
}
