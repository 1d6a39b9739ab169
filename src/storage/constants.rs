//! Pinned guest image identity: Alpine release, per-arch ISO hashes and the
//! aarch64 EFI firmware blob. Bumping the Alpine version means refreshing the
//! hashes below and the image version tag.

pub const BASE_ALPINE_VERSION_MAJOR: &str = "3.18";
pub const BASE_ALPINE_VERSION_MINOR: &str = "3";

/// Version tag of the built VM image layout. Bump when the image build
/// recipe changes incompatibly so stale images stop matching.
pub const LINSK_VM_IMAGE_VERSION: &str = "1";

#[cfg(target_arch = "aarch64")]
const BASE_ALPINE_ARCH: &str = "aarch64";
#[cfg(not(target_arch = "aarch64"))]
const BASE_ALPINE_ARCH: &str = "x86_64";

#[cfg(target_arch = "aarch64")]
const BASE_IMAGE_SHA256: &str =
    "c94593729e4577650d9e73ada28e3cbe56964ab2a27240364f8616e920ed6d4e";
#[cfg(not(target_arch = "aarch64"))]
const BASE_IMAGE_SHA256: &str =
    "925f6bc1039a0abcd0548d2c3054d54dce31cfa03c7eeba22d10d85dc5817c98";

pub const AARCH64_EFI_IMAGE_NAME: &str = "edk2-aarch64-code.fd";
pub const AARCH64_EFI_IMAGE_BZ2_URL: &str =
    "https://github.com/qemu/qemu/raw/86305e864191123dcf87c3af639fddfc59352ac6/pc-bios/edk2-aarch64-code.fd.bz2";
pub const AARCH64_EFI_IMAGE_SHA256: &str =
    "f7f2c02853fda64cad31d4ab95ef636a7c50aac4829290e7b3a73b17d3483fc1";

fn base_alpine_version_combined() -> String {
    format!("{BASE_ALPINE_VERSION_MAJOR}.{BASE_ALPINE_VERSION_MINOR}")
}

pub fn alpine_base_image_url() -> String {
    format!(
        "https://dl-cdn.alpinelinux.org/alpine/v{BASE_ALPINE_VERSION_MAJOR}/releases/{arch}/alpine-virt-{combined}-{arch}.iso",
        arch = BASE_ALPINE_ARCH,
        combined = base_alpine_version_combined(),
    )
}

/// `<alpine-ver>-<arch>`, the shared stem of image file names.
pub fn alpine_base_image_tags() -> String {
    format!("{}-{}", base_alpine_version_combined(), BASE_ALPINE_ARCH)
}

/// `<alpine-ver>-<arch>-linsk<ver>`, the stem of the built VM image name.
pub fn vm_image_tags() -> String {
    format!("{}-linsk{}", alpine_base_image_tags(), LINSK_VM_IMAGE_VERSION)
}

pub fn alpine_base_image_file_name() -> String {
    format!("alpine-{}.img", alpine_base_image_tags())
}

pub fn alpine_base_image_sha256() -> &'static str {
    BASE_IMAGE_SHA256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_names_carry_version_and_arch() {
        let tags = alpine_base_image_tags();
        assert!(tags.starts_with("3.18.3-"));

        let vm_tags = vm_image_tags();
        assert!(vm_tags.starts_with(&tags));
        assert!(vm_tags.ends_with("-linsk1"));

        assert!(alpine_base_image_file_name().starts_with("alpine-3.18.3-"));
        assert!(alpine_base_image_file_name().ends_with(".img"));
    }

    #[test]
    fn base_image_url_points_at_release_tree() {
        let url = alpine_base_image_url();
        assert!(url.starts_with("https://dl-cdn.alpinelinux.org/alpine/v3.18/releases/"));
        assert!(url.ends_with(".iso"));
    }
}
