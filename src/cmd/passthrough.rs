//! Passthrough spec parsing: `usb:<vendor_hex>,<product_hex>`,
//! `dev:<path>`, and the `dev_faulty_bs:<path>` compatibility mode.

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::osspecifics;
use crate::vm::{BlockDevicePassthrough, PassthroughConfig, UsbDevicePassthrough};

/// Parse a device passthrough spec into a passthrough config. Block specs
/// validate the device path and detect its logical block size; the caller
/// is responsible for the privilege check.
pub fn parse_spec(val: &str) -> Result<PassthroughConfig> {
    let Some((kind, rest)) = val.split_once(':') else {
        bail!("bad device passthrough syntax: expected '<type>:<value>'");
    };

    match kind {
        "usb" => {
            let Some((vendor, product)) = rest.split_once(',') else {
                bail!("bad usb device passthrough syntax: expected '<vendor_hex>,<product_hex>'");
            };

            let vendor_id = u16::from_str_radix(vendor, 16)
                .map_err(|_| anyhow::anyhow!("bad usb vendor id '{vendor}'"))?;
            let product_id = u16::from_str_radix(product, 16)
                .map_err(|_| anyhow::anyhow!("bad usb product id '{product}'"))?;

            Ok(PassthroughConfig {
                usb: vec![UsbDevicePassthrough {
                    vendor_id,
                    product_id,
                }],
                block: vec![],
            })
        }
        "dev" => {
            osspecifics::check_valid_device_path(rest)
                .with_context(|| format!("check whether device path is valid '{rest}'"))?;

            let block_size = osspecifics::get_device_logical_block_size(rest)
                .with_context(|| format!("get logical block size for device '{rest}'"))?;

            Ok(PassthroughConfig {
                usb: vec![],
                block: vec![BlockDevicePassthrough {
                    path: rest.into(),
                    block_size,
                }],
            })
        }
        "dev_faulty_bs" => {
            // Older releases left block size management to QEMU, which
            // always emulated 512-byte sectors no matter the device.
            // Filesystems written under that assumption look corrupted once
            // the true block size is passed through; this mode re-creates
            // the faulty 512-byte emulation so that data can be recovered.
            warn!(
                "RISK WARNING: Skipping device block size detection and using the default of 512 \
                 bytes. Please use this ONLY to recover data from disks with filesystems that \
                 were locked to the emulated 512-byte block size."
            );

            osspecifics::check_valid_device_path(rest)
                .with_context(|| format!("check whether device path is valid '{rest}'"))?;

            Ok(PassthroughConfig {
                usb: vec![],
                block: vec![BlockDevicePassthrough {
                    path: rest.into(),
                    block_size: 512,
                }],
            })
        }
        other => bail!("unknown device passthrough type '{other}'"),
    }
}

/// Platform-specific heads-up for USB passthrough, which is unstable
/// outside Linux.
pub fn warn_usb_quirks(cfg: &PassthroughConfig) {
    if cfg.usb.is_empty() {
        return;
    }

    if osspecifics::is_windows() {
        warn!(
            "USB passthrough is unstable on Windows and requires installation of the libusbK \
             driver. Please consider using raw block device passthrough instead."
        );
    } else if osspecifics::is_macos() {
        warn!(
            "USB passthrough is unstable on macOS. Please consider using raw block device \
             passthrough instead."
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_spec_parses_hex_ids() {
        let cfg = parse_spec("usb:0951,16a4").unwrap();
        assert_eq!(
            cfg.usb,
            vec![UsbDevicePassthrough {
                vendor_id: 0x0951,
                product_id: 0x16a4
            }]
        );
        assert!(cfg.block.is_empty());
    }

    #[test]
    fn usb_spec_rejects_bad_ids() {
        assert!(parse_spec("usb:zzzz,16a4").is_err());
        assert!(parse_spec("usb:0951,zzzz").is_err());
        assert!(parse_spec("usb:0951").is_err());
        assert!(parse_spec("usb:12345,16a4").is_err());
    }

    #[test]
    fn unknown_and_malformed_specs_rejected() {
        assert!(parse_spec("floppy:/dev/fd0").is_err());
        assert!(parse_spec("justapath").is_err());
        assert!(parse_spec("").is_err());
    }

    #[test]
    fn dev_spec_rejects_missing_device() {
        assert!(parse_spec("dev:/definitely/not/a/device").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dev_faulty_bs_forces_512() {
        // /dev/null passes the device check; faulty-bs mode must not probe
        // the real block size.
        let cfg = parse_spec("dev_faulty_bs:/dev/null").unwrap();
        assert_eq!(cfg.block.len(), 1);
        assert_eq!(cfg.block[0].block_size, 512);
    }
}
