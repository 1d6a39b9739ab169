//! VM configuration and its translation into a QEMU command line.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::nettap;
use crate::osspecifics;
use crate::qemucli::{self, Arg, KvItem};

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub path: PathBuf,
    /// Discard the guest's writes on exit.
    pub snapshot_mode: bool,
}

#[derive(Debug, Clone)]
pub struct TapConfig {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbDevicePassthrough {
    pub vendor_id: u16,
    pub product_id: u16,
}

#[derive(Debug, Clone)]
pub struct BlockDevicePassthrough {
    pub path: PathBuf,
    pub block_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PassthroughConfig {
    pub usb: Vec<UsbDevicePassthrough>,
    pub block: Vec<BlockDevicePassthrough>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForwardingRule {
    pub host_ip: Option<IpAddr>,
    pub host_port: u16,
    pub vm_port: u16,
}

impl PortForwardingRule {
    /// Parse `host_port:vm_port` or `host_ip:host_port:vm_port`.
    pub fn parse(s: &str) -> Result<Self> {
        // An IPv6 host address would itself contain colons; the accepted
        // grammar keeps to IPv4 literals and port pairs.
        let split: Vec<&str> = s.split(':').collect();
        match split.as_slice() {
            [host_port, vm_port] => Ok(Self {
                host_ip: None,
                host_port: host_port.parse().context("parse host port")?,
                vm_port: vm_port.parse().context("parse vm port")?,
            }),
            [host_ip, host_port, vm_port] => Ok(Self {
                host_ip: Some(host_ip.parse().map_err(|_| {
                    anyhow::anyhow!("bad host ip '{host_ip}'")
                })?),
                host_port: host_port.parse().context("parse host port")?,
                vm_port: vm_port.parse().context("parse vm port")?,
            }),
            parts => bail!("bad split by ':' length: want 2 or 3, have {}", parts.len()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub cdrom_image_path: Option<PathBuf>,
    pub bios_path: Option<PathBuf>,
    pub drives: Vec<DriveConfig>,

    /// In MiB.
    pub memory_alloc: u32,

    pub passthrough: PassthroughConfig,
    pub extra_port_forwarding_rules: Vec<PortForwardingRule>,

    pub unrestricted_networking: bool,
    pub taps: Vec<TapConfig>,

    pub os_up_timeout: Option<Duration>,
    pub ssh_up_timeout: Option<Duration>,

    /// Show the display and pass QEMU warnings through to stderr.
    pub debug: bool,
    /// Install OpenSSH during serial bootstrap. Only meaningful for the
    /// image builder, which boots the stock installer ISO; requires
    /// unrestricted networking.
    pub install_base_utilities: bool,
}

pub(crate) const DEFAULT_OS_UP_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_SSH_UP_TIMEOUT: Duration = Duration::from_secs(120);

/// Unique-within-process QEMU object IDs, derived from a nanosecond stamp.
/// The 1 ms pause guarantees distinct stamps for back-to-back calls.
async fn unique_qemu_id(prefix: &str) -> String {
    tokio::time::sleep(Duration::from_millis(1)).await;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{prefix}{nanos}")
}

/// QEMU on Windows chokes on backslash separators; forward slashes work on
/// every host.
fn clean_qemu_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if osspecifics::is_windows() {
        s.replace('\\', "/")
    } else {
        s.into_owned()
    }
}

fn configure_base_cmd(cfg: &Config) -> Result<(String, Vec<Arg>)> {
    let mut base_cmd = String::from("qemu-system");

    let mut args = vec![
        Arg::str("serial", "stdio")?,
        Arg::uint("m", cfg.memory_alloc as u64)?,
        Arg::uint(
            "smp",
            std::thread::available_parallelism()
                .map(|n| n.get() as u64)
                .unwrap_or(1),
        )?,
    ];

    if osspecifics::is_macos() {
        args.push(Arg::str("cpu", "host")?);
    }

    let accel = if osspecifics::is_windows() {
        vec![KvItem::flag("whpx"), KvItem::new("kernel-irqchip", "off")]
    } else if osspecifics::is_macos() {
        vec![KvItem::flag("hvf")]
    } else {
        vec![KvItem::flag("kvm")]
    };

    match std::env::consts::ARCH {
        "x86_64" => {
            base_cmd.push_str("-x86_64");
        }
        "aarch64" => {
            if cfg.bios_path.is_none() {
                warn!(
                    "BIOS image path is not specified while attempting to run an aarch64 (arm64) \
                     VM. The VM will not boot."
                );
            }

            // "highmem=off" is required for Apple Silicon.
            args.push(Arg::key_value(
                "machine",
                vec![KvItem::new("type", "virt"), KvItem::new("highmem", "off")],
            )?);

            base_cmd.push_str("-aarch64");
        }
        other => bail!("arch '{other}' is not supported"),
    }

    args.push(Arg::key_value("accel", accel)?);

    if let Some(bios_path) = &cfg.bios_path {
        let bios_path = clean_qemu_path(bios_path);
        args.push(
            Arg::str("bios", bios_path.clone())
                .with_context(|| format!("create bios arg (path '{bios_path}')"))?,
        );
    }

    if !cfg.debug {
        args.push(Arg::str("display", "none")?);
    }

    if let Some(cdrom_path) = &cfg.cdrom_image_path {
        let cdrom_path = clean_qemu_path(cdrom_path);
        args.push(
            Arg::str("cdrom", cdrom_path.clone())
                .with_context(|| format!("create cdrom arg (path '{cdrom_path}')"))?,
        );
        args.push(Arg::str("boot", "d")?);
    }

    if osspecifics::is_windows() {
        base_cmd.push_str(".exe");
    }

    Ok((base_cmd, args))
}

async fn configure_user_network(
    ports: &[PortForwardingRule],
    unrestricted: bool,
) -> Result<Vec<Arg>> {
    let net_id = unique_qemu_id("net").await;

    let mut netdev_items = vec![
        KvItem::new("type", "user"),
        KvItem::new("id", net_id.clone()),
    ];

    if !unrestricted {
        netdev_items.push(KvItem::new("restrict", "on"));
    }

    for pf in ports {
        let host_ip = pf.host_ip.map(|ip| ip.to_string()).unwrap_or_default();
        netdev_items.push(KvItem::new(
            "hostfwd",
            format!("tcp:{host_ip}:{}-:{}", pf.host_port, pf.vm_port),
        ));
    }

    Ok(vec![
        Arg::key_value("netdev", netdev_items).context("create netdev key-value arg")?,
        Arg::key_value(
            "device",
            vec![KvItem::new("driver", "virtio-net"), KvItem::new("netdev", net_id)],
        )
        .context("create device key-value arg")?,
    ])
}

async fn configure_tap_network(tap_name: &str) -> Result<Vec<Arg>> {
    nettap::validate_tap_name(tap_name)
        .with_context(|| format!("validate network tap name '{tap_name}'"))?;

    let net_id = unique_qemu_id("net").await;

    // script=no,downscript=no: no privileged helper is ever invoked.
    Ok(vec![
        Arg::key_value(
            "netdev",
            vec![
                KvItem::new("type", "tap"),
                KvItem::new("id", net_id.clone()),
                KvItem::new("ifname", tap_name),
                KvItem::new("script", "no"),
                KvItem::new("downscript", "no"),
            ],
        )
        .context("create netdev key-value arg")?,
        Arg::key_value(
            "device",
            vec![KvItem::new("driver", "virtio-net"), KvItem::new("netdev", net_id)],
        )
        .context("create device key-value arg")?,
    ])
}

async fn configure_networking(cfg: &Config, ssh_port: u16) -> Result<Vec<Arg>> {
    let mut ports = vec![PortForwardingRule {
        host_ip: Some("127.0.0.1".parse().unwrap()),
        host_port: ssh_port,
        vm_port: 22,
    }];
    ports.extend_from_slice(&cfg.extra_port_forwarding_rules);

    if cfg.unrestricted_networking {
        warn!("using unrestricted VM networking");
    }

    let mut args = configure_user_network(&ports, cfg.unrestricted_networking)
        .await
        .context("configure vm cmd user network")?;

    for (i, tap) in cfg.taps.iter().enumerate() {
        let tap_args = configure_tap_network(&tap.name)
            .await
            .with_context(|| format!("configure tap network #{i}"))?;
        args.extend(tap_args);
    }

    Ok(args)
}

async fn configure_drives(cfg: &Config) -> Result<Vec<Arg>> {
    let mut args = Vec::new();

    for (i, drive) in cfg.drives.iter().enumerate() {
        std::fs::metadata(&drive.path).with_context(|| format!("stat drive #{i} path"))?;

        let drive_id = unique_qemu_id("drive").await;
        let drive_path = clean_qemu_path(&drive.path);

        let mut drive_items = vec![
            KvItem::new("file", drive_path.clone()),
            KvItem::new("format", "qcow2"),
            KvItem::new("if", "none"),
            KvItem::new("id", drive_id.clone()),
        ];
        if drive.snapshot_mode {
            drive_items.push(KvItem::new("snapshot", "on"));
        }

        let mut device_items = vec![
            KvItem::new("driver", "virtio-blk-pci"),
            KvItem::new("drive", drive_id),
        ];
        if cfg.cdrom_image_path.is_none() {
            device_items.push(KvItem::new("bootindex", i.to_string()));
        }

        args.push(
            Arg::key_value("drive", drive_items)
                .with_context(|| format!("create drive key-value arg (path '{drive_path}')"))?,
        );
        args.push(
            Arg::key_value("device", device_items)
                .with_context(|| format!("create device key-value arg (path '{drive_path}')"))?,
        );
    }

    Ok(args)
}

fn configure_usb_passthrough(cfg: &Config) -> Result<Vec<Arg>> {
    let mut args = Vec::new();

    if !cfg.passthrough.usb.is_empty() {
        args.push(Arg::key_value(
            "device",
            vec![KvItem::new("driver", "nec-usb-xhci")],
        )?);

        for dev in &cfg.passthrough.usb {
            args.push(Arg::key_value(
                "device",
                vec![
                    KvItem::new("driver", "usb-host"),
                    KvItem::new("vendorid", format!("0x{:04x}", dev.vendor_id)),
                    KvItem::new("productid", format!("0x{:04x}", dev.product_id)),
                ],
            )?);
        }
    }

    Ok(args)
}

async fn configure_block_passthrough(cfg: &Config) -> Result<Vec<Arg>> {
    let mut args = Vec::new();

    if !cfg.passthrough.block.is_empty() {
        warn!(
            "Using raw block device passthrough. Please note that it's YOUR responsibility to \
             ensure that no device is mounted in your OS and the VM at the same time. Otherwise, \
             you run serious risks. No further warnings will be issued."
        );
    }

    for dev in &cfg.passthrough.block {
        let dev_path_str = dev.path.to_string_lossy();

        // Re-checked here even though the safety poller covers the runtime:
        // assembling a command line for an already-mounted device must fail
        // before QEMU ever sees it.
        let seems_mounted = osspecifics::check_device_seems_mounted(&dev_path_str)
            .await
            .with_context(|| format!("check whether device seems to be mounted (path '{dev_path_str}')"))?;
        if seems_mounted {
            bail!("device '{dev_path_str}' seems to be already mounted in the host system");
        }

        if dev.block_size == 0 {
            bail!("invalid zero block size specified for device '{dev_path_str}'");
        }
        if dev.block_size > 65536 {
            bail!(
                "block size specified for device '{dev_path_str}' is too large (max is 65536): '{}'",
                dev.block_size
            );
        }
        if dev.block_size % 512 != 0 {
            bail!(
                "unaligned block size specified for device '{dev_path_str}' (must be in increments of 512): '{}'",
                dev.block_size
            );
        }

        let dev_path = clean_qemu_path(&dev.path);
        let drive_id = unique_qemu_id("drive").await;
        let block_size = dev.block_size.to_string();

        args.push(
            Arg::key_value(
                "drive",
                vec![
                    KvItem::new("file", dev_path.clone()),
                    KvItem::new("format", "raw"),
                    KvItem::new("if", "none"),
                    KvItem::new("id", drive_id.clone()),
                ],
            )
            .with_context(|| format!("create drive key-value arg (path '{dev_path}')"))?,
        );
        args.push(
            Arg::key_value(
                "device",
                vec![
                    KvItem::new("driver", "virtio-blk-pci"),
                    KvItem::new("drive", drive_id),
                    KvItem::new("logical_block_size", block_size.clone()),
                    KvItem::new("physical_block_size", block_size),
                ],
            )
            .with_context(|| format!("create drive device key-value arg (path '{dev_path}')"))?,
        );
    }

    Ok(args)
}

/// Assemble the full QEMU invocation for a config: binary name plus encoded
/// CLI tokens.
pub(crate) async fn build_vm_command(cfg: &Config, ssh_port: u16) -> Result<(String, Vec<String>)> {
    let (base_cmd, mut args) = configure_base_cmd(cfg).context("configure base vm cmd")?;

    args.extend(
        configure_networking(cfg, ssh_port)
            .await
            .context("configure vm cmd networking")?,
    );
    args.extend(configure_drives(cfg).await.context("configure vm cmd drives")?);
    args.extend(configure_usb_passthrough(cfg).context("configure vm cmd usb passthrough")?);
    args.extend(
        configure_block_passthrough(cfg)
            .await
            .context("configure vm cmd block device passthrough")?,
    );

    let encoded = qemucli::encode_args(&args).context("encode qemu cli args")?;
    Ok((base_cmd, encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_drive() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.qcow2");
        std::fs::write(&path, b"qcow2 stub").unwrap();
        (dir, path)
    }

    fn joined(tokens: &[String]) -> String {
        tokens.join(" ")
    }

    #[test]
    fn port_forwarding_rule_two_part_form() {
        let rule = PortForwardingRule::parse("9000:22").unwrap();
        assert_eq!(
            rule,
            PortForwardingRule {
                host_ip: None,
                host_port: 9000,
                vm_port: 22
            }
        );
    }

    #[test]
    fn port_forwarding_rule_three_part_form() {
        let rule = PortForwardingRule::parse("127.0.0.1:9000:445").unwrap();
        assert_eq!(
            rule,
            PortForwardingRule {
                host_ip: Some("127.0.0.1".parse().unwrap()),
                host_port: 9000,
                vm_port: 445
            }
        );
    }

    #[test]
    fn port_forwarding_rule_rejects_other_shapes() {
        assert!(PortForwardingRule::parse("9000").is_err());
        assert!(PortForwardingRule::parse("a:b").is_err());
        assert!(PortForwardingRule::parse("1:2:3:4").is_err());
        assert!(PortForwardingRule::parse("999999:22").is_err());
        assert!(PortForwardingRule::parse("nothost:9000:22").is_err());
        assert!(PortForwardingRule::parse("").is_err());
    }

    #[tokio::test]
    async fn base_command_shape() {
        let (_dir, drive) = temp_drive();
        let cfg = Config {
            drives: vec![DriveConfig {
                path: drive,
                snapshot_mode: true,
            }],
            memory_alloc: 512,
            ..Config::default()
        };

        let (binary, tokens) = build_vm_command(&cfg, 40022).await.unwrap();
        assert!(binary.starts_with("qemu-system-"));

        let line = joined(&tokens);
        assert!(line.contains("-serial stdio"));
        assert!(line.contains("-m 512"));
        assert!(line.contains("-smp "));
        assert!(line.contains("-display none"));
        assert!(line.contains("snapshot=on"));
        assert!(line.contains("driver=virtio-blk-pci"));
        // Nothing marked bootable besides the only drive.
        assert!(line.contains("bootindex=0"));
    }

    #[tokio::test]
    async fn ssh_forward_always_present_and_restricted_by_default() {
        let (_dir, drive) = temp_drive();
        let cfg = Config {
            drives: vec![DriveConfig {
                path: drive,
                snapshot_mode: false,
            }],
            memory_alloc: 512,
            ..Config::default()
        };

        let (_, tokens) = build_vm_command(&cfg, 41111).await.unwrap();
        let line = joined(&tokens);
        assert!(line.contains("hostfwd=tcp:127.0.0.1:41111-:22"));
        assert!(line.contains("restrict=on"));
    }

    #[tokio::test]
    async fn unrestricted_networking_drops_restrict() {
        let (_dir, drive) = temp_drive();
        let cfg = Config {
            drives: vec![DriveConfig {
                path: drive,
                snapshot_mode: false,
            }],
            memory_alloc: 512,
            unrestricted_networking: true,
            ..Config::default()
        };

        let (_, tokens) = build_vm_command(&cfg, 41111).await.unwrap();
        assert!(!joined(&tokens).contains("restrict=on"));
    }

    #[tokio::test]
    async fn extra_forwards_rendered_with_and_without_ip() {
        let (_dir, drive) = temp_drive();
        let cfg = Config {
            drives: vec![DriveConfig {
                path: drive,
                snapshot_mode: false,
            }],
            memory_alloc: 512,
            extra_port_forwarding_rules: vec![
                PortForwardingRule::parse("127.0.0.1:9000:21").unwrap(),
                PortForwardingRule::parse("9001:9001").unwrap(),
            ],
            ..Config::default()
        };

        let (_, tokens) = build_vm_command(&cfg, 41111).await.unwrap();
        let line = joined(&tokens);
        assert!(line.contains("hostfwd=tcp:127.0.0.1:9000-:21"));
        assert!(line.contains("hostfwd=tcp::9001-:9001"));
    }

    #[tokio::test]
    async fn cdrom_adds_boot_d_and_suppresses_bootindex() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("installer.iso");
        std::fs::write(&iso, b"iso").unwrap();
        let drive_path = dir.path().join("disk.qcow2");
        std::fs::write(&drive_path, b"qcow2").unwrap();

        let cfg = Config {
            cdrom_image_path: Some(iso),
            drives: vec![DriveConfig {
                path: drive_path,
                snapshot_mode: false,
            }],
            memory_alloc: 512,
            ..Config::default()
        };

        let (_, tokens) = build_vm_command(&cfg, 41111).await.unwrap();
        let line = joined(&tokens);
        assert!(line.contains("-cdrom"));
        assert!(line.contains("-boot d"));
        assert!(!line.contains("bootindex"));
    }

    #[tokio::test]
    async fn debug_mode_keeps_display() {
        let (_dir, drive) = temp_drive();
        let cfg = Config {
            drives: vec![DriveConfig {
                path: drive,
                snapshot_mode: false,
            }],
            memory_alloc: 512,
            debug: true,
            ..Config::default()
        };

        let (_, tokens) = build_vm_command(&cfg, 41111).await.unwrap();
        assert!(!joined(&tokens).contains("-display"));
    }

    #[tokio::test]
    async fn usb_passthrough_renders_hex_ids_and_xhci() {
        let (_dir, drive) = temp_drive();
        let cfg = Config {
            drives: vec![DriveConfig {
                path: drive,
                snapshot_mode: false,
            }],
            memory_alloc: 512,
            passthrough: PassthroughConfig {
                usb: vec![UsbDevicePassthrough {
                    vendor_id: 0x0951,
                    product_id: 0x16a4,
                }],
                block: vec![],
            },
            ..Config::default()
        };

        let (_, tokens) = build_vm_command(&cfg, 41111).await.unwrap();
        let line = joined(&tokens);
        assert!(line.contains("driver=nec-usb-xhci"));
        assert!(line.contains("vendorid=0x0951"));
        assert!(line.contains("productid=0x16a4"));
    }

    #[tokio::test]
    async fn block_passthrough_validates_block_size() {
        let (_dir, drive) = temp_drive();

        for (block_size, msg) in [
            (0u64, "zero block size"),
            (131072, "too large"),
            (513, "unaligned"),
        ] {
            let cfg = Config {
                drives: vec![DriveConfig {
                    path: drive.clone(),
                    snapshot_mode: false,
                }],
                memory_alloc: 512,
                passthrough: PassthroughConfig {
                    usb: vec![],
                    block: vec![BlockDevicePassthrough {
                        path: drive.clone(),
                        block_size,
                    }],
                },
                ..Config::default()
            };

            let err = build_vm_command(&cfg, 41111).await.unwrap_err();
            assert!(
                format!("{err:#}").contains(msg),
                "block size {block_size}: expected '{msg}' in '{err:#}'"
            );
        }
    }

    #[tokio::test]
    async fn block_passthrough_renders_explicit_block_sizes() {
        let (_dir, drive) = temp_drive();
        let cfg = Config {
            drives: vec![DriveConfig {
                path: drive.clone(),
                snapshot_mode: false,
            }],
            memory_alloc: 512,
            passthrough: PassthroughConfig {
                usb: vec![],
                block: vec![BlockDevicePassthrough {
                    path: drive,
                    block_size: 4096,
                }],
            },
            ..Config::default()
        };

        let (_, tokens) = build_vm_command(&cfg, 41111).await.unwrap();
        let line = joined(&tokens);
        assert!(line.contains("format=raw"));
        assert!(line.contains("logical_block_size=4096"));
        assert!(line.contains("physical_block_size=4096"));
    }

    #[tokio::test]
    async fn missing_drive_file_fails() {
        let cfg = Config {
            drives: vec![DriveConfig {
                path: PathBuf::from("/definitely/not/here.qcow2"),
                snapshot_mode: false,
            }],
            memory_alloc: 512,
            ..Config::default()
        };

        assert!(build_vm_command(&cfg, 41111).await.is_err());
    }

    #[tokio::test]
    async fn tap_nic_renders_with_no_scripts() {
        let (_dir, drive) = temp_drive();
        let cfg = Config {
            drives: vec![DriveConfig {
                path: drive,
                snapshot_mode: false,
            }],
            memory_alloc: 512,
            taps: vec![TapConfig {
                name: "LinskTap-12345".into(),
            }],
            ..Config::default()
        };

        let (_, tokens) = build_vm_command(&cfg, 41111).await.unwrap();
        let line = joined(&tokens);
        assert!(line.contains("ifname=LinskTap-12345"));
        assert!(line.contains("script=no,downscript=no"));
    }

    #[tokio::test]
    async fn invalid_tap_name_fails() {
        let (_dir, drive) = temp_drive();
        let cfg = Config {
            drives: vec![DriveConfig {
                path: drive,
                snapshot_mode: false,
            }],
            memory_alloc: 512,
            taps: vec![TapConfig { name: "eth0".into() }],
            ..Config::default()
        };

        assert!(build_vm_command(&cfg, 41111).await.is_err());
    }

    #[tokio::test]
    async fn generated_ids_are_unique() {
        let a = unique_qemu_id("net").await;
        let b = unique_qemu_id("net").await;
        assert_ne!(a, b);
        assert!(a.starts_with("net"));
    }
}
