//! Host↔guest tap networking.
//!
//! A tap interface gives the host a point-to-point Ethernet link to the
//! guest's second NIC, used by the SMB-external share mode where the host OS
//! cannot address a forwarded port. Interface lifecycle management is
//! implemented for Windows only (via the OpenVPN `tapctl.exe` driver
//! utility); everywhere else the manager reports itself unavailable. The
//! pure pieces — naming, the IPv6 point-to-point plan and dangling-allocation
//! arithmetic — are platform-independent and live here.

use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TapError {
    #[error("tap not found")]
    NotFound,
    #[error("tap manager is implemented on windows only")]
    Unimplemented,
}

// A dedicated name format avoids ever touching interfaces we do not own.
static TAP_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^LinskTap-\d+$").unwrap());

pub fn validate_tap_name(s: &str) -> Result<()> {
    if !TAP_NAME.is_match(s) {
        bail!("invalid tap name '{s}'");
    }
    Ok(())
}

/// Produce a tap name unique within (and across) processes. The 1 ms pause
/// guarantees distinct nanosecond stamps for back-to-back calls.
pub async fn new_unique_name() -> String {
    tokio::time::sleep(Duration::from_millis(1)).await;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("LinskTap-{nanos}")
}

/// The host↔guest IPv6 point-to-point plan for one tap interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapNet {
    pub host_ip: Ipv6Addr,
    pub guest_ip: Ipv6Addr,
    pub host_cidr: String,
    pub guest_cidr: String,
}

/// Generate a fresh `/127` pair under the fixed internal prefix: the host
/// address has the low bit cleared, the guest address has it set, and the
/// 32-bit suffix is random so concurrent runs never collide.
pub fn generate_net() -> TapNet {
    // Linsk internal network IPv6 prefix.
    let mut host: [u8; 16] = "fe8f:5980:3253:7df4:0f4b:6db1::"
        .parse::<Ipv6Addr>()
        .expect("static prefix parses")
        .octets();

    rand::thread_rng().fill_bytes(&mut host[12..]);
    host[15] &= 0xfe;

    let mut guest = host;
    guest[15] |= 0x01;

    let host_ip = Ipv6Addr::from(host);
    let guest_ip = Ipv6Addr::from(guest);

    TapNet {
        host_cidr: format!("{host_ip}/127"),
        guest_cidr: format!("{guest_ip}/127"),
        host_ip,
        guest_ip,
    }
}

/// A persisted tap-interface ownership record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alloc {
    pub tap_name: String,
    pub pid: u32,
}

impl Alloc {
    pub fn validate(&self) -> Result<()> {
        validate_tap_name(&self.tap_name).context("validate tap name")?;

        if self.pid == 0 {
            bail!("pid is zero");
        }
        if self.pid > i32::MAX as u32 {
            bail!("pid int32 overflow ({})", self.pid);
        }

        Ok(())
    }
}

/// The subset of allocations whose owning PID is no longer running. Pure set
/// arithmetic; the caller supplies the current process list.
pub fn dangling_taps(allocs: &[Alloc], running_pids: &HashSet<u32>) -> Vec<String> {
    allocs
        .iter()
        .filter(|a| !running_pids.contains(&a.pid))
        .map(|a| a.tap_name.clone())
        .collect()
}

#[cfg(windows)]
mod imp {
    use std::collections::HashSet;
    use std::path::PathBuf;

    use anyhow::{bail, Context, Result};
    use tokio::process::Command;
    use tracing::{error, info, warn};

    use super::{dangling_taps, validate_tap_name, Alloc, TapError};
    use crate::util::clear_unprintable;

    pub fn available() -> bool {
        true
    }

    pub struct TapManager {
        tapctl_path: PathBuf,
    }

    impl TapManager {
        pub fn new() -> Result<Self> {
            let tapctl_path = PathBuf::from(r"C:\Program Files\OpenVPN\bin\tapctl.exe");
            if let Err(err) = std::fs::metadata(&tapctl_path) {
                if err.kind() == std::io::ErrorKind::NotFound {
                    warn!(
                        "Required OpenVPN tap networking Windows drivers do not appear to be \
                         installed. The easiest way to get them is to install OpenVPN: \
                         https://openvpn.net/community-downloads/"
                    );
                }
                return Err(err)
                    .with_context(|| format!("stat tapctl path '{}'", tapctl_path.display()));
            }

            Ok(Self { tapctl_path })
        }

        pub async fn create_tap(&self, tap_name: &str) -> Result<()> {
            validate_tap_name(tap_name).context("validate tap name")?;

            let out = Command::new(&self.tapctl_path)
                .args(["create", "--name", tap_name])
                .output()
                .await
                .context("exec tapctl create cmd")?;
            if !out.status.success() {
                bail!(
                    "tapctl create failed (out '{}')",
                    clear_unprintable(&String::from_utf8_lossy(&out.stdout), false)
                );
            }

            info!(name = %tap_name, "created network tap");
            Ok(())
        }

        /// Remove a tap by name. `tapctl delete` only accepts the interface
        /// UUID, so the tap list is scanned for the matching name first.
        pub async fn delete_tap(&self, tap_name: &str) -> Result<()> {
            let out = Command::new(&self.tapctl_path)
                .arg("list")
                .output()
                .await
                .context("exec tapctl list cmd")?;
            if !out.status.success() {
                bail!(
                    "tapctl list failed (out '{}')",
                    clear_unprintable(&String::from_utf8_lossy(&out.stderr), false)
                );
            }

            let listing = String::from_utf8_lossy(&out.stdout);
            for line in listing.lines() {
                if line.is_empty() {
                    continue;
                }

                let line = clear_unprintable(&line.replace('\t', " "), false);
                let mut split = line.split_whitespace();
                let (Some(uuid_field), Some(name_field)) = (split.next(), split.next()) else {
                    bail!("bad tap list item (line '{line}')");
                };

                if name_field != tap_name {
                    continue;
                }

                let uuid_str = uuid_field.trim_start_matches('{').trim_end_matches('}');
                let tap_uuid: uuid::Uuid = uuid_str
                    .parse()
                    .with_context(|| format!("parse tap uuid (value '{uuid_str}', line '{line}')"))?;

                let del = Command::new(&self.tapctl_path)
                    .args(["delete", &format!("{{{tap_uuid}}}")])
                    .output()
                    .await
                    .context("exec tapctl delete cmd")?;
                if !del.status.success() {
                    bail!(
                        "tapctl delete failed (out '{}')",
                        clear_unprintable(&String::from_utf8_lossy(&del.stdout), false)
                    );
                }

                info!(name = %tap_name, "deleted network tap");
                return Ok(());
            }

            Err(TapError::NotFound.into())
        }

        /// Assign the host side of the `/127` link to the interface.
        pub async fn configure_net(&self, tap_name: &str, host_cidr: &str) -> Result<()> {
            validate_tap_name(tap_name).context("validate tap name")?;

            let (addr, _prefix) = host_cidr
                .split_once('/')
                .with_context(|| format!("parse cidr '{host_cidr}'"))?;
            if addr.parse::<std::net::Ipv6Addr>().is_err() {
                bail!("ipv6 is accepted only (have '{addr}')");
            }

            let out = Command::new("netsh")
                .args(["interface", "ipv6", "set", "address", tap_name, host_cidr])
                .output()
                .await
                .context("exec netsh cmd")?;
            if !out.status.success() {
                bail!(
                    "netsh set address failed (out '{}')",
                    clear_unprintable(&String::from_utf8_lossy(&out.stdout), false)
                );
            }

            info!(name = %tap_name, cidr = %host_cidr, "configured network tap");
            Ok(())
        }

        /// Delete every tap whose owning process is gone and report which
        /// ones were removed. Individual deletion failures are logged and do
        /// not abort the sweep; a tap that already disappeared is skipped
        /// with a warning and omitted from the returned list.
        pub async fn prune_taps(&self, known_allocs: &[Alloc]) -> Result<Vec<String>> {
            for (i, alloc) in known_allocs.iter().enumerate() {
                alloc.validate().with_context(|| format!("validate alloc #{i}"))?;
            }

            let running = running_pids().await.context("get running pids")?;

            let mut removed = Vec::new();
            for tap_name in dangling_taps(known_allocs, &running) {
                info!(name = %tap_name, "found a dangling network tap");

                match self.delete_tap(&tap_name).await {
                    Ok(()) => removed.push(tap_name),
                    Err(err) if err.downcast_ref::<TapError>() == Some(&TapError::NotFound) => {
                        warn!(name = %tap_name, "attempted to prune a network tap that doesn't exist, skipping");
                    }
                    Err(err) => {
                        error!(name = %tap_name, error = %err, "failed to delete dangling tap");
                    }
                }
            }

            Ok(removed)
        }
    }

    async fn running_pids() -> Result<HashSet<u32>> {
        let out = Command::new("tasklist")
            .args(["/NH", "/FO", "CSV"])
            .output()
            .await
            .context("exec tasklist cmd")?;
        if !out.status.success() {
            bail!("tasklist exited with {}", out.status);
        }

        let listing = String::from_utf8_lossy(&out.stdout);
        let mut pids = HashSet::new();
        for line in listing.lines() {
            // "name","pid","session name","session#","mem usage"
            let mut fields = line.split("\",\"");
            let Some(pid_field) = fields.nth(1) else {
                continue;
            };
            if let Ok(pid) = pid_field.trim_matches('"').parse() {
                pids.insert(pid);
            }
        }

        Ok(pids)
    }
}

#[cfg(not(windows))]
mod imp {
    use anyhow::Result;

    use super::{Alloc, TapError};

    pub fn available() -> bool {
        false
    }

    /// Stub manager for hosts without tap support; every operation reports
    /// the well-known unimplemented error.
    pub struct TapManager {}

    impl TapManager {
        pub fn new() -> Result<Self> {
            Err(TapError::Unimplemented.into())
        }

        pub async fn create_tap(&self, _tap_name: &str) -> Result<()> {
            Err(TapError::Unimplemented.into())
        }

        pub async fn delete_tap(&self, _tap_name: &str) -> Result<()> {
            Err(TapError::Unimplemented.into())
        }

        pub async fn configure_net(&self, _tap_name: &str, _host_cidr: &str) -> Result<()> {
            Err(TapError::Unimplemented.into())
        }

        pub async fn prune_taps(&self, _known_allocs: &[Alloc]) -> Result<Vec<String>> {
            Err(TapError::Unimplemented.into())
        }
    }
}

pub use imp::{available, TapManager};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_name_pattern() {
        assert!(validate_tap_name("LinskTap-1000").is_ok());
        assert!(validate_tap_name("LinskTap-1695659701111111111").is_ok());
        assert!(validate_tap_name("LinskTap-").is_err());
        assert!(validate_tap_name("LinskTap-12a").is_err());
        assert!(validate_tap_name("linsktap-12").is_err());
        assert!(validate_tap_name("eth0").is_err());
        assert!(validate_tap_name("LinskTap-1 ").is_err());
    }

    #[tokio::test]
    async fn unique_names_validate_and_differ() {
        let a = new_unique_name().await;
        let b = new_unique_name().await;
        assert!(validate_tap_name(&a).is_ok());
        assert!(validate_tap_name(&b).is_ok());
        assert_ne!(a, b);
    }

    #[test]
    fn generated_net_is_a_127_pair() {
        let net = generate_net();

        let host = net.host_ip.octets();
        let guest = net.guest_ip.octets();

        // Shared 96-bit prefix plus identical suffix up to the low bit.
        assert_eq!(host[..12], guest[..12]);
        assert_eq!(
            host[..12],
            "fe8f:5980:3253:7df4:0f4b:6db1::"
                .parse::<Ipv6Addr>()
                .unwrap()
                .octets()[..12]
        );
        assert_eq!(host[15] & 1, 0);
        assert_eq!(guest[15] & 1, 1);
        assert_eq!(host[15] | 1, guest[15]);

        assert!(net.host_cidr.ends_with("/127"));
        assert!(net.guest_cidr.ends_with("/127"));
    }

    #[test]
    fn generated_nets_differ() {
        // The 32-bit random suffix makes collisions between two draws
        // astronomically unlikely.
        assert_ne!(generate_net().host_ip, generate_net().host_ip);
    }

    #[test]
    fn alloc_validation() {
        let ok = Alloc {
            tap_name: "LinskTap-42".into(),
            pid: 1234,
        };
        assert!(ok.validate().is_ok());

        let bad_name = Alloc {
            tap_name: "tap0".into(),
            pid: 1234,
        };
        assert!(bad_name.validate().is_err());

        let zero_pid = Alloc {
            tap_name: "LinskTap-42".into(),
            pid: 0,
        };
        assert!(zero_pid.validate().is_err());

        let overflow_pid = Alloc {
            tap_name: "LinskTap-42".into(),
            pid: u32::MAX,
        };
        assert!(overflow_pid.validate().is_err());
    }

    #[test]
    fn dangling_taps_returns_exactly_the_dead_ones() {
        let allocs = vec![
            Alloc {
                tap_name: "LinskTap-1000".into(),
                pid: 101,
            },
            Alloc {
                tap_name: "LinskTap-2000".into(),
                pid: 202,
            },
            Alloc {
                tap_name: "LinskTap-3000".into(),
                pid: 303,
            },
        ];

        let running: HashSet<u32> = [101, 303].into_iter().collect();
        assert_eq!(dangling_taps(&allocs, &running), vec!["LinskTap-2000"]);

        let all_running: HashSet<u32> = [101, 202, 303].into_iter().collect();
        assert!(dangling_taps(&allocs, &all_running).is_empty());

        let none_running = HashSet::new();
        assert_eq!(
            dangling_taps(&allocs, &none_running),
            vec!["LinskTap-1000", "LinskTap-2000", "LinskTap-3000"]
        );
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn manager_is_unavailable_off_windows() {
        assert!(!available());
        let err = TapManager::new().err().unwrap();
        assert_eq!(
            err.downcast_ref::<TapError>(),
            Some(&TapError::Unimplemented)
        );
    }
}
