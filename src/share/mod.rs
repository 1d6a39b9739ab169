//! Network file share backends.
//!
//! Each backend has a two-phase contract. The declaration phase is pure:
//! given the user configuration it claims host port forwards and/or requests
//! tap networking, before the VM is even configured. The apply phase runs
//! once the VM is ready: it starts the corresponding in-guest daemon through
//! the file manager, sets the ephemeral share password and returns the URL
//! the host OS should mount.

pub mod ports;

use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::warn;

use crate::nettap::TapNet;
use crate::osspecifics;
use crate::vm::{FileManager, PortForwardingRule};

const SMB_PORT: u16 = 445;
const AFP_PORT: u16 = 548;
const FTP_PASSIVE_PORT_COUNT: u16 = 9;

pub fn default_listen_ip() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// SMB external mode is the default on the one host OS whose SMB client
/// cannot address a nonstandard port.
pub fn is_smb_ext_mode_default() -> bool {
    osspecifics::is_windows()
}

/// Share configuration exactly as it arrived from the CLI.
pub struct RawUserConfig {
    pub listen_ip: String,
    pub ftp_ext_ip: String,
    pub smb_ext_mode: bool,
}

pub struct UserConfig {
    listen_ip: IpAddr,
    ftp_ext_ip: IpAddr,
    smb_ext_mode: bool,
}

impl RawUserConfig {
    pub fn process(&self, backend_id: &str) -> Result<UserConfig> {
        let listen_ip: IpAddr = self
            .listen_ip
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid listen ip '{}'", self.listen_ip))?;
        let ftp_ext_ip: IpAddr = self
            .ftp_ext_ip
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid ftp ext ip '{}'", self.ftp_ext_ip))?;

        if backend_id == "ftp" {
            if listen_ip != default_listen_ip() && ftp_ext_ip == default_listen_ip() {
                warn!(
                    "no external FTP IP address via --ftp-extip was configured. This is a \
                     requirement in almost all scenarios if you want to connect remotely"
                );
            }
        } else if ftp_ext_ip != default_listen_ip() {
            warn!(
                selected = %backend_id,
                "FTP external IP address specification is ineffective with non-FTP backends"
            );
        }

        if self.smb_ext_mode && backend_id != "smb" && !is_smb_ext_mode_default() {
            warn!("SMB external mode specification is ineffective with non-SMB backends");
        }

        Ok(UserConfig {
            listen_ip,
            ftp_ext_ip,
            smb_ext_mode: self.smb_ext_mode,
        })
    }
}

/// What a backend needs from the VM before it boots.
#[derive(Debug, Clone, Default)]
pub struct ShareOptions {
    pub ports: Vec<PortForwardingRule>,
    pub enable_tap: bool,
}

/// Tap networking state handed to the apply phase when a backend requested
/// `enable_tap`.
pub struct NetTapRuntime {
    pub name: String,
    pub net: TapNet,
}

pub struct ShareContext<'a> {
    pub file_manager: &'a FileManager,
    pub net_tap: Option<&'a NetTapRuntime>,
}

#[derive(Debug)]
pub enum Backend {
    Ftp(FtpBackend),
    Smb(SmbBackend),
    Afp(AfpBackend),
}

impl Backend {
    /// Resolve a backend identifier and run its declaration phase.
    pub fn new(id: &str, uc: &UserConfig) -> Result<(Self, ShareOptions)> {
        match id {
            "ftp" => {
                let (backend, opts) = FtpBackend::new(uc)?;
                Ok((Backend::Ftp(backend), opts))
            }
            "smb" => {
                let (backend, opts) = SmbBackend::new(uc)?;
                Ok((Backend::Smb(backend), opts))
            }
            "afp" => {
                let (backend, opts) = AfpBackend::new(uc)?;
                Ok((Backend::Afp(backend), opts))
            }
            other => bail!("unknown file share backend '{other}'"),
        }
    }

    /// Start the share daemon inside the ready VM and return the
    /// client-facing URL.
    pub async fn apply(&self, share_pwd: &str, ctx: &ShareContext<'_>) -> Result<String> {
        match self {
            Backend::Ftp(b) => b.apply(share_pwd, ctx).await,
            Backend::Smb(b) => b.apply(share_pwd, ctx).await,
            Backend::Afp(b) => b.apply(share_pwd, ctx).await,
        }
    }
}

pub struct FtpBackend {
    share_port: u16,
    passive_port_count: u16,
    ext_ip: IpAddr,
}

impl FtpBackend {
    fn new(uc: &UserConfig) -> Result<(Self, ShareOptions)> {
        let passive_port_count = FTP_PASSIVE_PORT_COUNT;

        let share_port =
            ports::network_share_port(passive_port_count).context("get network share port")?;

        // Control port forwards to guest FTP; the passive window forwards
        // 1:1 so the ports vsftpd advertises are the ports the host dials.
        let mut port_rules = vec![PortForwardingRule {
            host_ip: Some(uc.listen_ip),
            host_port: share_port,
            vm_port: 21,
        }];
        for i in 0..passive_port_count {
            let p = share_port + 1 + i;
            port_rules.push(PortForwardingRule {
                host_ip: Some(uc.listen_ip),
                host_port: p,
                vm_port: p,
            });
        }

        Ok((
            Self {
                share_port,
                passive_port_count,
                ext_ip: uc.ftp_ext_ip,
            },
            ShareOptions {
                ports: port_rules,
                enable_tap: false,
            },
        ))
    }

    async fn apply(&self, share_pwd: &str, ctx: &ShareContext<'_>) -> Result<String> {
        if ctx.net_tap.is_some() {
            bail!("net taps are unsupported in ftp");
        }

        ctx.file_manager
            .start_ftp(
                share_pwd,
                self.share_port + 1,
                self.passive_port_count,
                self.ext_ip,
            )
            .await
            .context("start ftp server")?;

        Ok(format!("ftp://{}:{}", self.ext_ip, self.share_port))
    }
}

pub struct SmbBackend {
    listen_ip: IpAddr,
    share_port: Option<u16>,
}

impl SmbBackend {
    fn new(uc: &UserConfig) -> Result<(Self, ShareOptions)> {
        if uc.smb_ext_mode {
            return Ok((
                Self {
                    listen_ip: uc.listen_ip,
                    share_port: None,
                },
                ShareOptions {
                    ports: Vec::new(),
                    enable_tap: true,
                },
            ));
        }

        let share_port = ports::network_share_port(0).context("get network share port")?;

        Ok((
            Self {
                listen_ip: uc.listen_ip,
                share_port: Some(share_port),
            },
            ShareOptions {
                ports: vec![PortForwardingRule {
                    host_ip: Some(uc.listen_ip),
                    host_port: share_port,
                    vm_port: SMB_PORT,
                }],
                enable_tap: false,
            },
        ))
    }

    async fn apply(&self, share_pwd: &str, ctx: &ShareContext<'_>) -> Result<String> {
        if self.share_port.is_some() && ctx.net_tap.is_some() {
            bail!("conflict: configured to use a forwarded port but a net tap configuration was detected");
        }
        if self.share_port.is_none() && ctx.net_tap.is_none() {
            bail!("no net tap configuration found");
        }

        ctx.file_manager
            .start_smb(share_pwd)
            .await
            .context("start smb server")?;

        match (self.share_port, ctx.net_tap) {
            (Some(port), _) => Ok(format!(
                "smb://{}/linsk",
                join_host_port(self.listen_ip, port)
            )),
            (None, Some(tap)) => {
                if osspecifics::is_windows() {
                    // The Windows UNC form cannot carry a raw IPv6 literal;
                    // the ipv6-literal.net transcription dashes it out.
                    Ok(format!(
                        r"\\{}.ipv6-literal.net\linsk",
                        tap.net.guest_ip.to_string().replace(':', "-")
                    ))
                } else {
                    Ok(format!(
                        "smb://{}/linsk",
                        join_host_port(tap.net.guest_ip.into(), SMB_PORT)
                    ))
                }
            }
            (None, None) => unreachable!("checked above"),
        }
    }
}

pub struct AfpBackend {
    listen_ip: IpAddr,
    share_port: u16,
}

impl AfpBackend {
    fn new(uc: &UserConfig) -> Result<(Self, ShareOptions)> {
        let share_port = ports::network_share_port(0).context("get network share port")?;

        Ok((
            Self {
                listen_ip: uc.listen_ip,
                share_port,
            },
            ShareOptions {
                ports: vec![PortForwardingRule {
                    host_ip: Some(uc.listen_ip),
                    host_port: share_port,
                    vm_port: AFP_PORT,
                }],
                enable_tap: false,
            },
        ))
    }

    async fn apply(&self, share_pwd: &str, ctx: &ShareContext<'_>) -> Result<String> {
        ctx.file_manager
            .start_afp(share_pwd)
            .await
            .context("start afp server")?;

        Ok(format!(
            "afp://{}/linsk",
            join_host_port(self.listen_ip, self.share_port)
        ))
    }
}

fn join_host_port(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}

/// The ephemeral share password: 16 characters, exactly 10 digits, the rest
/// mixed-case letters, no symbols.
pub fn generate_share_password() -> String {
    let mut rng = rand::thread_rng();

    let mut chars: Vec<char> = Vec::with_capacity(16);
    for _ in 0..10 {
        chars.push(rng.gen_range(b'0'..=b'9') as char);
    }
    // Mixed case guaranteed: one of each, then four coin flips.
    chars.push(rng.gen_range(b'a'..=b'z') as char);
    chars.push(rng.gen_range(b'A'..=b'Z') as char);
    for _ in 0..4 {
        if rng.gen_bool(0.5) {
            chars.push(rng.gen_range(b'a'..=b'z') as char);
        } else {
            chars.push(rng.gen_range(b'A'..=b'Z') as char);
        }
    }

    chars.shuffle(&mut rng);
    chars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_config(smb_ext_mode: bool) -> UserConfig {
        RawUserConfig {
            listen_ip: "127.0.0.1".into(),
            ftp_ext_ip: "127.0.0.1".into(),
            smb_ext_mode,
        }
        .process("smb")
        .unwrap()
    }

    #[test]
    fn raw_config_rejects_bad_ips() {
        let bad_listen = RawUserConfig {
            listen_ip: "not-an-ip".into(),
            ftp_ext_ip: "127.0.0.1".into(),
            smb_ext_mode: false,
        };
        assert!(bad_listen.process("ftp").is_err());

        let bad_ext = RawUserConfig {
            listen_ip: "127.0.0.1".into(),
            ftp_ext_ip: "".into(),
            smb_ext_mode: false,
        };
        assert!(bad_ext.process("ftp").is_err());
    }

    #[test]
    fn unknown_backend_id_rejected() {
        let uc = user_config(false);
        let err = Backend::new("nfs", &uc).unwrap_err();
        assert!(err.to_string().contains("unknown file share backend"));
    }

    #[test]
    fn ftp_declares_control_plus_passive_window() {
        let uc = user_config(false);
        let (_, opts) = Backend::new("ftp", &uc).unwrap();

        assert!(!opts.enable_tap);
        assert_eq!(opts.ports.len(), 10);

        let control = &opts.ports[0];
        assert!(control.host_port >= 9000);
        assert_eq!(control.vm_port, 21);

        for (i, rule) in opts.ports[1..].iter().enumerate() {
            let expected = control.host_port + 1 + i as u16;
            assert_eq!(rule.host_port, expected);
            // Passive ports forward 1:1 so the advertised port is dialable.
            assert_eq!(rule.vm_port, expected);
        }
    }

    #[test]
    fn smb_normal_mode_forwards_to_445() {
        let uc = user_config(false);
        let (_, opts) = Backend::new("smb", &uc).unwrap();

        assert!(!opts.enable_tap);
        assert_eq!(opts.ports.len(), 1);
        assert!(opts.ports[0].host_port >= 9000);
        assert_eq!(opts.ports[0].vm_port, 445);
    }

    #[test]
    fn smb_external_mode_requests_tap_instead_of_ports() {
        let uc = user_config(true);
        let (_, opts) = Backend::new("smb", &uc).unwrap();

        assert!(opts.enable_tap);
        assert!(opts.ports.is_empty());
    }

    #[test]
    fn afp_forwards_to_548() {
        let uc = user_config(false);
        let (_, opts) = Backend::new("afp", &uc).unwrap();

        assert!(!opts.enable_tap);
        assert_eq!(opts.ports.len(), 1);
        assert_eq!(opts.ports[0].vm_port, 548);
    }

    #[test]
    fn join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("127.0.0.1".parse().unwrap(), 9000), "127.0.0.1:9000");
        assert_eq!(join_host_port("fe80::1".parse().unwrap(), 445), "[fe80::1]:445");
    }

    #[test]
    fn share_password_shape() {
        for _ in 0..16 {
            let pwd = generate_share_password();
            assert_eq!(pwd.chars().count(), 16);
            assert_eq!(pwd.chars().filter(|c| c.is_ascii_digit()).count(), 10);
            assert!(pwd.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(pwd.chars().any(|c| c.is_ascii_lowercase()));
            assert!(pwd.chars().any(|c| c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn share_passwords_are_not_repeated() {
        assert_ne!(generate_share_password(), generate_share_password());
    }
}
