//! SSH/SCP broker.
//!
//! Guest access after bootstrap goes through the OpenSSH client binaries.
//! Trust is not first-use: a per-run RSA-4096 keypair is generated with
//! `ssh-keygen` and injected over the serial console, and the guest's host
//! keys are scanned with `ssh-keyscan -H` inside the bootstrap window while
//! nothing else can reach the forwarded SSH port. The scanned keys are
//! pinned into a per-run `known_hosts` file; every subsequent `ssh`/`scp`
//! invocation runs with strict host key checking against exactly that file.
//! Every session carries its own deadline — a stuck session is killed and
//! surfaces as a `timed out (...)` error rather than hanging the supervisor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::util::{log_err_msg, shell_quote, wait_for_true};

/// Default deadline for one-shot command execution.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for interactive password changes.
pub const PASSWD_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for config file uploads.
pub const SCP_TIMEOUT: Duration = Duration::from_secs(5);

/// Generate the per-run RSA-4096 keypair under `dir` and return the private
/// key path together with the `authorized_keys` line for the public half.
pub async fn generate_keypair(dir: &Path) -> Result<(PathBuf, String)> {
    let key_path = dir.join("id_rsa");

    let out = Command::new("ssh-keygen")
        .args(["-q", "-t", "rsa", "-b", "4096", "-N", "", "-C", "linsk"])
        .arg("-f")
        .arg(&key_path)
        .stdin(Stdio::null())
        .output()
        .await
        .context("run ssh-keygen")?;
    if !out.status.success() {
        bail!(
            "ssh-keygen failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }

    let public_key = std::fs::read_to_string(key_path.with_extension("pub"))
        .context("read generated public key")?
        .trim()
        .to_string();

    Ok((key_path, public_key))
}

/// The guest host keys captured during the bootstrap window, keyed by key
/// type (`ssh-ed25519`, `rsa-sha2-512`, ...), value being the raw marshaled
/// key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedHostKeys {
    keys: HashMap<String, Vec<u8>>,
}

impl PinnedHostKeys {
    /// Parse `ssh-keyscan -H` output: one `<hashed-host> <key-type>
    /// <base64-key>` triple per line.
    pub fn parse(scan: &str) -> Result<Self> {
        let mut keys = HashMap::new();

        for line in scan.lines() {
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() != 3 {
                bail!(
                    "bad split ssh identity string length: want 3, have {} ('{line}')",
                    fields.len()
                );
            }

            let key = base64::engine::general_purpose::STANDARD
                .decode(fields[2])
                .context("decode base64 public key")?;

            keys.insert(fields[1].to_string(), key);
        }

        if keys.is_empty() {
            bail!("keyscan yielded no host keys");
        }

        Ok(Self { keys })
    }

    /// Check a presented key against the pinned set: the type must be known
    /// and the marshaled bytes must match exactly.
    pub fn verify(&self, key_type: &str, marshaled: &[u8]) -> Result<()> {
        let Some(known) = self.keys.get(key_type) else {
            bail!("unknown key type '{key_type}'");
        };

        if known != marshaled {
            bail!("public key mismatch");
        }

        Ok(())
    }

    /// Render a `known_hosts` file pinning these keys for `[host]:port`.
    pub fn known_hosts_contents(&self, host: &str, port: u16) -> String {
        let mut types: Vec<&String> = self.keys.keys().collect();
        types.sort();

        let mut out = String::new();
        for key_type in types {
            let blob = base64::engine::general_purpose::STANDARD.encode(&self.keys[key_type]);
            out.push_str(&format!("[{host}]:{port} {key_type} {blob}\n"));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Authenticated access to the guest's forwarded SSH port. Owns the
/// ephemeral key directory; dropping the last handle removes the private key
/// and the pinned `known_hosts` from disk.
#[derive(Debug)]
pub struct SshAccess {
    port: u16,
    key_path: PathBuf,
    known_hosts_path: PathBuf,
    cancel: watch::Receiver<bool>,
    _key_dir: TempDir,
}

impl SshAccess {
    pub(crate) fn new(
        port: u16,
        key_dir: TempDir,
        key_path: PathBuf,
        pinned: &PinnedHostKeys,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self> {
        let known_hosts_path = key_dir.path().join("known_hosts");
        std::fs::write(
            &known_hosts_path,
            pinned.known_hosts_contents("127.0.0.1", port),
        )
        .context("write pinned known_hosts")?;

        Ok(Self {
            port,
            key_path,
            known_hosts_path,
            cancel,
            _key_dir: key_dir,
        })
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "IdentitiesOnly=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=yes".into(),
            "-o".into(),
            format!("UserKnownHostsFile={}", self.known_hosts_path.display()),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            "ConnectTimeout=5".into(),
        ]
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i").arg(&self.key_path);
        cmd.args(["-p", &self.port.to_string()]);
        cmd.args(self.common_options());
        cmd.arg("root@127.0.0.1");
        cmd
    }

    /// Spawn a remote command with piped stdio. The caller drives stdin and
    /// waits through [`SshChild`].
    pub fn spawn(&self, remote_cmd: &str) -> Result<SshChild> {
        let mut cmd = self.ssh_command();
        cmd.arg(remote_cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().context("spawn ssh client")?;

        let stdout = child.stdout.take().context("take ssh stdout")?;
        let stderr = child.stderr.take().context("take ssh stderr")?;

        let stdout_task = tokio::spawn(async move { read_all(stdout).await });
        let stderr_task = tokio::spawn(async move { read_all(stderr).await });

        Ok(SshChild {
            child,
            stdout_task,
            stderr_task,
            cancel: self.cancel.clone(),
        })
    }

    /// Run a remote command with the default 15 s deadline and return its
    /// stdout.
    pub async fn run_command(&self, remote_cmd: &str) -> Result<Vec<u8>> {
        self.run_command_with_timeout(remote_cmd, DEFAULT_CMD_TIMEOUT)
            .await
    }

    pub async fn run_command_with_timeout(
        &self,
        remote_cmd: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut child = self.spawn(remote_cmd)?;
        child.close_stdin();

        let out = child.wait(timeout, None).await?;
        if !out.status.success() {
            bail!(
                "run cmd {}",
                log_err_msg(&String::from_utf8_lossy(&out.stderr), "stderr log")
            );
        }

        Ok(out.stdout)
    }

    /// Upload a small config file to a fixed guest path with mode 0400.
    pub async fn upload_config(&self, content: &str, remote_path: &str) -> Result<()> {
        let staged = tempfile::NamedTempFile::new().context("create staging file")?;
        std::fs::write(staged.path(), content).context("write staging file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(staged.path(), std::fs::Permissions::from_mode(0o600))
                .context("set staging file permissions")?;
        }

        let mut cmd = Command::new("scp");
        cmd.arg("-i").arg(&self.key_path);
        cmd.args(["-P", &self.port.to_string()]);
        cmd.args(self.common_options());
        cmd.arg(staged.path());
        cmd.arg(format!("root@127.0.0.1:{remote_path}"));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().context("spawn scp client")?;
        let stderr = child.stderr.take().context("take scp stderr")?;
        let stderr_task = tokio::spawn(async move { read_all(stderr).await });

        let mut cancel = self.cancel.clone();
        let status = tokio::select! {
            _ = wait_for_true(&mut cancel) => {
                let _ = child.kill().await;
                bail!("timed out (vm canceled)");
            }
            status = tokio::time::timeout(SCP_TIMEOUT, child.wait()) => {
                match status {
                    Err(_) => {
                        let _ = child.kill().await;
                        bail!("timed out (scp deadline exceeded)");
                    }
                    Ok(status) => status.context("wait for scp client")?,
                }
            }
        };

        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default();
            bail!(
                "copy config file {}",
                log_err_msg(&String::from_utf8_lossy(&stderr), "stderr log")
            );
        }

        self.run_command_with_timeout(
            &format!("chmod 0400 {}", shell_quote(remote_path)),
            SCP_TIMEOUT,
        )
        .await
        .context("chmod uploaded config")?;

        Ok(())
    }

    /// Run an interactive login shell on the guest with the local terminal
    /// attached.
    pub async fn interactive_shell(&self) -> Result<()> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i").arg(&self.key_path);
        cmd.args(["-p", &self.port.to_string()]);
        cmd.args(self.common_options());
        cmd.args(["-t", "root@127.0.0.1"]);

        let mut child = cmd.spawn().context("spawn interactive ssh")?;

        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = wait_for_true(&mut cancel) => {
                let _ = child.kill().await;
            }
            status = child.wait() => {
                status.context("wait for interactive ssh")?;
            }
        }

        Ok(())
    }
}

/// A spawned remote command: stdout/stderr are drained in the background,
/// stdin stays writable, and [`SshChild::wait`] enforces the deadline.
pub struct SshChild {
    child: Child,
    stdout_task: tokio::task::JoinHandle<Vec<u8>>,
    stderr_task: tokio::task::JoinHandle<Vec<u8>>,
    cancel: watch::Receiver<bool>,
}

pub struct SshOutput {
    pub status: std::process::ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl SshChild {
    pub async fn write_stdin(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = self.child.stdin.as_mut().context("ssh stdin already closed")?;
        stdin.write_all(bytes).await.context("write to ssh stdin")?;
        stdin.flush().await.context("flush ssh stdin")?;
        Ok(())
    }

    pub fn close_stdin(&mut self) {
        self.child.stdin.take();
    }

    /// Wait for the remote command with a deadline. The timeout clock starts
    /// on this call, which is what gives the LUKS flow its delayed-timeout
    /// behavior: the caller prompts and feeds the password first, then
    /// waits. `pre_timeout` fires once right before the deadline kill.
    pub async fn wait(
        mut self,
        timeout: Duration,
        pre_timeout: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<SshOutput> {
        let mut cancel = self.cancel.clone();

        let status = tokio::select! {
            _ = wait_for_true(&mut cancel) => {
                let _ = self.child.kill().await;
                bail!("timed out (vm canceled)");
            }
            status = tokio::time::timeout(timeout, self.child.wait()) => {
                match status {
                    Err(_) => {
                        if let Some(hook) = pre_timeout {
                            hook();
                        }
                        let _ = self.child.kill().await;
                        bail!("timed out (session deadline exceeded)");
                    }
                    Ok(status) => status.context("wait for ssh client")?,
                }
            }
        };

        let stdout = self.stdout_task.await.unwrap_or_default();
        let stderr = self.stderr_task.await.unwrap_or_default();

        Ok(SshOutput {
            status,
            stdout,
            stderr,
        })
    }
}

async fn read_all(mut reader: impl tokio::io::AsyncRead + Unpin) -> Vec<u8> {
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    const SCAN: &str = "\
|1|hash1= ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKcCrFNrMoBZXz5v0t1WV8cbUC4dPedF0COMFprsrrsc
|1|hash2= ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAAAgQC7vbqajDw4o6gJy8UtmUbkEmB8BzyGQ4od
";

    #[test]
    fn parse_keyscan_output() {
        let pinned = PinnedHostKeys::parse(SCAN).unwrap();
        assert_eq!(pinned.len(), 2);
        assert!(!pinned.is_empty());
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(PinnedHostKeys::parse("only two fields").is_err());
        assert!(PinnedHostKeys::parse("a b c d").is_err());
        assert!(PinnedHostKeys::parse("|1|h= ssh-rsa not-base64!!!").is_err());
        assert!(PinnedHostKeys::parse("").is_err());
    }

    #[test]
    fn verify_accepts_pinned_key() {
        let pinned = PinnedHostKeys::parse(SCAN).unwrap();
        let blob = base64::engine::general_purpose::STANDARD
            .decode("AAAAC3NzaC1lZDI1NTE5AAAAIKcCrFNrMoBZXz5v0t1WV8cbUC4dPedF0COMFprsrrsc")
            .unwrap();
        assert!(pinned.verify("ssh-ed25519", &blob).is_ok());
    }

    #[test]
    fn verify_rejects_mismatched_key() {
        let pinned = PinnedHostKeys::parse(SCAN).unwrap();
        let mut blob = base64::engine::general_purpose::STANDARD
            .decode("AAAAC3NzaC1lZDI1NTE5AAAAIKcCrFNrMoBZXz5v0t1WV8cbUC4dPedF0COMFprsrrsc")
            .unwrap();
        blob[10] ^= 0xff;

        let err = pinned.verify("ssh-ed25519", &blob).unwrap_err();
        assert_eq!(err.to_string(), "public key mismatch");
    }

    #[test]
    fn verify_rejects_unknown_key_type() {
        let pinned = PinnedHostKeys::parse(SCAN).unwrap();
        let err = pinned.verify("ecdsa-sha2-nistp256", b"whatever").unwrap_err();
        assert!(err.to_string().contains("unknown key type"));
    }

    #[test]
    fn known_hosts_pins_forwarded_port() {
        let pinned = PinnedHostKeys::parse(SCAN).unwrap();
        let contents = pinned.known_hosts_contents("127.0.0.1", 40022);

        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            assert!(line.starts_with("[127.0.0.1]:40022 "));
            assert_eq!(line.split(' ').count(), 3);
        }
        // Keys are re-encoded verbatim.
        assert!(contents.contains("AAAAC3NzaC1lZDI1NTE5AAAAIKcCrFNrMoBZXz5v0t1WV8cbUC4dPedF0COMFprsrrsc"));
    }
}
