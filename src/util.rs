use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::watch;

/// Wait until a `watch::Receiver<bool>` observes `true`.
///
/// Equivalent to `rx.wait_for(|v| *v).await`, but avoids returning the
/// borrowed `watch::Ref` (which wraps a non-`Send` `RwLockReadGuard` and so
/// cannot be held across an `.await` inside `tokio::select!`/`tokio::spawn`).
pub async fn wait_for_true(rx: &mut watch::Receiver<bool>) -> Result<(), watch::error::RecvError> {
    loop {
        if *rx.borrow() {
            return Ok(());
        }
        rx.changed().await?;
    }
}

/// Shell-quote a string the way QEMU's command line expects.
///
/// Values made of characters that never need quoting are passed through
/// untouched (commas, equals signs and slashes are common in QEMU key-value
/// arguments and must stay literal). Anything else is wrapped in single
/// quotes, with embedded single quotes escaped as `'\''`.
pub fn shell_quote(s: &str) -> String {
    static SAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9@%+=:,./_-]+$").unwrap());

    if !s.is_empty() && SAFE.is_match(s) {
        return s.to_string();
    }

    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Strip ANSI escape sequences and unprintable characters from guest output.
///
/// Serial consoles and SSH stderr routinely carry color codes and control
/// bytes that make log excerpts unreadable when embedded in error messages.
pub fn clear_unprintable(s: &str, allow_newlines: bool) -> String {
    static ANSI: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());

    let stripped = ANSI.replace_all(s, "");
    stripped
        .chars()
        .filter(|c| {
            if allow_newlines && *c == '\n' {
                return true;
            }
            !c.is_control() && *c != '\u{fffd}'
        })
        .collect()
}

/// Format a captured log for inclusion in an error message.
///
/// Newlines are flattened to `\n` literals and only the last 256 visible
/// characters are kept so that a noisy boot log doesn't swallow the actual
/// error.
pub fn log_err_msg(log: &str, label: &str) -> String {
    let mut flat = log.replace('\n', "\\n");
    if let Some(stripped) = flat.strip_suffix("\\n") {
        flat = stripped.to_string();
    }
    flat = clear_unprintable(&flat, false);

    const MAX_LOG_LEN: usize = 256;
    let orig_len = flat.chars().count();
    if orig_len > MAX_LOG_LEN {
        let tail: String = flat
            .chars()
            .skip(orig_len - MAX_LOG_LEN)
            .collect();
        flat = format!("[{} chars trimmed]{}", orig_len - MAX_LOG_LEN, tail);
    }

    format!("({label}: '{flat}')")
}

/// Validate a guest block device name such as `vdb`, `vg0-lv0` or
/// `mapper/cryptmnt`. Only the `mapper/` prefix is allowed to carry a slash.
pub fn validate_dev_name(s: &str) -> bool {
    static DEV_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Za-z_-]+$").unwrap());

    let s = s.strip_prefix("mapper/").unwrap_or(s);
    DEV_NAME.is_match(s)
}

/// Validate a filesystem type string passed to `mount -t`.
pub fn validate_fs_type(s: &str) -> bool {
    static FS_TYPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]+$").unwrap());
    FS_TYPE.is_match(s)
}

/// Validate a comma-separated mount options string passed to `mount -o`.
pub fn validate_mount_options(s: &str) -> bool {
    static MOUNT_OPTS: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^([a-zA-Z0-9_]+(=[a-zA-Z0-9]+)?)(,[a-zA-Z0-9_]+(=[a-zA-Z0-9]+)?)*$").unwrap()
    });
    MOUNT_OPTS.is_match(s)
}

/// Validate a Unix username before it is templated into a guest command.
pub fn validate_unix_username(s: &str) -> bool {
    static UNIX_USERNAME: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[a-z_]([a-z0-9_-]{0,31}|[a-z0-9_-]{0,30}\$)$").unwrap());
    UNIX_USERNAME.is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_passes_safe_strings_through() {
        assert_eq!(shell_quote("file=/tmp/a.qcow2,format=qcow2"), "file=/tmp/a.qcow2,format=qcow2");
        assert_eq!(shell_quote("none"), "none");
        assert_eq!(shell_quote("type=virt,highmem=off"), "type=virt,highmem=off");
    }

    #[test]
    fn shell_quote_wraps_unsafe_strings() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("$(whoami)"), "'$(whoami)'");
    }

    #[test]
    fn clear_unprintable_strips_ansi_and_control() {
        assert_eq!(clear_unprintable("\x1b[31mred\x1b[0m", false), "red");
        assert_eq!(clear_unprintable("a\rb\x07c", false), "abc");
        assert_eq!(clear_unprintable("a\nb", true), "a\nb");
        assert_eq!(clear_unprintable("a\nb", false), "ab");
    }

    #[test]
    fn log_err_msg_flattens_and_trims() {
        assert_eq!(log_err_msg("line1\nline2\n", "serial log"), "(serial log: 'line1\\nline2')");

        let long = "x".repeat(300);
        let msg = log_err_msg(&long, "log");
        assert!(msg.contains("[44 chars trimmed]"));
        assert!(msg.len() < 300);
    }

    #[test]
    fn dev_name_validation() {
        assert!(validate_dev_name("vdb"));
        assert!(validate_dev_name("vg0-lv_home"));
        assert!(validate_dev_name("mapper/cryptmnt"));
        assert!(!validate_dev_name(""));
        assert!(!validate_dev_name("vdb/../etc"));
        assert!(!validate_dev_name("vdb;reboot"));
        assert!(!validate_dev_name("mapper/"));
    }

    #[test]
    fn fs_type_validation() {
        assert!(validate_fs_type("ext4"));
        assert!(validate_fs_type("btrfs"));
        assert!(!validate_fs_type("ext4 -o"));
        assert!(!validate_fs_type("EXT4"));
        assert!(!validate_fs_type(""));
    }

    #[test]
    fn mount_options_validation() {
        assert!(validate_mount_options("ro"));
        assert!(validate_mount_options("ro,noatime,uid=1000"));
        assert!(!validate_mount_options("ro, noatime"));
        assert!(!validate_mount_options("ro;rw"));
        assert!(!validate_mount_options(""));
    }

    #[test]
    fn unix_username_validation() {
        assert!(validate_unix_username("linsk"));
        assert!(validate_unix_username("_svc"));
        assert!(!validate_unix_username("linsk\n"));
        assert!(!validate_unix_username("../etc"));
        assert!(!validate_unix_username("0day"));
        assert!(!validate_unix_username(""));
    }
}
