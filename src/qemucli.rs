//! Strongly-typed QEMU command line construction.
//!
//! Every argument that reaches the QEMU binary goes through a closed
//! whitelist of known keys, each bound to one accepted value shape. This is
//! the primary defense against both command injection and silently
//! misspelled QEMU syntax: an unknown key or a value carrying QEMU
//! metacharacters fails at construction time, long before a process is
//! spawned.

use anyhow::{bail, Context, Result};

use crate::util::shell_quote;

/// The value shape a whitelisted key accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Uint,
    Str,
    KeyValue,
    None,
}

/// One `key=value` item inside a key-value list argument
/// (e.g. `file=/x.qcow2` inside `-drive file=/x.qcow2,format=qcow2`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvItem {
    pub key: String,
    pub value: String,
}

impl KvItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// A bare item with no `=value` part (e.g. `kvm` in `-accel kvm`).
    pub fn flag(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
        }
    }
}

/// A validated QEMU argument. Construct through [`Arg::uint`], [`Arg::str`],
/// [`Arg::key_value`] or [`Arg::flag`]; all constructors check the key
/// against the whitelist and the value against the string rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Uint { key: String, value: u64 },
    Str { key: String, value: String },
    KeyValue { key: String, items: Vec<KvItem> },
    Flag { key: String },
}

const SAFE_ARGS: &[(&str, ValueKind)] = &[
    ("accel", ValueKind::KeyValue),
    ("boot", ValueKind::Str),
    ("m", ValueKind::Uint),
    ("smp", ValueKind::Uint),
    ("device", ValueKind::KeyValue),
    ("netdev", ValueKind::KeyValue),
    ("serial", ValueKind::Str),
    ("cdrom", ValueKind::Str),
    ("machine", ValueKind::KeyValue),
    ("cpu", ValueKind::Str),
    ("display", ValueKind::Str),
    ("drive", ValueKind::KeyValue),
    ("bios", ValueKind::Str),
];

fn validate_arg_key(key: &str, kind: ValueKind) -> Result<()> {
    let allowed = SAFE_ARGS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, kind)| *kind);

    match allowed {
        None => bail!("unknown safe arg '{key}'"),
        Some(want) if want != kind => {
            bail!("bad arg value type for '{key}': want '{want:?}', have '{kind:?}'")
        }
        Some(_) => Ok(()),
    }
}

fn validate_arg_str_value(s: &str) -> Result<()> {
    if s.contains(',') {
        bail!("commas are not allowed");
    }
    if s.contains('\\') {
        // Backslashes are theoretically allowed, but they rarely survive
        // QEMU's own parsing. Windows paths must use forward slashes.
        bail!("backslashes are not allowed");
    }
    if s.contains('=') {
        bail!("equals sign is not allowed");
    }
    Ok(())
}

impl Arg {
    pub fn uint(key: impl Into<String>, value: u64) -> Result<Self> {
        let key = key.into();
        validate_arg_key(&key, ValueKind::Uint)?;
        Ok(Arg::Uint { key, value })
    }

    pub fn str(key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let value = value.into();
        validate_arg_key(&key, ValueKind::Str)?;
        validate_arg_str_value(&value).with_context(|| format!("validate value for '{key}'"))?;
        Ok(Arg::Str { key, value })
    }

    pub fn key_value(key: impl Into<String>, items: Vec<KvItem>) -> Result<Self> {
        let key = key.into();
        validate_arg_key(&key, ValueKind::KeyValue)?;

        for item in &items {
            if item.key.is_empty() {
                bail!("empty key not allowed in '{key}'");
            }
            validate_arg_str_value(&item.key)
                .with_context(|| format!("validate key '{}'", item.key))?;
            validate_arg_str_value(&item.value)
                .with_context(|| format!("validate value for key '{}'", item.key))?;
        }

        Ok(Arg::KeyValue { key, items })
    }

    pub fn flag(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        validate_arg_key(&key, ValueKind::None)?;
        Ok(Arg::Flag { key })
    }

    pub fn key(&self) -> &str {
        match self {
            Arg::Uint { key, .. }
            | Arg::Str { key, .. }
            | Arg::KeyValue { key, .. }
            | Arg::Flag { key } => key,
        }
    }

    /// The encoded value string, or `None` for bare flags.
    fn value_string(&self) -> Option<String> {
        match self {
            Arg::Uint { value, .. } => Some(value.to_string()),
            Arg::Str { value, .. } => Some(value.clone()),
            Arg::KeyValue { items, .. } => {
                let mut out = String::new();
                for (i, item) in items.iter().enumerate() {
                    if i != 0 {
                        out.push(',');
                    }
                    out.push_str(&item.key);
                    if !item.value.is_empty() {
                        out.push('=');
                        out.push_str(&item.value);
                    }
                }
                Some(out)
            }
            Arg::Flag { .. } => None,
        }
    }
}

/// Encode a validated argument list into CLI tokens: `-key` followed by the
/// quoted value where the shape has one.
pub fn encode_args(args: &[Arg]) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(args.len() * 2);

    for (i, arg) in args.iter().enumerate() {
        match arg.value_string() {
            None => out.push(format!("-{}", arg.key())),
            Some(value) => {
                if value.is_empty() {
                    bail!("empty value for arg #{i} '{}'", arg.key());
                }
                out.push(format!("-{}", arg.key()));
                out.push(shell_quote(&value));
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_arg_encodes() {
        let arg = Arg::uint("m", 2048).unwrap();
        let encoded = encode_args(&[arg]).unwrap();
        assert_eq!(encoded, vec!["-m", "2048"]);
    }

    #[test]
    fn str_arg_encodes() {
        let arg = Arg::str("serial", "stdio").unwrap();
        let encoded = encode_args(&[arg]).unwrap();
        assert_eq!(encoded, vec!["-serial", "stdio"]);
    }

    #[test]
    fn key_value_arg_encodes() {
        let arg = Arg::key_value(
            "drive",
            vec![
                KvItem::new("file", "/tmp/test.qcow2"),
                KvItem::new("format", "qcow2"),
                KvItem::new("if", "none"),
                KvItem::flag("snapshot"),
            ],
        )
        .unwrap();
        let encoded = encode_args(&[arg]).unwrap();
        assert_eq!(
            encoded,
            vec!["-drive", "file=/tmp/test.qcow2,format=qcow2,if=none,snapshot"]
        );
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(Arg::str("monitor", "stdio").is_err());
        assert!(Arg::uint("kernel", 1).is_err());
        assert!(Arg::flag("enable-kvm").is_err());
    }

    #[test]
    fn wrong_value_kind_rejected() {
        // `m` only accepts uints, `drive` only key-value lists.
        assert!(Arg::str("m", "2048").is_err());
        assert!(Arg::uint("drive", 1).is_err());
        assert!(Arg::key_value("serial", vec![]).is_err());
    }

    #[test]
    fn str_value_metacharacters_rejected() {
        assert!(Arg::str("cdrom", "a,b").is_err());
        assert!(Arg::str("cdrom", "a\\b").is_err());
        assert!(Arg::str("cdrom", "a=b").is_err());
        assert!(Arg::str("cdrom", "/plain/path.iso").is_ok());
    }

    #[test]
    fn kv_item_metacharacters_rejected() {
        assert!(Arg::key_value("drive", vec![KvItem::new("file", "a,b")]).is_err());
        assert!(Arg::key_value("drive", vec![KvItem::new("fi=le", "a")]).is_err());
        assert!(Arg::key_value("drive", vec![KvItem::new("", "a")]).is_err());
    }

    #[test]
    fn kv_empty_value_encodes_bare_key() {
        let arg = Arg::key_value("accel", vec![KvItem::flag("kvm")]).unwrap();
        let encoded = encode_args(&[arg]).unwrap();
        assert_eq!(encoded, vec!["-accel", "kvm"]);
    }

    #[test]
    fn known_keys_roundtrip_to_equivalent_tokens() {
        // Encoding a config-shaped arg list must produce tokens that parse
        // back to the same (key, value) pairs.
        let args = vec![
            Arg::str("serial", "stdio").unwrap(),
            Arg::uint("m", 512).unwrap(),
            Arg::key_value("accel", vec![KvItem::flag("kvm")]).unwrap(),
            Arg::str("display", "none").unwrap(),
        ];

        let encoded = encode_args(&args).unwrap();
        let mut it = encoded.iter();
        let mut parsed = Vec::new();
        while let Some(flag) = it.next() {
            let key = flag.strip_prefix('-').unwrap().to_string();
            let value = it.next().cloned();
            parsed.push((key, value));
        }

        assert_eq!(
            parsed,
            vec![
                ("serial".into(), Some("stdio".into())),
                ("m".into(), Some("512".into())),
                ("accel".into(), Some("kvm".into())),
                ("display".into(), Some("none".into())),
            ]
        );
    }
}
