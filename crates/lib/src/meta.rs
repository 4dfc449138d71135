//! META partition values and their kernel command line encoding.

use std::str::FromStr;

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// One META entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetaValue {
    /// The META key, a small integer.
    pub key: u8,
    /// The raw value.
    pub value: String,
}

impl FromStr for MetaValue {
    type Err = anyhow::Error;

    /// Parse `key=value`; the key may be decimal or `0x` hex.
    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s
            .split_once('=')
            .with_context(|| format!("Invalid META value {s:?}, expected key=value"))?;
        let key = match key.strip_prefix("0x") {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => key.parse(),
        }
        .with_context(|| format!("Invalid META key {key:?}"))?;
        Ok(Self {
            key,
            value: value.to_owned(),
        })
    }
}

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Encode `values` for the installer's environment: each entry as a varint
/// key, a varint length and the value bytes, zstd-compressed when
/// `compress` is set, then standard base64.
pub fn encode(values: &[MetaValue], compress: bool) -> Result<String> {
    let mut buf = Vec::new();
    for v in values {
        put_uvarint(&mut buf, u64::from(v.key));
        put_uvarint(&mut buf, v.value.len() as u64);
        buf.extend_from_slice(v.value.as_bytes());
    }
    if compress {
        buf = zstd::encode_all(buf.as_slice(), 0).context("Compressing META")?;
    }
    Ok(base64::engine::general_purpose::STANDARD.encode(buf))
}
