//! Resolved client configuration.
//!
//! The store client config format is one `key = value` pair per line,
//! `#` comments, with numeric values in decimal or `0x`-prefixed hex.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use boxtin_protocol::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub store_hostname: String,
    pub account_number: u32,
    pub keys_file: PathBuf,
    pub certificate_file: PathBuf,
    pub private_key_file: PathBuf,
    pub trusted_cas_file: PathBuf,
}

fn parse_number(value: &str) -> Option<u32> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = fs_err::read_to_string(path)
            .map_err(|err| Error::ConfigInvalid(format!("cannot read configuration: {err}")))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut fields = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let require = |key: &str| {
            fields.get(key).cloned().ok_or_else(|| {
                Error::ConfigInvalid(format!("missing critical configuration value: {key}"))
            })
        };

        let account_raw = require("AccountNumber")?;
        let account_number = parse_number(&account_raw).ok_or_else(|| {
            Error::ConfigInvalid(format!("AccountNumber {account_raw:?} is not a number"))
        })?;

        Ok(Self {
            store_hostname: require("StoreHostname")?,
            account_number,
            keys_file: require("KeysFile")?.into(),
            certificate_file: require("CertificateFile")?.into(),
            private_key_file: require("PrivateKeyFile")?.into(),
            trusted_cas_file: require("TrustedCAsFile")?.into(),
        })
    }
}
