// Copyright (C) 2025-2026 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of contacts.
//
// contacts is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// contacts is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with contacts.  If not,
// see <http://www.gnu.org/licenses/>.

//! # contacts Signing Keys
//!
//! Callers identify themselves with a bearer token signed by one of a set of versioned keys. The
//! keys are read from configuration at startup (and again on SIGHUP):
//!
//! ```toml
//! [signing-keys]
//! "keyid:2025-02-12" = [1, 2, 3, 4, ..., 64] # Keys must be 64 octets in length
//! "keyid:2025-02-15" = [65, 66, 67,..., 128]
//! ```
//!
//! Key IDs are compared lexicographically, and the greatest is "current": that's the key
//! `contacts-token` will sign with. Tokens carry the ID of the key that signed them, so older keys
//! can go on verifying outstanding tokens until the operator removes them from the list.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use lazy_static::lazy_static;
use rand::RngCore;
use regex::Regex;
use serde::Deserialize;
use snafu::{Backtrace, Snafu, prelude::*};

use crate::util::Key;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to recognize {text} as a KeyId"))]
    KeyId { text: String, backtrace: Backtrace },
    #[snafu(display("No signing key available"))]
    NoKey { backtrace: Backtrace },
    #[snafu(display("Signing keys must be 64 octets in length, not {len}"))]
    SigningKey { len: usize, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             KeyId                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref KEY_ID : Regex = Regex::new("^keyid:[-0-9a-zA-Z]+$").unwrap(/* known good */);
}

#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(s: &str) -> Result<KeyId> {
        if KEY_ID.find(s).is_none() {
            KeyIdSnafu { text: s.to_owned() }.fail()
        } else {
            Ok(KeyId(s.to_owned()))
        }
    }
}

impl Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for KeyId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        KeyId::new(s)
    }
}

impl AsRef<str> for KeyId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        KeyId::new(&s).map_err(serde::de::Error::custom)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           SigningKey                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A refined type enforcing a key length (of 64 octets)
#[derive(Clone, Debug)]
pub struct SigningKey(Key);

impl SigningKey {
    pub fn new(b: Vec<u8>) -> Result<SigningKey> {
        ensure!(b.len() == 64, SigningKeySnafu { len: b.len() });
        Ok(SigningKey(b.into()))
    }
}

/// A fresh, random key
impl Default for SigningKey {
    fn default() -> Self {
        let mut bytes: Vec<u8> = vec![0; 64];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        SigningKey(bytes.into())
    }
}

impl AsRef<Key> for SigningKey {
    fn as_ref(&self) -> &Key {
        &self.0
    }
}

impl<'de> Deserialize<'de> for SigningKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let key = Key::deserialize(deserializer)?;
        if key.len() != 64 {
            return Err(serde::de::Error::custom(
                SigningKeySnafu { len: key.len() }.build(),
            ));
        }
        Ok(SigningKey(key))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          SigningKeys                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
#[serde(transparent)]
pub struct SigningKeys {
    keys: BTreeMap<KeyId, SigningKey>,
}

impl SigningKeys {
    /// Retrieve the current (i.e. the most recent) SigningKey
    pub fn current(&self) -> Result<(KeyId, SigningKey)> {
        let (key, value) = self.keys.last_key_value().context(NoKeySnafu)?;
        Ok((key.clone(), value.clone()))
    }
    /// Retrieve a key by ID
    pub fn find_by_version(&self, keyid: &KeyId) -> Result<SigningKey> {
        Ok(self.keys.get(keyid).context(NoKeySnafu)?.clone())
    }
}

/// A single, random key good for this process only
///
/// Handy for development, since no token minted elsewhere will verify against it.
impl Default for SigningKeys {
    fn default() -> Self {
        SigningKeys {
            keys: BTreeMap::from_iter(vec![(
                KeyId(chrono::Local::now().format("keyid:%Y%m%d").to_string()),
                SigningKey::default(),
            )]),
        }
    }
}

impl<const N: usize> From<[(KeyId, SigningKey); N]> for SigningKeys {
    fn from(value: [(KeyId, SigningKey); N]) -> Self {
        Self {
            keys: BTreeMap::from(value),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_ids() {
        assert!(KeyId::new("keyid:20250817").is_ok());
        assert!(KeyId::new("keyid:2025-08-17").is_ok());
        assert!(KeyId::new("20250817").is_err());
        assert!(KeyId::new("keyid:").is_err());
    }

    #[test]
    fn from_config() {
        let keys: SigningKeys = toml::from_str(&format!(
            "\"keyid:20250101\" = [{}]\n\"keyid:20250201\" = [{}]\n",
            vec!["1"; 64].join(", "),
            vec!["2"; 64].join(", ")
        ))
        .unwrap();
        let (id, _) = keys.current().unwrap();
        assert_eq!(id.as_ref(), "keyid:20250201");
        assert!(
            keys.find_by_version(&KeyId::new("keyid:20250101").unwrap())
                .is_ok()
        );
        assert!(
            keys.find_by_version(&KeyId::new("keyid:20240101").unwrap())
                .is_err()
        );

        // Too short
        assert!(toml::from_str::<SigningKeys>("\"keyid:20250101\" = [1, 2, 3]\n").is_err());
        assert!(toml::from_str::<SigningKeys>("\"bogus\" = [1, 2, 3]\n").is_err());
    }
}
