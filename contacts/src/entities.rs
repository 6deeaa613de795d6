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

//! # contacts entities
//!
//! There's really only one: the [Contact]. It's an open-schema document; the service only cares
//! about two of its members (`Id` & `CreatedBy`) and carries everything else along verbatim.

use std::{fmt::Display, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use snafu::{Backtrace, prelude::*};
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("An empty string is not a valid contact ID"))]
    EmptyId { backtrace: Backtrace },
    #[snafu(display("{text} is not a valid e-mail address"))]
    Email { text: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           ContactId                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A contact identifier
///
/// Callers generally supply their own; if they don't, we'll mint one (a v4 UUID, formatted as
/// text). Nothing enforces uniqueness: it's just the key on which lookups compare. It can't be
/// empty, though, since neither store will key a document on "".
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ContactId(String);

impl ContactId {
    pub fn new(s: &str) -> Result<ContactId> {
        ensure!(!s.is_empty(), EmptyIdSnafu);
        Ok(ContactId(s.to_owned()))
    }
    /// Mint a fresh, random [ContactId]
    pub fn generate() -> ContactId {
        ContactId(Uuid::new_v4().to_string())
    }
}

impl AsRef<str> for ContactId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for ContactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContactId {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        ContactId::new(s)
    }
}

impl<'de> Deserialize<'de> for ContactId {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContactId::new(&s).map_err(serde::de::Error::custom)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Email                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref EMAIL: Regex = Regex::new(r"^[^@\s]+@[^@\s]+$").unwrap(/* known good */);
}

/// The caller's e-mail address, as asserted by the `email` claim of their bearer token
///
/// This is a light refinement: it only insists on something shaped like `local@domain`.
/// Deserialization deliberately skips the check, since the store is the system of record & may
/// hold values written before it was introduced.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    pub fn new(s: &str) -> Result<Email> {
        if EMAIL.is_match(s) {
            Ok(Email(s.to_owned()))
        } else {
            EmailSnafu { text: s.to_owned() }.fail()
        }
    }
}

impl AsRef<str> for Email {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for Email {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Email {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        Email::new(s)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Contact                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A contact record
///
/// On the wire, this looks like `{"Id": "...", "CreatedBy": "...", ...}`; any other members are
/// preserved as-is in `fields`. `id` (lower-case) is accepted as an alias for `Id` on input, since
/// that's how the document store spells it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Contact {
    #[serde(rename = "Id", alias = "id", default = "ContactId::generate")]
    id: ContactId,
    #[serde(rename = "CreatedBy", default)]
    created_by: Option<Email>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Contact {
    pub fn new(id: ContactId) -> Contact {
        Contact {
            id,
            created_by: None,
            fields: Map::new(),
        }
    }
    /// Builder-style helper for setting an open-schema member
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Contact {
        self.fields.insert(name.to_owned(), value.into());
        self
    }
    pub fn id(&self) -> &ContactId {
        &self.id
    }
    pub fn created_by(&self) -> Option<&Email> {
        self.created_by.as_ref()
    }
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
    /// Record who created this contact; `None` clears any prior value
    pub fn stamp_creator(&mut self, caller: Option<&Email>) {
        self.created_by = caller.cloned();
    }
}
