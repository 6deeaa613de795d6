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

use crate::{endpoint::ContactsEndpoint, metrics::Instruments, signing_keys::SigningKeys};

/// Application state available to all handlers
///
/// Built once per configuration generation (i.e. at startup & on each SIGHUP), so everything in
/// here, the store client in particular, is shared by every request served under that
/// configuration.
pub struct Contacts {
    pub endpoint: ContactsEndpoint,
    pub instruments: Instruments,
    pub signing_keys: SigningKeys,
    /// Tokens must name this as their issuer (and `api.{token_issuer}` as their audience)
    pub token_issuer: String,
}
