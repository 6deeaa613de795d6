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

//! # contacts
//!
//! A small CRUD service over a collection of contact records kept in a cloud document store.
//!
//! The library holds everything but the process plumbing: the storage backends ([cosmos],
//! [dynamodb] & [memory]), the [store] that reads & rewrites the collection, the [endpoint] that
//! implements the CRUD operations on top of it, and the [api] that puts the whole thing on the
//! wire. The daemon lives in `src/bin/contactsd.rs`.
pub mod api;
pub mod authn;
pub mod contacts;
pub mod cosmos;
pub mod dynamodb;
pub mod endpoint;
pub mod entities;
pub mod http;
pub mod memory;
pub mod metrics;
pub mod signing_keys;
pub mod storage;
pub mod store;
pub mod token;
pub mod util;
