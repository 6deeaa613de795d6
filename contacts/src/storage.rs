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

//! # storage
//!
//! Abstractions for the contacts storage layer.
//!
//! The [Backend] trait is the narrowest interface I could come up with onto a document database:
//! page through a collection, write a document (replacing any extant document with the same ID),
//! delete a document. Everything else (in particular, the "read it all, change it in memory, write
//! it all back" pattern) lives above this, in [ContactStore].
//!
//! [ContactStore]: crate::store::ContactStore

use std::fmt::Display;

use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use snafu::{Backtrace, IntoError, Snafu};

use crate::entities::{Contact, ContactId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The document store answered, but with a failure status; this is the one error we can
    /// usefully hand back to our own callers more-or-less verbatim.
    #[snafu(display("The document store responded with {status}: {body}"))]
    Upstream {
        status: StatusCode,
        body: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to decode a document: {source}"))]
    Document {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl Error {
    /// Wrap an arbitrary client library error
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
        }
    }
    /// Wrap a failure to (de)serialize a document
    pub fn document(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        DocumentSnafu.into_error(Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
    }
    /// If the store returned an HTTP status, retrieve it
    pub fn upstream_status(&self) -> Option<(StatusCode, &str)> {
        match self {
            Error::Upstream { status, body, .. } => Some((*status, body.as_str())),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Names a collection of documents: a (database, collection) pair
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct CollectionRef {
    pub database: String,
    pub collection: String,
}

impl CollectionRef {
    pub fn new(database: &str, collection: &str) -> CollectionRef {
        CollectionRef {
            database: database.to_owned(),
            collection: collection.to_owned(),
        }
    }
}

impl Default for CollectionRef {
    fn default() -> Self {
        CollectionRef::new("user_profile", "contacts")
    }
}

// This is the form of the resource link the Cosmos REST API uses, which seems as good a canonical
// representation as any.
impl Display for CollectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dbs/{}/colls/{}", self.database, self.collection)
    }
}

/// Options governing a collection scan
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FeedOptions {
    /// A hint to the store as to how many documents to return per page
    pub max_item_count: usize,
}

impl Default for FeedOptions {
    fn default() -> Self {
        FeedOptions { max_item_count: 10 }
    }
}

/// One page of a collection scan
#[derive(Clone, Debug, Default)]
pub struct Page {
    pub documents: Vec<Contact>,
    /// Opaque token with which to request the next page; `None` means this was the last
    pub continuation: Option<String>,
}

#[async_trait]
pub trait Backend {
    /// Retrieve one page of every document in `collection`, beginning at `continuation` (or at the
    /// start of the collection if that's `None`).
    async fn query_page(
        &self,
        collection: &CollectionRef,
        options: &FeedOptions,
        continuation: Option<&str>,
    ) -> Result<Page>;
    /// Write `contact` to `collection`, replacing any document already stored under its ID
    async fn upsert_document(&self, collection: &CollectionRef, contact: &Contact) -> Result<()>;
    /// Remove the document named by `id` from `collection`
    async fn delete_document(&self, collection: &CollectionRef, id: &ContactId) -> Result<()>;
}
