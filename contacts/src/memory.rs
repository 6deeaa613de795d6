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

//! # In-memory storage
//!
//! A process-local [Backend](StorageBackend) for development & testing. Documents are kept in
//! insertion order, which makes "store order" easy to reason about in tests.
//!
//! It can be told to misbehave: fail every query, or fail writes for particular contact IDs. That
//! lets us exercise the partial-save paths without standing up a real document store.

use std::{
    collections::HashSet,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use http::StatusCode;
use serde_json::json;
use tracing::debug;

use crate::{
    entities::{Contact, ContactId},
    storage::{
        self, Backend as StorageBackend, CollectionRef, FeedOptions, Page, UpstreamSnafu,
    },
};

#[derive(Debug, Default)]
pub struct Backend {
    documents: Mutex<Vec<Contact>>,
    fail_queries: AtomicBool,
    failing_ids: Mutex<HashSet<ContactId>>,
    queries: AtomicUsize,
}

impl Backend {
    /// Create a backend pre-loaded with `contacts`; duplicate IDs are kept as-is
    pub fn seeded(contacts: impl IntoIterator<Item = Contact>) -> Backend {
        Backend {
            documents: Mutex::new(contacts.into_iter().collect()),
            ..Default::default()
        }
    }
    /// When set, every subsequent query answers 503
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }
    /// Writes & deletes for `id` will answer 500 from here on
    pub fn fail_writes_for(&self, id: ContactId) {
        // Lock poisoning only happens if a test panicked while holding it.
        if let Ok(mut ids) = self.failing_ids.lock() {
            ids.insert(id);
        }
    }
    /// The number of pages served so far
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
    /// A copy of the current contents, in store order
    pub fn snapshot(&self) -> Vec<Contact> {
        self.documents
            .lock()
            .map(|docs| docs.clone())
            .unwrap_or_default()
    }
    fn check_writable(&self, id: &ContactId) -> storage::Result<()> {
        let failing = self
            .failing_ids
            .lock()
            .map(|ids| ids.contains(id))
            .unwrap_or(true);
        if failing {
            return UpstreamSnafu {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: format!("write of {id} refused"),
            }
            .fail();
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Poisoned;

impl std::fmt::Display for Poisoned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "in-memory store lock poisoned")
    }
}

impl std::error::Error for Poisoned {}

fn poisoned<T>(_: T) -> storage::Error {
    storage::Error::new(Poisoned)
}

#[async_trait]
impl StorageBackend for Backend {
    async fn query_page(
        &self,
        collection: &CollectionRef,
        options: &FeedOptions,
        continuation: Option<&str>,
    ) -> storage::Result<Page> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return UpstreamSnafu {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: json!({
                    "code": "ServiceUnavailable",
                    "message": format!("{collection} is unavailable"),
                })
                .to_string(),
            }
            .fail();
        }
        // The continuation token is just the offset of the next document.
        let start = match continuation {
            Some(token) => token.parse::<usize>().map_err(storage::Error::new)?,
            None => 0,
        };
        let docs = self.documents.lock().map_err(poisoned)?;
        let end = usize::min(start + options.max_item_count.max(1), docs.len());
        let documents = docs.get(start..end).map(|s| s.to_vec()).unwrap_or_default();
        let continuation = (end < docs.len()).then(|| end.to_string());
        debug!(
            "query_page({collection}, {continuation:?}) :=> {} documents",
            documents.len()
        );
        Ok(Page {
            documents,
            continuation,
        })
    }
    async fn upsert_document(
        &self,
        _collection: &CollectionRef,
        contact: &Contact,
    ) -> storage::Result<()> {
        self.check_writable(contact.id())?;
        let mut docs = self.documents.lock().map_err(poisoned)?;
        match docs.iter().position(|c| c.id() == contact.id()) {
            Some(idx) => {
                docs[idx] = contact.clone();
                // Keyed semantics: after an upsert, there's exactly one document with this ID.
                let mut seen = false;
                docs.retain(|c| {
                    if c.id() != contact.id() {
                        true
                    } else if !seen {
                        seen = true;
                        true
                    } else {
                        false
                    }
                });
            }
            None => docs.push(contact.clone()),
        }
        Ok(())
    }
    async fn delete_document(
        &self,
        _collection: &CollectionRef,
        id: &ContactId,
    ) -> storage::Result<()> {
        self.check_writable(id)?;
        let mut docs = self.documents.lock().map_err(poisoned)?;
        docs.retain(|c| c.id() != id);
        Ok(())
    }
}
