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

//! # The contact store
//!
//! [ContactStore] reads & writes the *entire* contact collection. That's the whole data access
//! model: every operation the service offers reads all the contacts, works on them in memory, and
//! (if it changed anything) writes them all back. This is O(n) in both directions for every
//! mutation, and provides no protection against concurrent writers; two requests that read the
//! same snapshot will each write back their own version, and the last one wins.
//!
//! Writes are not transactional, either: [ContactStore::save_all] issues one request per document
//! and carries on past failures. Rather than swallow them, it reports every per-document outcome
//! in a [SaveReport] & leaves it to the caller to decide what a partial save means.

use std::{collections::HashSet, fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, error, warn};

use crate::{
    entities::{Contact, ContactId},
    storage::{self, Backend as StorageBackend, CollectionRef, FeedOptions},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read {collection}: {source}"))]
    Fetch {
        collection: String,
        source: storage::Error,
    },
}

impl Error {
    /// Retrieve the underlying storage error
    pub fn storage(&self) -> &storage::Error {
        match self {
            Error::Fetch { source, .. } => source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           SaveReport                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What [ContactStore::save_all] was trying to do to a document when it failed
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveAction {
    Write,
    Remove,
}

impl Display for SaveAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaveAction::Write => write!(f, "write"),
            SaveAction::Remove => write!(f, "remove"),
        }
    }
}

/// A single document that couldn't be saved
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SaveFailure {
    pub id: ContactId,
    pub action: SaveAction,
    pub reason: String,
}

/// The outcome of a full-collection rewrite
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SaveReport {
    /// IDs of documents successfully written, in the order they were written
    pub written: Vec<ContactId>,
    /// IDs of documents successfully removed
    pub removed: Vec<ContactId>,
    pub failures: Vec<SaveFailure>,
}

impl SaveReport {
    /// True if every write & removal succeeded
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          ContactStore                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// All access to the contact collection goes through here
///
/// The backend is handed to us (there's no lazily-created connection hiding in here); cloning a
/// [ContactStore] is cheap & shares it.
#[derive(Clone)]
pub struct ContactStore {
    backend: Arc<dyn StorageBackend + Send + Sync>,
    collection: CollectionRef,
    options: FeedOptions,
}

impl ContactStore {
    pub fn new(
        backend: Arc<dyn StorageBackend + Send + Sync>,
        collection: CollectionRef,
    ) -> ContactStore {
        ContactStore {
            backend,
            collection,
            options: FeedOptions::default(),
        }
    }
    /// Read every contact in the collection
    ///
    /// The store is asked for results a page at a time (the page size is just a hint); we follow
    /// the continuation tokens until they run out and return the lot, in store order.
    pub async fn fetch_all(&self) -> Result<Vec<Contact>> {
        let mut contacts = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = match self
                .backend
                .query_page(&self.collection, &self.options, continuation.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    error!("Failed to scan {}: {}", self.collection, err);
                    return Err(err).context(FetchSnafu {
                        collection: self.collection.to_string(),
                    });
                }
            };
            contacts.extend(page.documents);
            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        debug!("fetch_all :=> {} contacts", contacts.len());
        Ok(contacts)
    }
    /// Replace the collection's contents with `contacts`
    ///
    /// Any document currently in the collection whose ID doesn't appear in `contacts` is removed;
    /// then each contact is written, one at a time & in order. Failure to read the current set of
    /// IDs is an error, but per-document failures are logged, recorded in the [SaveReport], and
    /// otherwise don't stop the loop.
    pub async fn save_all(&self, contacts: &[Contact]) -> Result<SaveReport> {
        let keep: HashSet<&ContactId> = contacts.iter().map(|c| c.id()).collect();
        let mut stale: Vec<ContactId> = Vec::new();
        for contact in self.fetch_all().await? {
            if !keep.contains(contact.id()) && !stale.contains(contact.id()) {
                stale.push(contact.id().clone());
            }
        }

        let mut report = SaveReport::default();
        for id in stale {
            match self.backend.delete_document(&self.collection, &id).await {
                Ok(_) => report.removed.push(id),
                Err(err) => {
                    warn!("Failed to remove contact {id} from {}: {err}", self.collection);
                    report.failures.push(SaveFailure {
                        id,
                        action: SaveAction::Remove,
                        reason: err.to_string(),
                    });
                }
            }
        }
        for contact in contacts {
            match self
                .backend
                .upsert_document(&self.collection, contact)
                .await
            {
                Ok(_) => report.written.push(contact.id().clone()),
                Err(err) => {
                    warn!(
                        "Failed to write contact {} to {}: {err}",
                        contact.id(),
                        self.collection
                    );
                    report.failures.push(SaveFailure {
                        id: contact.id().clone(),
                        action: SaveAction::Write,
                        reason: err.to_string(),
                    });
                }
            }
        }

        debug!(
            "save_all :=> {} written, {} removed, {} failed",
            report.written.len(),
            report.removed.len(),
            report.failures.len()
        );
        Ok(report)
    }
}
