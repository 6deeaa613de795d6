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

//! # The contacts endpoint
//!
//! The service's operations, independent of HTTP. Each one reads the full collection through the
//! [ContactStore], filters or edits it in memory, and (for mutations) writes the whole thing back.
//! The caller's identity, when there is one, is passed in explicitly.

use tracing::debug;

use crate::{
    entities::{Contact, ContactId, Email},
    store::{ContactStore, Result, SaveReport},
};

/// The result of a mutation: the contact as persisted, plus how the rewrite went
#[derive(Clone, Debug)]
pub struct Saved {
    pub contact: Contact,
    pub report: SaveReport,
}

#[derive(Clone)]
pub struct ContactsEndpoint {
    store: ContactStore,
}

impl ContactsEndpoint {
    pub fn new(store: ContactStore) -> ContactsEndpoint {
        ContactsEndpoint { store }
    }
    /// Every contact, in store order
    pub async fn list(&self) -> Result<Vec<Contact>> {
        self.store.fetch_all().await
    }
    /// The first contact (in store order) whose ID is `id`, if any
    pub async fn get_by_id(&self, id: &ContactId) -> Result<Option<Contact>> {
        Ok(self
            .store
            .fetch_all()
            .await?
            .into_iter()
            .find(|c| c.id() == id))
    }
    /// Add `contact` to the collection, stamped with `caller`
    ///
    /// Whatever the client sent for `CreatedBy` is discarded. The rewrite may only partially
    /// succeed; check the [SaveReport].
    pub async fn create(&self, mut contact: Contact, caller: Option<&Email>) -> Result<Saved> {
        let mut contacts = self.store.fetch_all().await?;
        contact.stamp_creator(caller);
        contacts.push(contact.clone());
        let report = self.store.save_all(&contacts).await?;
        debug!("Created contact {}", contact.id());
        Ok(Saved { contact, report })
    }
    /// Replace every contact sharing `contact`'s ID with `contact`, stamped with `caller`
    ///
    /// This is a delete followed by a create, but done with one read & one rewrite. If nothing had
    /// the ID, this is just a create.
    pub async fn update(&self, mut contact: Contact, caller: Option<&Email>) -> Result<Saved> {
        let mut contacts = self.store.fetch_all().await?;
        let before = contacts.len();
        contacts.retain(|c| c.id() != contact.id());
        debug!(
            "update({}): replacing {} contact(s)",
            contact.id(),
            before - contacts.len()
        );
        contact.stamp_creator(caller);
        contacts.push(contact.clone());
        let report = self.store.save_all(&contacts).await?;
        debug!("Updated contact {}", contact.id());
        Ok(Saved { contact, report })
    }
    /// Remove every contact whose ID is `id`
    ///
    /// Returns `None` if there were none (in which case nothing is written), else the outcome of
    /// the rewrite.
    pub async fn delete(&self, id: &ContactId) -> Result<Option<SaveReport>> {
        let mut contacts = self.store.fetch_all().await?;
        let before = contacts.len();
        contacts.retain(|c| c.id() != id);
        if contacts.len() == before {
            debug!("delete({id}): no such contact");
            return Ok(None);
        }
        let report = self.store.save_all(&contacts).await?;
        debug!("Deleted {} contact(s) with ID {id}", before - contacts.len());
        Ok(Some(report))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Arc;

    use crate::{memory, storage::CollectionRef};

    fn id(s: &str) -> ContactId {
        ContactId::new(s).unwrap()
    }

    fn email(s: &str) -> Email {
        Email::new(s).unwrap()
    }

    fn endpoint(backend: &Arc<memory::Backend>) -> ContactsEndpoint {
        ContactsEndpoint::new(ContactStore::new(backend.clone(), CollectionRef::default()))
    }

    #[tokio::test]
    async fn get_by_id() {
        let backend = Arc::new(memory::Backend::seeded([
            Contact::new(id("1")).with_field("Name", "first"),
            Contact::new(id("2")),
            Contact::new(id("1")).with_field("Name", "second"),
        ]));
        let ep = endpoint(&backend);
        assert!(ep.get_by_id(&id("3")).await.unwrap().is_none());
        let found = ep.get_by_id(&id("1")).await.unwrap().unwrap();
        assert_eq!(found.fields()["Name"], "first");
    }

    #[tokio::test]
    async fn create_stamps_and_appends() {
        let backend = Arc::new(memory::Backend::seeded([Contact::new(id("1"))]));
        let ep = endpoint(&backend);

        // Client-supplied CreatedBy doesn't survive
        let mut incoming = Contact::new(id("2"));
        incoming.stamp_creator(Some(&email("mallory@x.com")));
        let saved = ep.create(incoming, Some(&email("b@x.com"))).await.unwrap();
        assert!(saved.report.is_complete());
        assert_eq!(saved.contact.created_by(), Some(&email("b@x.com")));

        let contacts = ep.list().await.unwrap();
        assert_eq!(contacts.len(), 2);
        let found = ep.get_by_id(&id("2")).await.unwrap().unwrap();
        assert_eq!(found.created_by(), Some(&email("b@x.com")));

        let saved = ep.create(Contact::new(id("3")), None).await.unwrap();
        assert!(saved.contact.created_by().is_none());
        assert_eq!(ep.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn delete() {
        let mut seed = Contact::new(id("1"));
        seed.stamp_creator(Some(&email("a@x.com")));
        let backend = Arc::new(memory::Backend::seeded([seed]));
        let ep = endpoint(&backend);

        let report = ep.delete(&id("1")).await.unwrap();
        assert!(report.unwrap().is_complete());
        assert!(ep.list().await.unwrap().is_empty());

        let queries = backend.queries();
        assert!(ep.delete(&id("1")).await.unwrap().is_none());
        // One read, and no rewrite
        assert_eq!(backend.queries(), queries + 1);
    }

    #[tokio::test]
    async fn delete_removes_duplicates() {
        let backend = Arc::new(memory::Backend::seeded([
            Contact::new(id("1")),
            Contact::new(id("2")),
            Contact::new(id("1")),
        ]));
        let ep = endpoint(&backend);
        assert!(ep.delete(&id("1")).await.unwrap().is_some());
        let contacts = ep.list().await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].id(), &id("2"));
    }

    #[tokio::test]
    async fn update() {
        let backend = Arc::new(memory::Backend::seeded([
            Contact::new(id("1")).with_field("Name", "Ada"),
            Contact::new(id("2")),
        ]));
        let ep = endpoint(&backend);

        let saved = ep
            .update(
                Contact::new(id("1")).with_field("Name", "Grace"),
                Some(&email("c@x.com")),
            )
            .await
            .unwrap();
        assert!(saved.report.is_complete());
        let contacts = ep.list().await.unwrap();
        assert_eq!(contacts.len(), 2);
        let found = ep.get_by_id(&id("1")).await.unwrap().unwrap();
        assert_eq!(found.fields()["Name"], "Grace");
        assert_eq!(found.created_by(), Some(&email("c@x.com")));

        // An unknown ID degrades to a create
        ep.update(Contact::new(id("9")), None).await.unwrap();
        assert_eq!(ep.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn partial_save() {
        let backend = Arc::new(memory::Backend::seeded([
            Contact::new(id("a")),
            Contact::new(id("b")),
        ]));
        backend.fail_writes_for(id("b"));
        let ep = endpoint(&backend);

        let saved = ep.create(Contact::new(id("c")), None).await.unwrap();
        assert!(!saved.report.is_complete());
        assert_eq!(saved.report.failures[0].id, id("b"));
        let mut found: Vec<String> = ep
            .list()
            .await
            .unwrap()
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        found.sort();
        assert_eq!(found, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn read_failures_propagate() {
        let backend = Arc::new(memory::Backend::default());
        backend.fail_queries(true);
        let ep = endpoint(&backend);
        assert!(ep.list().await.is_err());
        assert!(ep.get_by_id(&id("1")).await.is_err());
        assert!(ep.create(Contact::new(id("1")), None).await.is_err());
        assert!(ep.delete(&id("1")).await.is_err());
    }
}
