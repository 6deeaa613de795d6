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

//! # cosmos
//!
//! [Storage] implementation for Azure Cosmos DB, spoken to over its [REST API] with master-key
//! authorization.
//!
//! [Storage]: crate::storage
//! [REST API]: https://learn.microsoft.com/en-us/rest/api/cosmos-db/
//!
//! There's no official Rust SDK I'm willing to take a dependency on, and we only need three
//! operations, so this is a thin [reqwest] client:
//!
//! - query: `POST dbs/{db}/colls/{coll}/docs` with a SQL query body (`SELECT * FROM c`), paged by
//!   the `x-ms-max-item-count` & `x-ms-continuation` headers
//! - upsert: `POST dbs/{db}/colls/{coll}/docs` with `x-ms-documentdb-is-upsert: True`
//! - delete: `DELETE dbs/{db}/colls/{coll}/docs/{id}`
//!
//! Every request carries an `authorization` header: an HMAC-SHA256, keyed with the (base64
//! decoded) master key, over the verb, resource type, resource link & date.

use async_trait::async_trait;
use base64::{Engine, prelude::BASE64_STANDARD};
use chrono::Utc;
use hmac::{Hmac, Mac, digest::InvalidLength};
use http::StatusCode;
use reqwest::{Method, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sha2::Sha256;
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::debug;
use url::Url;

use crate::{
    entities::{Contact, ContactId},
    storage::{self, CollectionRef, FeedOptions, Page, UpstreamSnafu},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The Cosmos DB master key is not valid base64: {source}"))]
    BadKey {
        source: base64::DecodeError,
        backtrace: Backtrace,
    },
    #[snafu(display("{url} can't be used as a base URL"))]
    BadUrl { url: Url, backtrace: Backtrace },
    #[snafu(display("Failed to build an HTTP client: {source}"))]
    Client {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{segment} can't be addressed as a path segment"))]
    DotSegment {
        segment: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create an HMAC: {source}"))]
    Hmac {
        source: InvalidLength,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// The REST API version we speak
const API_VERSION: &str = "2018-12-31";

/// The one query we issue
const QUERY_ALL: &str = "SELECT * FROM c";

/// Cosmos DB connection settings
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// Account endpoint, e.g. `https://account.documents.azure.com:443/`
    pub cosmos_db_url: Url,
    /// The account's primary key, as shown in the portal (i.e. base64-encoded)
    pub cosmos_db_pk: SecretString,
    /// Set this if the collection is partitioned on `/id`
    #[serde(default)]
    pub partitioned_by_id: bool,
}

pub struct Client {
    client: reqwest::Client,
    base: Url,
    key: SecretSlice<u8>,
    partitioned_by_id: bool,
}

/// Compute the value of the `authorization` header for a request
///
/// `resource_type` is "docs" (or "colls", &c); `resource_link` is the path of the resource (for a
/// feed, its parent): `dbs/{db}/colls/{coll}` to query, `dbs/{db}/colls/{coll}/docs/{id}` to
/// delete.
fn authorization_token(
    key: &[u8],
    verb: &Method,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> Result<String> {
    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.as_str().to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    );
    let mut mac: Hmac<Sha256> = Hmac::new_from_slice(key).context(HmacSnafu)?;
    mac.update(payload.as_bytes());
    let sig = BASE64_STANDARD.encode(mac.finalize().into_bytes());
    Ok(url::form_urlencoded::byte_serialize(
        format!("type=master&ver=1.0&sig={sig}").as_bytes(),
    )
    .collect())
}

/// Cosmos wants RFC 1123 dates, always in GMT
fn rfc1123_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Turn a [Contact] into a Cosmos document: Cosmos insists on a lower-case `id`.
fn to_document(contact: &Contact) -> storage::Result<Value> {
    let mut doc = serde_json::to_value(contact).map_err(storage::Error::document)?;
    if let Value::Object(map) = &mut doc {
        map.remove("Id");
        map.insert("id".to_owned(), Value::String(contact.id().to_string()));
    }
    Ok(doc)
}

/// Turn a Cosmos document into a [Contact], dropping the system properties (`_rid`, `_etag`, &c)
fn from_document(doc: Value) -> storage::Result<Contact> {
    let doc = match doc {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    };
    serde_json::from_value(doc).map_err(storage::Error::document)
}

/// Path segments naming the documents feed of `collection`
fn docs_path(collection: &CollectionRef) -> Vec<&str> {
    vec![
        "dbs",
        collection.database.as_str(),
        "colls",
        collection.collection.as_str(),
        "docs",
    ]
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(rename = "Documents")]
    documents: Vec<Value>,
}

/// Hand back non-2xx responses as [storage::Error::Upstream]
async fn check_status(rsp: Response) -> storage::Result<Response> {
    let status = rsp.status();
    if status.is_success() {
        return Ok(rsp);
    }
    let body = rsp.text().await.unwrap_or_default();
    UpstreamSnafu {
        status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        body,
    }
    .fail()
}

impl Client {
    pub fn new(settings: &Settings) -> Result<Client> {
        let key = BASE64_STANDARD
            .decode(settings.cosmos_db_pk.expose_secret())
            .context(BadKeySnafu)?;
        let base = settings.cosmos_db_url.clone();
        if base.cannot_be_a_base() {
            return BadUrlSnafu { url: base }.fail();
        }
        Ok(Client {
            client: reqwest::Client::builder().build().context(ClientSnafu)?,
            base,
            key: key.into(),
            partitioned_by_id: settings.partitioned_by_id,
        })
    }
    /// Build a request with the headers common to every call
    ///
    /// `segments` are appended to the account URL one at a time, so each is percent-encoded in
    /// full; a document id containing '/', '?' or '#' stays a single path segment.
    fn request(
        &self,
        verb: Method,
        segments: &[&str],
        resource_type: &str,
        resource_link: &str,
    ) -> storage::Result<RequestBuilder> {
        // `PathSegmentsMut` silently drops these
        if let Some(segment) = segments.iter().find(|s| matches!(**s, "." | "..")) {
            return Err(storage::Error::new(
                DotSegmentSnafu {
                    segment: segment.to_string(),
                }
                .build(),
            ));
        }
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                storage::Error::new(
                    BadUrlSnafu {
                        url: self.base.clone(),
                    }
                    .build(),
                )
            })?
            .pop_if_empty()
            .extend(segments);
        let date = rfc1123_now();
        let auth = authorization_token(
            self.key.expose_secret(),
            &verb,
            resource_type,
            resource_link,
            &date,
        )
        .map_err(storage::Error::new)?;
        Ok(self
            .client
            .request(verb, url)
            .header("authorization", auth)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION))
    }
}

#[async_trait]
impl storage::Backend for Client {
    async fn query_page(
        &self,
        collection: &CollectionRef,
        options: &FeedOptions,
        continuation: Option<&str>,
    ) -> storage::Result<Page> {
        let link = collection.to_string();
        let mut req = self
            .request(Method::POST, &docs_path(collection), "docs", &link)?
            .header("x-ms-documentdb-isquery", "True")
            .header("content-type", "application/query+json")
            .header("x-ms-max-item-count", options.max_item_count.to_string());
        if self.partitioned_by_id {
            req = req.header("x-ms-documentdb-query-enablecrosspartition", "True");
        }
        if let Some(token) = continuation {
            req = req.header("x-ms-continuation", token);
        }
        let rsp = req
            .body(json!({"query": QUERY_ALL, "parameters": []}).to_string())
            .send()
            .await
            .map_err(storage::Error::new)?;
        let rsp = check_status(rsp).await?;
        let continuation = rsp
            .headers()
            .get("x-ms-continuation")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_owned());
        let body: QueryResponse = rsp.json().await.map_err(storage::Error::document)?;
        let documents = body
            .documents
            .into_iter()
            .map(from_document)
            .collect::<storage::Result<Vec<Contact>>>()?;
        debug!(
            "query of {link} :=> {} documents, continuation {:?}",
            documents.len(),
            continuation
        );
        Ok(Page {
            documents,
            continuation,
        })
    }
    async fn upsert_document(
        &self,
        collection: &CollectionRef,
        contact: &Contact,
    ) -> storage::Result<()> {
        let link = collection.to_string();
        let mut req = self
            .request(Method::POST, &docs_path(collection), "docs", &link)?
            .header("x-ms-documentdb-is-upsert", "True")
            .header("content-type", "application/json");
        if self.partitioned_by_id {
            req = req.header(
                "x-ms-documentdb-partitionkey",
                json!([contact.id().as_ref()]).to_string(),
            );
        }
        let rsp = req
            .body(to_document(contact)?.to_string())
            .send()
            .await
            .map_err(storage::Error::new)?;
        check_status(rsp).await?;
        Ok(())
    }
    async fn delete_document(
        &self,
        collection: &CollectionRef,
        id: &ContactId,
    ) -> storage::Result<()> {
        let link = format!("{collection}/docs/{id}");
        let mut path = docs_path(collection);
        path.push(id.as_ref());
        let mut req = self.request(Method::DELETE, &path, "docs", &link)?;
        if self.partitioned_by_id {
            req = req.header(
                "x-ms-documentdb-partitionkey",
                json!([id.as_ref()]).to_string(),
            );
        }
        let rsp = req.send().await.map_err(storage::Error::new)?;
        check_status(rsp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use mockito::Matcher;

    use crate::storage::Backend;

    fn settings(url: &str) -> Settings {
        Settings {
            cosmos_db_url: Url::parse(url).unwrap(),
            cosmos_db_pk: SecretString::from(BASE64_STANDARD.encode(b"sekrit")),
            partitioned_by_id: false,
        }
    }

    #[test]
    fn signatures() {
        let token = authorization_token(
            b"sekrit",
            &Method::GET,
            "DOCS",
            "dbs/user_profile/colls/contacts",
            "Tue, 01 Nov 1994 08:12:31 GMT",
        )
        .unwrap();
        assert!(token.starts_with("type%3Dmaster%26ver%3D1.0%26sig%3D"));

        // Same inputs modulo case => same signature
        let again = authorization_token(
            b"sekrit",
            &Method::GET,
            "docs",
            "dbs/user_profile/colls/contacts",
            "tue, 01 nov 1994 08:12:31 gmt",
        )
        .unwrap();
        assert_eq!(token, again);
    }

    #[test]
    fn documents() {
        let contact = Contact::new(ContactId::new("7").unwrap()).with_field("Name", "Ada");
        let doc = to_document(&contact).unwrap();
        assert_eq!(doc["id"], "7");
        assert!(doc.get("Id").is_none());

        let back = from_document(json!({
            "id": "7", "Name": "Ada", "CreatedBy": null,
            "_rid": "abc", "_etag": "\"0\"", "_ts": 1700000000
        }))
        .unwrap();
        assert_eq!(back, contact);
    }

    #[tokio::test]
    async fn paged_query() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/dbs/user_profile/colls/contacts/docs")
            .match_header("x-ms-documentdb-isquery", "True")
            .match_header("x-ms-max-item-count", "10")
            .match_header("x-ms-version", API_VERSION)
            .match_header("authorization", Matcher::Regex("^type%3Dmaster".to_owned()))
            .match_header("x-ms-continuation", Matcher::Missing)
            .with_status(200)
            .with_header("x-ms-continuation", "page-2")
            .with_body(r#"{"_rid": "x", "Documents": [{"id": "1", "_ts": 1}], "_count": 1}"#)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/dbs/user_profile/colls/contacts/docs")
            .match_header("x-ms-continuation", "page-2")
            .with_status(200)
            .with_body(r#"{"Documents": [{"id": "2", "CreatedBy": "a@x.com"}]}"#)
            .create_async()
            .await;

        let client = Client::new(&settings(&server.url())).unwrap();
        let coll = CollectionRef::default();
        let page = client
            .query_page(&coll, &FeedOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(page.documents.len(), 1);
        assert_eq!(page.continuation.as_deref(), Some("page-2"));
        let page = client
            .query_page(&coll, &FeedOptions::default(), Some("page-2"))
            .await
            .unwrap();
        assert_eq!(page.documents[0].id().as_ref(), "2");
        assert!(page.continuation.is_none());

        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn upsert_and_delete() {
        let mut server = mockito::Server::new_async().await;
        let upsert = server
            .mock("POST", "/dbs/user_profile/colls/contacts/docs")
            .match_header("x-ms-documentdb-is-upsert", "True")
            .match_body(Matcher::PartialJson(json!({"id": "1", "Name": "Ada"})))
            .with_status(201)
            .with_body(r#"{"id": "1"}"#)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/dbs/user_profile/colls/contacts/docs/1")
            .with_status(204)
            .create_async()
            .await;

        let client = Client::new(&settings(&server.url())).unwrap();
        let coll = CollectionRef::default();
        client
            .upsert_document(
                &coll,
                &Contact::new(ContactId::new("1").unwrap()).with_field("Name", "Ada"),
            )
            .await
            .unwrap();
        client
            .delete_document(&coll, &ContactId::new("1").unwrap())
            .await
            .unwrap();
        upsert.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn ids_are_single_path_segments() {
        let mut server = mockito::Server::new_async().await;
        let delete = server
            .mock(
                "DELETE",
                "/dbs/user_profile/colls/contacts/docs/a%2Fb%3Fc%23d%20e",
            )
            .with_status(204)
            .create_async()
            .await;
        // An account URL with a path of its own keeps it
        let nested = server
            .mock("DELETE", "/cosmos/dbs/user_profile/colls/contacts/docs/1")
            .with_status(204)
            .create_async()
            .await;

        let coll = CollectionRef::default();
        Client::new(&settings(&server.url()))
            .unwrap()
            .delete_document(&coll, &ContactId::new("a/b?c#d e").unwrap())
            .await
            .unwrap();
        Client::new(&settings(&format!("{}/cosmos", server.url())))
            .unwrap()
            .delete_document(&coll, &ContactId::new("1").unwrap())
            .await
            .unwrap();
        delete.assert_async().await;
        nested.assert_async().await;

        // Never resolved against the collection
        assert!(
            Client::new(&settings(&server.url()))
                .unwrap()
                .delete_document(&coll, &ContactId::new("..").unwrap())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn upstream_failures() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/dbs/user_profile/colls/contacts/docs")
            .with_status(429)
            .with_body(r#"{"code": "TooManyRequests"}"#)
            .create_async()
            .await;
        let client = Client::new(&settings(&server.url())).unwrap();
        let err = client
            .query_page(&CollectionRef::default(), &FeedOptions::default(), None)
            .await
            .unwrap_err();
        let (status, body) = err.upstream_status().unwrap();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body.contains("TooManyRequests"));
    }
}
