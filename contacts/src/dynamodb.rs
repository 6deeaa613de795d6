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

//! # dynamodb
//!
//! [Storage] implementation for DynamoDB.
//!
//! [Storage]: crate::storage
//!
//! A collection maps to the table `"{database}.{collection}"`, keyed on the (string) attribute
//! `Id`. Contacts are written as-is via [serde_dynamo], so the open-schema members become
//! top-level attributes.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, meta::region::RegionProviderChain};
use aws_sdk_dynamodb::{
    config::{Credentials, http::HttpResponse},
    error::{DisplayErrorContext, SdkError},
    types::AttributeValue,
};
use http::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_dynamo::aws_sdk_dynamodb_1::{from_items, to_item};
use snafu::{Backtrace, OptionExt, Snafu};
use tracing::debug;
use url::Url;

use crate::{
    entities::{Contact, ContactId},
    storage::{self, CollectionRef, FeedOptions, Page, UpstreamSnafu},
    util::Credentials as KeyPair,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("No endpoint URLs specified"))]
    NoEndpoints { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

/// Where to find DynamoDB: an AWS region, or explicit endpoints (for DynamoDB local, or an
/// Alternator-compatible cluster)
#[derive(Clone, Debug, Deserialize)]
pub enum Location {
    Region(String),
    Endpoints(Vec<Url>),
}

pub struct Client {
    client: ::aws_sdk_dynamodb::Client,
}

impl Client {
    pub async fn new(location: &Location, credentials: &Option<KeyPair>) -> Result<Client> {
        let creds = credentials.as_ref().map(|KeyPair((id, secret))| {
            Credentials::new(
                id.expose_secret(),
                secret.expose_secret(),
                None,
                None,
                "contacts",
            )
        });

        let config = match location {
            Location::Region(region) => {
                let region_provider =
                    RegionProviderChain::first_try(Some(Region::new(region.clone())))
                        .or_default_provider()
                        .or_else(Region::new("us-west-2"));
                let mut loader = aws_config::from_env().region(region_provider);
                if let Some(creds) = creds {
                    loader = loader.credentials_provider(creds);
                }
                loader.load().await
            }
            Location::Endpoints(endpoints) => {
                let ep_url = endpoints.first().context(NoEndpointsSnafu)?;
                // DynamoDB local doesn't care about the region, but the SDK insists on one
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .endpoint_url(ep_url.as_str())
                    .region(
                        RegionProviderChain::default_provider().or_else(Region::new("us-west-2")),
                    );
                if let Some(creds) = creds {
                    loader = loader.credentials_provider(creds);
                }
                loader.load().await
            }
        };
        Ok(Client {
            client: ::aws_sdk_dynamodb::Client::new(&config),
        })
    }
}

fn table_name(collection: &CollectionRef) -> String {
    format!("{}.{}", collection.database, collection.collection)
}

/// Map an SDK error onto a storage error, preserving the service's HTTP status if it sent one
fn sdk_error<E>(err: SdkError<E, HttpResponse>) -> storage::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let upstream = err.raw_response().and_then(|rsp| {
        let status = StatusCode::from_u16(rsp.status().as_u16()).ok()?;
        let body = rsp
            .body()
            .bytes()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
        Some((status, body))
    });
    match upstream {
        Some((status, body)) if !status.is_success() => UpstreamSnafu {
            status,
            body: body.unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
        }
        .build(),
        _ => storage::Error::new(err),
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
        let mut builder = self
            .client
            .scan()
            .table_name(table_name(collection))
            .limit(i32::try_from(options.max_item_count).unwrap_or(i32::MAX));
        if let Some(token) = continuation {
            builder = builder.exclusive_start_key("Id", AttributeValue::S(token.to_owned()));
        }
        let output = builder.send().await.map_err(sdk_error)?;
        // The only key attribute is "Id", so that's all we need to carry forward.
        let continuation = match output.last_evaluated_key() {
            Some(key) => match key.get("Id") {
                Some(AttributeValue::S(id)) => Some(id.clone()),
                _ => None,
            },
            None => None,
        };
        let documents: Vec<Contact> = match output.items {
            Some(items) => from_items(items).map_err(storage::Error::document)?,
            None => Vec::new(),
        };
        debug!(
            "scan of {} :=> {} items, continuation {:?}",
            table_name(collection),
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
        self.client
            .put_item()
            .table_name(table_name(collection))
            .set_item(Some(to_item(contact).map_err(storage::Error::document)?))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
    async fn delete_document(
        &self,
        collection: &CollectionRef,
        id: &ContactId,
    ) -> storage::Result<()> {
        self.client
            .delete_item()
            .table_name(table_name(collection))
            .key("Id", AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}
