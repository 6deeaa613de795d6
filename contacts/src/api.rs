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

//! # Contacts API
//!
//! The HTTP face of [ContactsEndpoint]:
//!
//! | Method | Path              | Success                      | Not found         |
//! |--------|-------------------|------------------------------|-------------------|
//! | GET    | `/contacts`       | 200, every contact           |                   |
//! | GET    | `/contacts/{id}`  | 200, the contact             | 200, `null`       |
//! | POST   | `/contacts`       | 201, the contact as saved    |                   |
//! | PUT    | `/contacts`       | 200, the contact as saved    |                   |
//! | DELETE | `/contacts/{id}`  | 200, `true`                  | 404, `false`      |
//!
//! If the document store fails a request with an HTTP status, we pass that status (and its body)
//! straight back to our caller. Anything else that goes wrong is a 500. A write that only
//! partially lands is also a 500, with the contacts that didn't make it listed in the response
//! body.
//!
//! [ContactsEndpoint]: crate::endpoint::ContactsEndpoint

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::get,
};
use itertools::Itertools;
use snafu::prelude::*;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, error, info, warn};

use crate::{
    authn::{self, AuthnScheme, Caller, check_token},
    contacts::Contacts,
    counter_add,
    endpoint::Saved,
    entities::{self, Contact, ContactId},
    gauge_setu,
    http::ErrorResponseBody,
    metrics::{self, Sort},
    store::{self, SaveFailure, SaveReport},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{id} is not a valid contact ID: {source}"))]
    BadId {
        id: String,
        source: entities::Error,
    },
    #[snafu(display("Bad Authorization header: {source}"))]
    InvalidAuthHeader { source: authn::Error },
    #[snafu(display("Invalid credentials: {source}"))]
    InvalidCredentials { source: authn::Error },
    #[snafu(display("Multiple Authorization headers were supplied; only one is accepted."))]
    MultipleAuthnHeaders,
    #[snafu(display("{} of the writes for contact {id} failed", failures.len()))]
    PartialSave {
        id: ContactId,
        failures: Vec<SaveFailure>,
    },
    #[snafu(display("{source}"))]
    Store { source: store::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            ////////////////////////////////////////////////////////////////////////////////////////
            // Broken requests-- tell the caller how to fix it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::BadId { id, .. } => (
                StatusCode::BAD_REQUEST,
                format!("{id} is not a valid contact ID"),
            ),
            Error::InvalidAuthHeader { source } => match source {
                authn::Error::UnsupportedAuthScheme { .. } => {
                    (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
                }
                _ => (
                    StatusCode::BAD_REQUEST,
                    format!("Bad Authorization header: {source}"),
                ),
            },
            Error::MultipleAuthnHeaders => (
                StatusCode::BAD_REQUEST,
                "Multiple authorization headers".to_string(),
            ),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Authorization failure-- don't tell a potential attacker the way in which they failed
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::InvalidCredentials { .. } => {
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
            }
            ////////////////////////////////////////////////////////////////////////////////////////
            // Upstream failures are passed through; anything else is on us
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::PartialSave { id, failures } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(
                    "Contact {id} was not fully saved; {} write(s) failed",
                    failures.len()
                ),
            ),
            Error::Store { source } => match source.storage().upstream_status() {
                Some((status, body)) => (status, body.to_owned()),
                None => (StatusCode::INTERNAL_SERVER_ERROR, format!("{source}")),
            },
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        // The store's own error response goes back to the caller as-is
        if let Error::Store { source } = &self {
            if let Some((status, body)) = source.storage().upstream_status() {
                return (status, Body::from(body.to_owned())).into_response();
            }
        }
        let (code, msg) = self.as_status_and_msg();
        let failures = match self {
            Error::PartialSave { failures, .. } => Some(failures),
            _ => None,
        };
        (
            code,
            Json(ErrorResponseBody {
                error: msg,
                failures,
            }),
        )
            .into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

/// A write "succeeded" only if every document landed
fn check_report(id: &ContactId, report: SaveReport) -> Result<()> {
    if report.is_complete() {
        Ok(())
    } else {
        PartialSaveSnafu {
            id: id.clone(),
            failures: report.failures,
        }
        .fail()
    }
}

fn parse_id(id: &str) -> Result<ContactId> {
    ContactId::new(id).context(BadIdSnafu { id: id.to_owned() })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Authentication                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("contacts.auth.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("contacts.auth.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("contacts.auth.anonymous", Sort::IntegralCounter) }

/// Authenticate a request to the contacts API
///
/// Every request that gets through here carries a [Caller] extension. Callers who present no
/// `Authorization` header at all are let through anonymously; callers who present a bad one are
/// turned away.
async fn authenticate(
    State(state): State<Arc<Contacts>>,
    headers: axum::http::HeaderMap,
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    // Use a nested function returning a `Result` so I can use `?`, then have the outer
    // implementation handle converting that to an axum Response.
    fn authenticate1(headers: &axum::http::HeaderMap, state: &Contacts) -> Result<Caller> {
        // Reject requests carrying more than one Authorization header outright.
        let scheme = match headers
            .get_all("authorization")
            .into_iter()
            .at_most_one()
            .map_err(|_| Error::MultipleAuthnHeaders)?
        {
            Some(header_val) => AuthnScheme::try_from(header_val).context(InvalidAuthHeaderSnafu)?,
            None => return Ok(Caller::anonymous()),
        };
        match scheme {
            AuthnScheme::BearerToken(token_string) => {
                check_token(&token_string, &state.signing_keys, &state.token_issuer)
                    .map(Caller::authenticated)
                    .context(InvalidCredentialsSnafu)
            }
        }
    }

    match authenticate1(&headers, &state) {
        Ok(caller) => {
            match caller.identity() {
                Some(identity) => {
                    debug!("contacts authenticated {}", identity.subject);
                    counter_add!(state.instruments, "contacts.auth.successes", 1, &[]);
                }
                None => {
                    counter_add!(state.instruments, "contacts.auth.anonymous", 1, &[]);
                }
            }
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Err(err) => {
            info!("contacts failed to authenticate this request: {err}");
            counter_add!(state.instruments, "contacts.auth.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         GET /contacts                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("contacts.list.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("contacts.list.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("contacts.count", Sort::IntegralGauge) }

/// Retrieve every contact
async fn list(State(state): State<Arc<Contacts>>) -> axum::response::Response {
    match state.endpoint.list().await.context(StoreSnafu) {
        Ok(contacts) => {
            counter_add!(state.instruments, "contacts.list.successes", 1, &[]);
            gauge_setu!(state.instruments, "contacts.count", contacts.len() as u64, &[]);
            (StatusCode::OK, Json(contacts)).into_response()
        }
        Err(err) => {
            error!("{err:#?}");
            counter_add!(state.instruments, "contacts.list.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       GET /contacts/{id}                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("contacts.get.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("contacts.get.failures", Sort::IntegralCounter) }

/// Retrieve a single contact by ID
///
/// Note that a missing contact is *not* a 404: the response is a 200 with a body of `null`.
async fn get_by_id(
    State(state): State<Arc<Contacts>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    async fn get_by_id1(id: &str, state: &Contacts) -> Result<Option<Contact>> {
        let id = parse_id(id)?;
        state.endpoint.get_by_id(&id).await.context(StoreSnafu)
    }

    match get_by_id1(&id, &state).await {
        Ok(contact) => {
            if contact.is_none() {
                debug!("No contact with ID {id}");
            }
            counter_add!(state.instruments, "contacts.get.successes", 1, &[]);
            (StatusCode::OK, Json(contact)).into_response()
        }
        Err(err) => {
            error!("{err:#?}");
            counter_add!(state.instruments, "contacts.get.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         POST /contacts                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("contacts.create.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("contacts.create.failures", Sort::IntegralCounter) }

/// Add a new contact
///
/// `CreatedBy` is set from the caller's token (or cleared, for anonymous callers); anything the
/// caller put there themselves is ignored.
async fn create(
    State(state): State<Arc<Contacts>>,
    Extension(caller): Extension<Caller>,
    Json(contact): Json<Contact>,
) -> axum::response::Response {
    async fn create1(contact: Contact, caller: &Caller, state: &Contacts) -> Result<Contact> {
        let Saved { contact, report } = state
            .endpoint
            .create(contact, caller.email())
            .await
            .context(StoreSnafu)?;
        check_report(contact.id(), report)?;
        Ok(contact)
    }

    match create1(contact, &caller, &state).await {
        Ok(contact) => {
            info!("Created contact {}", contact.id());
            counter_add!(state.instruments, "contacts.create.successes", 1, &[]);
            (StatusCode::CREATED, Json(contact)).into_response()
        }
        Err(err) => {
            error!("{err:#?}");
            counter_add!(state.instruments, "contacts.create.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         PUT /contacts                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("contacts.update.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("contacts.update.failures", Sort::IntegralCounter) }

/// Replace a contact (or add it, if there's nothing to replace)
async fn update(
    State(state): State<Arc<Contacts>>,
    Extension(caller): Extension<Caller>,
    Json(contact): Json<Contact>,
) -> axum::response::Response {
    async fn update1(contact: Contact, caller: &Caller, state: &Contacts) -> Result<Contact> {
        let Saved { contact, report } = state
            .endpoint
            .update(contact, caller.email())
            .await
            .context(StoreSnafu)?;
        check_report(contact.id(), report)?;
        Ok(contact)
    }

    match update1(contact, &caller, &state).await {
        Ok(contact) => {
            info!("Updated contact {}", contact.id());
            counter_add!(state.instruments, "contacts.update.successes", 1, &[]);
            (StatusCode::OK, Json(contact)).into_response()
        }
        Err(err) => {
            error!("{err:#?}");
            counter_add!(state.instruments, "contacts.update.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     DELETE /contacts/{id}                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("contacts.delete.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("contacts.delete.not-found", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("contacts.delete.failures", Sort::IntegralCounter) }

/// Remove every contact with a given ID; the response body is simply `true` or `false`
async fn delete(
    State(state): State<Arc<Contacts>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    async fn delete1(id: &str, state: &Contacts) -> Result<bool> {
        let id = parse_id(id)?;
        match state.endpoint.delete(&id).await.context(StoreSnafu)? {
            Some(report) => {
                check_report(&id, report)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    match delete1(&id, &state).await {
        Ok(true) => {
            info!("Deleted contact {id}");
            counter_add!(state.instruments, "contacts.delete.successes", 1, &[]);
            (StatusCode::OK, Json(true)).into_response()
        }
        Ok(false) => {
            warn!("Request to delete non-existent contact {id}");
            counter_add!(state.instruments, "contacts.delete.not-found", 1, &[]);
            (StatusCode::NOT_FOUND, Json(false)).into_response()
        }
        Err(err) => {
            error!("{err:#?}");
            counter_add!(state.instruments, "contacts.delete.failures", 1, &[]);
            err.into_response()
        }
    }
}

pub fn make_router(state: Arc<Contacts>) -> Router<Arc<Contacts>> {
    Router::new()
        .route("/contacts", get(list).post(create).put(update))
        .route("/contacts/", get(list).post(create).put(update))
        .route("/contacts/{id}", get(get_by_id).delete(delete))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            authenticate,
        ))
        // All responses are JSON; add the appropriate Content-Type header (but leave the existing
        // Content-Type header should a handler set it specially).
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
