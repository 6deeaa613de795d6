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

//! Exercise the contacts API end-to-end (router, authentication middleware, endpoint & store)
//! against the in-memory backend.

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{
        HeaderMap, Method, Request, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
            ACCESS_CONTROL_REQUEST_METHOD, AUTHORIZATION, CONTENT_TYPE, ORIGIN,
        },
    },
};
use chrono::Duration;
use serde_json::{Value, json};
use tower::ServiceExt;

use contacts::{
    api::make_router,
    contacts::Contacts,
    endpoint::ContactsEndpoint,
    entities::{Contact, ContactId, Email},
    memory,
    metrics::Instruments,
    signing_keys::{KeyId, SigningKey, SigningKeys},
    storage::CollectionRef,
    store::ContactStore,
    token::mint_token,
};

const ISSUER: &str = "contacts.example.com";

fn keys() -> SigningKeys {
    SigningKeys::from([(
        KeyId::new("keyid:20250101").unwrap(),
        SigningKey::new(vec![7u8; 64]).unwrap(),
    )])
}

fn bearer(email: &str) -> String {
    let (keyid, key) = keys().current().unwrap();
    let token = mint_token(
        "someone",
        Some(&Email::new(email).unwrap()),
        &keyid,
        &key,
        ISSUER,
        &Duration::minutes(5),
    )
    .unwrap();
    format!("Bearer {token}")
}

fn contact(id: &str, created_by: Option<&str>) -> Contact {
    let mut c = Contact::new(ContactId::new(id).unwrap()).with_field("Name", format!("Person {id}"));
    c.stamp_creator(created_by.map(|e| Email::new(e).unwrap()).as_ref());
    c
}

fn router(backend: Arc<memory::Backend>) -> Router {
    let state = Arc::new(Contacts {
        endpoint: ContactsEndpoint::new(ContactStore::new(backend, CollectionRef::default())),
        instruments: Instruments::new("contacts"),
        signing_keys: keys(),
        token_issuer: ISSUER.to_owned(),
    });
    make_router(state.clone()).with_state(state)
}

/// Send a single request; return the status & the body, parsed as JSON
async fn call(
    router: Router,
    method: Method,
    uri: &str,
    authz: &[String],
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for value in authz {
        builder = builder.header(AUTHORIZATION, value);
    }
    let request = match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// Send a request as-is; return the status, headers & raw body
async fn send(router: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, bytes.to_vec())
}

#[tokio::test]
async fn reads() {
    let backend = Arc::new(memory::Backend::seeded(vec![
        contact("1", Some("a@x.com")),
        contact("2", None),
    ]));

    let (status, body) = call(router(backend.clone()), Method::GET, "/contacts", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(|v| v.len()), Some(2));
    assert_eq!(body[0]["Id"], "1");
    assert_eq!(body[0]["CreatedBy"], "a@x.com");
    assert_eq!(body[0]["Name"], "Person 1");

    let (status, body) = call(router(backend.clone()), Method::GET, "/contacts/", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(|v| v.len()), Some(2));

    let (status, body) = call(router(backend.clone()), Method::GET, "/contacts/2", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Id"], "2");
    assert_eq!(body["CreatedBy"], Value::Null);

    // Missing contacts are a 200 with a null body
    let (status, body) = call(router(backend), Method::GET, "/contacts/3", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn creates() {
    let backend = Arc::new(memory::Backend::default());

    // The caller's claim wins over whatever they put in the body
    let (status, body) = call(
        router(backend.clone()),
        Method::POST,
        "/contacts",
        &[bearer("b@x.com")],
        Some(json!({"Id": "2", "Name": "Bob", "CreatedBy": "mallory@x.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["Id"], "2");
    assert_eq!(body["Name"], "Bob");
    assert_eq!(body["CreatedBy"], "b@x.com");

    let (status, body) = call(router(backend.clone()), Method::GET, "/contacts/2", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["CreatedBy"], "b@x.com");

    // Anonymous callers get no CreatedBy; a missing Id is generated
    let (status, body) = call(
        router(backend.clone()),
        Method::POST,
        "/contacts",
        &[],
        Some(json!({"Name": "Carol", "CreatedBy": "mallory@x.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["CreatedBy"], Value::Null);
    assert!(body["Id"].as_str().is_some_and(|s| !s.is_empty()));

    assert_eq!(backend.snapshot().len(), 2);
}

#[tokio::test]
async fn updates() {
    let backend = Arc::new(memory::Backend::seeded(vec![
        contact("1", Some("a@x.com")),
        contact("2", None),
    ]));

    let (status, body) = call(
        router(backend.clone()),
        Method::PUT,
        "/contacts",
        &[bearer("c@x.com")],
        Some(json!({"Id": "1", "Name": "Ada"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Name"], "Ada");
    assert_eq!(body["CreatedBy"], "c@x.com");

    let snapshot = backend.snapshot();
    assert_eq!(snapshot.len(), 2);
    let updated = snapshot
        .iter()
        .find(|c| c.id().as_ref() == "1")
        .unwrap();
    assert_eq!(updated.fields().get("Name"), Some(&json!("Ada")));
    assert_eq!(updated.created_by().map(|e| e.as_ref()), Some("c@x.com"));
}

#[tokio::test]
async fn deletes() {
    let backend = Arc::new(memory::Backend::seeded(vec![contact("1", Some("a@x.com"))]));

    let (status, body) = call(router(backend.clone()), Method::DELETE, "/contacts/1", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Bool(true));

    let (_, body) = call(router(backend.clone()), Method::GET, "/contacts", &[], None).await;
    assert_eq!(body, json!([]));

    let (status, body) = call(router(backend), Method::DELETE, "/contacts/1", &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, Value::Bool(false));
}

#[tokio::test]
async fn partial_saves() {
    let backend = Arc::new(memory::Backend::seeded(vec![
        contact("1", None),
        contact("2", None),
    ]));
    backend.fail_writes_for(ContactId::new("2").unwrap());

    let (status, body) = call(
        router(backend.clone()),
        Method::POST,
        "/contacts",
        &[],
        Some(json!({"Id": "3"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());
    assert_eq!(body["failures"].as_array().map(|v| v.len()), Some(1));
    assert_eq!(body["failures"][0]["id"], "2");
    assert_eq!(body["failures"][0]["action"], "write");

    // The writes that succeeded did land
    let ids: Vec<String> = backend
        .snapshot()
        .iter()
        .map(|c| c.id().to_string())
        .collect();
    assert!(ids.contains(&"1".to_owned()));
    assert!(ids.contains(&"3".to_owned()));
}

#[tokio::test]
async fn upstream_failures() {
    let backend = Arc::new(memory::Backend::seeded(vec![contact("1", None)]));
    backend.fail_queries(true);

    let (status, body) = call(router(backend.clone()), Method::GET, "/contacts", &[], None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    // The store's error body comes back untouched
    assert_eq!(body["code"], "ServiceUnavailable");
    assert_eq!(body["message"], "dbs/user_profile/colls/contacts is unavailable");
    assert!(body.get("error").is_none());

    let (status, _) = call(router(backend.clone()), Method::GET, "/contacts/1", &[], None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = call(router(backend.clone()), Method::DELETE, "/contacts/1", &[], None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // Nothing was removed
    backend.fail_queries(false);
    assert_eq!(backend.snapshot().len(), 1);
}

#[tokio::test]
async fn authentication() {
    let backend = Arc::new(memory::Backend::default());

    // A token signed with some other key
    let other = SigningKeys::from([(
        KeyId::new("keyid:20250101").unwrap(),
        SigningKey::new(vec![8u8; 64]).unwrap(),
    )]);
    let (keyid, key) = other.current().unwrap();
    let forged = mint_token(
        "someone",
        Some(&Email::new("b@x.com").unwrap()),
        &keyid,
        &key,
        ISSUER,
        &Duration::minutes(5),
    )
    .unwrap();
    let (status, body) = call(
        router(backend.clone()),
        Method::GET,
        "/contacts",
        &[format!("Bearer {forged}")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _) = call(
        router(backend.clone()),
        Method::GET,
        "/contacts",
        &["Basic dXNlcjpwYXNz".to_owned()],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        router(backend.clone()),
        Method::GET,
        "/contacts",
        &[bearer("b@x.com"), bearer("c@x.com")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing written by a rejected caller
    let (status, _) = call(
        router(backend.clone()),
        Method::POST,
        "/contacts",
        &[format!("Bearer {forged}")],
        Some(json!({"Id": "1"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(backend.snapshot().is_empty());

    let (status, _) = call(
        router(backend),
        Method::GET,
        "/contacts",
        &[bearer("b@x.com")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_bodies() {
    let backend = Arc::new(memory::Backend::default());

    for (method, uri) in [(Method::POST, "/contacts"), (Method::PUT, "/contacts/")] {
        let (status, _, _) = send(
            router(backend.clone()),
            Request::builder()
                .method(method.clone())
                .uri(uri)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await;
        assert!(status.is_client_error(), "{method} {uri} :=> {status}");
    }

    // Well-formed JSON, but not an object
    let (status, _) = call(
        router(backend.clone()),
        Method::POST,
        "/contacts",
        &[],
        Some(json!(["Ada"])),
    )
    .await;
    assert!(status.is_client_error());

    // No content type at all
    let (status, _, _) = send(
        router(backend.clone()),
        Request::builder()
            .method(Method::POST)
            .uri("/contacts")
            .body(Body::from(r#"{"Id": "1"}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    // An Id must be non-empty, and may only be given once
    for body in [json!({"Id": ""}), json!({"Id": "1", "id": "2"})] {
        let (status, _, _) = send(
            router(backend.clone()),
            Request::builder()
                .method(Method::POST)
                .uri("/contacts")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
    }

    // Nothing was written
    assert!(backend.snapshot().is_empty());
}

#[tokio::test]
async fn cors() {
    let backend = Arc::new(memory::Backend::seeded(vec![contact("1", None)]));

    // Preflight
    let (status, headers, _) = send(
        router(backend.clone()),
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/contacts")
            .header(ORIGIN, "http://example.com")
            .header(ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert!(status.is_success());
    assert!(headers.contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));
    assert!(headers.contains_key(ACCESS_CONTROL_ALLOW_METHODS));

    // Simple cross-origin request
    let (status, headers, _) = send(
        router(backend.clone()),
        Request::builder()
            .method(Method::GET)
            .uri("/contacts/1")
            .header(ORIGIN, "http://example.com")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert!(
        headers[CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("application/json")
    );
}
