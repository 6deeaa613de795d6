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

//! # contacts Bearer Tokens
//!
//! Callers identify themselves with a [JWT], HS256-signed with one of our [SigningKeys]. The only
//! claim this service really cares about is `email`, which becomes the `CreatedBy` member of any
//! contact the caller writes.
//!
//! [JWT]: https://www.rfc-editor.org/rfc/rfc7519.html

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac, digest::InvalidLength};
use jwt::{Header, SignWithKey, Token, VerifyWithKey};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use snafu::{Backtrace, prelude::*};

use crate::{
    entities::{self, Email},
    signing_keys::{self, KeyId, SigningKey, SigningKeys},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The email claim is invalid: {source}"))]
    BadEmail { source: entities::Error },
    #[snafu(display("Token expired at {expires}"))]
    Expired {
        expires: DateTime<Utc>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create an HMAC: {source}"))]
    Hmac {
        source: InvalidLength,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to refine a string to a KeyId: {source}"))]
    KeyId { source: signing_keys::Error },
    #[snafu(display("The Key ID was missing from the JWT"))]
    MissingKeyId { backtrace: Backtrace },
    #[snafu(display("No signing key matching {keyid}: {source}"))]
    NoKey {
        keyid: KeyId,
        source: signing_keys::Error,
    },
    #[snafu(display("Invalid token: not before {not_before}"))]
    NotBefore {
        not_before: DateTime<Utc>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse JWT: {source}"))]
    Parse {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to sign JWT claims: {source}"))]
    Signature {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown token audience {audience}"))]
    UnknownAudience {
        audience: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown token issuer {issuer}"))]
    UnknownIssuer { issuer: String, backtrace: Backtrace },
    #[snafu(display("Verification failure: {source}"))]
    Verification {
        source: jwt::error::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       the access token                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// contacts access [JWT] [claims]
///
/// [claims]: https://pragmaticwebsecurity.com/articles/apisecurity/hard-parts-of-jwt.html
#[derive(Clone, Debug, Deserialize, Serialize)]
struct AccessClaims {
    #[serde(rename = "iat")]
    issued_at: DateTime<Utc>,
    #[serde(rename = "iss")]
    issuer: String,
    #[serde(rename = "aud")]
    audience: String,
    #[serde(rename = "nbf")]
    not_before: DateTime<Utc>,
    #[serde(rename = "exp")]
    expires: DateTime<Utc>,
    #[serde(rename = "sub")]
    subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
}

/// Who a verified token says the caller is
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    pub subject: String,
    pub email: Option<Email>,
}

fn audience_for(issuer: &str) -> String {
    format!("api.{}", issuer)
}

/// Mint a new JWT
///
/// Mint a new token for `subject` (optionally asserting `email`), signed using `signing_key`
/// (identified by `keyid`). The token will be valid for duration `lifetime`.
///
/// The fully serialized JWT will be returned.
pub fn mint_token(
    subject: &str,
    email: Option<&Email>,
    keyid: &KeyId,
    signing_key: &SigningKey,
    issuer: &str,
    lifetime: &Duration,
) -> Result<String> {
    let key: Hmac<Sha256> =
        Hmac::new_from_slice(signing_key.as_ref().expose_secret()).context(HmacSnafu)?;
    let header = Header {
        key_id: Some(keyid.to_string()),
        ..Default::default()
    };
    let now = Utc::now();
    let claims = AccessClaims {
        issued_at: now,
        issuer: issuer.to_owned(),
        audience: audience_for(issuer),
        not_before: now,
        expires: now + *lifetime,
        subject: subject.to_owned(),
        email: email.map(|e| e.to_string()),
    };
    Ok(Token::new(header, claims)
        .sign_with_key(&key)
        .context(SignatureSnafu)?
        .as_str()
        .to_owned())
}

pub fn verify_token(token_string: &str, keys: &SigningKeys, issuer: &str) -> Result<Identity> {
    let token: Token<Header, AccessClaims, _ /* Unverified<'_> */> =
        Token::parse_unverified(token_string).context(ParseSnafu)?;
    let keyid = token
        .header()
        .key_id
        .clone()
        .context(MissingKeyIdSnafu)?;
    let keyid = KeyId::new(&keyid).context(KeyIdSnafu)?;
    let signing_key = keys.find_by_version(&keyid).context(NoKeySnafu { keyid })?;
    let key: Hmac<Sha256> =
        Hmac::new_from_slice(signing_key.as_ref().expose_secret()).context(HmacSnafu)?;
    let token: Token<Header, AccessClaims, _> = token_string
        .verify_with_key(&key)
        .context(VerificationSnafu)?;
    let claims = token.claims();

    let now = Utc::now();

    ensure!(
        now >= claims.not_before,
        NotBeforeSnafu {
            not_before: claims.not_before
        }
    );
    ensure!(
        now <= claims.expires,
        ExpiredSnafu {
            expires: claims.expires
        }
    );
    ensure!(
        issuer == claims.issuer,
        UnknownIssuerSnafu {
            issuer: claims.issuer.clone()
        }
    );
    ensure!(
        audience_for(issuer) == claims.audience,
        UnknownAudienceSnafu {
            audience: claims.audience.clone()
        }
    );

    Ok(Identity {
        subject: claims.subject.clone(),
        email: claims
            .email
            .as_deref()
            .map(Email::new)
            .transpose()
            .context(BadEmailSnafu)?,
    })
}
