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

//! # contacts-token
//!
//! Mint a bearer token that `contactsd` will accept. Point it at the daemon's configuration file
//! so that it signs with the same (current) key & names the same issuer:
//!
//! ```text
//! contacts-token -c /etc/contacts.toml -e someone@example.com someone
//! ```
//!
//! The token is written to stdout.

use std::{fs, path::PathBuf};

use chrono::Duration;
use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use serde::Deserialize;
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tracing::{Level, debug, level_filters::LevelFilter};
use tracing_subscriber::{Registry, fmt, layer::SubscriberExt};

use contacts::{
    entities::Email,
    signing_keys::{self, SigningKeys},
    token::{self, mint_token},
};

#[derive(Snafu)]
enum Error {
    #[snafu(display("While attempting to read {path:?}, {source}"))]
    BadConfig {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("While parsing the configuration file, {source}"))]
    Config {
        source: toml::de::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("No signing key available: {source}"))]
    Key { source: signing_keys::Error },
    #[snafu(display("Failed to mint a token: {source}"))]
    Mint { source: token::Error },
    #[snafu(display("Failed to setup the tracing global subscriber: {source}"))]
    Subscriber {
        source: tracing::dispatcher::SetGlobalDefaultError,
        backtrace: Backtrace,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{self}")
    }
}

type Result<T> = std::result::Result<T, Error>;

/// The parts of the `contactsd` configuration file we need; everything else is ignored
#[derive(Debug, Deserialize)]
struct Configuration {
    #[serde(rename = "token-issuer")]
    token_issuer: String,
    #[serde(rename = "signing-keys")]
    signing_keys: SigningKeys,
}

/// Longest token lifetime we'll mint, in minutes (one year)
const MAX_LIFETIME: i64 = 525_600;

fn make_command() -> Command {
    Command::new("contacts-token")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Mint bearer tokens for the contacts API")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .required(true)
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("CONTACTS_CONFIG")
                .help("path to the contactsd configuration file"),
        )
        .arg(
            Arg::new("email")
                .short('e')
                .long("email")
                .num_args(1)
                .value_parser(value_parser!(Email))
                .help("e-mail address to assert in the token (this becomes CreatedBy)"),
        )
        .arg(
            Arg::new("lifetime")
                .short('l')
                .long("lifetime")
                .num_args(1)
                .default_value("60")
                .value_parser(value_parser!(i64).range(1..=MAX_LIFETIME))
                .help("token lifetime, in minutes (at most a year)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .help("produce prolix output"),
        )
        .arg(
            Arg::new("SUBJECT")
                .required(true)
                .value_parser(value_parser!(String))
                .index(1)
                .help("the token's subject"),
        )
}

fn main() -> Result<()> {
    let matches = make_command().get_matches();

    // Log to stderr; stdout is reserved for the token.
    tracing::subscriber::set_global_default(
        Registry::default()
            .with(LevelFilter::from_level(if matches.get_flag("verbose") {
                Level::DEBUG
            } else {
                Level::INFO
            }))
            .with(
                fmt::Layer::default()
                    .compact()
                    .without_time()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            ),
    )
    .context(SubscriberSnafu)?;

    let path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_default();
    let cfg: Configuration = match fs::read_to_string(&path) {
        Ok(text) => toml::from_str(&text).context(ConfigSnafu)?,
        Err(err) => return Err(BadConfigSnafu { path }.into_error(err)),
    };

    let (keyid, signing_key) = cfg.signing_keys.current().context(KeySnafu)?;
    debug!("Signing with {keyid}; issuer is {}.", cfg.token_issuer);

    let token = mint_token(
        matches
            .get_one::<String>("SUBJECT")
            .map(String::as_str)
            .unwrap_or_default(),
        matches.get_one::<Email>("email"),
        &keyid,
        &signing_key,
        &cfg.token_issuer,
        &Duration::minutes(matches.get_one::<i64>("lifetime").copied().unwrap_or(60)),
    )
    .context(MintSnafu)?;

    println!("{token}");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lifetimes() {
        let lifetime = |arg: &str| {
            make_command()
                .try_get_matches_from(["contacts-token", "-c", "contactsd.toml", "-l", arg, "sub"])
                .map(|matches| matches.get_one::<i64>("lifetime").copied())
        };
        assert_eq!(lifetime("60").unwrap(), Some(60));
        assert_eq!(lifetime("525600").unwrap(), Some(MAX_LIFETIME));
        assert!(lifetime("0").is_err());
        assert!(lifetime("525601").is_err());
        // Large enough to overflow `Duration::minutes`
        assert!(lifetime("153722867280912931").is_err());

        let defaults = make_command()
            .try_get_matches_from(["contacts-token", "-c", "contactsd.toml", "sub"])
            .unwrap();
        assert_eq!(defaults.get_one::<i64>("lifetime").copied(), Some(60));
    }
}
