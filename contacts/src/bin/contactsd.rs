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

//! # contactsd
//!
//! The contacts daemon: read configuration, set up logging & telemetry, and serve the contacts
//! API until asked to stop. `SIGHUP` re-reads the configuration file (and rebuilds the store
//! client); `SIGTERM` shuts the server down gracefully.

use std::{
    env,
    fmt::Display,
    future::IntoFuture,
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use axum::{Router, extract::MatchedPath, routing::get};
use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use http::{HeaderName, HeaderValue};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use serde::Deserialize;
use snafu::{IntoError, prelude::*};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::Notify,
};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{Layer, Registry, filter::EnvFilter, fmt, layer::SubscriberExt};
use url::Url;

use contacts::{
    api::make_router as make_contacts_router,
    contacts::Contacts,
    cosmos::{self, Settings as CosmosSettings},
    dynamodb::{self, Location as DynamoLocation},
    endpoint::ContactsEndpoint,
    memory,
    metrics::Instruments,
    signing_keys::SigningKeys,
    storage::{Backend as StorageBackend, CollectionRef},
    store::ContactStore,
    util::Credentials,
};

/// The contactsd application error type
///
/// Note that I do not derive [Debug] for this error: `main()` returns `Result<(), Error>`, and
/// should the `Err` variant be returned the Rust runtime will print it to stderr via `Debug`. The
/// derived implementation is not very readable, so it's implemented by hand below, in terms of
/// [Display].
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to set up the Cosmos DB client: {source}"))]
    Cosmos { source: cosmos::Error },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to connect to DynamoDB: {source}"))]
    Dynamo { source: dynamodb::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("While building the OLTP exporter, {source}"))]
    OltpExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("The server exited unexpectedly: {source}"))]
    Serve { source: std::io::Error },
    #[snafu(display("Failed to install a handler for {signal}: {source}"))]
    Signal {
        signal: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

static DEFAULT_CONFIG: &str = "/etc/contacts.toml";

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
        })
    }
}

/// Where the contacts live
///
/// Chosen at startup (and again on each `SIGHUP`); the rest of the service only ever sees a
/// [StorageBackend].
// Nb that we can only deserialize (i.e. not serialize) due to the presence of secrets in the
// struct
#[derive(Clone, Debug, Default, Deserialize)]
pub enum StorageConfig {
    /// Azure Cosmos DB, over its REST interface
    Cosmos(CosmosSettings),
    /// Use DyanmoDB (or Scylla over the Alternator interface)
    Dynamo {
        /// AWS credentials: key ID & secret key; you'll pretty-much always need to specify these
        /// when running against DDB, but a local endpoint may well be open
        credentials: Option<Credentials>,
        /// Either an AWS region, or one or more endpoint URLs
        location: DynamoLocation,
    },
    /// Keep contacts in process memory; they're lost on restart (and on `SIGHUP`)
    #[default]
    Memory,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtelExportConfig {
    /// Endpoint that will receive metric data in OTLP format
    endpoint: Url,
    /// Interval at which metrics will be pushed to `endpoint`; defaults to 60 seconds
    interval: Option<std::time::Duration>,
}

/// contactsd configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// OTLP export target; None means don't export
    #[serde(rename = "otlp-export")]
    otlp_export: Option<OtelExportConfig>,
    /// Local address at which to listen; specify as "address:port"
    #[serde(rename = "public-address")]
    public_address: SocketAddr,
    /// Bearer tokens must have been issued by this party
    #[serde(rename = "token-issuer")]
    token_issuer: String,
    #[serde(rename = "storage-config")]
    storage_config: StorageConfig,
    /// The database & collection holding our contacts
    collection: CollectionRef,
    #[serde(rename = "signing-keys")]
    signing_keys: SigningKeys,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            otlp_export: None,
            public_address: SocketAddr::from(([0, 0, 0, 0], 20779)),
            token_issuer: "localhost".to_owned(),
            storage_config: StorageConfig::default(),
            collection: CollectionRef::default(),
            signing_keys: SigningKeys::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the contactsd configuration file
///
/// If no file was named, look for [DEFAULT_CONFIG], falling back to the defaults should it not
/// exist. A file that was named explicitly *must* exist.
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from(DEFAULT_CONFIG), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(cfg) => match cfg {
                Configuration::V1(cfg) => Ok(cfg),
            },
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

/// Configure contactsd logging
///
/// We always log to stdout (we expect to be run in the foreground, inside a container or under a
/// supervisor); `--plain` selects human-readable rather than JSON output.
///
/// The caller is responsible for installing the results (which can only be done once).
fn configure_logging(
    logopts: &LogOpts,
) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers *of different types*; `Box<dyn Layer<S> + Send + Sync>`
    // implements `Layer`, so:
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter))
}

/// Count requests by method & route
///
/// The metric is named for the route *template* (e.g. `http.get.contacts.id`), not the request
/// path, so that contact IDs don't each mint a new instrument. OTel names must be ASCII and belong
/// to the alphanumeric characters, '_', '.', '-' and '/'; anything else is dropped and '/' becomes
/// '.'.
async fn otel_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let stem: String = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str())
        .unwrap_or("/unmatched")
        .chars()
        .filter_map(|c| match c {
            '/' => Some('.'),
            '-' | '.' | '_' => Some(c),
            c if c.is_ascii_alphanumeric() => Some(c),
            _ => None,
        })
        .collect();

    let name = format!("http.{}{}", request.method().as_str().to_lowercase(), stem);
    global::meter("contacts")
        .u64_counter(name)
        .build()
        .add(1, &[]);
    next.run(request).await
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Counter for generating request IDs; a u64 carries a lot less information than a UUID, but it's
/// enough, more easily read, and a rough gauge of how long the server's been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .pipe(HeaderValue::from)
            .pipe(RequestId::new)
            .pipe(Some)
    }
}

/// Make the [Router] that will be accessible to the world
fn make_world_router(state: Arc<Contacts>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .merge(make_contacts_router(state.clone()))
        // Incoming requests need to hit the `SetRequestIdLayer` *first*, so it's the last (outer)
        // layer applied:
        //
        //                 requests
        //                    |
        //                    v
        // +---------  SetRequestIdLayer      ---------+
        // | +-------      OTEL layer         -------+ |
        // | | +-----      TraceLayer         -----+ | |
        // | | | +--- PropagateRequestIdLayer ---+ | | |
        // | | | |                               | | | |
        // | | | |          handler              | | | |
        // | | | |                               | | | |
        // | | | +--- PropagateRequestIdLayer ---+ | | |
        // | | +-----      TraceLayer         -----+ | |
        // | +-------      OTEL Layer         -------+ |
        // +---------   SetRequestIdLayer     ---------+
        //                    |
        //                    v
        //                responses
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(axum::middleware::from_fn(otel_middleware))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
        .with_state(state)
}

pub async fn select_storage(
    config: &StorageConfig,
) -> Result<Arc<dyn StorageBackend + Send + Sync>> {
    match config {
        StorageConfig::Cosmos(settings) => {
            Ok(Arc::new(cosmos::Client::new(settings).context(CosmosSnafu)?))
        }
        StorageConfig::Dynamo {
            credentials,
            location,
        } => Ok(Arc::new(
            dynamodb::Client::new(location, credentials)
                .await
                .context(DynamoSnafu)?,
        )),
        StorageConfig::Memory => {
            warn!("Keeping contacts in memory; they will not survive a restart.");
            Ok(Arc::new(memory::Backend::default()))
        }
    }
}

/// Serve contacts API requests
#[tracing::instrument(skip(opts, cfg))]
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::error::Error + std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu { signal: "SIGHUP" })?;
    let mut sigterm =
        signal(SignalKind::terminate()).context(SignalSnafu { signal: "SIGTERM" })?;

    init_telemetry(cfg.otlp_export.as_ref())?;

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build our store client each pass, in case configuration values have changed:
        let storage = select_storage(&cfg.storage_config).await?;
        debug!("Serving contacts from {}.", cfg.collection);

        let state = Arc::new(Contacts {
            endpoint: ContactsEndpoint::new(ContactStore::new(storage, cfg.collection.clone())),
            instruments: Instruments::new("contacts"),
            signing_keys: cfg.signing_keys.clone(),
            token_issuer: cfg.token_issuer.clone(),
        });

        let nfy = Arc::new(Notify::new());

        let world_server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_world_router(state),
        )
        .with_graceful_shutdown(shutdown_signal(nfy.clone()));

        info!("Listening on {}.", cfg.public_address);

        let mut world_server = world_server.into_future();

        tokio::select! {
            // The server *should* never shut down on its own.
            res = &mut world_server => {
                error!("The server exited without being asked to; shutting-down.");
                return res.context(ServeSnafu);
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                // Signal our server to shut-down, & wait for it to complete.
                nfy.notify_one();
                log_on_err(world_server.await);
                // Failure to parse at this point isn't fatal; keep the last known-good
                // configuration.
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("{err}; continuing with the prior configuration.");
                        cfg
                    }
                };
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                nfy.notify_one();
                log_on_err(world_server.await);
                break;
            }
        }; // End tokio::select!.
    } // End loop.

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Initialize telemetry
///
/// <div class="warning">
///
/// This method must be invoked from inside the Tokio runtime, but before any instruments are
/// accessed.
///
/// </div>
///
/// Set up the global meter provider, attributing everything to the `contacts` service. If an OTLP
/// collector is configured, metrics are pushed to it periodically over HTTP; otherwise they're
/// recorded & dropped.
fn init_telemetry(collector_config: Option<&OtelExportConfig>) -> Result<()> {
    let mut provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder().with_resource(
        opentelemetry_sdk::Resource::builder_empty()
            .with_attribute(KeyValue::new("service.name", "contacts"))
            .build(),
    );

    if let Some(config) = collector_config {
        let otlp_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()
            .context(OltpExporterSnafu)?;

        let mut reader = opentelemetry_sdk::metrics::PeriodicReader::builder(otlp_exporter);
        if let Some(interval) = config.interval {
            reader = reader.with_interval(interval);
        }
        provider = provider.with_reader(reader.build());
    }

    global::set_meter_provider(provider.build());
    Ok(())
}

async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    // Take care to configure logging *before* we call `serve()` since it's instrumented. Failure to
    // parse at this point is fatal; in `serve()`, we fall back to the last "known-good"
    // configuration & keep going.
    fn go_async1(
        opts: &CliOpts,
    ) -> Result<(ConfigV1, Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
        let cfg = parse_config(&opts.cfg)?;
        let (formatter, filter) = configure_logging(&opts.log_opts)?;
        Ok((cfg, formatter, filter))
    }

    match go_async1(&opts) {
        Ok((cfg, formatter, filter)) => {
            // Nb. this can only be invoked once!
            tracing::subscriber::set_global_default(
                Registry::default().with(formatter).with(filter),
            )
            .context(SubscriberSnafu)?;
            drop(bootstrap_logging_guard);

            info!("contacts version {} starting.", crate_version!());

            serve(opts, cfg).await
        }
        Err(err) => {
            error!("While configuring logging: {err:?}");
            Err(err)
        }
    }
}

fn main() -> Result<()> {
    // Most of contactsd's configuration is read from file; the few command-line options govern
    // where to find that file & how to log. They all have corresponding environment variables for
    // convenience when running in a container.
    let opts = CliOpts::new(
        Command::new("contactsd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("A small CRUD service for contact records")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("CONTACTS_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("CONTACTS_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("CONTACTS_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("CONTACTS_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("CONTACTS_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // A number of things can go wrong before we've parsed our configuration file and configured
    // logging for the process, so set up a *temporary* logger to stderr via `set_default()`.
    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}
