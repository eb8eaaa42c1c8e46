// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of starling.
//
// starling is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// starling is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with starling.  If not,
// see <http://www.gnu.org/licenses/>.

//! # starlingd
//!
//! Home timelines, materialised.
//!
//! # Introduction
//!
//! starlingd is the whole service in one process: the HTTP surface (users, tweets, follows,
//! timeline reads) & the three pipeline consumers (materialiser, applier, reconciler), sharing
//! one store pool, one cache client & one producer. Scale-out is a matter of running more
//! instances; the consumer groups split partitions among them.

use std::{
    env,
    fmt::Display,
    future::IntoFuture,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use axum::{http::HeaderValue, routing::get, Router};
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use http::HeaderName;
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
    task::JoinHandle,
};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};
use uuid::Uuid;

use starling::{
    apply::TimelineApplier,
    bus,
    events::{
        GROUP_FANOUT_CONSUMER, GROUP_FOLLOW_CONSUMER, GROUP_TWEET_CONSUMER, TOPIC_TIMELINE_FANOUT,
        TOPIC_TWEETS_CREATED, TOPIC_USER_FOLLOW,
    },
    fanout::TweetMaterialiser,
    postgres,
    reconcile::GraphReconciler,
    redis,
    starling::Starling,
    timelines::make_router as make_timeline_router,
    tweets::make_router as make_tweet_router,
    users::make_router as make_user_router,
};

/// The starling application error type
///
/// Note that I do not derive the [Debug] trait for this error. This is because `main()` returns
/// `Result<(), Error>`, & should the `Err` variant come back the Rust runtime uses the `Debug`
/// implementation to produce an error message on stderr. The derived implementation is not very
/// readable, so I forward it to [Display].
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to set up a consumer: {source}"))]
    Consumer { source: bus::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to connect to PostgreSQL: {source}"))]
    Postgres { source: postgres::Error },
    #[snafu(display("Failed to create the Kafka producer: {source}"))]
    Producer { source: bus::Error },
    #[snafu(display("Failed to connect to Redis: {source}"))]
    Redis { source: redis::Error },
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

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

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
    pub instance_id: Uuid,
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            instance_id: matches
                .get_one::<Uuid>("instance-id")
                .cloned()
                .unwrap_or(Uuid::new_v4()),
            log_opts: LogOpts::new(&matches),
            cfg: matches.get_one::<PathBuf>("config").cloned(),
        }
    }
}

/// starling configuration, version one
#[derive(Clone, Debug, Deserialize)]
struct ConfigV1 {
    /// Local address at which to listen for API requests; specify as "address:port"
    #[serde(rename = "listen-address")]
    listen_address: SocketAddr,
    /// PostgreSQL connection string; the `DB_URL` environment variable takes precedence
    #[serde(rename = "db-url")]
    db_url: String,
    /// Kafka bootstrap servers; the `KAFKA_BROKER` environment variable takes precedence
    #[serde(rename = "kafka-broker")]
    kafka_broker: String,
    /// Redis address (URL or "host:port"); the `REDIS_ADDR` environment variable takes
    /// precedence
    #[serde(rename = "redis-addr")]
    redis_addr: String,
    /// Cap on the length of each materialised timeline
    #[serde(rename = "max-timeline")]
    max_timeline: usize,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            listen_address: "0.0.0.0:8000".parse::<SocketAddr>().unwrap(/* known good */),
            db_url: "postgres://localhost:5432/starling".to_owned(),
            kafka_broker: "localhost:9092".to_owned(),
            redis_addr: "redis://localhost:6379".to_owned(),
            max_timeline: 1_000,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the starling configuration file & fold-in the environment
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/starling.toml").unwrap(/* known good */), true),
        |p| (p.clone(), false),
    );
    let mut cfg = match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }?;

    // These three have been environment variables since before there was a configuration file;
    // they win.
    if let Ok(url) = env::var("DB_URL") {
        cfg.db_url = url;
    }
    if let Ok(broker) = env::var("KAFKA_BROKER") {
        cfg.kafka_broker = broker;
    }
    if let Ok(addr) = env::var("REDIS_ADDR") {
        cfg.redis_addr = addr;
    }
    Ok(cfg)
}

/// Configure starling logging
///
/// Plain gets you a compact, human-readable format; the default is JSON/structured. Either way
/// we log to stdout (the usual case is a container) & `RUST_LOG` can override the level from
/// the command line.
fn configure_logging(logopts: &LogOpts) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `compact()` & `json()` produce `Layer` instances *of different types*; it is for this
    // reason that `Box<dyn Layer<S> + Send + Sync>` implements `Layer`:
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(std::io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stdout),
        )
    };

    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Counter for generating request IDs; a u64 gives me a lot less information than a UUID (the
/// traditional type for request IDs), but I judge it to be enough, as well as more easily
/// readable, and a useful gauge of how long the server's been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| RequestId::new(HeaderValue::from_str(&s).unwrap(/* known good */)))
            .pipe(Some)
    }
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

/// Make the [Router] that will be accessible to the world
fn make_world_router(state: Arc<Starling>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .merge(make_user_router(state.clone()))
        .merge(make_tweet_router(state.clone()))
        .merge(make_timeline_router(state))
        // We want incoming requests to hit the `SetRequestIdLayer` *first*, so it must be the
        // last/outer layer we apply:
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
}

/// Serve `starling`: the API & all three consumers
#[tracing::instrument(skip(opts, cfg), fields(instance_id = %opts.instance_id))]
async fn serve(opts: CliOpts, cfg: ConfigV1) -> Result<()> {
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

    let mut sigterm = signal(SignalKind::terminate()).unwrap(/* known good */);
    let mut sigint = signal(SignalKind::interrupt()).unwrap(/* known good */);

    // Shared clients: one store pool, one cache client, one producer, split between the HTTP
    // handlers & the consumers.
    let storage = Arc::new(postgres::Store::new(&cfg.db_url).await.context(PostgresSnafu)?);
    let cache = Arc::new(
        redis::Cache::new(&cfg.redis_addr, cfg.max_timeline)
            .await
            .context(RedisSnafu)?,
    );
    let bus_cfg = bus::Config::new(&cfg.kafka_broker);
    let sink = Arc::new(bus::Producer::new(&bus_cfg).context(ProducerSnafu)?);

    // The three consumer loops, each a long-lived task with its own shutdown handle. One
    // message at a time within each; the broker paces the pipeline.
    let mut consumers: Vec<(&str, Arc<Notify>, JoinHandle<StdResult<(), bus::Error>>)> =
        Vec::new();
    {
        let nfy = Arc::new(Notify::new());
        let task = tokio::spawn(bus::consume(
            bus::subscriber(&bus_cfg, GROUP_TWEET_CONSUMER, TOPIC_TWEETS_CREATED)
                .context(ConsumerSnafu)?,
            TweetMaterialiser::new(storage.clone(), sink.clone()),
            nfy.clone(),
        ));
        consumers.push(("tweet-materialiser", nfy, task));
    }
    {
        let nfy = Arc::new(Notify::new());
        let task = tokio::spawn(bus::consume(
            bus::subscriber(&bus_cfg, GROUP_FANOUT_CONSUMER, TOPIC_TIMELINE_FANOUT)
                .context(ConsumerSnafu)?,
            TimelineApplier::new(cache.clone()),
            nfy.clone(),
        ));
        consumers.push(("timeline-applier", nfy, task));
    }
    {
        let nfy = Arc::new(Notify::new());
        let task = tokio::spawn(bus::consume(
            bus::subscriber(&bus_cfg, GROUP_FOLLOW_CONSUMER, TOPIC_USER_FOLLOW)
                .context(ConsumerSnafu)?,
            GraphReconciler::new(storage.clone(), cache.clone()),
            nfy.clone(),
        ));
        consumers.push(("graph-reconciler", nfy, task));
    }

    let state = Arc::new(Starling {
        instance_id: opts.instance_id,
        storage,
        cache,
        sink,
    });

    let server_nfy = Arc::new(Notify::new());
    let server = axum::serve(
        TcpListener::bind(&cfg.listen_address).await.context(BindSnafu {
            addr: cfg.listen_address,
        })?,
        make_world_router(state),
    )
    .with_graceful_shutdown(shutdown_signal(server_nfy.clone()));

    info!("starling listening on {}.", cfg.listen_address);

    let mut server = std::pin::pin!(server.into_future());

    tokio::select! {
        // Intentionally not handled-- the server *should* never shut down on its own. That
        // said, if I don't poll it, it never serves.
        _ = &mut server => unimplemented!(),
        _ = sigterm.recv() => {
            info!("Received SIGTERM; terminating.");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT; terminating.");
        }
    };

    // Signal our axum server to shut down & wait for it to complete...
    server_nfy.notify_one();
    log_on_err(server.await);

    // then stop the consumers. Each returns the distinguished Cancelled value on a clean
    // shutdown; an in-flight message may be abandoned, which at-least-once delivery makes safe.
    for (name, nfy, _) in consumers.iter() {
        debug!("Signalling the {} to shut down.", name);
        nfy.notify_one();
    }
    for (name, _, task) in consumers {
        match tokio::time::timeout(std::time::Duration::from_secs(5), task).await {
            Ok(Ok(Err(err))) if err.is_cancelled() => {
                info!("The {} shut down cleanly.", name)
            }
            Ok(Ok(result)) => error!("The {} exited with {:?}.", name, result),
            Ok(Err(err)) => error!("Failed to join the {}: {:?}", name, err),
            Err(err) => error!("Timed-out waiting for the {}: {:?}", name, err),
        }
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn main() -> Result<()> {
    // Most of starlingd's configuration is read from file; the command-line options govern 1)
    // where to find the configuration file & 2) logging, which wants setting-up before the
    // configuration file is parsed. They all have corresponding environment variables for the
    // sake of convenience when running starling in a container.
    let opts = CliOpts::new(
        Command::new("starlingd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("Home timelines, materialised")
            .long_about(
                "`starlingd` serves the starling API & runs the fan-out pipeline: three \
                 log-driven consumers materialising tweets, follows & unfollows into per-user \
                 cached timelines.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("STARLING_CONFIG")
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
                    .env("STARLING_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("instance-id")
                    .short('I')
                    .long("instance-id")
                    .num_args(1)
                    .value_parser(value_parser!(Uuid))
                    .env("STARLING_INSTANCE_ID")
                    .help("Instance ID (only salient when running multiple instances)")
                    .long_help(
                        "Instance ID
A UUID identifying this starling instance. If not given, a random UUID will be used.",
                    ),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("STARLING_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("STARLING_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("STARLING_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    );

    configure_logging(&opts.log_opts)?;
    let cfg = parse_config(&opts.cfg)?;

    info!(
        "starling version {}, instance {} starting.",
        crate_version!(),
        opts.instance_id
    );

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(opts, cfg))
}
