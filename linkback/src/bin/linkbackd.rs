// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of linkback.
//
// linkback is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// linkback is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with linkback.  If not,
// see <http://www.gnu.org/licenses/>.

//! # linkbackd
//!
//! The receiving daemon: hosts the [linkback] webmention receiver behind an HTTP server.
//!
//! [linkback]: https://docs.rs/linkback
//!
//! Point your target pages' `<link rel="webmention">` (or a `Link` header) at wherever this
//! listens, and every verified mention shows up in the log. Deployments wanting more than a log
//! line embed the library & register their own notifiers; this daemon is the
//! batteries-included path.
//!
//! Configuration is a small versioned TOML file; the handful of command-line options govern
//! where to find it & how to log. Run it in the foreground (under systemd or in a container)
//! and it will drain its queue on SIGINT/SIGTERM, within the configured timeout.
//!
//! Exit status: 0 on a clean shutdown, 2 for configuration errors, 1 for anything else.

use std::{
    future::IntoFuture, net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc,
    time::Duration,
};

use clap::{crate_version, value_parser, Arg, ArgAction, Command};
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};
use url::Url;

use linkback::{
    notify::LogNotifier,
    receiver::{self, make_router},
    DEFAULT_USER_AGENT,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     application Error type                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

// Nb. no derived Debug: main() reports errors itself & chooses the exit code, and the derived
// Debug output is unreadable for operators anyway.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind {address}: {source}"))]
    Bind {
        address: SocketAddr,
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
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("The HTTP server failed: {source}"))]
    Serve { source: std::io::Error },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

impl Error {
    /// Configuration errors earn a distinct exit status
    fn configuration(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. } | Error::ConfigParse { .. }
        )
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn default_listen_address() -> SocketAddr {
    "0.0.0.0:8080".parse::<SocketAddr>().unwrap(/* known good */)
}

fn default_endpoint() -> String {
    "/webmention".to_string()
}

fn default_queue_size() -> usize {
    100
}

fn default_workers() -> usize {
    1
}

fn default_shutdown_timeout() -> u64 {
    120
}

fn default_user_agent() -> String {
    format!("{} linkbackd/{}", DEFAULT_USER_AGENT, crate_version!())
}

/// linkbackd configuration, version one
#[derive(Clone, Debug, Deserialize)]
struct ConfigV1 {
    /// Address to which the listening socket is bound; "address:port"
    #[serde(rename = "listen-address", default = "default_listen_address")]
    listen_address: SocketAddr,
    /// Path at which to accept webmentions
    #[serde(rename = "endpoint", default = "default_endpoint")]
    endpoint: String,
    /// Mentions are accepted only for targets whose origin (scheme, host & port) matches one of
    /// these URLs-- i.e. the sites this instance speaks for. Empty means reject everything.
    #[serde(rename = "accept-targets", default)]
    accept_targets: Vec<Url>,
    /// Mentions awaiting verification beyond this bound are shed with `429`
    #[serde(rename = "queue-size", default = "default_queue_size")]
    queue_size: usize,
    /// Number of verification workers
    #[serde(rename = "workers", default = "default_workers")]
    workers: usize,
    /// Seconds to allow for draining the queue on shutdown
    #[serde(rename = "shutdown-timeout", default = "default_shutdown_timeout")]
    shutdown_timeout: u64,
    /// The User-Agent presented when fetching mention sources
    #[serde(rename = "user-agent", default = "default_user_agent")]
    user_agent: String,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            listen_address: default_listen_address(),
            endpoint: default_endpoint(),
            accept_targets: Vec::new(),
            queue_size: default_queue_size(),
            workers: default_workers(),
            shutdown_timeout: default_shutdown_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")]
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the linkbackd configuration file
///
/// If no path was given & nothing lives at the default location, fall back to the built-in
/// defaults (which reject every mention-- you'll want `accept-targets`).
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from("/etc/linkbackd.toml"), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
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
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn shutdown_signal(nfy: Arc<Notify>) {
    nfy.notified().await
}

async fn serve(cfg: ConfigV1) -> Result<()> {
    let origins: Vec<url::Origin> = cfg.accept_targets.iter().map(|u| u.origin()).collect();
    if origins.is_empty() {
        warn!("accept-targets is empty; every webmention will be rejected");
    }

    let receiver = Arc::new(
        receiver::Builder::new()
            .accepts(move |_source, target| origins.iter().any(|origin| *origin == target.origin()))
            .queue_size(cfg.queue_size)
            .user_agent(cfg.user_agent.clone())
            .notifier(LogNotifier)
            .build(),
    );

    let mut workers = Vec::new();
    for _ in 0..cfg.workers.max(1) {
        let receiver = receiver.clone();
        workers.push(tokio::spawn(async move {
            receiver.process_mentions().await
        }));
    }

    let router = make_router(&cfg.endpoint, receiver.clone()).layer(TraceLayer::new_for_http());
    let listener = TcpListener::bind(cfg.listen_address)
        .await
        .context(BindSnafu {
            address: cfg.listen_address,
        })?;
    info!(
        "listening for webmentions on http://{}{}",
        cfg.listen_address, cfg.endpoint
    );

    let nfy = Arc::new(Notify::new());
    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal(nfy.clone()));
    let mut server = std::pin::pin!(server.into_future());

    let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    tokio::select! {
        res = &mut server => {
            // The server should only ever come down in response to a signal; if it exits on its
            // own, something is wrong & the error is all we have to go on.
            res.context(ServeSnafu)?;
        }
        _ = sigint.recv() => {
            info!("SIGINT received; shutting down");
            nfy.notify_waiters();
            if let Err(err) = server.await {
                error!("while shutting down the HTTP server: {err}");
            }
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received; shutting down");
            nfy.notify_waiters();
            if let Err(err) = server.await {
                error!("while shutting down the HTTP server: {err}");
            }
        }
    }

    // The server is down, so nothing new can arrive; drain what's queued.
    receiver
        .shutdown(Duration::from_secs(cfg.shutdown_timeout))
        .await;
    for worker in workers {
        if let Err(err) = worker.await {
            error!("a verification worker panicked: {err}");
        }
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Options read from the command line (or the environment)
struct CliOpts {
    pub cfg: Option<PathBuf>,
    pub plain: bool,
    pub level: Level,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            cfg: matches.get_one::<PathBuf>("config").cloned(),
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

fn configure_logging(opts: &CliOpts) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(opts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;
    // `compact()` & `json()` produce layers of different types; boxing erases that.
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if opts.plain {
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

fn run(opts: CliOpts) -> Result<()> {
    // Parse configuration *before* taking any other action: a bad config file should produce a
    // complaint on stderr & exit status 2, nothing more.
    let cfg = parse_config(&opts.cfg)?;
    configure_logging(&opts)?;
    info!("linkbackd {} starting", crate_version!());
    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(cfg))
}

fn main() -> ExitCode {
    let opts = CliOpts::new(
        Command::new("linkbackd")
            .version(crate_version!())
            .about("Receive webmentions")
            .long_about(
                "linkbackd listens for webmentions, verifies them against their source \
                 documents, and reports each verified mention through structured logging.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("LINKBACK_CONFIG")
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
                    .env("LINKBACK_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("LINKBACK_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("LINKBACK_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("LINKBACK_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    );

    match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Logging may not be configured yet; stderr always works.
            eprintln!("{err}");
            if err.configuration() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn config_round_trip() {
        let text = r#"
version = "1"
listen-address = "127.0.0.1:8081"
endpoint = "/api/webmention"
accept-targets = ["https://example.com"]
queue-size = 32
workers = 2
shutdown-timeout = 30
user-agent = "Webmention (example.com)"
"#;
        let Configuration::V1(cfg) = toml::from_str::<Configuration>(text).unwrap();
        assert_eq!("127.0.0.1:8081".parse::<SocketAddr>().unwrap(), cfg.listen_address);
        assert_eq!("/api/webmention", cfg.endpoint);
        assert_eq!(1, cfg.accept_targets.len());
        assert_eq!(32, cfg.queue_size);
        assert_eq!(2, cfg.workers);
        assert_eq!(30, cfg.shutdown_timeout);
    }

    #[test]
    fn config_defaults() {
        // Everything but the version tag may be omitted
        let Configuration::V1(cfg) = toml::from_str::<Configuration>("version = \"1\"").unwrap();
        assert_eq!(default_listen_address(), cfg.listen_address);
        assert_eq!("/webmention", cfg.endpoint);
        assert!(cfg.accept_targets.is_empty());
        assert_eq!(100, cfg.queue_size);
        assert_eq!(1, cfg.workers);
    }
}
