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

//! # linkback-send
//!
//! The sending daemon: listens on a Unix stream socket for batches of mentions to dispatch.
//!
//! The intended customer is a blogging engine or static site generator: every time a post is
//! (re)published, the publish step connects to the socket & hands over the post's URL together
//! with the targets it used to link to & the targets it links to now; this daemon reconciles the
//! two (everything ever mentioned gets notified, so dropped targets can clean up after us) &
//! reports per-source results.
//!
//! The wire format is one JSON object per line, in each direction:
//!
//! ```text
//! -> {"mentions":[{"source":"https://me.example/post",
//!                  "past_targets":["https://old.example/"],
//!                  "current_targets":["https://new.example/"]}]}
//! <- {"statuses":[{"source":"https://me.example/post","error":""}],"error":""}
//! ```
//!
//! A connection may be reused for any number of request/response exchanges. A malformed line
//! earns an envelope-level `error` & the connection stays up.
//!
//! Exit status: 0 on a clean shutdown, 2 for configuration errors, 1 for anything else.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{crate_version, value_parser, Arg, ArgAction, Command};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    signal::unix::{signal, SignalKind},
};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};
use url::Url;

use linkback::{
    sender::{ListPersister, Sender},
    DEFAULT_USER_AGENT,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     application Error type                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind {pth:?}: {source}"))]
    Bind {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to create the webmention sender: {source}"))]
    MakeSender { source: linkback::sender::Error },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         wire format                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
struct Request {
    mentions: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    source: Url,
    #[serde(default)]
    past_targets: Vec<Url>,
    #[serde(default)]
    current_targets: Vec<Url>,
}

#[derive(Debug, Serialize)]
struct Response {
    statuses: Vec<SourceStatus>,
    /// Envelope-level failure (e.g. the request couldn't be parsed); empty on success
    error: String,
}

#[derive(Debug, Serialize)]
struct SourceStatus {
    source: Url,
    /// Per-source failure; empty on success
    error: String,
}

impl Response {
    fn failed(error: impl Into<String>) -> Response {
        Response {
            statuses: Vec::new(),
            error: error.into(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       request handling                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn handle_request(sender: &Sender, line: &str) -> Response {
    if line.trim().is_empty() {
        return Response::failed("empty request: nothing to send");
    }
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => return Response::failed(format!("invalid message: {err}")),
    };
    if request.mentions.is_empty() {
        return Response::failed("empty request: nothing to send");
    }

    let mut statuses = Vec::new();
    for entry in request.mentions {
        // The caller ships this source's past targets in the request itself; that list *is* the
        // persistent store, as far as this daemon is concerned.
        let persister = ListPersister(entry.past_targets);
        let error = match sender
            .update(&persister, &entry.source, &entry.current_targets)
            .await
        {
            Ok(()) => String::new(),
            Err(err) => err.to_string(),
        };
        statuses.push(SourceStatus {
            source: entry.source,
            error,
        });
    }
    Response {
        statuses,
        error: String::new(),
    }
}

async fn handle_connection(sender: Arc<Sender>, stream: UnixStream) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let rsp = handle_request(&sender, &line).await;
                let mut buf = match serde_json::to_vec(&rsp) {
                    Ok(buf) => buf,
                    Err(err) => {
                        // Can't happen for these types, but dropping the connection beats lying.
                        error!("cannot serialize response: {err}");
                        return;
                    }
                };
                buf.push(b'\n');
                if write.write_all(&buf).await.is_err() {
                    return; // peer went away
                }
            }
            Ok(None) => return, // EOF
            Err(err) => {
                debug!("connection closed: {err}");
                return;
            }
        }
    }
}

async fn serve(socket: PathBuf, user_agent: String) -> Result<()> {
    let sender = Arc::new(Sender::with_user_agent(user_agent).context(MakeSenderSnafu)?);

    // A stale socket from an unclean shutdown would make bind() fail; clear it.
    if socket.exists() {
        let _ = std::fs::remove_file(&socket);
    }
    let listener = UnixListener::bind(&socket).context(BindSnafu { pth: socket.clone() })?;
    info!("listening for mention batches on {:?}", socket);

    let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    loop {
        tokio::select! {
            conn = listener.accept() => match conn {
                Ok((stream, _addr)) => {
                    let sender = sender.clone();
                    tokio::spawn(handle_connection(sender, stream));
                }
                Err(err) => error!("accept failed: {err}"),
            },
            _ = sigint.recv() => {
                info!("SIGINT received; shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
                break;
            }
        }
    }

    drop(listener);
    let _ = std::fs::remove_file(&socket);
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct CliOpts {
    pub socket: PathBuf,
    pub user_agent: String,
    pub plain: bool,
    pub level: Level,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            socket: matches.get_one::<PathBuf>("socket").cloned().unwrap(/* defaulted */),
            user_agent: matches
                .get_one::<String>("user-agent")
                .cloned()
                .unwrap_or_else(|| {
                    format!("{} linkback-send/{}", DEFAULT_USER_AGENT, crate_version!())
                }),
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
    configure_logging(&opts)?;
    info!("linkback-send {} starting", crate_version!());
    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(opts.socket, opts.user_agent))
}

fn main() -> ExitCode {
    let opts = CliOpts::new(
        Command::new("linkback-send")
            .version(crate_version!())
            .about("Send webmentions on command")
            .long_about(
                "linkback-send listens on a Unix stream socket for line-delimited JSON \
                 batches of mentions & dispatches a webmention for each (source, target) \
                 pair, past & present.",
            )
            .arg(
                Arg::new("socket")
                    .short('s')
                    .long("socket")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .default_value("/tmp/linkback-send.socket")
                    .env("LINKBACK_SEND_SOCKET")
                    .help("path at which to create the listening socket"),
            )
            .arg(
                Arg::new("user-agent")
                    .short('U')
                    .long("user-agent")
                    .num_args(1)
                    .env("LINKBACK_SEND_USER_AGENT")
                    .help("User-Agent to present to targets"),
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
            eprintln!("{err}");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn malformed_requests() {
        let sender = Sender::new().unwrap();
        let rsp = handle_request(&sender, "").await;
        assert!(!rsp.error.is_empty());
        assert!(rsp.statuses.is_empty());

        let rsp = handle_request(&sender, "this is not json").await;
        assert!(rsp.error.starts_with("invalid message"));

        let rsp = handle_request(&sender, r#"{"mentions":[]}"#).await;
        assert!(!rsp.error.is_empty());
    }

    #[tokio::test]
    async fn mentions_dispatched_with_per_source_status() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/ok"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Link", "</wm>; rel=webmention"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/wm"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        // This target exists but advertises nothing, so the mention must fail.
        Mock::given(method("HEAD"))
            .and(path("/mute"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mute"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<p>nothing here</p>", "text/html"),
            )
            .mount(&server)
            .await;

        let sender = Sender::new().unwrap();
        let line = format!(
            r#"{{"mentions":[{{"source":"http://me.example/post","current_targets":["{0}/ok"]}},{{"source":"http://me.example/other","current_targets":["{0}/mute"]}}]}}"#,
            server.uri()
        );
        let rsp = handle_request(&sender, &line).await;
        assert!(rsp.error.is_empty());
        assert_eq!(2, rsp.statuses.len());
        assert!(rsp.statuses[0].error.is_empty());
        assert!(rsp.statuses[1].error.contains("no webmention endpoint"));
    }
}
