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

//! # Sending webmentions
//!
//! The outbound half of the protocol: given a source document & the targets it links to, notify
//! each target's advertised endpoint with an `application/x-www-form-urlencoded` POST of
//! `source` & `target`.
//!
//! The interesting wrinkle is *updates*. When a source document changes, the polite thing to do
//! is to re-notify every target it has ever mentioned: targets still linked learn nothing new
//! (processing is idempotent on the receiving side), targets no longer linked get a chance to
//! drop whatever they were displaying. [Sender::update] implements that reconciliation over a
//! [Persister], which is whatever the embedder uses to remember past targets. Deleting a source
//! altogether is the same dance: serve `410 Gone` at the source URL (with a tombstone, ideally)
//! and call [Sender::update] with an empty current-target list.

use async_trait::async_trait;
use http::{
    header::{LOCATION, USER_AGENT},
    StatusCode,
};
use itertools::Itertools;
use snafu::{Backtrace, ResultExt, Snafu};
use tap::Pipe;
use tracing::{debug, warn};
use url::Url;

use crate::{discovery, DEFAULT_USER_AGENT};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create an HTTP client: {source}"))]
    Client {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Endpoint discovery failed for {target}: {source}"))]
    Discovery {
        target: Url,
        source: discovery::Error,
    },
    #[snafu(display("{failed} of {total} mentions failed: {summary}"))]
    Partial {
        failed: usize,
        total: usize,
        summary: String,
        failures: Vec<(Url, String)>,
    },
    #[snafu(display("Failed to load past targets: {source}"))]
    Persister {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("{endpoint} answered our mention with {status}: {body}"))]
    SendFailed {
        endpoint: Url,
        status: StatusCode,
        body: String,
    },
    #[snafu(display("Failed to POST to {endpoint}: {source}"))]
    Transport {
        endpoint: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Wrap an arbitrary failure from an embedder-supplied [Persister]
    pub fn persister(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Persister {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Persister                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The sender's memory of which targets a source has mentioned before
///
/// linkback does not mandate a storage layout; it only ever *reads* past targets, and only in
/// [Sender::update]. Recording what was sent (so it can be recalled here next time) is the
/// embedder's business. The returned list's order is preserved in the re-notification pass, so
/// implementations should return a stable order if they care about determinism.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn past_targets(&self, source: &Url) -> Result<Vec<Url>>;
}

/// A [Persister] for sources with no send history
pub struct NoPersister;

#[async_trait]
impl Persister for NoPersister {
    async fn past_targets(&self, _source: &Url) -> Result<Vec<Url>> {
        Ok(Vec::new())
    }
}

/// A [Persister] that holds its target list in memory
///
/// This is what the sender daemon uses: callers there ship the past-target list inside each
/// request, so "storage" is just that list.
pub struct ListPersister(pub Vec<Url>);

#[async_trait]
impl Persister for ListPersister {
    async fn past_targets(&self, _source: &Url) -> Result<Vec<Url>> {
        Ok(self.0.clone())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Outcome                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What a receiver said about one mention
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// `200`: the request was processed synchronously
    Processed,
    /// `201`: the request will be processed asynchronously; if the receiver named a status page
    /// in its `Location` header, it's here
    Queued { status_page: Option<Url> },
    /// `202`: the request will be processed asynchronously & there is no way to check on it
    Accepted,
    /// Any other `2xx`: success, nothing further known
    Success { status: StatusCode },
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Sender                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The sending side of the protocol
///
/// Holds one [reqwest::Client] (configured to chase up to ten redirects), reused across every
/// discovery & submission this instance performs.
pub struct Sender {
    client: reqwest::Client,
    user_agent: String,
}

impl Sender {
    pub fn new() -> Result<Sender> {
        Sender::with_user_agent(DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(user_agent: impl Into<String>) -> Result<Sender> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context(ClientSnafu)?
            .pipe(|client| Sender {
                client,
                user_agent: user_agent.into(),
            })
            .pipe(Ok)
    }

    /// Discover `target`'s webmention endpoint; see [discovery::discover]
    pub async fn discover_endpoint(&self, target: &Url) -> discovery::Result<Url> {
        discovery::discover(&self.client, &self.user_agent, target).await
    }

    /// Notify `target` that `source` links to it
    ///
    /// Discovers the endpoint afresh (it may have moved since last time), then POSTs. Any query
    /// string on the endpoint stays on the request line; the body carries exactly `source` &
    /// `target`.
    pub async fn mention(&self, source: &Url, target: &Url) -> Result<Outcome> {
        let endpoint = self
            .discover_endpoint(target)
            .await
            .context(DiscoverySnafu {
                target: target.clone(),
            })?;

        let rsp = self
            .client
            .post(endpoint.clone())
            .header(USER_AGENT, self.user_agent.as_str())
            .form(&[("source", source.as_str()), ("target", target.as_str())])
            .send()
            .await
            .context(TransportSnafu {
                endpoint: endpoint.clone(),
            })?;

        let status = rsp.status();
        match status.as_u16() {
            200 => {
                let _ = rsp.bytes().await;
                Ok(Outcome::Processed)
            }
            201 => {
                let status_page = rsp
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|location| rsp.url().join(location).ok());
                let _ = rsp.bytes().await;
                Ok(Outcome::Queued { status_page })
            }
            202 => {
                let _ = rsp.bytes().await;
                Ok(Outcome::Accepted)
            }
            203..=299 => {
                let _ = rsp.bytes().await;
                Ok(Outcome::Success { status })
            }
            _ => {
                // Keep enough of the body to be useful in a log line, no more.
                let body: String = rsp
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(1024)
                    .collect();
                SendFailedSnafu {
                    endpoint,
                    status,
                    body,
                }
                .fail()
            }
        }
    }

    /// Mention each of `targets` in turn
    ///
    /// A failure against one target doesn't stop the rest; the per-target failures are gathered
    /// into a single [Partial](Error::Partial) error.
    pub async fn mention_many(&self, source: &Url, targets: &[Url]) -> Result<()> {
        let mut failures = Vec::new();
        for target in targets {
            match self.mention(source, target).await {
                Ok(outcome) => {
                    debug!(source = %source, target = %target, outcome = ?outcome, "sent webmention");
                }
                Err(err) => {
                    warn!(source = %source, target = %target, "failed to send webmention: {err}");
                    failures.push((target.clone(), err.to_string()));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            let summary = failures
                .iter()
                .map(|(target, err)| format!("{target}: {err}"))
                .join("; ");
            PartialSnafu {
                failed: failures.len(),
                total: targets.len(),
                summary,
                failures,
            }
            .fail()
        }
    }

    /// `source` changed; re-send mentions to everything it mentions now *or ever has*
    ///
    /// Targets that dropped out of the document still get notified-- that's how they learn to
    /// update or discard what they're displaying. To propagate a deletion, serve `410 Gone` at
    /// `source` (a tombstone body is a nice touch) & call this with an empty `current`.
    pub async fn update(
        &self,
        persister: &dyn Persister,
        source: &Url,
        current: &[Url],
    ) -> Result<()> {
        let past = persister.past_targets(source).await?;
        let union = unioned(&past, current);
        self.mention_many(source, &union).await
    }
}

/// Past targets in stored order, then current targets not already present
fn unioned(past: &[Url], current: &[Url]) -> Vec<Url> {
    let mut union: Vec<Url> = Vec::new();
    for target in past.iter().chain(current.iter()) {
        if !union.contains(target) {
            union.push(target.clone());
        }
    }
    union
}
