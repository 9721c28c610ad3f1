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

//! # Receiving webmentions
//!
//! The receiving side splits into a cheap, synchronous *ingress* & an asynchronous *verification*
//! pipeline, joined by a bounded queue:
//!
//! ```text
//!  POST /webmention
//!        |
//!        v
//!   [ ingress ]  --405/400/429-->  (rejected; nothing enqueued)
//!        |
//!       202
//!        |
//!        v
//!   bounded queue ---> [ worker ] ---> HEAD source ---> GET source ---> media handler
//!                                                                           |
//!                                                                           v
//!                                                                      notifiers
//! ```
//!
//! Ingress performs no outbound I/O whatsoever: it validates the form, asks the embedder's
//! `accepts` predicate whether this instance even handles the target, and enqueues. Everything
//! slow-- fetching the source, parsing it, fanning out to notifiers-- happens on worker tasks
//! the embedder spawns (one is plenty for a personal site; spawn more if you're popular). The
//! queue is bounded & the enqueue non-blocking: under load we shed with `429` rather than buying
//! memory with latency.
//!
//! Verification is idempotent by design. A mention carries no state beyond (source, target), so
//! re-delivery-- whether from an impatient sender or a crashed worker-- just recomputes the same
//! truth & notifiers see the current state of the world, not a delta. That's also why no
//! per-target locking exists: two workers verifying the same pair concurrently do redundant
//! work, not conflicting work.
//!
//! Shutdown is a three-state affair, `Running` -> `Draining` -> `Stopped`: [Receiver::shutdown]
//! flips the receiver to `Draining` (ingress starts refusing), processes whatever the queue
//! still holds until it's empty or the deadline passes, then flips to `Stopped`. Only if the
//! deadline fires are workers told to abandon in-flight fetches; mentions accepted before the
//! shutdown began are never dropped otherwise.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Request, State},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use http::{
    header::{ACCEPT, CONTENT_TYPE, USER_AGENT},
    Method, StatusCode,
};
use itertools::Itertools;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use url::{form_urlencoded, Url};

use crate::{
    entities::{admissible, Mention, Status},
    media::{Body, MediaHandler, Registry},
    notify::Notifier,
    DEFAULT_USER_AGENT,
};

const DEFAULT_QUEUE_SIZE: usize = 100;

// More than enough for two URLs; anything bigger is not a webmention.
const MAX_FORM_BYTES: usize = 64 * 1024;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Failures encountered while *verifying* a mention
///
/// By the time one of these occurs the submitter has long since been answered `202`, so these
/// never turn into HTTP responses; they're handed to the receiver's error reporter together with
/// the offending mention. Note that a source which simply doesn't link to the target is not an
/// error-- that's a verification *outcome* ([Status::NoLink]) & flows to the notifiers.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Source {source_url} responded {status}"))]
    SourceNotFound {
        source_url: Url,
        status: StatusCode,
    },
    #[snafu(display("Failed to fetch {source_url}: {source}"))]
    Transport {
        source_url: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("No media handler registered for {media_type:?}"))]
    UnsupportedMediaType { media_type: String },
    #[snafu(display("While verifying {source_url}: {source}"))]
    Verification {
        source_url: Url,
        source: crate::media::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      ingress rejections                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The ways ingress can turn a request away
///
/// Each rejection knows how to answer the HTTP request that provoked it (the [IntoResponse]
/// implementation, below); the handler just converts & returns.
#[derive(Debug, Snafu)]
pub enum Rejection {
    #[snafu(display("{reason}"))]
    BadRequest { reason: String },
    #[snafu(display("only POST is accepted here"))]
    MethodNotAllowed,
    #[snafu(display("the mention queue is full; try again later"))]
    TooManyRequests,
    #[snafu(display("this service is shutting down & no longer accepts webmentions"))]
    Draining,
}

impl Rejection {
    fn bad(reason: impl Into<String>) -> Rejection {
        Rejection::BadRequest {
            reason: reason.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Rejection::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Rejection::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Rejection::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Rejection::Draining => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status(), format!("{}\n", self)).into_response()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          lifecycle                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Running,
    Draining,
    Stopped,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Receiver                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Decides whether this instance handles mentions of `target` from `source` at all
pub type AcceptsFn = dyn Fn(&Url, &Url) -> bool + Send + Sync;

/// Receives verification failures together with the mention that provoked them
pub type ReporterFn = dyn Fn(&Error, &Mention) + Send + Sync;

/// The receiving side of the protocol
///
/// Construct one through [Builder], wrap it in an [Arc], mount [make_router] (or the [receive]
/// handler directly) on your server, & spawn [Receiver::process_mentions] once per desired
/// worker. Immutable after construction, save for the queue & the lifecycle state.
pub struct Receiver {
    // Set on shutdown, only if the drain deadline expires: tells workers to abandon whatever
    // verification they have in flight. Kept distinct from `lifecycle` because a *clean* drain
    // also reaches `Stopped`, and an in-flight mention must not be dropped in that case.
    abort: watch::Sender<bool>,
    accepts: Box<AcceptsFn>,
    client: reqwest::Client,
    dequeue: Mutex<mpsc::Receiver<Mention>>,
    enqueue: mpsc::Sender<Mention>,
    handlers: Registry,
    lifecycle: watch::Sender<Lifecycle>,
    notifiers: Vec<Arc<dyn Notifier>>,
    reporter: Box<ReporterFn>,
    user_agent: String,
}

/// Builder for [Receiver]
///
/// The defaults are deliberately inert: the `accepts` predicate refuses everything (a receiver
/// that verifies & notifies for arbitrary targets is an open relay), there are no notifiers, and
/// the error reporter logs at `ERROR`.
pub struct Builder {
    accepts: Box<AcceptsFn>,
    client: Option<reqwest::Client>,
    handlers: Registry,
    notifiers: Vec<Arc<dyn Notifier>>,
    queue_size: usize,
    reporter: Box<ReporterFn>,
    user_agent: String,
}

impl Default for Builder {
    fn default() -> Builder {
        Builder {
            accepts: Box::new(|_source, _target| false),
            client: None,
            handlers: Registry::default(),
            notifiers: Vec::new(),
            queue_size: DEFAULT_QUEUE_SIZE,
            reporter: Box::new(|err, mention| {
                error!(
                    source = %mention.source,
                    target = %mention.target,
                    "failed to process webmention: {err}"
                );
            }),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Predicate saying whether `(source, target)` pairs are handled here; you almost certainly
    /// want "target is on my domain"
    pub fn accepts<F>(mut self, accepts: F) -> Builder
    where
        F: Fn(&Url, &Url) -> bool + Send + Sync + 'static,
    {
        self.accepts = Box::new(accepts);
        self
    }

    /// Supply your own [reqwest::Client] (it will be shared by all workers)
    pub fn client(mut self, client: reqwest::Client) -> Builder {
        self.client = Some(client);
        self
    }

    /// Register a handler for `media_type` at weight `qweight`, or remove the handler for that
    /// type by passing `None`; see [Registry::set]
    pub fn media_handler(
        mut self,
        media_type: &str,
        qweight: f64,
        handler: Option<Arc<dyn MediaHandler>>,
    ) -> Builder {
        self.handlers.set(media_type, qweight, handler);
        self
    }

    /// Add a notifier; notifiers are invoked in registration order
    pub fn notifier(mut self, notifier: impl Notifier + 'static) -> Builder {
        self.notifiers.push(Arc::new(notifier));
        self
    }

    /// Bound on the number of mentions awaiting verification; beyond it, ingress sheds with
    /// `429`. Clamped to at least one.
    pub fn queue_size(mut self, queue_size: usize) -> Builder {
        self.queue_size = queue_size.max(1);
        self
    }

    /// Where verification failures go; default is an `ERROR`-level log line
    pub fn reporter<F>(mut self, reporter: F) -> Builder
    where
        F: Fn(&Error, &Mention) + Send + Sync + 'static,
    {
        self.reporter = Box::new(reporter);
        self
    }

    /// The User-Agent presented when fetching sources; SHOULD contain "Webmention"
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Builder {
        self.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> Receiver {
        if self.handlers.is_empty() {
            warn!("no media handlers registered; every mention will fail verification");
        }
        let (enqueue, dequeue) = mpsc::channel(self.queue_size);
        let (lifecycle, _) = watch::channel(Lifecycle::Running);
        let (abort, _) = watch::channel(false);
        Receiver {
            abort,
            accepts: self.accepts,
            client: self.client.unwrap_or_default(),
            dequeue: Mutex::new(dequeue),
            enqueue,
            handlers: self.handlers,
            lifecycle,
            notifiers: self.notifiers,
            reporter: self.reporter,
            user_agent: self.user_agent,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           ingress                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Mount the [receive] handler at `endpoint`
pub fn make_router(endpoint: &str, receiver: Arc<Receiver>) -> Router {
    Router::new()
        .route(endpoint, any(receive))
        .with_state(receiver)
}

/// The webmention ingress handler
pub async fn receive(State(receiver): State<Arc<Receiver>>, request: Request) -> Response {
    match receiver.admit(request).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            "Accepted: your webmention has been queued for processing.\n",
        )
            .into_response(),
        Err(rejection) => {
            debug!("rejecting webmention: {rejection}");
            rejection.into_response()
        }
    }
}

/// Exactly one value for `key`, or the appropriate complaint
fn single<'a>(pairs: &'a [(String, String)], key: &str) -> std::result::Result<&'a str, Rejection> {
    pairs
        .iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .at_most_one()
        .map_err(|_| Rejection::bad(format!("malformed {key} argument")))?
        .ok_or_else(|| Rejection::bad(format!("missing form value: {key}")))
}

impl Receiver {
    /// The synchronous admission checks; anything other than `Ok` means "nothing was enqueued"
    async fn admit(&self, request: Request) -> std::result::Result<(), Rejection> {
        if request.method() != Method::POST {
            return Err(Rejection::MethodNotAllowed);
        }
        if *self.lifecycle.borrow() != Lifecycle::Running {
            return Err(Rejection::Draining);
        }

        let body = axum::body::to_bytes(request.into_body(), MAX_FORM_BYTES)
            .await
            .map_err(|_| Rejection::bad("could not read the request body"))?;
        let pairs: Vec<(String, String)> = form_urlencoded::parse(&body).into_owned().collect();

        let source = single(&pairs, "source")?;
        let target = single(&pairs, "target")?;
        if source == target {
            return Err(Rejection::bad("target must be different from source"));
        }

        let source = Url::parse(source).map_err(|_| Rejection::bad("source url is malformed"))?;
        let target = Url::parse(target).map_err(|_| Rejection::bad("target url is malformed"))?;
        if !admissible(&source) {
            return Err(Rejection::bad(
                "source url scheme not supported (supported schemes are: http, https)",
            ));
        }
        if !admissible(&target) {
            return Err(Rejection::bad(
                "target url scheme not supported (supported schemes are: http, https)",
            ));
        }

        if !(self.accepts)(&source, &target) {
            return Err(Rejection::bad(
                "target does not accept webmentions from this source",
            ));
        }

        match self.enqueue.try_send(Mention::new(source, target)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Rejection::TooManyRequests),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Rejection::Draining),
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                        the workers                                         //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Verify queued mentions until shut down
    ///
    /// Does not return until [shutdown](Receiver::shutdown) completes; spawn it on its own task.
    /// Multiple tasks may run this concurrently-- they share the queue.
    pub async fn process_mentions(&self) {
        let mut lifecycle = self.lifecycle.subscribe();
        let mut abort = self.abort.subscribe();
        loop {
            let next = {
                let mut dequeue = self.dequeue.lock().await;
                tokio::select! {
                    mention = dequeue.recv() => Some(mention),
                    _ = lifecycle.wait_for(|state| *state != Lifecycle::Running) => None,
                }
            };
            match next {
                Some(Some(mention)) => self.handle_one(mention, &mut abort).await,
                // The channel can't close while we hold the send side, but be tidy about it.
                Some(None) => return,
                None => break, // shutdown has begun
            }
        }
        self.drain(&mut abort).await;
    }

    /// Process whatever the queue still holds; returns when it's empty or the drain deadline
    /// expires
    async fn drain(&self, abort: &mut watch::Receiver<bool>) {
        loop {
            if *abort.borrow() {
                return;
            }
            let next = { self.dequeue.lock().await.try_recv() };
            match next {
                Ok(mention) => self.handle_one(mention, abort).await,
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => return,
            }
        }
    }

    /// Verify one mention, reporting any failure; abandons the attempt if the drain deadline
    /// expires while a fetch is in flight
    async fn handle_one(&self, mention: Mention, abort: &mut watch::Receiver<bool>) {
        tokio::select! {
            result = self.process(mention.clone()) => {
                if let Err(err) = result {
                    (self.reporter)(&err, &mention);
                }
            }
            _ = abort.wait_for(|aborted| *aborted) => {
                warn!(
                    source = %mention.source,
                    target = %mention.target,
                    "shutdown deadline expired with verification in flight; mention dropped"
                );
            }
        }
    }

    async fn process(&self, mut mention: Mention) -> Result<()> {
        // First pass: HEAD. Establishes whether the source exists at all (or has been
        // tombstoned), and what shape its representation takes.
        let rsp = self
            .client
            .head(mention.source.clone())
            .header(USER_AGENT, self.user_agent.as_str())
            .header(ACCEPT, self.handlers.accept_header())
            .send()
            .await
            .context(TransportSnafu {
                source_url: mention.source.clone(),
            })?;
        let status = rsp.status();
        if status == StatusCode::GONE {
            let _ = rsp.bytes().await;
            mention.status = Status::Deleted;
            self.fan_out(mention);
            return Ok(());
        }
        if !status.is_success() {
            let _ = rsp.bytes().await;
            return SourceNotFoundSnafu {
                source_url: mention.source.clone(),
                status,
            }
            .fail();
        }
        // Media type, parameters stripped. A source that can't be bothered to say is assumed to
        // be plain text.
        let media_type = rsp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|media_type| media_type.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "text/plain".to_string());
        let _ = rsp.bytes().await;

        let handler = self
            .handlers
            .get(&media_type)
            .context(UnsupportedMediaTypeSnafu {
                media_type: media_type.clone(),
            })?;

        // Second pass: GET, streaming the representation into the handler.
        let rsp = self
            .client
            .get(mention.source.clone())
            .header(USER_AGENT, self.user_agent.as_str())
            .header(ACCEPT, media_type.as_str())
            .send()
            .await
            .context(TransportSnafu {
                source_url: mention.source.clone(),
            })?;
        let body: Body = Box::pin(rsp.bytes_stream());
        mention.status = handler
            .verify(body, &mention.target)
            .await
            .context(VerificationSnafu {
                source_url: mention.source.clone(),
            })?;

        self.fan_out(mention);
        Ok(())
    }

    /// Hand `mention` to every notifier, in registration order, without waiting on any of them
    fn fan_out(&self, mention: Mention) {
        debug!(notifiers = self.notifiers.len(), mention = %mention, "dispatching verified mention");
        for notifier in &self.notifiers {
            let notifier = notifier.clone();
            let mention = mention.clone();
            tokio::spawn(async move {
                notifier.receive(&mention).await;
            });
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                          shutdown                                          //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Stop accepting mentions & drain the queue, allowing at most `deadline` for the drain
    ///
    /// On return the receiver is stopped: ingress answers `503`, workers have exited (or will,
    /// the moment their in-flight fetch resolves or is abandoned). Mentions accepted before this
    /// call are processed unless the deadline fires first.
    pub async fn shutdown(&self, deadline: Duration) {
        info!("webmention receiver shutting down; draining the queue");
        self.lifecycle.send_replace(Lifecycle::Draining);
        let mut abort = self.abort.subscribe();
        if tokio::time::timeout(deadline, self.drain(&mut abort))
            .await
            .is_err()
        {
            warn!("shutdown deadline expired before the mention queue drained");
            self.abort.send_replace(true);
        }
        self.lifecycle.send_replace(Lifecycle::Stopped);
        info!("webmention receiver stopped");
    }
}

#[cfg(test)]
mod test {

    use super::*;

    use crate::notify::NotifierFn;
    use tower::ServiceExt; // for `oneshot`
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn form_request(endpoint: &str, body: &str) -> Request {
        http::Request::builder()
            .method("POST")
            .uri(endpoint)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap()
    }

    /// A receiver that accepts everything & reports mentions/errors over channels
    fn test_receiver(
        queue_size: usize,
    ) -> (
        Arc<Receiver>,
        tokio::sync::mpsc::UnboundedReceiver<Mention>,
        tokio::sync::mpsc::UnboundedReceiver<String>,
    ) {
        let (mention_tx, mention_rx) = tokio::sync::mpsc::unbounded_channel();
        let (error_tx, error_rx) = tokio::sync::mpsc::unbounded_channel();
        let receiver = Builder::new()
            .accepts(|_source, _target| true)
            .queue_size(queue_size)
            .notifier(NotifierFn(move |mention: Mention| {
                let _ = mention_tx.send(mention);
            }))
            .reporter(move |err: &Error, _mention: &Mention| {
                let _ = error_tx.send(err.to_string());
            })
            .build();
        (Arc::new(receiver), mention_rx, error_rx)
    }

    async fn body_text(rsp: Response) -> String {
        let bytes = axum::body::to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                        ingress tests                                       //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    #[tokio::test]
    async fn ingress_method_not_allowed() {
        let (receiver, _, _) = test_receiver(8);
        let router = make_router("/webmention", receiver);
        let rsp = router
            .oneshot(
                http::Request::builder()
                    .method("GET")
                    .uri("/webmention")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, rsp.status());
    }

    #[tokio::test]
    async fn ingress_missing_and_repeated_fields() {
        let (receiver, mut mentions, _) = test_receiver(8);
        let router = make_router("/webmention", receiver);

        let rsp = router
            .clone()
            .oneshot(form_request("/webmention", "source=http://s.example/a"))
            .await
            .unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
        assert!(body_text(rsp).await.contains("missing form value: target"));

        let rsp = router
            .clone()
            .oneshot(form_request(
                "/webmention",
                "source=http://s.example/a&source=http://s.example/b&target=http://t.example/c",
            ))
            .await
            .unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
        assert!(body_text(rsp).await.contains("malformed source argument"));

        // Nothing may have been enqueued or notified
        assert!(mentions.try_recv().is_err());
    }

    #[tokio::test]
    async fn ingress_source_equals_target() {
        let (receiver, mut mentions, _) = test_receiver(8);
        let router = make_router("/webmention", receiver);
        let rsp = router
            .oneshot(form_request(
                "/webmention",
                "source=http://x.example/p&target=http://x.example/p",
            ))
            .await
            .unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
        assert!(mentions.try_recv().is_err());
    }

    #[tokio::test]
    async fn ingress_scheme_checks() {
        let (receiver, _, _) = test_receiver(8);
        let router = make_router("/webmention", receiver);
        let rsp = router
            .clone()
            .oneshot(form_request(
                "/webmention",
                "source=ftp://s.example/a&target=http://t.example/b",
            ))
            .await
            .unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, rsp.status());

        let rsp = router
            .oneshot(form_request(
                "/webmention",
                "source=http://s.example/a&target=not a url at all",
            ))
            .await
            .unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    }

    #[tokio::test]
    async fn ingress_default_accepts_nothing() {
        // The Builder default refuses all targets
        let receiver = Arc::new(Builder::new().build());
        let router = make_router("/webmention", receiver);
        let rsp = router
            .oneshot(form_request(
                "/webmention",
                "source=http://s.example/a&target=http://t.example/b",
            ))
            .await
            .unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
        assert!(body_text(rsp)
            .await
            .contains("target does not accept webmentions"));
    }

    #[tokio::test]
    async fn ingress_back_pressure() {
        // Queue capacity one & no worker running (equivalently: the worker is wedged): the
        // first mention is accepted, the second shed.
        let (receiver, _mentions, _) = test_receiver(1);
        let router = make_router("/webmention", receiver);

        let rsp = router
            .clone()
            .oneshot(form_request(
                "/webmention",
                "source=http://s.example/1&target=http://t.example/1",
            ))
            .await
            .unwrap();
        assert_eq!(StatusCode::ACCEPTED, rsp.status());

        let rsp = router
            .oneshot(form_request(
                "/webmention",
                "source=http://s.example/2&target=http://t.example/2",
            ))
            .await
            .unwrap();
        assert_eq!(StatusCode::TOO_MANY_REQUESTS, rsp.status());
    }

    #[tokio::test]
    async fn ingress_rejects_after_shutdown() {
        let (receiver, _, _) = test_receiver(8);
        let router = make_router("/webmention", receiver.clone());
        receiver.shutdown(Duration::from_millis(100)).await;
        let rsp = router
            .oneshot(form_request(
                "/webmention",
                "source=http://s.example/a&target=http://t.example/b",
            ))
            .await
            .unwrap();
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, rsp.status());
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                        worker tests                                        //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// POST a mention for `source` -> `target` through the router & expect `202`
    async fn submit(router: &Router, source: &Url, target: &Url) {
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("source", source.as_str())
            .append_pair("target", target.as_str())
            .finish();
        let rsp = router
            .clone()
            .oneshot(form_request("/webmention", &body))
            .await
            .unwrap();
        assert_eq!(StatusCode::ACCEPTED, rsp.status());
    }

    #[tokio::test]
    async fn worker_happy_path() {
        let server = MockServer::start().await;
        let target = Url::parse("http://t.example/page").unwrap();
        Mock::given(method("HEAD"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "text/html"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                format!(r#"<html><body><a href="{}">a fine page</a></body></html>"#, target),
                "text/html",
            ))
            .mount(&server)
            .await;

        let (receiver, mut mentions, _) = test_receiver(8);
        let router = make_router("/webmention", receiver.clone());
        let worker = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.process_mentions().await })
        };

        let source = Url::parse(&format!("{}/post", server.uri())).unwrap();
        submit(&router, &source, &target).await;

        let mention = tokio::time::timeout(Duration::from_secs(5), mentions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source, mention.source);
        assert_eq!(target, mention.target);
        assert_eq!(Status::Link, mention.status);

        receiver.shutdown(Duration::from_secs(1)).await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_processing_is_idempotent() {
        let server = MockServer::start().await;
        let target = Url::parse("http://t.example/page").unwrap();
        Mock::given(method("HEAD"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "text/html"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                format!(r#"<a href="{}">x</a>"#, target),
                "text/html",
            ))
            .mount(&server)
            .await;

        let (receiver, mut mentions, _) = test_receiver(8);
        let router = make_router("/webmention", receiver.clone());
        let worker = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.process_mentions().await })
        };

        let source = Url::parse(&format!("{}/post", server.uri())).unwrap();
        submit(&router, &source, &target).await;
        submit(&router, &source, &target).await;

        let first = tokio::time::timeout(Duration::from_secs(5), mentions.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), mentions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);

        receiver.shutdown(Duration::from_secs(1)).await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_deleted_source() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/tombstone"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        // A tombstoned source must not be fetched
        Mock::given(method("GET"))
            .and(path("/tombstone"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (receiver, mut mentions, _) = test_receiver(8);
        let router = make_router("/webmention", receiver.clone());
        let worker = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.process_mentions().await })
        };

        let source = Url::parse(&format!("{}/tombstone", server.uri())).unwrap();
        let target = Url::parse("http://t.example/page").unwrap();
        submit(&router, &source, &target).await;

        let mention = tokio::time::timeout(Duration::from_secs(5), mentions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Status::Deleted, mention.status);

        receiver.shutdown(Duration::from_secs(1)).await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_source_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (receiver, mut mentions, mut errors) = test_receiver(8);
        let router = make_router("/webmention", receiver.clone());
        let worker = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.process_mentions().await })
        };

        let source = Url::parse(&format!("{}/nope", server.uri())).unwrap();
        let target = Url::parse("http://t.example/page").unwrap();
        submit(&router, &source, &target).await;

        let err = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(err.contains("404"));
        // No notifier may have been invoked
        assert!(mentions.try_recv().is_err());

        receiver.shutdown(Duration::from_secs(1)).await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_unsupported_media_type() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/binary"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Content-Type", "application/pdf"),
            )
            .mount(&server)
            .await;

        let (receiver, mut mentions, mut errors) = test_receiver(8);
        let router = make_router("/webmention", receiver.clone());
        let worker = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.process_mentions().await })
        };

        let source = Url::parse(&format!("{}/binary", server.uri())).unwrap();
        let target = Url::parse("http://t.example/page").unwrap();
        submit(&router, &source, &target).await;

        let err = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(err.contains("application/pdf"));
        assert!(mentions.try_recv().is_err());

        receiver.shutdown(Duration::from_secs(1)).await;
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_no_link() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "text/html"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<p>hi</p>", "text/html"))
            .mount(&server)
            .await;

        let (receiver, mut mentions, _) = test_receiver(8);
        let router = make_router("/webmention", receiver.clone());
        let worker = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.process_mentions().await })
        };

        let source = Url::parse(&format!("{}/post", server.uri())).unwrap();
        let target = Url::parse("http://t.example/page").unwrap();
        submit(&router, &source, &target).await;

        let mention = tokio::time::timeout(Duration::from_secs(5), mentions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Status::NoLink, mention.status);

        receiver.shutdown(Duration::from_secs(1)).await;
        worker.await.unwrap();
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                       shutdown tests                                       //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    #[tokio::test]
    async fn shutdown_drains_accepted_mentions() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "text/html"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<p>hi</p>", "text/html"))
            .mount(&server)
            .await;

        // No workers at all: everything rides on shutdown's own drain.
        let (receiver, mut mentions, _) = test_receiver(8);
        let router = make_router("/webmention", receiver.clone());

        let source = Url::parse(&format!("{}/post", server.uri())).unwrap();
        submit(&router, &source, &Url::parse("http://t.example/1").unwrap()).await;
        submit(&router, &source, &Url::parse("http://t.example/2").unwrap()).await;

        receiver.shutdown(Duration::from_secs(5)).await;

        assert!(mentions.recv().await.is_some());
        assert!(mentions.recv().await.is_some());
    }

    #[tokio::test]
    async fn shutdown_deadline_bounds_the_drain() {
        let server = MockServer::start().await;
        // A source slow enough that the deadline must fire first
        Mock::given(method("HEAD"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/html")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let (receiver, mut mentions, _) = test_receiver(8);
        let router = make_router("/webmention", receiver.clone());
        let source = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        submit(&router, &source, &Url::parse("http://t.example/1").unwrap()).await;

        let begin = std::time::Instant::now();
        receiver.shutdown(Duration::from_millis(250)).await;
        assert!(begin.elapsed() < Duration::from_secs(10));
        assert!(mentions.try_recv().is_err());
    }
}
