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

//! # Media handlers
//!
//! Verification of a mention is a per-media-type concern: given the bytes of the source document
//! and the target URL, does the source link to the target? The receiver holds an ordered registry
//! of [MediaHandler]s, keyed by media type; the registry doubles as the source of the `Accept`
//! header the receiver sends when fetching a source.
//!
//! Two handlers ship with linkback, mirroring what a webmention receiver must support in
//! practice: `text/html` (a DOM scan) and `text/plain` (substring search). Embedders can register
//! their own-- or a closure, via [HandlerFn]-- for anything else (JSON feeds, gemtext, whatever).

use std::{pin::Pin, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use snafu::{Backtrace, ResultExt, Snafu};
use url::Url;

use crate::{
    entities::Status,
    html::document_links_to,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read the source document: {source}"))]
    Read {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    // Escape hatch for handlers defined outside this crate
    #[snafu(display("{source}"))]
    Handler {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Wrap an arbitrary failure from an embedder-supplied handler
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Handler {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      the MediaHandler trait                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The source document's bytes, as they come off the wire
pub type Body = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Collect a [Body] into memory
///
/// Both built-in handlers need the entire document before they can say anything; handlers for
/// line-oriented formats could consume the stream incrementally instead.
pub async fn collect(mut body: Body) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.try_next().await.context(ReadSnafu)? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Decide whether a source document of a particular media type links to a target
///
/// An exact match must yield [Status::Link]; a well-formed document with no match,
/// [Status::NoLink]. An `Err` return is an *internal* failure (unreadable stream, say)-- it is
/// reported through the receiver's error reporter and suppresses notification; it does not mean
/// "no link".
// Must be object-safe: the registry stores these as trait objects.
#[async_trait]
pub trait MediaHandler: Send + Sync {
    async fn verify(&self, body: Body, target: &Url) -> Result<Status>;
}

/// Adapt a closure to a [MediaHandler], so embedders can register one without declaring a type
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> MediaHandler for HandlerFn<F>
where
    F: Fn(Body, Url) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Status>> + Send,
{
    async fn verify(&self, body: Body, target: &Url) -> Result<Status> {
        (self.0)(body, target.clone()).await
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       built-in handlers                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `text/html`: parse & scan `a`/`img`/`video` elements for an exact reference to the target
pub struct HtmlHandler;

#[async_trait]
impl MediaHandler for HtmlHandler {
    async fn verify(&self, body: Body, target: &Url) -> Result<Status> {
        let buf = collect(body).await?;
        let text = String::from_utf8_lossy(&buf);
        if document_links_to(&text, target) {
            Ok(Status::Link)
        } else {
            Ok(Status::NoLink)
        }
    }
}

/// `text/plain`: the target's canonical string form must appear as a substring
pub struct PlainHandler;

#[async_trait]
impl MediaHandler for PlainHandler {
    async fn verify(&self, body: Body, target: &Url) -> Result<Status> {
        let buf = collect(body).await?;
        let text = String::from_utf8_lossy(&buf);
        if text.contains(target.as_str()) {
            Ok(Status::Link)
        } else {
            Ok(Status::NoLink)
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         the registry                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Entry {
    media_type: String,
    qweight: f64,
    handler: Arc<dyn MediaHandler>,
}

/// Ordered media type to handler map
///
/// Insertion order is preserved: it governs both the rendered `Accept` header and lookup, which
/// is first-match.
pub struct Registry {
    entries: Vec<Entry>,
}

impl Default for Registry {
    /// `text/html` at q=1.0, `text/plain` at q=0.1
    fn default() -> Registry {
        let mut registry = Registry {
            entries: Vec::new(),
        };
        registry.set("text/html", 1.0, Some(Arc::new(HtmlHandler)));
        registry.set("text/plain", 0.1, Some(Arc::new(PlainHandler)));
        registry
    }
}

impl Registry {
    /// Register a handler for `media_type`, or remove one by passing `None`
    ///
    /// Removal drops the first entry for that media type; registration appends (it does not
    /// replace-- lookup being first-match, an existing entry continues to win until removed).
    pub fn set(&mut self, media_type: &str, qweight: f64, handler: Option<Arc<dyn MediaHandler>>) {
        match handler {
            Some(handler) => self.entries.push(Entry {
                media_type: media_type.to_ascii_lowercase(),
                qweight: qweight.clamp(0.0, 1.0),
                handler,
            }),
            None => {
                if let Some(i) = self
                    .entries
                    .iter()
                    .position(|e| e.media_type == media_type.to_ascii_lowercase())
                {
                    self.entries.remove(i);
                }
            }
        }
    }

    /// First handler registered for `media_type` (lower-cased, parameters already stripped)
    pub fn get(&self, media_type: &str) -> Option<Arc<dyn MediaHandler>> {
        self.entries
            .iter()
            .find(|e| e.media_type == media_type)
            .map(|e| e.handler.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the registry as an `Accept` header value
    ///
    /// Entries appear in registration order; `;q=` is omitted when the weight is 1.
    pub fn accept_header(&self) -> String {
        let mut value = String::new();
        for entry in &self.entries {
            if !value.is_empty() {
                value.push(',');
            }
            value.push_str(&entry.media_type);
            if entry.qweight != 1.0 {
                value.push_str(&format!(";q={:.3}", entry.qweight));
            }
        }
        value
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use futures::stream;

    fn body_of(text: &str) -> Body {
        Box::pin(stream::iter(vec![Ok(Bytes::copy_from_slice(
            text.as_bytes(),
        ))]))
    }

    #[test]
    fn accept_header_rendering() {
        let registry = Registry::default();
        assert_eq!("text/html,text/plain;q=0.100", registry.accept_header());
    }

    #[test]
    fn registration_order_and_removal() {
        let mut registry = Registry::default();
        registry.set("text/html", 1.0, None);
        assert!(registry.get("text/html").is_none());
        assert!(registry.get("text/plain").is_some());
        assert_eq!("text/plain;q=0.100", registry.accept_header());

        registry.set("application/ld+json", 0.8, Some(Arc::new(PlainHandler)));
        assert_eq!(
            "text/plain;q=0.100,application/ld+json;q=0.800",
            registry.accept_header()
        );
        assert!(registry.get("application/ld+json").is_some());
    }

    #[test]
    fn lookup_is_first_match() {
        let mut registry = Registry {
            entries: Vec::new(),
        };
        registry.set("text/plain", 1.0, Some(Arc::new(PlainHandler)));
        registry.set("text/plain", 0.5, Some(Arc::new(HtmlHandler)));
        // Two entries; the first one registered wins
        assert_eq!("text/plain,text/plain;q=0.500", registry.accept_header());
        let handler = registry.get("text/plain").unwrap();
        // Cheap identity check: PlainHandler does a substring match, HtmlHandler a DOM scan, so
        // raw text containing the URL distinguishes them.
        let target = Url::parse("http://t.example/x").unwrap();
        let status = futures::executor::block_on(
            handler.verify(body_of("see http://t.example/x here"), &target),
        )
        .unwrap();
        assert_eq!(Status::Link, status);
    }

    #[tokio::test]
    async fn plain_handler() {
        let target = Url::parse("http://t.example/page").unwrap();
        let status = PlainHandler
            .verify(body_of("mentioned at http://t.example/page today"), &target)
            .await
            .unwrap();
        assert_eq!(Status::Link, status);
        let status = PlainHandler
            .verify(body_of("nothing to see"), &target)
            .await
            .unwrap();
        assert_eq!(Status::NoLink, status);
        // Substring match is case-sensitive on path
        let status = PlainHandler
            .verify(body_of("http://t.example/PAGE"), &target)
            .await
            .unwrap();
        assert_eq!(Status::NoLink, status);
    }

    #[tokio::test]
    async fn html_handler() {
        let target = Url::parse("http://t.example/page").unwrap();
        let status = HtmlHandler
            .verify(
                body_of(r#"<p>read <a href="http://t.example/page">this</a></p>"#),
                &target,
            )
            .await
            .unwrap();
        assert_eq!(Status::Link, status);
        let status = HtmlHandler
            .verify(body_of("<p>hi</p>"), &target)
            .await
            .unwrap();
        assert_eq!(Status::NoLink, status);
        // Unlike text/plain, a bare textual occurrence is not a link
        let status = HtmlHandler
            .verify(body_of("<p>http://t.example/page</p>"), &target)
            .await
            .unwrap();
        assert_eq!(Status::NoLink, status);
    }

    #[tokio::test]
    async fn handler_fn_adapter() {
        let handler = HandlerFn(|body: Body, target: Url| async move {
            let buf = collect(body).await?;
            if buf.windows(target.as_str().len()).any(|w| w == target.as_str().as_bytes()) {
                Ok(Status::Link)
            } else {
                Ok(Status::NoLink)
            }
        });
        let target = Url::parse("http://t.example/p").unwrap();
        let status = handler
            .verify(body_of("-> http://t.example/p <-"), &target)
            .await
            .unwrap();
        assert_eq!(Status::Link, status);
    }
}
