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

//! # DOM scans
//!
//! The two HTML walks linkback performs: locating a target's advertised webmention endpoint
//! (sender side) and checking whether a source document links to a target (receiver side).
//!
//! Both run over the DOM produced by [scraper]-- i.e. after browser-style error recovery--
//! never over raw bytes. That matters: an endpoint inside an HTML comment, or in
//! entity-escaped text (`&lt;a href=...&gt;`), must *not* be found, and a real parser is the
//! only sane way to guarantee that. [scraper]'s `select` yields elements in document order
//! (depth-first, pre-order), which is exactly the traversal the protocol calls for.

use lazy_static::lazy_static;
use scraper::{Html, Selector};
use url::Url;

lazy_static! {
    static ref LINK_WITH_HREF: Selector = Selector::parse("link[href]").unwrap(/* known good */);
    static ref ANCHOR_WITH_HREF: Selector = Selector::parse("a[href]").unwrap(/* known good */);
    static ref REFERRING_ELEMENTS: Selector =
        Selector::parse("a[href], img[src], video[src]").unwrap(/* known good */);
}

fn rel_contains_webmention(el: &scraper::node::Element) -> bool {
    el.attr("rel")
        .map(|rel| {
            rel.split_ascii_whitespace()
                .any(|t| t.eq_ignore_ascii_case("webmention"))
        })
        .unwrap_or(false)
}

/// Find the webmention endpoint advertised in `document`, if any
///
/// Returns the `href` of the first `<link rel~=webmention>`, or failing that the first
/// `<a rel~=webmention>`; `<link>` wins even when an `<a>` appears earlier in the document.
/// Elements lacking an `href` attribute don't count (so a bare `<link rel="webmention">`
/// doesn't shadow a later, usable `<a>`). The returned reference may be relative-- even
/// empty-- and resolution is the caller's problem.
pub fn endpoint_from_document(document: &str) -> Option<String> {
    let doc = Html::parse_document(document);
    for selector in [&*LINK_WITH_HREF, &*ANCHOR_WITH_HREF] {
        if let Some(el) = doc
            .select(selector)
            .find(|el| rel_contains_webmention(el.value()))
        {
            return el.value().attr("href").map(ToOwned::to_owned);
        }
    }
    None
}

/// Does `document` contain a reference to `target`?
///
/// Scans `<a href>`, `<img src>` & `<video src>` in document order; the comparison is a
/// case-insensitive match of the entire attribute value against `target`'s canonical string
/// form. No resolution is performed: the protocol asks for an exact reference.
// Nb. the elements examined: anchors carry their URL in `href`, but `img` & `video` carry
// theirs in `src`.
pub fn document_links_to(document: &str, target: &Url) -> bool {
    let doc = Html::parse_document(document);
    let want = target.as_str();
    doc.select(&REFERRING_ELEMENTS).any(|el| {
        let attr = match el.value().name() {
            "a" => "href",
            _ => "src",
        };
        el.value()
            .attr(attr)
            .map(|v| v.eq_ignore_ascii_case(want))
            .unwrap_or(false)
    })
}
