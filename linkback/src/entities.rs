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

//! # linkback entities
//!
//! The types that flow through both halves of the crate: the [Mention] triple, its verification
//! [Status], and a handful of URL helpers.
//!
//! On URL comparison: a Webmention implementation compares scheme & host case-insensitively, but
//! path & query byte-for-byte. The [Url] crate normalizes scheme & host to lower case at parse
//! time (per the [URL Standard]), so `Url`'s derived equality gives us exactly those semantics and
//! we don't maintain a comparison function of our own. There's a test below to keep us honest
//! should that ever change.
//!
//! [URL Standard]: https://url.spec.whatwg.org/

use std::fmt::Display;

use url::Url;

/// Verification status of a [Mention]
///
/// Set exactly once, by the receiver worker, before any notifier observes the mention.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// The source currently contains an exact reference to the target
    Link,
    /// The source exists, but contains no reference to the target (or no longer does)
    NoLink,
    /// The source itself responded `410 Gone`
    Deleted,
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Link => write!(f, "source links to target"),
            Status::NoLink => write!(f, "source does not link to target"),
            Status::Deleted => write!(f, "source itself got deleted"),
        }
    }
}

/// One webmention making its way through the receiver pipeline
///
/// Created at ingress with a status of [NoLink](Status::NoLink) (i.e. pending verification),
/// updated exactly once by the worker that picks it up, handed to every notifier, then discarded.
/// Nothing is retained.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mention {
    pub source: Url,
    pub target: Url,
    pub status: Status,
}

impl Mention {
    /// A new, unverified mention
    pub fn new(source: Url, target: Url) -> Mention {
        Mention {
            source,
            target,
            status: Status::NoLink,
        }
    }
}

impl Display for Mention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} \u{2192} {} ({})", self.source, self.target, self.status)
    }
}

/// Is `url` something we're willing to mention, or be mentioned by?
///
/// Both sides of the protocol only traffic in absolute http/https URLs with a host.
pub fn admissible(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host_str().map(|h| !h.is_empty()).unwrap_or(false)
}
