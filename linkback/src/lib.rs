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

//! # linkback
//!
//! Send & receive [Webmention]s.
//!
//! [Webmention]: https://www.w3.org/TR/webmention/
//!
//! Webmention is the IndieWeb's notification protocol: when page S links to page T, S's author
//! may POST `source=S&target=T` to an endpoint T advertises, and T's server-- after verifying
//! for itself that the link is really there-- may display, archive or forward the fact. It's
//! `@`-mentions for the open web, with the refreshing property that the receiver trusts nothing
//! it's told.
//!
//! This crate provides both halves:
//!
//! - [sender::Sender] discovers a target's endpoint ([discovery]) & dispatches mentions,
//!   including the re-notification dance when a source document is updated or deleted
//! - [receiver::Receiver] is an [axum] handler plus a small worker pool: ingress validation,
//!   a bounded queue, asynchronous verification against the source ([media]), & fan-out to
//!   pluggable [notify::Notifier]s
//!
//! Two thin daemons ship alongside: `linkbackd` hosts the receiver; `linkback-send` drives the
//! sender from a Unix socket (one JSON request per line), which makes it easy to hook into a
//! static site generator's publish step.

pub mod discovery;
pub mod entities;
pub mod html;
#[path = "link-header.rs"]
pub mod link_header;
pub mod media;
pub mod notify;
pub mod receiver;
pub mod sender;

/// The User-Agent both halves present when not told otherwise; receivers are told to be lenient,
/// but SHOULD give some weight to the token "Webmention" when deciding whether a request is
/// genuine
pub const DEFAULT_USER_AGENT: &str = "Webmention (linkback)";
