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

//! # Notifiers
//!
//! A [Notifier] is the receiver's output side: a sink invoked once for every mention that
//! completes verification (including [Deleted](crate::entities::Status::Deleted) ones-- a
//! notifier displaying mentions somewhere will want to drop its copy). The notifier must check
//! the mention's status; "verified" means "we know the truth about this mention now", not "the
//! link exists".
//!
//! This is the natural place to hook in whatever a deployment actually wants done with its
//! webmentions: write them to a store, ping a chat channel, send a digest mail. linkback itself
//! ships only [LogNotifier]; the trait plus [NotifierFn] keep the barrier to entry low.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::entities::Mention;

/// A sink for fully-verified mentions
///
/// Notifier invocations happen off the worker's hot path (the worker does not await them before
/// picking up its next mention), so implementations may block on I/O without holding up the
/// queue. Each notifier is invoked once per mention, in registration order.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn receive(&self, mention: &Mention);
}

/// Blanket implementation for [Arc]s; if `T` is a [Notifier], then so is `Arc<T>`
///
/// Handy when the same notifier instance also needs to be held elsewhere (to flush it on
/// shutdown, say).
#[async_trait]
impl<T: Notifier + Send + Sync> Notifier for Arc<T> {
    async fn receive(&self, mention: &Mention) {
        self.as_ref().receive(mention).await
    }
}

/// Adapt a closure to a [Notifier], so callers can register one without declaring a new type
pub struct NotifierFn<F>(pub F);

#[async_trait]
impl<F> Notifier for NotifierFn<F>
where
    F: Fn(Mention) + Send + Sync,
{
    async fn receive(&self, mention: &Mention) {
        (self.0)(mention.clone())
    }
}

/// A [Notifier] that reports each verified mention through structured logging
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn receive(&self, mention: &Mention) {
        info!(
            source = %mention.source,
            target = %mention.target,
            status = %mention.status,
            "verified webmention"
        );
    }
}
