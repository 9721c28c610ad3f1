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

//! # Webmention endpoint discovery
//!
//! Before we can notify a target that we link to it, we have to find out where it wants to hear
//! about it. A target advertises its endpoint in one of three places, and the [spec] imposes a
//! strict precedence among them:
//!
//! 1. an HTTP `Link` header carrying `rel=webmention`
//! 2. the first `<link rel=webmention href=...>` in the document
//! 3. the first `<a rel=webmention href=...>` in the document
//!
//! [spec]: https://www.w3.org/TR/webmention/#sender-discovers-receiver-webmention-endpoint
//!
//! We HEAD the target first: if the endpoint is in a header, there's no reason to pull the whole
//! document over the wire. Only when the headers come up empty do we GET & scan the DOM.
//!
//! One subtlety that the [webmention.rocks] suite is keen on: the advertised endpoint may be a
//! relative reference, and it resolves against the URL we *ended up at* after following
//! redirects-- not the URL we started with.
//!
//! [webmention.rocks]: https://webmention.rocks/

use http::{
    header::{ACCEPT, LINK, USER_AGENT},
    StatusCode,
};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use url::Url;

use crate::{entities::admissible, html, link_header};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{target} advertises no webmention endpoint"))]
    NoEndpointFound { target: Url },
    #[snafu(display("{target} advertises {href:?}, which is not a valid URL reference: {source}"))]
    InvalidEndpoint {
        target: Url,
        href: String,
        source: url::ParseError,
    },
    #[snafu(display("{target} advertises {endpoint}, which is not an http(s) endpoint"))]
    EndpointScheme { target: Url, endpoint: Url },
    #[snafu(display("{target} responded {status}"))]
    TargetNotFound { target: Url, status: StatusCode },
    #[snafu(display("Failed to fetch {target}: {source}"))]
    Transport {
        target: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Resolve the reference a target advertised against the URL we actually fetched it from
fn resolve(target: &Url, base: &Url, href: &str) -> Result<Url> {
    let endpoint = base.join(href).context(InvalidEndpointSnafu {
        target: target.clone(),
        href,
    })?;
    ensure!(
        admissible(&endpoint),
        EndpointSchemeSnafu {
            target: target.clone(),
            endpoint
        }
    );
    Ok(endpoint)
}

/// Discover `target`'s webmention endpoint
///
/// `client` should follow redirects (the [Sender](crate::sender::Sender) configures ten, per the
/// protocol's SHOULD); `user_agent` accompanies both requests. On success the returned URL is
/// absolute, with any query string the target put there left intact.
pub async fn discover(client: &reqwest::Client, user_agent: &str, target: &Url) -> Result<Url> {
    // First pass: HEAD, in the hopes that a Link header will spare us the document.
    let rsp = client
        .head(target.clone())
        .header(USER_AGENT, user_agent)
        .header(ACCEPT, "text/html")
        .send()
        .await
        .context(TransportSnafu {
            target: target.clone(),
        })?;
    let status = rsp.status();
    ensure!(
        status.is_success(),
        TargetNotFoundSnafu {
            target: target.clone(),
            status
        }
    );
    // Relative references resolve against the URL reached after redirects, not `target`.
    let base = rsp.url().clone();
    let header_link = link_header::parse_all(
        rsp.headers()
            .get_all(LINK)
            .iter()
            .filter_map(|value| value.to_str().ok()),
    )
    .into_iter()
    .find(|lv| lv.rel_contains("webmention"));
    // A HEAD response carries no body, but be thorough about returning the connection to the
    // pool in good order.
    let _ = rsp.bytes().await;

    if let Some(lv) = header_link {
        return resolve(target, &base, &lv.target);
    }

    // Second pass: GET the document & scan the DOM.
    let rsp = client
        .get(target.clone())
        .header(USER_AGENT, user_agent)
        .header(ACCEPT, "text/html")
        .send()
        .await
        .context(TransportSnafu {
            target: target.clone(),
        })?;
    let status = rsp.status();
    ensure!(
        status.is_success(),
        TargetNotFoundSnafu {
            target: target.clone(),
            status
        }
    );
    let base = rsp.url().clone();
    let document = rsp.text().await.context(TransportSnafu {
        target: target.clone(),
    })?;

    html::endpoint_from_document(&document)
        .context(NoEndpointFoundSnafu {
            target: target.clone(),
        })
        .and_then(|href| resolve(target, &base, &href))
}
