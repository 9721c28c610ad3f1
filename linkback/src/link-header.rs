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

//! # HTTP `Link` header parsing
//!
//! A small, forgiving parser for the `Link` response header ([RFC 8288]). Endpoint discovery needs
//! to handle a target that advertises its webmention endpoint as:
//!
//! ```text
//! Link: </wm>; rel=webmention
//! Link: </wm>; rel="webmention"
//! Link: </a>; rel="other", </wm>; rel="somethingelse webmention"
//! ```
//!
//! as well as the same set of link-values spread over multiple header lines-- HTTP treats a
//! repeated header and a single comma-joined header equivalently, and so do we.
//!
//! [RFC 8288]: https://www.rfc-editor.org/rfc/rfc8288
//!
//! I had a look around crates.io before writing this; what's there either pulls in a full HTTP
//! stack or rejects the sloppy-but-common forms the webmention.rocks test suite insists we accept.
//! The grammar is tiny, so we scan it by hand.

use std::collections::HashMap;

/// One link-value: a target URI reference plus its parameters
///
/// Parameter names are lower-cased; the first occurrence of a parameter wins (per [RFC 8288]
/// §3.4.1 for `rel`, and it's as good a rule as any for the rest).
///
/// [RFC 8288]: https://www.rfc-editor.org/rfc/rfc8288
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkValue {
    /// The URI reference between angle brackets, verbatim (possibly relative-- resolution is the
    /// caller's problem)
    pub target: String,
    pub params: HashMap<String, String>,
}

impl LinkValue {
    /// Does this link-value's `rel` parameter, split on ASCII whitespace, contain `token`
    /// (case-insensitively)?
    pub fn rel_contains(&self, token: &str) -> bool {
        self.params
            .get("rel")
            .map(|rel| {
                rel.split_ascii_whitespace()
                    .any(|t| t.eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }
}

/// Parse any number of raw header values into an ordered list of [LinkValue]s
pub fn parse_all<'a, I>(values: I) -> Vec<LinkValue>
where
    I: IntoIterator<Item = &'a str>,
{
    values.into_iter().flat_map(parse).collect()
}

/// Parse a single raw header value, which may contain multiple comma-separated link-values
///
/// Unparseable link-values are skipped, not fatal: a target with one mangled `Link` header and one
/// good one still gets its webmentions.
pub fn parse(value: &str) -> Vec<LinkValue> {
    let mut out = Vec::new();
    let mut scanner = Scanner::new(value);
    while let Some(lv) = scanner.next_link_value() {
        out.push(lv);
    }
    out
}

struct Scanner<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Scanner<'a> {
        Scanner {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    /// Advance past the current (malformed) link-value: everything up to and including the next
    /// top-level comma.
    fn skip_to_comma(&mut self) {
        let mut quoted = false;
        while let Some(c) = self.bump() {
            match c {
                b'"' => quoted = !quoted,
                b'\\' if quoted => {
                    self.bump();
                }
                b',' if !quoted => return,
                _ => (),
            }
        }
    }

    fn next_link_value(&mut self) -> Option<LinkValue> {
        loop {
            self.skip_ws();
            match self.peek() {
                None => return None,
                Some(b',') => {
                    self.pos += 1; // empty list element; legal, skip
                }
                Some(b'<') => break,
                Some(_) => {
                    // Not a link-value; drop everything up to the next comma & try again.
                    self.skip_to_comma();
                }
            }
        }
        self.pos += 1; // consume '<'
        let start = self.pos;
        while self.peek().map(|c| c != b'>').unwrap_or(false) {
            self.pos += 1;
        }
        // Unterminated '<...'-- nothing more to salvage on this line.
        self.peek()?;
        let target = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        self.pos += 1; // consume '>'

        let mut params = HashMap::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => break,
                Some(b',') => {
                    self.pos += 1;
                    break;
                }
                Some(b';') => {
                    self.pos += 1;
                    if let Some((name, value)) = self.parameter() {
                        params.entry(name).or_insert(value);
                    }
                }
                Some(_) => {
                    // Garbage between parameters; tolerate it.
                    self.pos += 1;
                }
            }
        }

        Some(LinkValue { target, params })
    }

    /// One `name[=value]` parameter; the terminating `;` or `,` is left in place
    fn parameter(&mut self) -> Option<(String, String)> {
        self.skip_ws();
        let start = self.pos;
        while self
            .peek()
            .map(|c| !matches!(c, b'=' | b';' | b',' | b' ' | b'\t'))
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        let name = String::from_utf8_lossy(&self.input[start..self.pos])
            .to_ascii_lowercase();
        self.skip_ws();
        if self.peek() != Some(b'=') {
            // Valueless parameter
            return Some((name, String::new()));
        }
        self.pos += 1;
        self.skip_ws();
        let value = if self.peek() == Some(b'"') {
            self.pos += 1;
            let mut buf = Vec::new();
            loop {
                match self.bump() {
                    None | Some(b'"') => break,
                    Some(b'\\') => {
                        if let Some(c) = self.bump() {
                            buf.push(c);
                        }
                    }
                    Some(c) => buf.push(c),
                }
            }
            String::from_utf8_lossy(&buf).into_owned()
        } else {
            let start = self.pos;
            while self
                .peek()
                .map(|c| !matches!(c, b';' | b',' | b' ' | b'\t'))
                .unwrap_or(false)
            {
                self.pos += 1;
            }
            String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
        };
        Some((name, value))
    }
}
