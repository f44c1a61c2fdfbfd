//-
// Copyright (c) 2026, the Mailpopbox Authors
//
// This file is part of Mailpopbox.
//
// Mailpopbox is free software: you can redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailpopbox is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailpopbox. If not, see <http://www.gnu.org/licenses/>.

//! The ESMTP receive/submit server and the outbound relay.

pub mod conn;
pub mod relay;
pub mod sendas;
pub mod syntax;

#[cfg(test)]
pub(crate) mod integration_test_common;
#[cfg(test)]
mod integration_tests;

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;

use chrono::prelude::*;
use futures::future::LocalBoxFuture;
use openssl::ssl::SslAcceptor;
use rand::Rng;

/// An SMTP reply: a three-digit code and its text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,
    pub message: Cow<'static, str>,
}

impl ReplyLine {
    pub const fn new(code: u16, message: &'static str) -> Self {
        Self {
            code,
            message: Cow::Borrowed(message),
        }
    }
}

impl fmt::Display for ReplyLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

pub const REPLY_OK: ReplyLine = ReplyLine::new(250, "OK");
pub const REPLY_AUTH_OK: ReplyLine = ReplyLine::new(235, "auth success");
pub const REPLY_BAD_SYNTAX: ReplyLine = ReplyLine::new(501, "syntax error");
pub const REPLY_BAD_SEQUENCE: ReplyLine =
    ReplyLine::new(503, "bad sequence of commands");
pub const REPLY_BAD_MAILBOX: ReplyLine =
    ReplyLine::new(550, "mailbox unavailable");
pub const REPLY_MAILBOX_UNALLOWED: ReplyLine =
    ReplyLine::new(553, "mailbox name not allowed");

/// The size advertised in the EHLO response and enforced on DATA.
pub const MAX_MESSAGE_SIZE: u64 = 40_960_000;

/// The routing record for one accepted message.
///
/// `data` carries the RFC 5322 message bytes with dot-stuffing removed and
/// line endings normalised to LF, prefixed by the CRLF-terminated
/// `Received:` trace block the receiver synthesized.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub remote_addr: SocketAddr,
    pub ehlo: String,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub data: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub id: String,
}

/// Generates an envelope id of the form `<prefix>.<nanos>.<8 hex chars>`.
///
/// The high-resolution timestamp plus four random bytes make collision
/// within a process lifetime negligibly improbable; no other uniqueness
/// guard exists.
pub fn generate_envelope_id(prefix: &str, t: DateTime<Utc>) -> String {
    format!(
        "{}.{}.{:08x}",
        prefix,
        t.timestamp_nanos_opt().unwrap_or_default(),
        rand::thread_rng().gen::<u32>(),
    )
}

/// The domain of an address, i.e. everything after the last `@`. Empty when
/// there is no `@`.
pub fn domain_for_address(address: &str) -> &str {
    match address.rfind('@') {
        Some(idx) => &address[idx + 1..],
        None => "",
    }
}

/// Writes the maildrop framing for `env`: the `Delivered-To:` and
/// `Return-Path:` headers, then the message bytes verbatim.
pub fn write_envelope_for_delivery(
    w: &mut impl Write,
    env: &Envelope,
) -> io::Result<()> {
    write!(w, "Delivered-To: <{}>\r\n", env.rcpt_to[0])?;
    write!(w, "Return-Path: <{}>\r\n", env.mail_from)?;
    w.write_all(&env.data)
}

/// The capabilities the SMTP connection state machine requires of its host.
///
/// There is one production implementation (the daemon) and small fakes in
/// tests.
pub trait SmtpHost {
    /// The hostname used in the greeting and the received trace.
    fn name(&self) -> &str;

    /// The server-side TLS configuration for `STARTTLS`, if any.
    fn tls_acceptor(&self) -> Option<SslAcceptor>;

    /// Whether `address` is deliverable here: its domain is authoritative
    /// and the address is not blacklisted.
    fn verify_address(&self, address: &str) -> ReplyLine;

    /// Whether `authc` + `password` may send mail as `authz` (empty `authz`
    /// means "as itself").
    fn authenticate(&self, authz: &str, authc: &str, password: &str) -> bool;

    /// Writes `env` into the maildrop for its first recipient's domain.
    /// `None` on success, a reply to surface to the client on failure.
    ///
    /// Returns a future because delivery touches the filesystem, and disk
    /// I/O must not stall the other connections sharing the executor.
    fn deliver_message(
        &self,
        env: Envelope,
    ) -> LocalBoxFuture<'_, Option<ReplyLine>>;

    /// Hands `env` to the outbound MTA. Asynchronous; the caller replies
    /// `250` as soon as the handoff is made. `authc` is the authenticated
    /// submitter.
    fn relay_message(&self, env: Envelope, authc: &str);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn named_reply_vocabulary() {
        assert_eq!("250 OK", REPLY_OK.to_string());
        assert_eq!(235, REPLY_AUTH_OK.code);
        assert_eq!(501, REPLY_BAD_SYNTAX.code);
        assert_eq!(503, REPLY_BAD_SEQUENCE.code);
        assert_eq!("550 mailbox unavailable", REPLY_BAD_MAILBOX.to_string());
        assert_eq!(
            "553 mailbox name not allowed",
            REPLY_MAILBOX_UNALLOWED.to_string(),
        );
    }

    #[test]
    fn envelope_id_shape() {
        let t = Utc::now();
        let id = generate_envelope_id("m", t);
        let mut parts = id.split('.');
        assert_eq!(Some("m"), parts.next());
        assert_eq!(
            t.timestamp_nanos_opt().unwrap().to_string(),
            parts.next().unwrap(),
        );
        let entropy = parts.next().unwrap();
        assert_eq!(8, entropy.len());
        assert!(entropy.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(None, parts.next());
    }

    #[test]
    fn envelope_ids_are_distinct() {
        let t = Utc::now();
        // Same instant, different entropy.
        assert_ne!(generate_envelope_id("m", t), generate_envelope_id("m", t));
    }

    #[test]
    fn domain_extraction() {
        assert_eq!("foo.com", domain_for_address("user@foo.com"));
        assert_eq!("b.com", domain_for_address("weird@a@b.com"));
        assert_eq!("", domain_for_address("nodomain"));
        assert_eq!("", domain_for_address(""));
    }

    #[test]
    fn delivery_framing() {
        let env = Envelope {
            remote_addr: "127.0.0.1:25".parse().unwrap(),
            ehlo: "client.example.com".to_owned(),
            mail_from: "sender@remote.net".to_owned(),
            rcpt_to: vec![
                "jones@foo.com".to_owned(),
                "brown@foo.com".to_owned(),
            ],
            data: b"Subject: hi\n\nbody\n".to_vec(),
            received_at: Utc::now(),
            id: "m.1.00000000".to_owned(),
        };

        let mut out = Vec::new();
        write_envelope_for_delivery(&mut out, &env).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("Delivered-To: <jones@foo.com>\r\n"));
        assert!(out.contains("Return-Path: <sender@remote.net>\r\n"));
        assert!(out.ends_with("Subject: hi\n\nbody\n"));
    }
}
