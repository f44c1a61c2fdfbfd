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

//! The per-connection ESMTP receive/submit state machine.

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::str;
use std::time::Duration;

use chrono::prelude::*;
use log::{info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};

use super::syntax::{is_valid_address, looks_like_known_command, Command};
use super::{
    generate_envelope_id, sendas, domain_for_address, Envelope, ReplyLine,
    SmtpHost, MAX_MESSAGE_SIZE, REPLY_AUTH_OK, REPLY_BAD_MAILBOX,
    REPLY_BAD_SEQUENCE, REPLY_BAD_SYNTAX, REPLY_OK,
};
use crate::support::{
    async_io::NetStream, dns, error::Error, log_prefix::LogPrefix,
};

const MAX_LINE: usize = 1024;
/// Cap on a single line inside DATA; RFC 5322 wants far less.
const MAX_DATA_LINE: usize = 1 << 20;
const MAX_RECIPIENTS: usize = 50;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
const DATA_TIMEOUT: Duration = Duration::from_secs(1800);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Before EHLO, and again right after a TLS handshake.
    New,
    Initial,
    Mail,
    Recipient,
}

/// Serves one SMTP connection to completion.
///
/// `resolver` is used for the reverse lookup in the received trace; `None`
/// skips the lookup. The TLS configuration is snapshotted from the host up
/// front, so a reload affects only later connections.
pub async fn serve(
    io: NetStream,
    host: Rc<dyn SmtpHost>,
    resolver: Option<Rc<dns::Resolver>>,
    log_prefix: LogPrefix,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
) -> Result<(), Error> {
    let tls_acceptor = host.tls_acceptor();
    let mut conn = Conn {
        io: BufStream::new(io),
        host,
        resolver,
        log_prefix,
        remote_addr,
        local_addr,
        tls_acceptor,
        state: State::New,
        esmtp: false,
        ehlo: String::new(),
        authc: String::new(),
        mail_from: String::new(),
        rcpt_to: Vec::new(),
        quit: false,
    };

    conn.run().await
}

struct Conn {
    io: BufStream<NetStream>,
    host: Rc<dyn SmtpHost>,
    resolver: Option<Rc<dns::Resolver>>,
    log_prefix: LogPrefix,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    tls_acceptor: Option<SslAcceptor>,

    state: State,
    esmtp: bool,
    ehlo: String,
    /// The authcid from a PLAIN login; non-empty iff TLS is active and AUTH
    /// succeeded.
    authc: String,
    mail_from: String,
    rcpt_to: Vec<String>,
    quit: bool,
}

impl Conn {
    async fn run(&mut self) -> Result<(), Error> {
        info!("{} accepted connection", self.log_prefix);
        let greeting = format!(
            "{} ESMTP [{}] (mailpopbox)",
            self.host.name(),
            self.local_addr,
        );
        self.write_reply(220, &greeting).await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        buffer.clear();
        tokio::time::timeout(
            COMMAND_TIMEOUT,
            (&mut self.io).take(MAX_LINE as u64).read_until(b'\n', buffer),
        )
        .await
        .map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for command",
            ))
        })??;

        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                self.write_reply(500, "line too long").await?;

                // Skip the rest of the oversized line.
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }

                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        let line_ending_len = if buffer.ends_with(b"\r\n") { 2 } else { 1 };
        let line = &buffer[..buffer.len() - line_ending_len];

        if line.contains(&0) {
            warn!("{} remote is speaking binary, closing", self.log_prefix);
            self.quit = true;
            return Ok(());
        }

        let Ok(line) = str::from_utf8(line) else {
            return self.reply(&REPLY_BAD_SYNTAX).await;
        };

        info!("{} << {:?}", self.log_prefix, line);

        let command = match line.parse::<Command>() {
            Ok(c) => c,
            Err(()) => {
                return if looks_like_known_command(line) {
                    self.reply(&REPLY_BAD_SYNTAX).await
                } else {
                    self.write_reply(500, "unrecognized command").await
                };
            },
        };

        match command {
            Command::Helo(command, origin) => {
                self.cmd_helo(command, origin).await
            },
            Command::Auth(mechanism, initial) => {
                self.cmd_auth(mechanism, initial).await
            },
            Command::MailFrom(path, size) => {
                self.cmd_mail(path, size).await
            },
            Command::Recipient(path) => self.cmd_rcpt(path).await,
            Command::Data => self.cmd_data().await,
            Command::Reset => self.cmd_rset().await,
            Command::StartTls => self.cmd_starttls().await,
            Command::Verify => self.write_reply(252, "I'll do my best").await,
            Command::Expand => self.write_reply(550, "access denied").await,
            Command::Help => {
                self.write_reply(250, "https://tools.ietf.org/html/rfc5321")
                    .await
            },
            Command::Noop => self.reply(&REPLY_OK).await,
            Command::Quit => {
                self.quit = true;
                self.write_reply(221, "Goodbye").await
            },
        }
    }

    async fn cmd_helo(
        &mut self,
        command: String,
        origin: String,
    ) -> Result<(), Error> {
        self.esmtp = "EHLO".eq_ignore_ascii_case(&command);
        self.ehlo = origin;
        self.mail_from.clear();
        self.rcpt_to.clear();
        self.state = State::Initial;

        info!("{} {} {}", self.log_prefix, command, self.ehlo);

        if !self.esmtp {
            return self
                .write_reply(
                    250,
                    &format!("Hello {} [{}]", self.ehlo, self.remote_addr),
                )
                .await;
        }

        self.write_continuation(
            250,
            &format!("Hello {} [{}]", self.ehlo, self.remote_addr),
        )
        .await?;
        if self.tls_acceptor.is_some() && !self.io.get_ref().is_tls() {
            self.write_continuation(250, "STARTTLS").await?;
        }
        if self.io.get_ref().is_tls() {
            self.write_continuation(250, "AUTH PLAIN").await?;
        }
        self.write_reply(250, &format!("SIZE {}", MAX_MESSAGE_SIZE)).await
    }

    async fn cmd_starttls(&mut self) -> Result<(), Error> {
        if self.state != State::Initial {
            return self.reply(&REPLY_BAD_SEQUENCE).await;
        }

        if !self.esmtp
            || self.tls_acceptor.is_none()
            || self.io.get_ref().is_tls()
        {
            return self.write_reply(500, "unrecognized command").await;
        }

        self.write_reply(220, "initiate TLS connection").await?;

        let acceptor = self.tls_acceptor.take().unwrap();
        if let Err(e) = self.io.get_ref().tls_accept(&acceptor).await {
            warn!("{} TLS handshake failed: {}", self.log_prefix, e);
            self.quit = true;
            return Ok(());
        }

        // RFC 3207: the session restarts; the client must EHLO again.
        self.state = State::New;
        info!(
            "{} TLS connection done ({})",
            self.log_prefix,
            self.io.get_ref().transport_string(),
        );

        Ok(())
    }

    async fn cmd_auth(
        &mut self,
        mechanism: Option<String>,
        initial: Option<String>,
    ) -> Result<(), Error> {
        if self.state != State::Initial || !self.io.get_ref().is_tls() {
            return self.reply(&REPLY_BAD_SEQUENCE).await;
        }

        if !self.authc.is_empty() {
            return self.write_reply(503, "already authenticated").await;
        }

        let Some(mechanism) = mechanism else {
            return self.reply(&REPLY_BAD_SYNTAX).await;
        };

        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            return self.write_reply(504, "unrecognized auth type").await;
        }

        let auth_line = match initial {
            Some(initial) => initial,
            None => {
                // Bare continuation prompt per RFC 4954.
                self.io.write_all(b"334 \r\n").await?;
                self.io.flush().await?;

                let mut buffer = Vec::new();
                (&mut self.io)
                    .take(MAX_LINE as u64)
                    .read_until(b'\n', &mut buffer)
                    .await?;
                if !buffer.ends_with(b"\n") {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "EOF in AUTH exchange",
                    )));
                }

                let _ = buffer.pop();
                if buffer.last() == Some(&b'\r') {
                    let _ = buffer.pop();
                }
                String::from_utf8_lossy(&buffer).into_owned()
            },
        };

        let Ok(decoded) = base64::decode(auth_line.trim()) else {
            return self.reply(&REPLY_BAD_SYNTAX).await;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return self.reply(&REPLY_BAD_SYNTAX).await;
        };

        let parts = decoded.split('\x00').collect::<Vec<_>>();
        let &[authz, authc, password] = parts.as_slice() else {
            return self.reply(&REPLY_BAD_SYNTAX).await;
        };

        if !self.host.authenticate(authz, authc, password) {
            warn!("{} failed to authenticate {:?}", self.log_prefix, authc);
            return self.write_reply(535, "invalid credentials").await;
        }

        info!("{} authenticated {:?}", self.log_prefix, authc);
        self.authc = authc.to_owned();
        self.log_prefix.set_user(self.authc.clone());
        self.reply(&REPLY_AUTH_OK).await
    }

    async fn cmd_mail(
        &mut self,
        path: String,
        size: Option<u64>,
    ) -> Result<(), Error> {
        if self.state != State::Initial {
            return self.reply(&REPLY_BAD_SEQUENCE).await;
        }

        let address = path.to_lowercase();
        if !address.is_empty() && !is_valid_address(&address) {
            return self.reply(&REPLY_BAD_SYNTAX).await;
        }

        if size.unwrap_or(0) > MAX_MESSAGE_SIZE {
            return self
                .write_reply(
                    552,
                    &format!("maximum message size is {}", MAX_MESSAGE_SIZE),
                )
                .await;
        }

        if self.authc.is_empty() {
            // Unauthenticated senders may not claim an address we are
            // authoritative for.
            if !address.is_empty() && self.is_local_address(&address) {
                warn!(
                    "{} rejected local return path {:?} without auth",
                    self.log_prefix, address,
                );
                return self.reply(&REPLY_BAD_MAILBOX).await;
            }
        } else {
            let allowed =
                format!("mailbox@{}", domain_for_address(&self.authc));
            if !address.eq_ignore_ascii_case(&allowed) {
                warn!(
                    "{} submission return path {:?} not permitted for {:?}",
                    self.log_prefix, address, self.authc,
                );
                return self.reply(&REPLY_BAD_MAILBOX).await;
            }
        }

        info!("{} MAIL FROM {:?}", self.log_prefix, address);
        self.mail_from = address;
        self.state = State::Mail;
        self.reply(&REPLY_OK).await
    }

    async fn cmd_rcpt(&mut self, path: String) -> Result<(), Error> {
        if self.state != State::Mail && self.state != State::Recipient {
            return self.reply(&REPLY_BAD_SEQUENCE).await;
        }

        let address = path.to_lowercase();
        if !is_valid_address(&address) {
            return self.reply(&REPLY_BAD_SYNTAX).await;
        }

        if self.rcpt_to.len() >= MAX_RECIPIENTS {
            return self.write_reply(452, "too many recipients").await;
        }

        if self.authc.is_empty() {
            let reply = self.host.verify_address(&address);
            if reply != REPLY_OK {
                warn!(
                    "{} invalid address {:?}: {}",
                    self.log_prefix, address, reply,
                );
                return self.reply(&reply).await;
            }
        } else if self.is_local_address(&address) {
            // Authenticated submission is for outbound mail only.
            warn!(
                "{} rejected internal relay to {:?}",
                self.log_prefix, address,
            );
            return self.reply(&REPLY_BAD_MAILBOX).await;
        }

        info!("{} RCPT TO {:?}", self.log_prefix, address);
        self.rcpt_to.push(address);
        self.state = State::Recipient;
        self.reply(&REPLY_OK).await
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        if self.state != State::Recipient {
            return self.reply(&REPLY_BAD_SEQUENCE).await;
        }

        self.write_reply(354, "Start mail input; end with <CRLF>.<CRLF>")
            .await?;

        let body = tokio::time::timeout(DATA_TIMEOUT, self.read_data_body())
            .await
            .map_err(|_| {
                Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out reading DATA",
                ))
            })?;

        let body = match body {
            Ok(Some(body)) => body,
            Ok(None) | Err(_) => {
                // Oversized or broken payload; the transaction is void
                // either way.
                self.state = State::Initial;
                self.mail_from.clear();
                self.rcpt_to.clear();
                return self.write_reply(552, "transaction failed").await;
            },
        };

        let received_at = Utc::now();
        let id = generate_envelope_id("m", received_at);
        info!(
            "{} received message id={} bytes={}",
            self.log_prefix,
            id,
            body.len(),
        );

        let mut data = self.received_trace(&id, received_at).await.into_bytes();
        data.extend_from_slice(&body);

        let mut env = Envelope {
            remote_addr: self.remote_addr,
            ehlo: self.ehlo.clone(),
            mail_from: std::mem::take(&mut self.mail_from),
            rcpt_to: std::mem::take(&mut self.rcpt_to),
            data,
            received_at,
            id,
        };

        self.state = State::Initial;

        if self.authc.is_empty() {
            if let Some(reply) = self.host.deliver_message(env).await {
                warn!("{} message was rejected", self.log_prefix);
                return self.reply(&reply).await;
            }
        } else {
            sendas::rewrite_send_as(&self.log_prefix, &mut env, &self.authc);
            self.host.relay_message(env, &self.authc);
        }

        self.reply(&REPLY_OK).await
    }

    async fn cmd_rset(&mut self) -> Result<(), Error> {
        self.state = State::Initial;
        self.mail_from.clear();
        self.rcpt_to.clear();
        self.reply(&REPLY_OK).await
    }

    async fn read_data_body(&mut self) -> Result<Option<Vec<u8>>, Error> {
        read_dot_stuffed(&mut self.io, MAX_MESSAGE_SIZE as usize).await
    }

    /// Builds the received-trace block prepended to the message data.
    async fn received_trace(
        &self,
        id: &str,
        received_at: DateTime<Utc>,
    ) -> String {
        let ip = self.remote_addr.ip();
        let rhost = match self.resolver {
            Some(ref resolver) => {
                match dns::reverse_lookup(resolver, ip).await {
                    Some(name) => format!("{name} [{ip}]"),
                    None => ip.to_string(),
                }
            },
            None => ip.to_string(),
        };

        let mut with = String::from("SMTP");
        if self.esmtp {
            with.insert(0, 'E');
        }
        if self.io.get_ref().is_tls() {
            with.push('S');
        }

        format!(
            "Received: from {ehlo} ({rhost})\r\n        \
             by {name} (mailpopbox) with {with} id {id}\r\n        \
             for <{rcpt}>\r\n        \
             (using {transport});\r\n        \
             {date}\r\n",
            ehlo = self.ehlo,
            name = self.host.name(),
            rcpt = self.rcpt_to[0],
            transport = self.io.get_ref().transport_string(),
            date = received_at.format("%a, %d %b %Y %H:%M:%S %z"),
        )
    }

    /// Whether the address's domain is one this server is authoritative
    /// for. A blacklisted address still counts as local.
    fn is_local_address(&self, address: &str) -> bool {
        self.host.verify_address(address).code != REPLY_BAD_MAILBOX.code
    }

    async fn reply(&mut self, reply: &ReplyLine) -> Result<(), Error> {
        self.write_reply(reply.code, &reply.message).await
    }

    async fn write_reply(
        &mut self,
        code: u16,
        message: &str,
    ) -> Result<(), Error> {
        let line = if message.is_empty() {
            format!("{code}\r\n")
        } else {
            format!("{code} {message}\r\n")
        };
        self.io.write_all(line.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn write_continuation(
        &mut self,
        code: u16,
        message: &str,
    ) -> Result<(), Error> {
        let line = format!("{code}-{message}\r\n");
        self.io.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Reads a dot-stuffed DATA payload up to and including the `.` terminator,
/// unstuffing and normalising line endings to LF.
///
/// `None` when the payload exceeded `limit`; the stream is left positioned
/// after the terminator either way.
async fn read_dot_stuffed(
    io: &mut (impl tokio::io::AsyncBufRead + Unpin),
    limit: usize,
) -> Result<Option<Vec<u8>>, Error> {
    let mut data = Vec::<u8>::new();
    let mut line = Vec::<u8>::new();
    let mut overrun = false;

    loop {
        line.clear();
        (&mut *io)
            .take(MAX_DATA_LINE as u64)
            .read_until(b'\n', &mut line)
            .await?;

        if !line.ends_with(b"\n") {
            return Err(Error::Io(io::Error::new(
                if line.len() >= MAX_DATA_LINE {
                    io::ErrorKind::InvalidData
                } else {
                    io::ErrorKind::UnexpectedEof
                },
                "broken DATA payload",
            )));
        }

        let _ = line.pop();
        if line.last() == Some(&b'\r') {
            let _ = line.pop();
        }

        if line == b"." {
            break;
        }

        let content: &[u8] = if line.first() == Some(&b'.') {
            &line[1..]
        } else {
            &line
        };

        if !overrun && data.len() + content.len() + 1 > limit {
            overrun = true;
            data = Vec::new();
        }

        if !overrun {
            data.extend_from_slice(content);
            data.push(b'\n');
        }
    }

    Ok(if overrun { None } else { Some(data) })
}
