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

//! The outbound MTA.
//!
//! One SMTP transaction per recipient: resolve the destination's MX, dial
//! the single best exchange on port 25, EHLO, opportunistically STARTTLS,
//! transmit, QUIT. There is no queue and no retry schedule; any failure is
//! converted into a multipart/report DSN delivered back into the sender's
//! own maildrop, where the next POP3 poll picks it up.

use std::fmt::Write as _;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use chrono::prelude::*;
use log::{error, info, warn};
use openssl::ssl::{SslConnector, SslMethod};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
    domain_for_address, generate_envelope_id, Envelope, SmtpHost,
};
use crate::support::{async_io::NetStream, dns, log_prefix::LogPrefix};

const MAX_LINE: usize = 1024;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Relays `env` to each of its recipients. `authc` is the authenticated
/// submitter, used only for logging.
///
/// Failures never propagate to the caller; they become DSNs via
/// `host.deliver_message`.
pub async fn relay_message(
    host: Rc<dyn SmtpHost>,
    resolver: Option<Rc<dns::Resolver>>,
    env: Envelope,
    authc: String,
) {
    let log_prefix = LogPrefix::new(format!("relay:{}", env.id));
    log_prefix.set_user(authc);

    for rcpt in env.rcpt_to.clone() {
        let relay_host = match resolve_relay_host(
            &log_prefix,
            resolver.as_deref(),
            &rcpt,
        )
        .await
        {
            Ok(h) => h,
            Err(failure) => {
                deliver_relay_failure(
                    &log_prefix,
                    &*host,
                    resolver.as_deref(),
                    &env,
                    &rcpt,
                    failure,
                )
                .await;
                continue;
            },
        };

        info!(
            "{} sending to {:?} via {}",
            log_prefix, rcpt, relay_host,
        );

        if let Err(failure) =
            relay_to_host(&log_prefix, host.name(), &env, &rcpt, &relay_host)
                .await
        {
            deliver_relay_failure(
                &log_prefix,
                &*host,
                resolver.as_deref(),
                &env,
                &rcpt,
                failure,
            )
            .await;
        }
    }
}

/// A terminal relay error: the step that failed and its detail, in the form
/// the DSN's human-readable part reports them.
#[derive(Debug, PartialEq, Eq)]
pub struct RelayFailure {
    pub context: &'static str,
    pub detail: String,
}

impl RelayFailure {
    fn new(context: &'static str, detail: impl ToString) -> Self {
        Self {
            context,
            detail: detail.to_string(),
        }
    }
}

/// Picks the mail exchange for `rcpt`'s domain.
///
/// Only the single best-preference MX host is ever attempted; there is no
/// failover to secondary exchanges.
async fn resolve_relay_host(
    log_prefix: &LogPrefix,
    resolver: Option<&dns::Resolver>,
    rcpt: &str,
) -> Result<String, RelayFailure> {
    let domain = domain_for_address(rcpt);

    let Some(resolver) = resolver else {
        return Err(RelayFailure::new(
            "failed to lookup MX records",
            "no resolver available",
        ));
    };

    let records = dns::lookup_mx(resolver, domain).await.map_err(|e| {
        warn!("{} MX lookup for {:?} failed: {}", log_prefix, domain, e);
        RelayFailure::new("failed to lookup MX records", e)
    })?;

    match pick_mx_host(&records) {
        Some(host) => Ok(host),
        None => Err(RelayFailure::new(
            "failed to lookup MX records",
            format!("no MX records for {domain}"),
        )),
    }
}

/// The exchange with the lowest preference number, as a bare host name.
fn pick_mx_host(records: &[(dns::Name, u16)]) -> Option<String> {
    records
        .iter()
        .min_by_key(|&&(_, preference)| preference)
        .map(|(name, _)| {
            let ascii = name.to_ascii();
            ascii.trim_end_matches('.').to_owned()
        })
}

/// Runs one complete SMTP transaction for one recipient.
async fn relay_to_host(
    log_prefix: &LogPrefix,
    local_host_name: &str,
    env: &Envelope,
    rcpt: &str,
    relay_host: &str,
) -> Result<(), RelayFailure> {
    let sock = tokio::time::timeout(
        COMMAND_TIMEOUT,
        tokio::net::TcpStream::connect((relay_host, 25)),
    )
    .await
    .map_err(|_| RelayFailure::new("failed to dial host", "connect timeout"))?
    .map_err(|e| RelayFailure::new("failed to dial host", e))?;

    let sock = sock
        .into_std()
        .map_err(|e| RelayFailure::new("failed to dial host", e))?;
    let cxn = NetStream::from_socket(sock)
        .map_err(|e| RelayFailure::new("failed to dial host", e))?;

    let mut tx = Transaction {
        cxn,
        log_prefix,
        line_buffer: [0; MAX_LINE],
        line_buffer_len: 0,
    };

    tx.relay(local_host_name, env, rcpt, relay_host).await
}

struct Transaction<'a> {
    cxn: NetStream,
    log_prefix: &'a LogPrefix,

    line_buffer: [u8; MAX_LINE],
    line_buffer_len: usize,
}

#[derive(Clone, Copy, Default)]
struct Capabilities {
    starttls: bool,
}

impl Transaction<'_> {
    async fn relay(
        &mut self,
        local_host_name: &str,
        env: &Envelope,
        rcpt: &str,
        relay_host: &str,
    ) -> Result<(), RelayFailure> {
        // Greeting.
        let status = self.read_status("failed to dial host").await?;
        if !(200..300).contains(&status) {
            return Err(RelayFailure::new(
                "failed to dial host",
                format!("unexpected greeting {status}"),
            ));
        }

        let capabilities = self.hello(local_host_name).await?;

        if capabilities.starttls {
            self.command("STARTTLS", 220, "failed to STARTTLS").await?;

            let connector = SslConnector::builder(SslMethod::tls_client())
                .map_err(|e| RelayFailure::new("failed to STARTTLS", e))?
                .build();
            tokio::time::timeout(
                COMMAND_TIMEOUT,
                self.cxn.tls_connect(relay_host, &connector),
            )
            .await
            .map_err(|_| {
                RelayFailure::new("failed to STARTTLS", "handshake timeout")
            })?
            .map_err(|e| RelayFailure::new("failed to STARTTLS", e))?;

            // The session state reset with the TLS layer; greet again.
            self.hello(local_host_name)
                .await
                .map_err(|f| RelayFailure::new("failed to STARTTLS", f.detail))?;
        }

        self.command(
            &format!("MAIL FROM:<{}>", env.mail_from),
            250,
            "failed MAIL FROM",
        )
        .await?;
        self.command(
            &format!("RCPT TO:<{}>", rcpt),
            250,
            "failed to RCPT TO",
        )
        .await?;

        self.send_command("DATA")
            .await
            .map_err(|e| RelayFailure::new("failed to DATA", e))?;
        let status = self.read_status("failed to DATA").await?;
        if status != 354 {
            return Err(RelayFailure::new(
                "failed to DATA",
                format!("unexpected reply {status}"),
            ));
        }

        tokio::time::timeout(
            COMMAND_TIMEOUT + Duration::from_millis(env.data.len() as u64 / 4),
            write_dot_stuffed(&mut self.cxn, &env.data),
        )
        .await
        .map_err(|_| {
            RelayFailure::new("failed to write DATA", "transfer timeout")
        })?
        .map_err(|e| RelayFailure::new("failed to write DATA", e))?;

        let status = self.read_status("failed to close DATA").await?;
        if !(200..300).contains(&status) {
            return Err(RelayFailure::new(
                "failed to close DATA",
                format!("message rejected with {status}"),
            ));
        }

        // The message is accepted; whatever happens to QUIT is not our
        // problem.
        if self.send_command("QUIT").await.is_ok() {
            let _ = self.read_status("").await;
        }

        Ok(())
    }

    /// EHLO, falling back to HELO when the server rejects it.
    async fn hello(
        &mut self,
        local_host_name: &str,
    ) -> Result<Capabilities, RelayFailure> {
        let mut capabilities = Capabilities::default();

        self.send_command(&format!("EHLO {local_host_name}"))
            .await
            .map_err(|e| RelayFailure::new("failed to HELO", e))?;
        let status = self
            .read_responses("failed to HELO", |line| {
                if "STARTTLS".eq_ignore_ascii_case(line) {
                    capabilities.starttls = true;
                }
            })
            .await?;

        match status {
            200..=299 => return Ok(capabilities),
            500..=504 | 550 => (), // Pre-extension server; retry with HELO.
            _ => {
                return Err(RelayFailure::new(
                    "failed to HELO",
                    format!("unexpected reply {status}"),
                ))
            },
        }

        self.command(
            &format!("HELO {local_host_name}"),
            250,
            "failed to HELO",
        )
        .await?;
        Ok(Capabilities::default())
    }

    /// Sends `cmd` and requires the single expected success status.
    async fn command(
        &mut self,
        cmd: &str,
        expect: u32,
        context: &'static str,
    ) -> Result<(), RelayFailure> {
        self.send_command(cmd)
            .await
            .map_err(|e| RelayFailure::new(context, e))?;
        let status = self.read_status(context).await?;
        if status != expect {
            return Err(RelayFailure::new(
                context,
                format!("unexpected reply {status}"),
            ));
        }
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> io::Result<()> {
        info!("{} << {}", self.log_prefix, command);
        let io = async {
            self.cxn.write_all(command.as_bytes()).await?;
            self.cxn.write_all(b"\r\n").await?;
            self.cxn.flush().await
        };
        tokio::time::timeout(COMMAND_TIMEOUT, io).await.map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, "timeout sending command")
        })?
    }

    async fn read_status(
        &mut self,
        context: &'static str,
    ) -> Result<u32, RelayFailure> {
        self.read_responses(context, |_| ()).await
    }

    /// Reads response lines up to and including the final one, returning
    /// the final status code. `on_line` sees the text of each line.
    async fn read_responses(
        &mut self,
        context: &'static str,
        mut on_line: impl FnMut(&str),
    ) -> Result<u32, RelayFailure> {
        for _ in 0..1000 {
            let line = self
                .read_line()
                .await
                .map_err(|e| RelayFailure::new(context, e))?;
            info!("{} >> {:?}", self.log_prefix, line);

            let parsed = parse_response_line(&line);
            let Some((status, last, comment)) = parsed else {
                return Err(RelayFailure::new(context, "bad SMTP response"));
            };
            on_line(&comment);
            self.consume_line();

            if last {
                return Ok(status);
            }
        }

        Err(RelayFailure::new(context, "too many response lines"))
    }

    /// Reads from the server until `line_buffer` holds a full line, which
    /// is returned without its ending.
    async fn read_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(ix) = memchr::memchr(
                b'\n',
                &self.line_buffer[..self.line_buffer_len],
            ) {
                let s = String::from_utf8_lossy(&self.line_buffer[..ix])
                    .trim_end_matches('\r')
                    .to_owned();
                return Ok(s);
            }

            if self.line_buffer_len >= MAX_LINE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "server response line too long",
                ));
            }

            let n = tokio::time::timeout(
                COMMAND_TIMEOUT,
                self.cxn.read(&mut self.line_buffer[self.line_buffer_len..]),
            )
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timeout reading server response",
                )
            })??;

            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            self.line_buffer_len += n;
        }
    }

    /// Discards the first buffered line, including its ending.
    fn consume_line(&mut self) {
        let Some(eol) =
            memchr::memchr(b'\n', &self.line_buffer[..self.line_buffer_len])
        else {
            return;
        };
        self.line_buffer.copy_within(eol + 1..self.line_buffer_len, 0);
        self.line_buffer_len -= eol + 1;
    }
}

/// Parses `NNN[- ]text`, returning (status, is-final, text).
fn parse_response_line(s: &str) -> Option<(u32, bool, String)> {
    let status = s.get(0..3)?.parse::<u32>().ok()?;
    let (last, comment) = match s.get(3..4) {
        None => (true, ""),
        Some(" ") => (true, s.get(4..).unwrap_or("")),
        Some("-") => (false, s.get(4..).unwrap_or("")),
        Some(_) => return None,
    };

    Some((status, last, comment.to_owned()))
}

/// Writes `data` to the wire dot-stuffed, converting LF line endings to
/// CRLF, and finishes with the `.` terminator. Also used by POP3 `RETR`.
pub(crate) async fn write_dot_stuffed(
    dst: &mut (impl AsyncWriteExt + Unpin),
    data: &[u8],
) -> io::Result<()> {
    let mut dst = tokio::io::BufWriter::new(dst);
    let mut rest = data;

    while !rest.is_empty() {
        let (line, tail) = match memchr::memchr(b'\n', rest) {
            Some(ix) => (&rest[..ix], &rest[ix + 1..]),
            None => (rest, &[][..]),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line.first() == Some(&b'.') {
            dst.write_all(b".").await?;
        }
        dst.write_all(line).await?;
        dst.write_all(b"\r\n").await?;

        rest = tail;
    }

    dst.write_all(b".\r\n").await?;
    dst.flush().await
}

/// Converts a relay failure into a DSN envelope and delivers it locally.
async fn deliver_relay_failure(
    log_prefix: &LogPrefix,
    host: &dyn SmtpHost,
    resolver: Option<&dns::Resolver>,
    env: &Envelope,
    rcpt: &str,
    failure: RelayFailure,
) {
    error!(
        "{} {}: {} (recipient {:?})",
        log_prefix, failure.context, failure.detail, rcpt,
    );

    let reporting_mta = match resolver {
        Some(resolver) => {
            dns::reverse_lookup(resolver, env.remote_addr.ip()).await
        },
        None => None,
    };

    let dsn = synthesize_failure_dsn(
        env,
        rcpt,
        &failure,
        reporting_mta.as_deref(),
        Utc::now(),
    );

    if host.deliver_message(dsn).await.is_some() {
        error!("{} failed to deliver DSN", log_prefix);
    }
}

/// Builds the RFC 3464-shaped failure notification for `env`'s sender.
pub fn synthesize_failure_dsn(
    env: &Envelope,
    failed_rcpt: &str,
    failure: &RelayFailure,
    reporting_mta: Option<&str>,
    now: DateTime<Utc>,
) -> Envelope {
    let mail_from =
        format!("mailbox@{}", domain_for_address(&env.mail_from));
    let id = generate_envelope_id("f", now);
    let boundary = format!(
        "{:016x}{:016x}",
        rand::thread_rng().gen::<u64>(),
        rand::thread_rng().gen::<u64>(),
    );
    let date = now.format("%a, %d %b %Y %H:%M:%S %z");

    let mut body = String::new();
    let _ = write!(
        body,
        "From: \"mailpopbox\" <{mail_from}>\n\
         To: <{to}>\n\
         Subject: Delivery Status Notification (Failure)\n\
         X-Failed-Recipients: {failed_rcpt}\n\
         Message-ID: {id}\n\
         Date: {date}\n\
         Content-Type: multipart/report; boundary={boundary}; \
         report-type=delivery-status\n\n",
        to = env.mail_from,
    );

    let _ = write!(
        body,
        "--{boundary}\n\
         Content-Type: text/plain; charset=UTF-8\n\n\
         * * * Delivery Failure * * *\n\n\
         The server failed to relay the message:\n\n\
         {context}:\n{detail}\n",
        context = failure.context,
        detail = failure.detail,
    );

    let _ = write!(
        body,
        "--{boundary}\n\
         Content-Type: message/delivery-status\n\n\
         Original-Envelope-ID: {orig_id}\n",
        orig_id = env.id,
    );
    let _ = write!(body, "Reporting-UA: {}\n", env.ehlo);
    if let Some(mta) = reporting_mta {
        let _ = write!(body, "Reporting-MTA: dns; {mta}\n");
    }
    let _ = write!(body, "X-Remote-Address: {}\n", env.remote_addr);
    let _ = write!(
        body,
        "Date: {}\n",
        env.received_at.format("%a, %d %b %Y %H:%M:%S %z"),
    );

    let _ = write!(
        body,
        "--{boundary}\n\
         Content-Type: message/rfc822\n\n",
    );

    let mut data = body.into_bytes();
    data.extend_from_slice(&env.data);
    data.extend_from_slice(format!("\n--{boundary}--\n").as_bytes());

    Envelope {
        remote_addr: env.remote_addr,
        ehlo: env.ehlo.clone(),
        mail_from,
        rcpt_to: vec![env.mail_from.clone()],
        data,
        received_at: now,
        id,
    }
}
