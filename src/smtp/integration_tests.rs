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

//! Session-level tests driving the real SMTP state machine over a socket
//! pair.

use std::io;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use openssl::ssl::SslAcceptor;

use super::integration_test_common::*;
use super::*;
use crate::support::{async_io::NetStream, error::Error, log_prefix::LogPrefix};

#[derive(Clone, Copy, Default)]
struct HostParams {
    domain: &'static str,
    blocklist: &'static [&'static str],
    with_tls: bool,
    /// Exact (authz, authc, password) triple accepted by AUTH.
    credentials: Option<(&'static str, &'static str, &'static str)>,
}

/// What the fake host observed, shared back to the test thread.
#[derive(Default)]
struct HostRecorder {
    delivered: Mutex<Vec<Envelope>>,
    relayed: Mutex<Vec<(Envelope, String)>>,
}

struct TestHost {
    params: HostParams,
    tls: Option<SslAcceptor>,
    recorder: Arc<HostRecorder>,
}

impl SmtpHost for TestHost {
    fn name(&self) -> &str {
        "Test-Server"
    }

    fn tls_acceptor(&self) -> Option<SslAcceptor> {
        self.tls.clone()
    }

    fn verify_address(&self, address: &str) -> ReplyLine {
        if !domain_for_address(address)
            .eq_ignore_ascii_case(self.params.domain)
        {
            return REPLY_BAD_MAILBOX;
        }

        for blocked in self.params.blocklist {
            if blocked.eq_ignore_ascii_case(address) {
                return REPLY_BAD_MAILBOX;
            }
        }

        REPLY_OK
    }

    fn authenticate(&self, authz: &str, authc: &str, password: &str) -> bool {
        match self.params.credentials {
            Some((z, c, p)) => authz == z && authc == c && password == p,
            None => false,
        }
    }

    fn deliver_message(
        &self,
        env: Envelope,
    ) -> futures::future::LocalBoxFuture<'_, Option<ReplyLine>> {
        Box::pin(async move {
            self.recorder.delivered.lock().unwrap().push(env);
            None
        })
    }

    fn relay_message(&self, env: Envelope, authc: &str) {
        self.recorder
            .relayed
            .lock()
            .unwrap()
            .push((env, authc.to_owned()));
    }
}

fn connect(
    cxn_name: &'static str,
    params: HostParams,
) -> (LineClient, Arc<HostRecorder>) {
    let recorder = Arc::new(HostRecorder::default());
    let (server_io, client_io) = UnixStream::pair().unwrap();

    let server_recorder = Arc::clone(&recorder);
    std::thread::spawn(move || {
        run_server(server_io, cxn_name, params, server_recorder)
    });

    (LineClient::new(cxn_name, client_io), recorder)
}

#[tokio::main(flavor = "current_thread")]
async fn run_server(
    server_io: UnixStream,
    cxn_name: &'static str,
    params: HostParams,
    recorder: Arc<HostRecorder>,
) {
    crate::init_test_log();

    let host = Rc::new(TestHost {
        tls: params.with_tls.then(ssl_acceptor),
        params,
        recorder,
    });

    let io = NetStream::from_socket(server_io).unwrap();
    let local = tokio::task::LocalSet::new();
    let result = local
        .run_until(super::conn::serve(
            io,
            host,
            None,
            LogPrefix::new(cxn_name.to_owned()),
            "192.0.2.7:4321".parse().unwrap(),
            "192.0.2.1:925".parse().unwrap(),
        ))
        .await;

    match result {
        Ok(()) => (),
        // The client hanging up without QUIT is fine.
        Err(Error::Io(e))
            if io::ErrorKind::UnexpectedEof == e.kind()
                || io::ErrorKind::BrokenPipe == e.kind() => {},
        Err(e) => panic!("unexpected server error: {e}"),
    }
}

fn b64(s: &str) -> String {
    base64::encode(s)
}

#[test]
fn inbound_delivery() {
    let (mut client, recorder) = connect(
        "inbound",
        HostParams {
            domain: "foo.com",
            blocklist: &["Green@foo.com"],
            ..HostParams::default()
        },
    );

    let greeting = client.read_line();
    assert!(greeting.starts_with("220 Test-Server ESMTP ["));
    assert!(greeting.ends_with("] (mailpopbox)"));

    client.write_line("EHLO greet.test");
    let responses = client.read_responses();
    assert!(responses[0].starts_with("250-Hello greet.test [192.0.2.7:4321]"));
    assert!(responses.last().unwrap().starts_with("250 SIZE 40960000"));

    client.simple_command("MAIL FROM:<Smith@bar.com>", "250");
    client.simple_command("RCPT TO:<Jones@foo.com>", "250");
    client.simple_command("RCPT TO:<Green@foo.com>", "550");
    client.simple_command("RCPT TO:<Brown@foo.com>", "250");

    client.simple_command("DATA", "354");
    client.write_line("Blah blah blah...");
    client.write_line("...etc. etc. etc.");
    client.simple_command(".", "250");

    client.simple_command("QUIT", "221");

    let delivered = recorder.delivered.lock().unwrap();
    assert_eq!(1, delivered.len());
    let env = &delivered[0];
    assert_eq!("smith@bar.com", env.mail_from);
    assert_eq!(
        vec!["jones@foo.com".to_owned(), "brown@foo.com".to_owned()],
        env.rcpt_to,
    );

    let data = std::str::from_utf8(&env.data).unwrap();
    assert!(data.starts_with("Received: from greet.test (192.0.2.7)\r\n"));
    assert!(data
        .contains(&format!("by Test-Server (mailpopbox) with ESMTP id {}", env.id)));
    assert!(data.contains("for <jones@foo.com>\r\n"));
    assert!(data.contains("(using PLAINTEXT);\r\n"));
    assert!(data.ends_with("Blah blah blah...\n...etc. etc. etc.\n"));
}

#[test]
fn helo_uses_smtp_trace_token() {
    let (mut client, recorder) = connect(
        "helo",
        HostParams {
            domain: "foo.com",
            ..HostParams::default()
        },
    );

    client.read_line();
    client.simple_command("HELO old.test", "250 Hello old.test");
    client.simple_command("MAIL FROM:<smith@bar.com>", "250");
    client.simple_command("RCPT TO:<jones@foo.com>", "250");
    client.simple_command("DATA", "354");
    client.simple_command(".", "250");
    client.simple_command("QUIT", "221");

    let delivered = recorder.delivered.lock().unwrap();
    let data = std::str::from_utf8(&delivered[0].data).unwrap();
    assert!(data.contains("with SMTP id "));
}

#[test]
fn data_unstuffs_dots() {
    let (mut client, recorder) = connect(
        "stuffing",
        HostParams {
            domain: "foo.com",
            ..HostParams::default()
        },
    );

    client.read_line();
    client.simple_command("EHLO stuff.test", "250");
    client.simple_command("MAIL FROM:<a@bar.com>", "250");
    client.simple_command("RCPT TO:<b@foo.com>", "250");
    client.simple_command("DATA", "354");
    client.write_line("..leading dot");
    client.write_line("...two dots");
    client.write_line("ordinary");
    client.simple_command(".", "250");
    client.simple_command("QUIT", "221");

    let delivered = recorder.delivered.lock().unwrap();
    let data = std::str::from_utf8(&delivered[0].data).unwrap();
    assert!(data.ends_with(".leading dot\n..two dots\nordinary\n"));
}

#[test]
fn command_sequencing() {
    let (mut client, _) = connect(
        "sequencing",
        HostParams {
            domain: "foo.com",
            ..HostParams::default()
        },
    );

    client.read_line();
    client.simple_command("MAIL FROM:<a@bar.com>", "503");
    client.simple_command("RCPT TO:<b@foo.com>", "503");
    client.simple_command("DATA", "503");
    client.simple_command("STARTTLS", "503");
    client.simple_command("AUTH PLAIN", "503");

    client.simple_command("EHLO seq.test", "250");
    client.simple_command("RCPT TO:<b@foo.com>", "503");
    client.simple_command("DATA", "503");
    // No TLS configured for this host.
    client.simple_command("STARTTLS", "500");

    client.simple_command("MAIL FROM:<a@bar.com>", "250");
    client.simple_command("MAIL FROM:<a@bar.com>", "503");
    client.simple_command("DATA", "503");

    client.simple_command("RSET", "250");
    client.simple_command("RCPT TO:<b@foo.com>", "503");

    client.simple_command("QUIT", "221");
}

#[test]
fn miscellaneous_commands() {
    let (mut client, _) = connect(
        "misc",
        HostParams {
            domain: "foo.com",
            ..HostParams::default()
        },
    );

    client.read_line();
    client.simple_command("VRFY banned@foo.com", "252");
    client.simple_command("EXPN list@foo.com", "550");
    client.simple_command("NOOP", "250");
    client.simple_command("HELP", "250 https://tools.ietf.org/html/rfc5321");
    client.simple_command("FROB", "500");
    client.simple_command("MAIL FROM:oops", "501");
    client.simple_command("QUIT", "221");
}

#[test]
fn bad_addresses() {
    let (mut client, _) = connect(
        "badaddr",
        HostParams {
            domain: "test.mail",
            ..HostParams::default()
        },
    );

    client.read_line();
    client.simple_command("EHLO test", "250");
    client.simple_command("MAIL FROM:<sender>", "501");
    client.simple_command("MAIL FROM:<sender@foo.com> SIZE=2163", "250");
    client.simple_command("RCPT TO:<banned.net>", "501");
    client.simple_command("QUIT", "221");
}

#[test]
fn oversized_size_declaration() {
    let (mut client, _) = connect(
        "oversize",
        HostParams {
            domain: "test.mail",
            ..HostParams::default()
        },
    );

    client.read_line();
    client.simple_command("EHLO test", "250");
    client.simple_command(
        "MAIL FROM:<sender@foo.com> SIZE=999999999",
        "552",
    );
    client.simple_command("QUIT", "221");
}

#[test]
fn verb_case_insensitivity() {
    let (mut client, _) = connect(
        "casing",
        HostParams {
            domain: "mail.com",
            blocklist: &["reject@mail.com"],
            ..HostParams::default()
        },
    );

    client.read_line();
    client.simple_command("nOoP", "250");
    client.write_line("ehLO test.TEST");
    client.read_responses();
    client.simple_command("mail FROM:<sender@example.com>", "250");
    client.simple_command("RcPT tO:<receive@mail.com>", "250");
    client.simple_command("RCPT TO:<reject@MAIL.com>", "550");
    client.simple_command("rSeT", "250");
    client.simple_command("qUIt", "221");
}

#[test]
fn auth_not_advertised_over_plaintext() {
    let (mut client, _) = connect(
        "plaintext-auth",
        HostParams {
            domain: "example.com",
            with_tls: true,
            credentials: Some(("", "mailbox@example.com", "test")),
            ..HostParams::default()
        },
    );

    client.read_line();
    client.write_line("EHLO test");
    let responses = client.read_responses();
    assert!(responses.iter().any(|r| r.contains("STARTTLS")));
    assert!(!responses.iter().any(|r| r.contains("AUTH")));

    // Issuing it anyway is a sequence error until TLS is up.
    client.simple_command("AUTH PLAIN", "503");
    client.simple_command("QUIT", "221");
}

#[test]
fn starttls_resets_and_enables_auth() {
    let (mut client, recorder) = connect(
        "starttls",
        HostParams {
            domain: "example.com",
            with_tls: true,
            credentials: Some(("", "mailbox@example.com", "test")),
            ..HostParams::default()
        },
    );

    client.read_line();
    client.write_line("EHLO tls.test");
    client.read_responses();
    client.simple_command("STARTTLS", "220");
    client.start_tls();

    // The state machine reset with the TLS layer.
    client.simple_command("MAIL FROM:<a@bar.com>", "503");

    client.write_line("EHLO tls.test");
    let responses = client.read_responses();
    assert!(!responses.iter().any(|r| r.contains("STARTTLS")));
    assert!(responses.iter().any(|r| r.contains("AUTH PLAIN")));

    // Unauthenticated relay of a local return path is refused.
    client.simple_command("MAIL FROM:<mailbox@example.com>", "550");

    client.write_line("AUTH PLAIN");
    assert_eq!("334 ", client.read_line());
    client.simple_command(&b64("abc\x00def\x00ghf"), "535");

    client.write_line("AUTH PLAIN");
    client.read_line();
    client.simple_command(&b64("\x00"), "501");

    client.write_line("AUTH PLAIN");
    client.read_line();
    client.simple_command("this isn't base 64", "501");

    client.simple_command("AUTH", "501");
    client.simple_command("AUTH OAUTHBEARER", "504");

    client.simple_command(
        &format!("AUTH PLAIN {}", b64("\x00mailbox@example.com\x00test")),
        "235",
    );
    client.simple_command("AUTH PLAIN", "503");

    client.simple_command("MAIL FROM:<mailbox@example.com>", "250");
    // Submission must not relay back into a hosted domain.
    client.simple_command("RCPT TO:<other@example.com>", "550");
    client.simple_command("RCPT TO:<dest@x.net>", "250");

    client.simple_command("DATA", "354");
    client.write_line("From: <mailbox@example.com>");
    client.write_line("To: <dest@x.net>");
    client.write_line("Subject: Send-as relay [sendas:source]");
    client.write_line("");
    client.write_line("hello");
    client.simple_command(".", "250");
    client.simple_command("QUIT", "221");

    let relayed = recorder.relayed.lock().unwrap();
    assert_eq!(1, relayed.len());
    let (env, authc) = &relayed[0];
    assert_eq!("mailbox@example.com", authc);
    assert_eq!("source@example.com", env.mail_from);
    assert_eq!(vec!["dest@x.net".to_owned()], env.rcpt_to);

    let data = std::str::from_utf8(&env.data).unwrap();
    assert!(data.contains("\nFrom: <source@example.com>\n"));
    assert!(data.contains("\nSubject: Send-as relay \n"));
    assert!(!data.contains("mailbox@example.com"));
    assert!(data.contains("with ESMTPS id "));
    assert!(data.contains("(using TLS"));
    assert!(data.ends_with("\n\nhello\n"));
}

#[test]
fn auth_with_continuation_line() {
    let (mut client, _) = connect(
        "auth-continue",
        HostParams {
            domain: "example.com",
            with_tls: true,
            credentials: Some(("", "user", "longpassword")),
            ..HostParams::default()
        },
    );

    client.read_line();
    client.write_line("EHLO test");
    client.read_responses();
    client.simple_command("STARTTLS", "220");
    client.start_tls();
    client.write_line("EHLO test");
    client.read_responses();

    client.write_line("AUTH PLAIN");
    assert_eq!("334 ", client.read_line());
    client.simple_command(&b64("\x00user\x00longpassword"), "235");
    client.simple_command("QUIT", "221");
}
