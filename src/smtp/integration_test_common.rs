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

//! Shared helpers for session-level tests: a synchronous scripted client
//! driven from the test thread while the real server runs in another.

use std::io::{self, Read, Write};
use std::mem;

use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};

use crate::test_data::{TLS_TEST_CERT, TLS_TEST_KEY};

pub(crate) fn ssl_acceptor() -> SslAcceptor {
    let mut ssl_acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).unwrap();
    ssl_acceptor.set_private_key(&TLS_TEST_KEY).unwrap();
    ssl_acceptor.set_certificate(&TLS_TEST_CERT).unwrap();
    ssl_acceptor.build()
}

pub(crate) trait ReadWrite: Read + Write {}
impl<T: Read + Write + ?Sized> ReadWrite for T {}

pub(crate) struct LineClient {
    name: &'static str,
    io: Box<dyn ReadWrite>,
}

impl LineClient {
    pub fn new(name: &'static str, io: impl ReadWrite + 'static) -> Self {
        Self {
            name,
            io: Box::new(io),
        }
    }

    /// Reads one CRLF-terminated line, returned without its ending.
    ///
    /// Reads a byte at a time so that nothing past the line ending is
    /// consumed, which matters when the server coalesces its writes.
    pub fn read_line(&mut self) -> String {
        let mut line = Vec::<u8>::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.io.read(&mut byte).unwrap();
            assert!(n > 0, "unexpected EOF");
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }

        if line.last() == Some(&b'\r') {
            let _ = line.pop();
        }

        let line = String::from_utf8(line).unwrap();
        println!("[{}] >> {:?}", self.name, line);
        line
    }

    /// Reads SMTP responses up to and including the final one.
    pub fn read_responses(&mut self) -> Vec<String> {
        let mut ret = Vec::<String>::new();

        loop {
            let line = self.read_line();
            let last = line.get(3..4) != Some("-");
            ret.push(line);

            if last {
                break;
            }
        }

        ret
    }

    /// Reads lines until the `.` terminator of a multiline POP3 response.
    /// The terminator is not included.
    pub fn read_until_dot(&mut self) -> Vec<String> {
        let mut ret = Vec::<String>::new();
        loop {
            let line = self.read_line();
            if line == "." {
                return ret;
            }
            ret.push(line);
        }
    }

    pub fn write_line(&mut self, s: &str) {
        println!("[{}] << {:?}", self.name, s);
        self.io.write_all(s.as_bytes()).unwrap();
        self.io.write_all(b"\r\n").unwrap();
        self.io.flush().unwrap();
    }

    /// Sends a command expected to have one response with the given prefix.
    pub fn simple_command(&mut self, command: &str, prefix: &str) {
        self.write_line(command);
        let responses = self.read_responses();
        assert_eq!(1, responses.len());
        assert!(
            responses[0].starts_with(prefix),
            "expected {prefix:?}, got {:?}",
            responses[0],
        );
    }

    /// Performs the client half of a TLS handshake on the connection.
    pub fn start_tls(&mut self) {
        let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);

        println!("[{}] <> start TLS handshake", self.name);
        let cxn = mem::replace(&mut self.io, Box::new(io::empty()));
        let cxn = connector
            .build()
            .connect("localhost", cxn)
            .map_err(|_| "TLS handshake failed")
            .unwrap();
        println!("[{}] <> TLS handshake succeeded", self.name);
        self.io = Box::new(cxn);
    }
}
