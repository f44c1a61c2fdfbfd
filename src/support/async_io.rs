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

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task;

use openssl::ssl::{
    HandshakeError, SslAcceptor, SslConnector, SslStream, NameType,
};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};

use crate::support::error::Error;

/// An async duplex stream over a single socket which can be upgraded from
/// cleartext to TLS mid-stream.
///
/// This covers all three TLS situations in the server: SMTP `STARTTLS`
/// (server-side upgrade), POP3 implicit TLS (server-side handshake right
/// after accept), and the relay's opportunistic `STARTTLS` (client-side
/// upgrade). Clones share the same underlying state.
#[derive(Clone)]
pub struct NetStream {
    fd: Rc<AsyncFd<RawFd>>,
    mode: Rc<RefCell<Mode>>,
    _owned: Rc<dyn Any>,
}

enum Mode {
    Cleartext(FdRw),
    Tls(SslStream<FdRw>),
}

impl NetStream {
    /// Wraps the given socket, which the `NetStream` takes ownership of.
    ///
    /// The socket is closed when the last clone is dropped. This only fails
    /// if making the socket non-blocking fails.
    pub fn from_socket(sock: impl AsRawFd + Any) -> Result<Self, Error> {
        let fd = sock.as_raw_fd();
        nix::fcntl::fcntl(
            fd,
            nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let fd = Rc::new(
            AsyncFd::with_interest(
                fd,
                tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            )
            .map_err(Error::Io)?,
        );

        Ok(Self {
            fd: Rc::clone(&fd),
            mode: Rc::new(RefCell::new(Mode::Cleartext(FdRw(fd)))),
            _owned: Rc::new(sock),
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(*self.mode.borrow(), Mode::Tls(_))
    }

    /// Describes the transport for the received-trace `using` clause:
    /// `PLAINTEXT`, or `<version> cipher=<name>[ name=<sni>]`.
    pub fn transport_string(&self) -> String {
        match *self.mode.borrow() {
            Mode::Cleartext(..) => "PLAINTEXT".to_owned(),
            Mode::Tls(ref stream) => {
                let ssl = stream.ssl();
                let cipher =
                    ssl.current_cipher().map_or("NONE", |c| c.name());
                match ssl.servername(NameType::HOST_NAME) {
                    Some(name) => format!(
                        "{} cipher={} name={}",
                        ssl.version_str(),
                        cipher,
                        name
                    ),
                    None => {
                        format!("{} cipher={}", ssl.version_str(), cipher)
                    },
                }
            },
        }
    }

    /// Performs the server side of a TLS handshake.
    ///
    /// Concurrent use of other methods during the handshake will panic.
    pub async fn tls_accept(
        &self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        #[allow(clippy::await_holding_refcell_ref)] // intentional
        let mode = self.mode.borrow_mut();
        let result = acceptor.accept(FdRw(Rc::clone(&self.fd)));
        self.complete_handshake(mode, result).await
    }

    /// Performs the client side of a TLS handshake, verifying against
    /// `domain`.
    pub async fn tls_connect(
        &self,
        domain: &str,
        connector: &SslConnector,
    ) -> Result<(), Error> {
        #[allow(clippy::await_holding_refcell_ref)] // intentional
        let mode = self.mode.borrow_mut();
        let result = connector.connect(domain, FdRw(Rc::clone(&self.fd)));
        self.complete_handshake(mode, result).await
    }

    #[allow(clippy::await_holding_refcell_ref)] // intentional
    async fn complete_handshake(
        &self,
        mut mode: std::cell::RefMut<'_, Mode>,
        mut result: Result<SslStream<FdRw>, HandshakeError<FdRw>>,
    ) -> Result<(), Error> {
        // OpenSSL tells us WANT_READ/WANT_WRITE after the fact, so each
        // round waits for the respective readiness, clears the stale ready
        // state, and retries the handshake.
        loop {
            match result {
                Ok(stream) => {
                    *mode = Mode::Tls(stream);
                    return Ok(());
                },

                Err(HandshakeError::SetupFailure(e)) => return Err(e.into()),

                Err(HandshakeError::Failure(mhss)) => {
                    return Err(handshake_failure_to_error(mhss));
                },

                Err(HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        openssl::ssl::ErrorCode::WANT_READ => {
                            let mut guard = self.fd.readable().await?;
                            guard.clear_ready();
                            result = mhss.handshake();
                        },

                        openssl::ssl::ErrorCode::WANT_WRITE => {
                            let mut guard = self.fd.writable().await?;
                            guard.clear_ready();
                            result = mhss.handshake();
                        },

                        _ => return Err(handshake_failure_to_error(mhss)),
                    }
                },
            }
        }
    }

    /// Handles an error from `ssl_read`/`ssl_write`, arranging readiness
    /// polling for WANT_READ/WANT_WRITE.
    ///
    /// Must be called immediately after the failing call with no await
    /// points in between, so that the readiness status being cleared really
    /// refers to the state OpenSSL observed.
    fn on_tls_error(
        &self,
        ctx: &mut task::Context<'_>,
        e: openssl::ssl::Error,
    ) -> task::Poll<io::Result<()>> {
        match e.code() {
            openssl::ssl::ErrorCode::WANT_READ => {
                futures::ready!(self.fd.poll_read_ready(ctx))?.clear_ready();
                // Poll again so tokio keeps watching the FD.
                futures::ready!(self.fd.poll_read_ready(ctx))?.retain_ready();
                task::Poll::Ready(Ok(()))
            },

            openssl::ssl::ErrorCode::WANT_WRITE => {
                futures::ready!(self.fd.poll_write_ready(ctx))?.clear_ready();
                futures::ready!(self.fd.poll_write_ready(ctx))?
                    .retain_ready();
                task::Poll::Ready(Ok(()))
            },

            // EOF surfaces as a SYSCALL error with no inner IO error.
            openssl::ssl::ErrorCode::SYSCALL => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

            _ => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
        }
    }
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_read(ctx, buf),
            Mode::Tls(ref mut tls) => loop {
                match tls.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => futures::ready!(self.on_tls_error(ctx, e))?,
                }
            },
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_write(ctx, buf),
            Mode::Tls(ref mut tls) => loop {
                match tls.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => futures::ready!(self.on_tls_error(ctx, e))?,
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // Neither OpenSSL nor the raw FD buffer anything here.
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        let done = if let Mode::Tls(ref mut tls) = *mode {
            loop {
                match tls.shutdown() {
                    Ok(openssl::ssl::ShutdownResult::Received) => break,
                    Ok(openssl::ssl::ShutdownResult::Sent) => {
                        return task::Poll::Pending;
                    },

                    Err(e) => futures::ready!(self.on_tls_error(ctx, e))?,
                }
            }

            true
        } else {
            false
        };

        if done {
            *mode = Mode::Cleartext(FdRw(Rc::clone(&self.fd)));
        }

        task::Poll::Ready(Ok(()))
    }
}

/// Synchronous and asynchronous read/write over the raw file descriptor.
///
/// OpenSSL drives the synchronous impls during handshakes and record
/// processing; tokio readiness is handled a level up.
struct FdRw(Rc<AsyncFd<RawFd>>);

impl io::Read for FdRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(*self.0.get_ref(), dst).map_err(nix_to_io)
    }
}

impl io::Write for FdRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        nix::unistd::write(*self.0.get_ref(), src).map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for FdRw {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_read_ready(ctx))?;

            match guard.try_io(|fd| {
                nix::unistd::read(*fd.get_ref(), buf.initialize_unfilled())
                    .map_err(nix_to_io)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return task::Poll::Ready(Ok(()));
                },

                Ok(Err(e)) => return task::Poll::Ready(Err(e)),

                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdRw {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_write_ready(ctx))?;

            if let Ok(result) = guard.try_io(|fd| {
                nix::unistd::write(*fd.get_ref(), buf).map_err(nix_to_io)
            }) {
                return task::Poll::Ready(result);
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn handshake_failure_to_error(
    mhss: openssl::ssl::MidHandshakeSslStream<FdRw>,
) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == openssl::ssl::ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
