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

//! The daemon: both listeners, the production host implementations, and
//! the SIGHUP reload plumbing.
//!
//! Everything runs on one current-thread runtime inside a `LocalSet`, one
//! task per connection and per outbound relay. Tasks share no mutable
//! state; the maildrop directories are the only cross-task coupling.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::config::{Config, MAILBOX_ACCOUNT};
use crate::pop3::{self, maildrop::FsMaildrop, Maildrop, PostOffice};
use crate::smtp::{
    self, domain_for_address, relay, syntax::is_valid_address, Envelope,
    ReplyLine, SmtpHost, REPLY_BAD_MAILBOX, REPLY_OK,
};
use crate::support::{
    async_io::NetStream, dns, error::Error, log_prefix::LogPrefix, tls,
};

/// Runs both servers until one of them fails fatally.
pub fn run(config: Config) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, serve_all(Rc::new(config)))
}

async fn serve_all(config: Rc<Config>) -> Result<(), Error> {
    let resolver = Rc::new(dns::system_resolver());

    let (reload_tx, reload_rx) = watch::channel(());
    tokio::task::spawn_local(watch_sighup(reload_tx));

    tokio::try_join!(
        run_smtp_server(
            Rc::clone(&config),
            Rc::clone(&resolver),
            reload_rx.clone(),
        ),
        run_pop3_server(config, reload_rx),
    )?;

    Ok(())
}

async fn watch_sighup(reload_tx: watch::Sender<()>) {
    let mut hangup = match tokio::signal::unix::signal(
        tokio::signal::unix::SignalKind::hangup(),
    ) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("unable to install SIGHUP handler: {e}");
            return;
        },
    };

    while hangup.recv().await.is_some() {
        info!("SIGHUP received, reloading TLS configuration");
        if reload_tx.send(()).is_err() {
            return;
        }
    }
}

async fn bind_listener(port: u16) -> io::Result<TcpListener> {
    match TcpListener::bind(("::", port)).await {
        Ok(listener) => Ok(listener),
        Err(_) => TcpListener::bind(("0.0.0.0", port)).await,
    }
}

async fn run_smtp_server(
    config: Rc<Config>,
    resolver: Rc<dns::Resolver>,
    mut reload: watch::Receiver<()>,
) -> Result<(), Error> {
    let gateway = SmtpGateway::new(Rc::clone(&config), Rc::clone(&resolver));
    let hostnames = gateway.load_tls().await?;
    if hostnames.is_empty() {
        warn!("smtp: no TLS certificates configured");
    } else {
        info!("smtp: loaded TLS certificates for {hostnames:?}");
    }

    let listener = bind_listener(config.smtp_port).await?;
    info!("smtp: listening on port {}", config.smtp_port);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (sock, peer) = accepted?;
                let gateway = Rc::clone(&gateway);
                let resolver = Rc::clone(&resolver);
                tokio::task::spawn_local(async move {
                    handle_smtp_conn(gateway, resolver, sock, peer).await;
                });
            },

            _ = reload.changed() => {
                match gateway.load_tls().await {
                    Ok(hostnames) => {
                        info!("smtp: reloaded TLS certificates for {hostnames:?}");
                    },
                    Err(e) => {
                        // Keep serving with the previous certificates.
                        error!("smtp: failed to reload TLS config: {e}");
                    },
                }
            },
        }
    }
}

async fn handle_smtp_conn(
    gateway: Rc<SmtpGateway>,
    resolver: Rc<dns::Resolver>,
    sock: TcpStream,
    peer: SocketAddr,
) {
    let log_prefix = LogPrefix::new(format!("smtp:{peer}"));

    let local_addr = match sock.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("{} failed to inspect socket: {}", log_prefix, e);
            return;
        },
    };

    let io = match sock.into_std().map_err(Error::Io).and_then(
        NetStream::from_socket,
    ) {
        Ok(io) => io,
        Err(e) => {
            error!("{} failed to configure socket: {}", log_prefix, e);
            return;
        },
    };

    let result = smtp::conn::serve(
        io,
        gateway,
        Some(resolver),
        log_prefix.clone(),
        peer,
        local_addr,
    )
    .await;

    match result {
        Ok(()) => info!("{} normal client disconnect", log_prefix),
        Err(e) => warn!("{} abnormal client disconnect: {}", log_prefix, e),
    }
}

/// The production SMTP host: routes verified recipients to maildrops and
/// authenticated submissions to the relay.
struct SmtpGateway {
    config: Rc<Config>,
    resolver: Rc<dns::Resolver>,
    tls: RefCell<Option<SslAcceptor>>,
    weak_self: std::rc::Weak<SmtpGateway>,
}

impl SmtpGateway {
    fn new(config: Rc<Config>, resolver: Rc<dns::Resolver>) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            config,
            resolver,
            tls: RefCell::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// (Re)loads the certificate catalog off the connection executor,
    /// swapping it in for new connections only. Returns the covered
    /// hostnames.
    async fn load_tls(&self) -> Result<Vec<String>, Error> {
        let catalog = tls::load_detached(&self.config).await?;
        *self.tls.borrow_mut() = catalog.acceptor;
        Ok(catalog.hostnames)
    }
}

impl SmtpHost for SmtpGateway {
    fn name(&self) -> &str {
        &self.config.hostname
    }

    fn tls_acceptor(&self) -> Option<SslAcceptor> {
        self.tls.borrow().clone()
    }

    fn verify_address(&self, address: &str) -> ReplyLine {
        let Some(server) =
            self.config.server_for_domain(domain_for_address(address))
        else {
            return REPLY_BAD_MAILBOX;
        };

        if server
            .blacklisted_addresses
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(address))
        {
            // Indistinguishable from an unknown mailbox on purpose.
            return REPLY_BAD_MAILBOX;
        }

        REPLY_OK
    }

    fn authenticate(&self, authz: &str, authc: &str, password: &str) -> bool {
        if !is_valid_address(authc) {
            return false;
        }

        let domain = domain_for_address(authc);
        let Some(server) = self.config.server_for_domain(domain) else {
            return false;
        };

        let account = format!("{}{}", MAILBOX_ACCOUNT, server.domain);
        let mut auth_ok = authc.eq_ignore_ascii_case(&account)
            && password == server.mailbox_password;

        // The authorization identity may only be another address in the
        // same domain.
        if !authz.is_empty() {
            auth_ok = auth_ok
                && is_valid_address(authz)
                && domain_for_address(authz).eq_ignore_ascii_case(domain);
        }

        auth_ok
    }

    fn deliver_message(
        &self,
        env: Envelope,
    ) -> LocalBoxFuture<'_, Option<ReplyLine>> {
        Box::pin(async move {
            let domain = domain_for_address(&env.rcpt_to[0]);
            let Some(server) = self.config.server_for_domain(domain) else {
                error!("no maildrop to deliver message id={}", env.id);
                return Some(REPLY_BAD_MAILBOX);
            };

            let mut framed = Vec::with_capacity(env.data.len() + 128);
            if let Err(e) =
                smtp::write_envelope_for_delivery(&mut framed, &env)
            {
                error!("failed to frame message id={}: {}", env.id, e);
                return Some(REPLY_BAD_MAILBOX);
            }

            let path = server.maildrop_path.join(format!("{}.msg", env.id));
            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    error!(
                        "failed to create message file id={}: {}",
                        env.id, e,
                    );
                    return Some(REPLY_BAD_MAILBOX);
                },
            };

            if let Err(e) = file.write_all(&framed).await {
                error!("failed to write message file id={}: {}", env.id, e);
                // Never leave a half-written message for POP3 to see.
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Some(REPLY_BAD_MAILBOX);
            }

            info!("delivered message id={} to {}", env.id, domain);
            None
        })
    }

    fn relay_message(&self, env: Envelope, authc: &str) {
        let Some(host) = self.weak_self.upgrade() else {
            return;
        };
        let resolver = Rc::clone(&self.resolver);
        let authc = authc.to_owned();

        tokio::task::spawn_local(async move {
            relay::relay_message(host, Some(resolver), env, authc).await;
        });
    }
}

async fn run_pop3_server(
    config: Rc<Config>,
    mut reload: watch::Receiver<()>,
) -> Result<(), Error> {
    let office = Rc::new(Pop3Office {
        config: Rc::clone(&config),
    });

    // Implicit TLS means a reload replaces the listener wholesale; the
    // outer loop rebuilds both it and the acceptor.
    loop {
        let catalog = tls::load_detached(&config).await?;
        let acceptor = catalog.acceptor;
        if acceptor.is_none() {
            warn!("pop3: no TLS certificates configured, serving cleartext");
        }

        let listener = bind_listener(config.pop3_port).await?;
        info!("pop3: listening on port {}", config.pop3_port);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (sock, peer) = accepted?;
                    let office = Rc::clone(&office);
                    let acceptor = acceptor.clone();
                    tokio::task::spawn_local(async move {
                        handle_pop3_conn(office, acceptor, sock, peer).await;
                    });
                },

                _ = reload.changed() => {
                    info!("pop3: restarting listener");
                    break;
                },
            }
        }
    }
}

async fn handle_pop3_conn(
    office: Rc<Pop3Office>,
    acceptor: Option<SslAcceptor>,
    sock: TcpStream,
    peer: SocketAddr,
) {
    let log_prefix = LogPrefix::new(format!("pop3:{peer}"));

    let io = match sock.into_std().map_err(Error::Io).and_then(
        NetStream::from_socket,
    ) {
        Ok(io) => io,
        Err(e) => {
            error!("{} failed to configure socket: {}", log_prefix, e);
            return;
        },
    };

    if let Some(ref acceptor) = acceptor {
        if let Err(e) = io.tls_accept(acceptor).await {
            warn!("{} TLS handshake failed: {}", log_prefix, e);
            return;
        }
    }

    match pop3::conn::serve(io, office, log_prefix.clone()).await {
        Ok(()) => info!("{} normal client disconnect", log_prefix),
        Err(e) => warn!("{} abnormal client disconnect: {}", log_prefix, e),
    }
}

/// The production post office: one catch-all mailbox per configured
/// domain, stored as a flat maildrop directory.
struct Pop3Office {
    config: Rc<Config>,
}

impl PostOffice for Pop3Office {
    fn name(&self) -> &str {
        &self.config.hostname
    }

    fn open_mailbox<'a>(
        &'a self,
        user: &'a str,
        pass: &'a str,
    ) -> LocalBoxFuture<'a, Result<Box<dyn Maildrop>, Error>> {
        Box::pin(async move {
            for server in &self.config.servers {
                let account = format!("{}{}", MAILBOX_ACCOUNT, server.domain);
                if user.eq_ignore_ascii_case(&account)
                    && pass == server.mailbox_password
                {
                    return match FsMaildrop::open(&server.maildrop_path)
                        .await
                    {
                        Ok(mb) => Ok(Box::new(mb) as Box<dyn Maildrop>),
                        Err(e) => {
                            error!(
                                "failed to open maildrop {}: {}",
                                server.maildrop_path.display(),
                                e,
                            );
                            Err(Error::MaildropUnavailable)
                        },
                    };
                }
            }

            Err(Error::PermissionDenied)
        })
    }
}
