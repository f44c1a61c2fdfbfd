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

//! Loads the per-domain TLS certificates into a single server-side
//! configuration.
//!
//! Each configured domain may carry its own key/certificate pair. All of
//! them are folded into one `SslAcceptor` that dispatches on the SNI name
//! the client sends, defaulting to the first domain's certificate when the
//! client sends none. Reloading is done by calling [`load`] again and
//! swapping the returned catalog in for new connections.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use openssl::ssl::{
    NameType, SniError, SslAcceptor, SslAcceptorBuilder, SslContext,
    SslFiletype, SslMethod,
};

use crate::config::Config;
use crate::support::error::Error;

/// A ready-made server-side TLS configuration and the hostnames it covers.
pub struct TlsCatalog {
    /// `None` when no domain has certificate paths configured; the servers
    /// then run without TLS.
    pub acceptor: Option<SslAcceptor>,
    pub hostnames: Vec<String>,
}

/// Like [`load`], but runs the PEM reads and certificate parsing on the
/// blocking thread pool so the connection executor is never stalled by
/// them. This is the entry point the servers use at startup and on each
/// SIGHUP reload.
pub async fn load_detached(config: &Config) -> Result<TlsCatalog, Error> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || load(&config))
        .await
        .map_err(|e| {
            Error::Io(io::Error::new(io::ErrorKind::Other, e))
        })?
}

pub fn load(config: &Config) -> Result<TlsCatalog, Error> {
    let entries = config
        .servers
        .iter()
        .filter(|s| !s.tls_cert_path.is_empty())
        .collect::<Vec<_>>();

    if entries.is_empty() {
        return Ok(TlsCatalog {
            acceptor: None,
            hostnames: Vec::new(),
        });
    }

    let mut contexts = HashMap::<String, SslContext>::new();
    for server in &entries {
        let builder =
            acceptor_builder(&server.tls_key_path, &server.tls_cert_path)?;
        contexts.insert(
            server.domain.to_lowercase(),
            builder.build().into_context(),
        );
    }

    let contexts = Arc::new(contexts);
    let mut default =
        acceptor_builder(&entries[0].tls_key_path, &entries[0].tls_cert_path)?;
    default.set_servername_callback({
        let contexts = Arc::clone(&contexts);
        move |ssl, _alert| {
            let Some(name) = ssl.servername(NameType::HOST_NAME) else {
                return Ok(());
            };

            if let Some(ctx) = contexts.get(&name.to_lowercase()) {
                ssl.set_ssl_context(ctx).map_err(|_| SniError::ALERT_FATAL)?;
            }

            // An unknown name falls through to the default certificate; the
            // client's certificate validation is the backstop.
            Ok(())
        }
    });

    Ok(TlsCatalog {
        acceptor: Some(default.build()),
        hostnames: entries.iter().map(|s| s.domain.clone()).collect(),
    })
}

fn acceptor_builder(
    key_path: &str,
    cert_path: &str,
) -> Result<SslAcceptorBuilder, Error> {
    let mut builder =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    builder.set_private_key_file(key_path, SslFiletype::PEM)?;
    builder.set_certificate_chain_file(cert_path)?;
    builder.check_private_key()?;
    Ok(builder)
}
