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

use std::net::IpAddr;

pub use hickory_resolver::Name;

use crate::support::error::Error;

pub type Resolver = hickory_resolver::AsyncResolver<
    hickory_resolver::name_server::GenericConnector<
        hickory_resolver::name_server::TokioRuntimeProvider,
    >,
>;

/// Builds a resolver from the system configuration, falling back to the
/// standard public defaults when `/etc/resolv.conf` is unusable.
pub fn system_resolver() -> Resolver {
    hickory_resolver::AsyncResolver::tokio_from_system_conf().unwrap_or_else(
        |_| {
            hickory_resolver::AsyncResolver::tokio(
                hickory_resolver::config::ResolverConfig::default(),
                hickory_resolver::config::ResolverOpts::default(),
            )
        },
    )
}

/// Looks up the MX records for `domain`, returned as
/// `(exchange, preference)` pairs in the order the resolver produced them.
pub async fn lookup_mx(
    resolver: &Resolver,
    domain: &str,
) -> Result<Vec<(Name, u16)>, Error> {
    let mut name = Name::from_str_relaxed(domain).map_err(|_| {
        Error::Dns(hickory_resolver::error::ResolveErrorKind::Message(
            "invalid domain name",
        )
        .into())
    })?;
    name.set_fqdn(true);

    let records = resolver.mx_lookup(name).await?;
    Ok(records
        .iter()
        .map(|mx| (mx.exchange().clone(), mx.preference()))
        .collect())
}

/// Reverse-resolves `ip`, returning the first PTR name without its trailing
/// dot. `None` when the lookup fails or yields nothing.
pub async fn reverse_lookup(
    resolver: &Resolver,
    ip: IpAddr,
) -> Option<String> {
    let ptr = resolver.reverse_lookup(ip).await.ok()?;
    let name = ptr.iter().next()?.0.to_ascii();
    Some(name.trim_end_matches('.').to_owned())
}
