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

use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;

use serde::Deserialize;

/// The single mailbox user's local-part, including the separator.
pub const MAILBOX_ACCOUNT: &str = "mailbox@";

/// The top-level JSON configuration, read once at startup.
///
/// Only TLS material is hot-reloadable (via SIGHUP); everything else
/// requires a restart.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "SMTPPort")]
    pub smtp_port: u16,
    #[serde(rename = "POP3Port")]
    pub pop3_port: u16,

    /// The name of the MX server that is running, used in greetings and
    /// trace headers.
    #[serde(rename = "Hostname")]
    pub hostname: String,

    #[serde(rename = "Servers")]
    pub servers: Vec<ServerConfig>,
}

/// One domain this instance is authoritative for.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// The second component of a mail address: `<local-part@domain.com>`.
    #[serde(rename = "Domain")]
    pub domain: String,

    /// PEM paths; empty means no TLS for this domain.
    #[serde(rename = "TLSKeyPath", default)]
    pub tls_key_path: String,
    #[serde(rename = "TLSCertPath", default)]
    pub tls_cert_path: String,

    /// Password for the mailbox user, `mailbox@domain.com`.
    #[serde(rename = "MailboxPassword")]
    pub mailbox_password: String,

    /// Location to store the mail messages.
    #[serde(rename = "MaildropPath")]
    pub maildrop_path: PathBuf,

    /// Addresses that should not accept mail even though their domain
    /// matches.
    #[serde(rename = "BlacklistedAddresses", default)]
    pub blacklisted_addresses: Vec<String>,
}

impl Config {
    pub fn server_for_domain(&self, domain: &str) -> Option<&ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.domain.eq_ignore_ascii_case(domain))
    }

    /// Creates every configured maildrop directory (mode 0700) that does
    /// not already exist.
    pub fn create_maildrops(&self) -> io::Result<()> {
        for server in &self.servers {
            let result = std::fs::DirBuilder::new()
                .mode(0o700)
                .create(&server.maildrop_path);
            match result {
                Ok(()) => (),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => (),
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_config_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "SMTPPort": 925,
                "POP3Port": 9995,
                "Hostname": "mx.example.com",
                "Servers": [{
                    "Domain": "example.com",
                    "TLSKeyPath": "",
                    "TLSCertPath": "",
                    "MailboxPassword": "hunter2",
                    "MaildropPath": "/var/spool/mailpopbox/example.com",
                    "BlacklistedAddresses": ["spam@example.com"]
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(925, config.smtp_port);
        assert_eq!(9995, config.pop3_port);
        assert_eq!("mx.example.com", config.hostname);
        assert_eq!(1, config.servers.len());
        assert_eq!("example.com", config.servers[0].domain);
        assert_eq!(
            vec!["spam@example.com".to_owned()],
            config.servers[0].blacklisted_addresses,
        );
    }

    #[test]
    fn optional_fields_default() {
        let config: Config = serde_json::from_str(
            r#"{
                "SMTPPort": 25,
                "POP3Port": 995,
                "Hostname": "mx.example.com",
                "Servers": [{
                    "Domain": "example.com",
                    "MailboxPassword": "pw",
                    "MaildropPath": "/tmp/drop"
                }]
            }"#,
        )
        .unwrap();

        assert!(config.servers[0].tls_key_path.is_empty());
        assert!(config.servers[0].blacklisted_addresses.is_empty());
    }

    #[test]
    fn domain_lookup_is_case_insensitive() {
        let config: Config = serde_json::from_str(
            r#"{
                "SMTPPort": 25,
                "POP3Port": 995,
                "Hostname": "mx",
                "Servers": [
                    {"Domain": "example.com", "MailboxPassword": "a",
                     "MaildropPath": "/tmp/a"},
                    {"Domain": "other.net", "MailboxPassword": "b",
                     "MaildropPath": "/tmp/b"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(
            "other.net",
            config.server_for_domain("OTHER.NET").unwrap().domain,
        );
        assert!(config.server_for_domain("nowhere.org").is_none());
    }

    #[test]
    fn maildrop_creation_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            smtp_port: 25,
            pop3_port: 995,
            hostname: "mx".to_owned(),
            servers: vec![ServerConfig {
                domain: "example.com".to_owned(),
                tls_key_path: String::new(),
                tls_cert_path: String::new(),
                mailbox_password: "pw".to_owned(),
                maildrop_path: dir.path().join("drop"),
                blacklisted_addresses: vec![],
            }],
        };

        config.create_maildrops().unwrap();
        config.create_maildrops().unwrap();
        assert!(dir.path().join("drop").is_dir());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join("drop"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(0o700, mode & 0o777);
    }
}
