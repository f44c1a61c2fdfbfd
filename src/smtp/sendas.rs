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

//! The send-as rewrite for authenticated submissions.
//!
//! A `[sendas:LOCALPART]` tag in the `Subject:` header causes the message to
//! go out as `LOCALPART@<domain>` instead of the mailbox account: the tag is
//! removed from the subject, the `From:` header's address is replaced, and
//! the envelope reverse-path is updated. The body is never touched.

use lazy_static::lazy_static;
use log::{info, warn};

use super::{domain_for_address, Envelope};
use crate::support::log_prefix::LogPrefix;

lazy_static! {
    static ref SEND_AS_SUBJECT: regex::bytes::Regex =
        regex::bytes::Regex::new(r"(?i)\[sendas:\s*([A-Za-z0-9._-]+)\]")
            .unwrap();
}

/// Applies the send-as rewrite to `env` in place, if its `Subject:` carries
/// the tag. `authc` is the authenticated submitter, whose domain the new
/// address is formed in.
pub fn rewrite_send_as(
    log_prefix: &LogPrefix,
    env: &mut Envelope,
    authc: &str,
) {
    // The header block is everything before the first blank line. Line
    // endings were normalised to LF when DATA was read.
    let Some(header_end) = find_blank_line(&env.data) else {
        warn!("{} send-as: no header/body separator", log_prefix);
        return;
    };

    let headers = split_after_newlines(&env.data[..header_end]);

    let mut from_idx = None::<usize>;
    let mut subject_idx = None::<usize>;
    for (i, header) in headers.iter().enumerate() {
        if header_name_is(header, "From:") {
            from_idx = Some(i);
        } else if header_name_is(header, "Subject:") {
            subject_idx = Some(i);
        }
    }

    let (Some(from_idx), Some(subject_idx)) = (from_idx, subject_idx) else {
        return;
    };

    let Some(tag) = SEND_AS_SUBJECT.captures(headers[subject_idx]) else {
        return;
    };

    let send_as_user = tag.get(1).unwrap().as_bytes();
    let send_as_address = format!(
        "{}@{}",
        String::from_utf8_lossy(send_as_user),
        domain_for_address(authc),
    );

    info!("{} send-as {}", log_prefix, send_as_address);

    let whole_tag = tag.get(0).unwrap();
    let mut buf = Vec::with_capacity(env.data.len());
    for (i, header) in headers.iter().enumerate() {
        if i == subject_idx {
            buf.extend_from_slice(&header[..whole_tag.start()]);
            buf.extend_from_slice(&header[whole_tag.end()..]);
        } else if i == from_idx {
            match header.iter().rposition(|&b| b == b'<') {
                Some(angle) => {
                    // Keep the display name, swap the angle-addr. Anything
                    // after the closing bracket is dropped.
                    buf.extend_from_slice(&header[..angle + 1]);
                    buf.extend_from_slice(send_as_address.as_bytes());
                    buf.extend_from_slice(b">\n");
                },
                None => {
                    // Bare addr-spec; there is no display name to keep.
                    buf.extend_from_slice(b"From: <");
                    buf.extend_from_slice(send_as_address.as_bytes());
                    buf.extend_from_slice(b">\n");
                },
            }
        } else {
            buf.extend_from_slice(header);
        }
    }

    buf.extend_from_slice(&env.data[header_end..]);

    env.data = buf;
    env.mail_from = send_as_address;
}

/// Index of the `\n\n` separating headers from body, or `None`.
fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\n\n")
}

/// Splits `data` into segments each ending just after a `\n` (the final
/// segment may lack one).
fn split_after_newlines(data: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, &b) in data.iter().enumerate() {
        if b == b'\n' {
            out.push(&data[start..=i]);
            start = i + 1;
        }
    }
    if start < data.len() {
        out.push(&data[start..]);
    }
    out
}

fn header_name_is(header: &[u8], name: &str) -> bool {
    header
        .get(..name.len())
        .is_some_and(|h| h.eq_ignore_ascii_case(name.as_bytes()))
}

#[cfg(test)]
mod test {
    use chrono::prelude::*;

    use super::*;

    fn envelope(data: &str) -> Envelope {
        Envelope {
            remote_addr: "192.0.2.7:4321".parse().unwrap(),
            ehlo: "client.test".to_owned(),
            mail_from: "mailbox@example.com".to_owned(),
            rcpt_to: vec!["dest@x.net".to_owned()],
            data: data.as_bytes().to_vec(),
            received_at: Utc::now(),
            id: "m.1.00000000".to_owned(),
        }
    }

    fn rewrite(env: &mut Envelope) {
        rewrite_send_as(
            &LogPrefix::new("test".to_owned()),
            env,
            "mailbox@example.com",
        );
    }

    #[test]
    fn rewrites_subject_from_and_envelope() {
        let mut env = envelope(
            "From: <mailbox@example.com>\n\
             To: <dest@x.net>\n\
             Subject: Send-as relay [sendas:source]\n\n\
             hello\n",
        );
        rewrite(&mut env);

        assert_eq!("source@example.com", env.mail_from);
        let data = String::from_utf8(env.data).unwrap();
        assert!(data.contains("From: <source@example.com>\n"));
        assert!(data.contains("Subject: Send-as relay \n"));
        assert!(!data.contains("mailbox@example.com"));
        assert!(data.ends_with("\n\nhello\n"));
    }

    #[test]
    fn rewrite_is_idempotent() {
        let mut env = envelope(
            "From: <mailbox@example.com>\n\
             Subject: hi [sendas:other]\n\n\
             body\n",
        );
        rewrite(&mut env);
        assert!(SEND_AS_SUBJECT.captures(&env.data).is_none());
    }

    #[test]
    fn preserves_display_name() {
        let mut env = envelope(
            "From: \"The Mailbox\" <mailbox@example.com>\n\
             Subject: x [sendas:support]\n\n\
             body\n",
        );
        rewrite(&mut env);
        let data = String::from_utf8(env.data).unwrap();
        assert!(
            data.contains("From: \"The Mailbox\" <support@example.com>\n")
        );
    }

    #[test]
    fn bare_addr_spec_from_is_replaced() {
        let mut env = envelope(
            "From: mailbox@example.com\n\
             Subject: x [sendas:support]\n\n\
             body\n",
        );
        rewrite(&mut env);
        let data = String::from_utf8(env.data).unwrap();
        assert!(data.contains("From: <support@example.com>\n"));
    }

    #[test]
    fn no_tag_leaves_envelope_alone() {
        let original = "From: <mailbox@example.com>\n\
             Subject: ordinary mail\n\n\
             [sendas:not-a-header]\n";
        let mut env = envelope(original);
        rewrite(&mut env);
        assert_eq!(original.as_bytes(), &*env.data);
        assert_eq!("mailbox@example.com", env.mail_from);
    }

    #[test]
    fn tag_whitespace_and_case() {
        let mut env = envelope(
            "From: <mailbox@example.com>\n\
             Subject: x [SendAs: billing]\n\n\
             body\n",
        );
        rewrite(&mut env);
        assert_eq!("billing@example.com", env.mail_from);
    }

    #[test]
    fn body_is_untouched() {
        let mut env = envelope(
            "From: <mailbox@example.com>\n\
             Subject: x [sendas:a]\n\n\
             Subject: x [sendas:b]\n",
        );
        rewrite(&mut env);
        let data = String::from_utf8(env.data).unwrap();
        assert!(data.ends_with("\n\nSubject: x [sendas:b]\n"));
        assert_eq!("a@example.com", env.mail_from);
    }
}
