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

//! The POP3 server.

pub mod conn;
pub mod maildrop;


use std::io;

use futures::future::LocalBoxFuture;

use crate::support::error::Error;

/// The session's view of one message in the maildrop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageInfo {
    /// The filename stem; stable across sessions.
    pub unique_id: String,
    /// 1-based position in the session's snapshot; stable only within the
    /// session.
    pub ordinal_id: usize,
    pub size: u64,
    pub deleted: bool,
}

/// A transactional view over one maildrop, frozen at open.
///
/// Deletions are session-local marks until [`Maildrop::close`] commits
/// them; a session dropped without `close` must leave the maildrop
/// untouched. The operations that touch the filesystem return futures so
/// one session's disk I/O cannot stall the other connections sharing the
/// executor.
pub trait Maildrop {
    fn list_messages(&self) -> Vec<MessageInfo>;

    fn get_message(&self, ordinal: usize) -> Option<MessageInfo>;

    /// The message's file bytes, verbatim.
    fn retrieve(
        &self,
        ordinal: usize,
    ) -> LocalBoxFuture<'_, io::Result<Vec<u8>>>;

    /// Marks the message deleted for this session.
    fn delete(&mut self, ordinal: usize);

    /// Clears every deletion mark.
    fn reset(&mut self);

    /// Commits the session: unlinks every message marked deleted. Partial
    /// removal is allowed; no rollback is attempted.
    fn close(&mut self) -> LocalBoxFuture<'_, Result<(), Error>>;
}

/// What the POP3 server needs from its surroundings.
pub trait PostOffice {
    /// The hostname announced in the greeting.
    fn name(&self) -> &str;

    /// Authenticates `user`/`pass` and opens a fresh snapshot of that
    /// user's maildrop.
    fn open_mailbox<'a>(
        &'a self,
        user: &'a str,
        pass: &'a str,
    ) -> LocalBoxFuture<'a, Result<Box<dyn Maildrop>, Error>>;
}
