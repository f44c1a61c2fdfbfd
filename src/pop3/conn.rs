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

//! The per-connection POP3 state machine (RFC 1939 plus CAPA).

use std::io;
use std::rc::Rc;
use std::str;
use std::time::Duration;

use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};

use super::{MessageInfo, Maildrop, PostOffice};
use crate::smtp::relay::write_dot_stuffed;
use crate::support::{
    async_io::NetStream, error::Error, log_prefix::LogPrefix,
};

const MAX_LINE: usize = 1024;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

const ERR_STATE_AUTH: &str = "not in AUTHORIZATION";
const ERR_STATE_TXN: &str = "not in TRANSACTION";
const ERR_SYNTAX: &str = "syntax error";
const ERR_DELETED_MSG: &str = "no such message - deleted";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Authorization,
    Transaction,
}

/// Serves one POP3 connection to completion. The UPDATE state is the
/// commit inside QUIT; any other way out of the loop discards the
/// session's deletion marks.
pub async fn serve(
    io: NetStream,
    po: Rc<dyn PostOffice>,
    log_prefix: LogPrefix,
) -> Result<(), Error> {
    let mut conn = Conn {
        io: BufStream::new(io),
        po,
        mb: None,
        log_prefix,
        state: State::Authorization,
        user: String::new(),
        quit: false,
    };

    conn.run().await
}

struct Conn {
    io: BufStream<NetStream>,
    po: Rc<dyn PostOffice>,
    mb: Option<Box<dyn Maildrop>>,
    log_prefix: LogPrefix,

    state: State,
    user: String,
    quit: bool,
}

impl Conn {
    async fn run(&mut self) -> Result<(), Error> {
        info!("{} accepted connection", self.log_prefix);
        self.ok(&format!("POP3 (mailpopbox) server {}", self.po.name()))
            .await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        buffer.clear();
        tokio::time::timeout(
            COMMAND_TIMEOUT,
            (&mut self.io).take(MAX_LINE as u64).read_until(b'\n', buffer),
        )
        .await
        .map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for command",
            ))
        })??;

        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                self.err("line too long").await?;
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }
                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        let line_ending_len = if buffer.ends_with(b"\r\n") { 2 } else { 1 };
        let line = &buffer[..buffer.len() - line_ending_len];
        let Ok(line) = str::from_utf8(line) else {
            return self.err("invalid command").await;
        };

        info!("{} << {:?}", self.log_prefix, line);

        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, Some(arg)),
            None => (line, None),
        };

        if verb.is_empty() {
            return self.err("invalid command").await;
        }

        match verb.to_ascii_uppercase().as_str() {
            "QUIT" => self.cmd_quit().await,
            "USER" => self.cmd_user(arg).await,
            "PASS" => self.cmd_pass(arg).await,
            "STAT" => self.cmd_stat().await,
            "LIST" => self.cmd_list(arg).await,
            "RETR" => self.cmd_retr(arg).await,
            "DELE" => self.cmd_dele(arg).await,
            "RSET" => self.cmd_rset().await,
            "UIDL" => self.cmd_uidl(arg).await,
            "CAPA" => self.cmd_capa().await,
            "NOOP" => self.ok("").await,
            _ => self.err("unknown command").await,
        }
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;

        if let Some(ref mut mb) = self.mb {
            // UPDATE: commit the deletion marks.
            if mb.close().await.is_err() {
                warn!("{} failed to commit deletions", self.log_prefix);
                return self.err("failed to remove some messages").await;
            }
        }

        self.ok("goodbye").await
    }

    async fn cmd_user(&mut self, arg: Option<&str>) -> Result<(), Error> {
        if self.state != State::Authorization {
            return self.err(ERR_STATE_AUTH).await;
        }

        let Some(user) = arg else {
            return self.err("invalid user").await;
        };

        self.user = user.to_owned();
        self.ok("").await
    }

    async fn cmd_pass(&mut self, arg: Option<&str>) -> Result<(), Error> {
        if self.state != State::Authorization {
            return self.err(ERR_STATE_AUTH).await;
        }

        if self.user.is_empty() {
            return self.err("no USER").await;
        }

        let Some(pass) = arg else {
            return self.err("invalid pass").await;
        };

        match self.po.open_mailbox(&self.user, pass).await {
            Ok(mb) => {
                info!("{} authenticated {:?}", self.log_prefix, self.user);
                self.log_prefix.set_user(self.user.clone());
                self.state = State::Transaction;
                self.mb = Some(mb);
                self.ok("").await
            },
            Err(e) => {
                warn!(
                    "{} failed to open mailbox for {:?}: {}",
                    self.log_prefix, self.user, e,
                );
                self.err(&e.to_string()).await
            },
        }
    }

    async fn cmd_stat(&mut self) -> Result<(), Error> {
        if self.state != State::Transaction {
            return self.err(ERR_STATE_TXN).await;
        }

        let msgs = self.mb.as_ref().unwrap().list_messages();
        let mut num = 0usize;
        let mut size = 0u64;
        for msg in msgs.iter().filter(|m| !m.deleted) {
            num += 1;
            size += msg.size;
        }

        self.ok(&format!("{num} {size}")).await
    }

    async fn cmd_list(&mut self, arg: Option<&str>) -> Result<(), Error> {
        if self.state != State::Transaction {
            return self.err(ERR_STATE_TXN).await;
        }

        if arg.is_some() {
            let Some(msg) = self.requested_message(arg).await? else {
                return Ok(());
            };
            if msg.deleted {
                return self.err(ERR_DELETED_MSG).await;
            }
            return self.ok(&format!("{} {}", msg.ordinal_id, msg.size)).await;
        }

        let msgs = self.mb.as_ref().unwrap().list_messages();
        self.ok("scan listing").await?;
        for msg in msgs.iter().filter(|m| !m.deleted) {
            self.write_line(&format!("{} {}", msg.ordinal_id, msg.size))
                .await?;
        }
        self.write_line(".").await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn cmd_retr(&mut self, arg: Option<&str>) -> Result<(), Error> {
        if self.state != State::Transaction {
            return self.err(ERR_STATE_TXN).await;
        }

        let Some(msg) = self.requested_message(arg).await? else {
            return Ok(());
        };
        if msg.deleted {
            return self.err(ERR_DELETED_MSG).await;
        }

        let contents =
            match self.mb.as_ref().unwrap().retrieve(msg.ordinal_id).await {
                Ok(contents) => contents,
                Err(e) => {
                    warn!(
                        "{} failed to retrieve message {}: {}",
                        self.log_prefix, msg.ordinal_id, e,
                    );
                    return self.err("failed to retrieve message").await;
                },
            };

        info!(
            "{} retrieve message unique-id={}",
            self.log_prefix, msg.unique_id,
        );
        self.ok(&msg.size.to_string()).await?;
        write_dot_stuffed(&mut self.io, &contents).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn cmd_dele(&mut self, arg: Option<&str>) -> Result<(), Error> {
        if self.state != State::Transaction {
            return self.err(ERR_STATE_TXN).await;
        }

        let Some(msg) = self.requested_message(arg).await? else {
            return Ok(());
        };
        if msg.deleted {
            return self.err(ERR_DELETED_MSG).await;
        }

        self.mb.as_mut().unwrap().delete(msg.ordinal_id);
        info!(
            "{} delete message unique-id={}",
            self.log_prefix, msg.unique_id,
        );
        self.ok("").await
    }

    async fn cmd_rset(&mut self) -> Result<(), Error> {
        if self.state != State::Transaction {
            return self.err(ERR_STATE_TXN).await;
        }

        self.mb.as_mut().unwrap().reset();
        self.ok("").await
    }

    async fn cmd_uidl(&mut self, arg: Option<&str>) -> Result<(), Error> {
        if self.state != State::Transaction {
            return self.err(ERR_STATE_TXN).await;
        }

        if arg.is_some() {
            let Some(msg) = self.requested_message(arg).await? else {
                return Ok(());
            };
            if msg.deleted {
                return self.err(ERR_DELETED_MSG).await;
            }
            return self
                .ok(&format!("{} {}", msg.ordinal_id, msg.unique_id))
                .await;
        }

        let msgs = self.mb.as_ref().unwrap().list_messages();
        self.ok("unique-id listing").await?;
        for msg in msgs.iter().filter(|m| !m.deleted) {
            self.write_line(&format!("{} {}", msg.ordinal_id, msg.unique_id))
                .await?;
        }
        self.write_line(".").await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn cmd_capa(&mut self) -> Result<(), Error> {
        self.ok("capability list").await?;
        for capability in ["USER", "UIDL", "."] {
            self.write_line(capability).await?;
        }
        self.io.flush().await?;
        Ok(())
    }

    /// Parses and resolves a message-number argument, emitting the error
    /// reply itself when the argument is bad. `Ok(None)` means a reply was
    /// already sent.
    async fn requested_message(
        &mut self,
        arg: Option<&str>,
    ) -> Result<Option<MessageInfo>, Error> {
        let Some(idx) = arg.and_then(|a| a.trim().parse::<i64>().ok()) else {
            self.err(ERR_SYNTAX).await?;
            return Ok(None);
        };

        if idx < 1 {
            self.err("invalid message-number").await?;
            return Ok(None);
        }

        match self.mb.as_ref().unwrap().get_message(idx as usize) {
            Some(msg) => Ok(Some(msg)),
            None => {
                self.err("no such message").await?;
                Ok(None)
            },
        }
    }

    async fn ok(&mut self, msg: &str) -> Result<(), Error> {
        let line = if msg.is_empty() {
            "+OK\r\n".to_owned()
        } else {
            format!("+OK {msg}\r\n")
        };
        self.io.write_all(line.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn err(&mut self, msg: &str) -> Result<(), Error> {
        warn!("{} -ERR {}", self.log_prefix, msg);
        let line = if msg.is_empty() {
            "-ERR\r\n".to_owned()
        } else {
            format!("-ERR {msg}\r\n")
        };
        self.io.write_all(line.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), Error> {
        self.io.write_all(line.as_bytes()).await?;
        self.io.write_all(b"\r\n").await?;
        Ok(())
    }
}
