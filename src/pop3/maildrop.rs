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

//! The on-disk maildrop.
//!
//! A maildrop is a flat directory of `<envelope-id>.msg` files. A session
//! takes a snapshot of the directory at open; deliveries arriving later are
//! invisible until the next open. No locks are taken anywhere; correctness
//! rests on unique filenames and the snapshot rule. All directory and file
//! access goes through `tokio::fs` so it runs off the connection executor.

use std::io;
use std::path::{Path, PathBuf};

use futures::future::LocalBoxFuture;
use log::{error, warn};

use super::{Maildrop, MessageInfo};
use crate::support::error::Error;

pub struct FsMaildrop {
    messages: Vec<Entry>,
}

struct Entry {
    path: PathBuf,
    info: MessageInfo,
}

impl FsMaildrop {
    /// Enumerates `dir` and freezes the message set for this session.
    pub async fn open(dir: &Path) -> io::Result<Self> {
        let mut files = Vec::<(String, PathBuf, u64)>::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                continue;
            }

            let Ok(name) = entry.file_name().into_string() else {
                warn!(
                    "skipping non-UTF-8 maildrop entry in {}",
                    dir.display(),
                );
                continue;
            };

            files.push((name, entry.path(), meta.len()));
        }

        // Ordinal ids follow filename order, which for envelope-id names is
        // also arrival order at nanosecond granularity.
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let messages = files
            .into_iter()
            .enumerate()
            .map(|(i, (name, path, size))| Entry {
                path,
                info: MessageInfo {
                    unique_id: name
                        .strip_suffix(".msg")
                        .unwrap_or(&name)
                        .to_owned(),
                    ordinal_id: i + 1,
                    size,
                    deleted: false,
                },
            })
            .collect();

        Ok(Self { messages })
    }

    fn entry(&self, ordinal: usize) -> Option<&Entry> {
        if ordinal < 1 {
            return None;
        }
        self.messages.get(ordinal - 1)
    }
}

impl Maildrop for FsMaildrop {
    fn list_messages(&self) -> Vec<MessageInfo> {
        self.messages.iter().map(|e| e.info.clone()).collect()
    }

    fn get_message(&self, ordinal: usize) -> Option<MessageInfo> {
        self.entry(ordinal).map(|e| e.info.clone())
    }

    fn retrieve(
        &self,
        ordinal: usize,
    ) -> LocalBoxFuture<'_, io::Result<Vec<u8>>> {
        Box::pin(async move {
            let entry =
                self.entry(ordinal).ok_or(io::ErrorKind::NotFound)?;
            tokio::fs::read(&entry.path).await
        })
    }

    fn delete(&mut self, ordinal: usize) {
        if ordinal >= 1 {
            if let Some(entry) = self.messages.get_mut(ordinal - 1) {
                entry.info.deleted = true;
            }
        }
    }

    fn reset(&mut self) {
        for entry in &mut self.messages {
            entry.info.deleted = false;
        }
    }

    fn close(&mut self) -> LocalBoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut failed = false;
            for entry in &self.messages {
                if !entry.info.deleted {
                    continue;
                }

                if let Err(e) = tokio::fs::remove_file(&entry.path).await {
                    error!(
                        "failed to remove {}: {}",
                        entry.path.display(),
                        e,
                    );
                    failed = true;
                }
            }

            if failed {
                Err(Error::MaildropUnavailable)
            } else {
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::future::Future;

    use tempfile::TempDir;

    use super::*;

    fn block_on<F: Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    fn open(dir: &TempDir) -> FsMaildrop {
        block_on(FsMaildrop::open(dir.path())).unwrap()
    }

    fn drop_with_messages(messages: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, contents) in messages {
            fs::write(dir.path().join(name), contents).unwrap();
        }
        dir
    }

    #[test]
    fn snapshot_is_sorted_and_numbered() {
        let dir = drop_with_messages(&[
            ("m.200.aaaaaaaa.msg", "second message"),
            ("m.100.bbbbbbbb.msg", "first"),
        ]);
        let mb = open(&dir);

        let msgs = mb.list_messages();
        assert_eq!(2, msgs.len());
        assert_eq!("m.100.bbbbbbbb", msgs[0].unique_id);
        assert_eq!(1, msgs[0].ordinal_id);
        assert_eq!(5, msgs[0].size);
        assert_eq!("m.200.aaaaaaaa", msgs[1].unique_id);
        assert_eq!(2, msgs[1].ordinal_id);
        assert_eq!(14, msgs[1].size);
    }

    #[test]
    fn snapshot_ignores_later_deliveries() {
        let dir = drop_with_messages(&[("m.1.00000000.msg", "x")]);
        let mb = open(&dir);

        fs::write(dir.path().join("m.2.00000000.msg"), "y").unwrap();
        assert_eq!(1, mb.list_messages().len());

        let mb2 = open(&dir);
        assert_eq!(2, mb2.list_messages().len());
    }

    #[test]
    fn subdirectories_are_not_messages() {
        let dir = drop_with_messages(&[("m.1.00000000.msg", "x")]);
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let mb = open(&dir);
        assert_eq!(1, mb.list_messages().len());
    }

    #[test]
    fn retrieve_returns_file_bytes() {
        let dir = drop_with_messages(&[("m.1.00000000.msg", "hello\nthere\n")]);
        let mb = open(&dir);
        assert_eq!(
            b"hello\nthere\n".to_vec(),
            block_on(mb.retrieve(1)).unwrap(),
        );
        assert!(block_on(mb.retrieve(2)).is_err());
        assert!(block_on(mb.retrieve(0)).is_err());
    }

    #[test]
    fn delete_marks_until_close() {
        let dir = drop_with_messages(&[
            ("m.1.00000000.msg", "one"),
            ("m.2.00000000.msg", "two"),
        ]);
        let mut mb = open(&dir);

        mb.delete(1);
        assert!(mb.get_message(1).unwrap().deleted);
        // Nothing on disk changed yet.
        assert_eq!(2, fs::read_dir(dir.path()).unwrap().count());

        block_on(mb.close()).unwrap();
        let remaining = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(vec!["m.2.00000000.msg".to_owned()], remaining);
    }

    #[test]
    fn reset_clears_all_marks() {
        let dir = drop_with_messages(&[
            ("m.1.00000000.msg", "one"),
            ("m.2.00000000.msg", "two"),
        ]);
        let mut mb = open(&dir);

        mb.delete(1);
        mb.delete(2);
        mb.reset();
        assert!(mb.list_messages().iter().all(|m| !m.deleted));

        block_on(mb.close()).unwrap();
        assert_eq!(2, fs::read_dir(dir.path()).unwrap().count());
    }

    #[test]
    fn dropping_without_close_keeps_files() {
        let dir = drop_with_messages(&[("m.1.00000000.msg", "one")]);
        {
            let mut mb = open(&dir);
            mb.delete(1);
            // Session ends without close().
        }
        assert_eq!(1, fs::read_dir(dir.path()).unwrap().count());
    }

    #[test]
    fn close_reports_missing_files() {
        let dir = drop_with_messages(&[("m.1.00000000.msg", "one")]);
        let mut mb = open(&dir);
        mb.delete(1);

        // A concurrent session already removed the file.
        fs::remove_file(dir.path().join("m.1.00000000.msg")).unwrap();
        assert!(block_on(mb.close()).is_err());
    }
}
