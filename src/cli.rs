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

use std::fs;
use std::path::PathBuf;

use log::error;
use structopt::StructOpt;

use crate::config::Config;
use crate::support::sysexits::*;

/// A single-user, catch-all mail server: inbound SMTP and authenticated
/// submission on one port, the shared maildrop served over POP3 on
/// another.
#[derive(StructOpt)]
#[structopt(name = "mailpopbox", max_term_width = 80)]
struct Options {
    /// Path to the JSON configuration file.
    #[structopt(parse(from_os_str))]
    config: PathBuf,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more
    // concise API.
    let options =
        Options::from_clap(&match Options::clap().get_matches_safe() {
            Ok(matches) => matches,
            Err(
                e @ clap::Error {
                    kind: clap::ErrorKind::HelpDisplayed,
                    ..
                },
            )
            | Err(
                e @ clap::Error {
                    kind: clap::ErrorKind::VersionDisplayed,
                    ..
                },
            ) => {
                println!("{}", e.message);
                return;
            },
            Err(e) => {
                eprintln!("{}", e.message);
                EX_USAGE.exit()
            },
        });

    let config_json = match fs::read(&options.config) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!(
                "Error reading '{}': {}",
                options.config.display(),
                e
            );
            EX_NOINPUT.exit()
        },
    };

    let config: Config = match serde_json::from_slice(&config_json) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Error in config file at '{}': {}",
                options.config.display(),
                e
            );
            EX_CONFIG.exit()
        },
    };

    if let Err(e) = init_logging() {
        eprintln!("Failed to initialise logging: {e}");
        EX_SOFTWARE.exit()
    }

    if let Err(e) = config.create_maildrops() {
        error!("failed to create maildrop: {e}");
        EX_CANTCREAT.exit()
    }

    if let Err(e) = crate::serve::run(config) {
        error!("server terminated: {e}");
        EX_UNAVAILABLE.exit()
    }
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let stderr = log4rs::append::console::ConsoleAppender::builder()
        .target(log4rs::append::console::Target::Stderr)
        .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
        )))
        .build();
    let log_config = log4rs::config::Config::builder()
        .appender(
            log4rs::config::Appender::builder()
                .build("stderr", Box::new(stderr)),
        )
        .build(
            log4rs::config::Root::builder()
                .appender("stderr")
                .build(log::LevelFilter::Info),
        )?;
    log4rs::init_config(log_config)?;
    Ok(())
}
