// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths)]
#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused,
    unused_lifetimes,
    unused_qualifications,
    unused_results,
    anonymous_parameters,
    deprecated_in_future,
    elided_lifetimes_in_paths,
    explicit_outlives_requirements,
    keyword_idents,
    macro_use_extern_crate,
    missing_doc_code_examples,
    private_doc_tests,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::unseparated_literal_suffix,
    clippy::decimal_literal_representation,
    clippy::single_char_lifetime_names,
    clippy::fallible_impl_from,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::wildcard_enum_match_arm,
    clippy::deref_by_slicing,
    clippy::default_numeric_fallback,
    clippy::shadow_reuse,
    clippy::clone_on_ref_ptr,
    clippy::todo,
    clippy::string_add,
    clippy::use_debug,
    clippy::future_not_send
)]
#![cfg_attr(not(test), warn(clippy::panic_in_result_fn))]

mod agent;
mod agentport;
mod api;
mod command;
mod error;
mod keys;
mod message;
mod metadata;
mod password;
mod rng;
mod server;
mod storage;

use std::{path::PathBuf, process, sync::Arc};

use async_trait::async_trait;
use clap::{Args as ClapArgs, Parser, Subcommand};
use error::Result;
use log::{error, info, warn};
use url::Url;

use crate::storage::Area;

#[derive(Debug, Subcommand)]
enum Command {
    Serve(Serve),
    List(command::list::Command),
    Loaded(command::loaded::Command),
    Add(command::add::Command),
    Remove(command::remove::Command),
    Load(command::load::Command),
    Unload(command::unload::Command),
}

#[async_trait]
impl command::Command for Command {
    async fn execute(self, client: &mut api::Client) -> Result<()> {
        match self {
            Self::Serve(_) => Err(error::Error::Command),
            Self::List(cmd) => cmd.execute(client).await,
            Self::Loaded(cmd) => cmd.execute(client).await,
            Self::Add(cmd) => cmd.execute(client).await,
            Self::Remove(cmd) => cmd.execute(client).await,
            Self::Load(cmd) => cmd.execute(client).await,
            Self::Unload(cmd) => cmd.execute(client).await,
        }
    }
}

/// Run the agent, serving agent connections and key management requests.
#[derive(Debug, ClapArgs)]
struct Serve {
    /// The directory in which configured keys are persisted. Defaults to the
    /// per-user data directory.
    #[arg(long, env = "KEYPORT_DATA_DIR", value_hint = clap::ValueHint::DirPath)]
    data_dir: Option<PathBuf>,

    /// The largest record, in bytes, that the key store writes as a single
    /// item. Larger values are split into chunks.
    #[arg(long, env = "KEYPORT_MAX_ITEM_BYTES", default_value_t = storage::DEFAULT_MAX_ITEM_BYTES)]
    max_item_bytes: usize,

    /// A browser origin, such as `https://ssh.example.com`, whose pages may
    /// connect. Repeat the option or separate origins with commas.
    #[arg(
        long = "allowed-origin",
        env = "KEYPORT_ALLOWED_ORIGINS",
        value_delimiter = ','
    )]
    allowed_origins: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// The WebSocket URL the agent listens on. Management commands connect
    /// to the same URL.
    #[arg(long, env = "KEYPORT_URL", default_value = "ws://127.0.0.1:12547", value_parser = Url::parse)]
    url: Url,

    #[clap(subcommand)]
    command: Command,
}

fn get_persistent_storage(serve: &Serve) -> Result<Box<dyn Area>> {
    let file = match serve.data_dir {
        Some(ref dir) => storage::File::persistent_at(dir.join(storage::PERSISTENT_FILE)),
        None => storage::File::persistent(storage::PERSISTENT_FILE).ok_or_else(|| {
            error!("We could not determine a data directory, so you need to pass --data-dir");
            error::Error::Command
        })?,
    };

    Ok(Box::new(storage::Chunked::new(
        serve.max_item_bytes,
        Box::new(file),
    )?))
}

fn get_session_storage() -> Box<dyn Area> {
    if let Some(file) = storage::File::session(storage::SESSION_FILE) {
        return Box::new(file);
    }

    warn!("We need to fall back to in-memory session storage because there is no runtime directory, so loaded keys will not survive a restart");
    Box::new(storage::Memory::new())
}

async fn serve(url: Url, serve: Serve) -> Result<()> {
    let keyring = Arc::new(keys::Keyring::new());
    let manager = Arc::new(keys::Manager::new(
        Arc::clone(&keyring),
        get_persistent_storage(&serve)?,
        get_session_storage(),
    ));

    manager.load_from_session().await?;
    info!("Restored session keys; listening on {}", url);

    server::serve(&url, serve.allowed_origins, manager, keyring).await
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Serve(opts) => serve(args.url, opts).await,
        cmd => {
            let mut client = api::Client::connect(&args.url).await?;
            let result = command::Command::execute(cmd, &mut client).await;
            client.close().await?;
            result
        }
    }
}

#[tokio::main]
async fn main() {
    let logger_env = env_logger::Env::new()
        .filter_or("KEYPORT_LOG", "warn")
        .write_style("KEYPORT_LOG_STYLE");
    env_logger::Builder::from_env(logger_env).init();

    if let Err(e) = run(Args::parse()).await {
        error!("We encountered an error: {}", e);
        process::exit(1);
    };
}
