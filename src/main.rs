// Copyright 2023 BPX Chain Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
#![deny(unsafe_code)]

use std::path::{Path, PathBuf};

use directories_next::ProjectDirs;
use structopt::StructOpt;
use tokio::signal::unix;

use bpx_relayer::config::{self, BpxRelayerConfig, PrivateKey};
use bpx_relayer::context::RelayerContext;
use bpx_relayer::store::sled::SledStore;
use bpx_relayer::{probe, service};

const PACKAGE_ID: [&str; 3] = ["cc", "bpxchain", "bpx-relayer"];

type Result<T> = bpx_relayer::Result<T>;

/// The BPX Bridge Relayer Command-line tool
///
/// Relay between the BPX home chain and a partner chain:
///
///     $ bpx-relayer -vvv -s <SRC_RPC_URL> -d <DST_RPC_URL> -k $BPX_WALLET_KEY
#[derive(StructOpt)]
#[structopt(name = "BPX Relayer")]
struct Opts {
    /// A level of verbosity, and can be used multiple times
    #[structopt(short, long, parse(from_occurrences))]
    verbose: i32,
    /// Directory that contains configration files.
    #[structopt(
        short = "c",
        long = "config-dir",
        value_name = "PATH",
        parse(from_os_str)
    )]
    config_dir: Option<PathBuf>,
    /// RPC endpoint of the source chain (where messages are created).
    #[structopt(short = "s", long = "src-rpc", value_name = "URL")]
    src_rpc: url::Url,
    /// RPC endpoint of the destination chain (where messages execute).
    #[structopt(short = "d", long = "dst-rpc", value_name = "URL")]
    dst_rpc: url::Url,
    /// The relayer wallet key: a 0x-prefixed hex key, or $ENV_VAR naming
    /// an environment variable that holds one.
    #[structopt(short = "k", long = "wallet-key", value_name = "KEY")]
    wallet_key: PrivateKey,
    /// Create the Database Store in a temporary directory.
    /// and will be deleted when the process exits.
    #[structopt(long)]
    tmp: bool,
}

#[paw::main]
#[tokio::main]
async fn main(args: Opts) -> anyhow::Result<()> {
    setup_logger(args.verbose)?;
    match dotenv::dotenv() {
        Ok(_) => {
            tracing::trace!("Loaded .env file");
        }
        Err(e) => {
            tracing::warn!("Failed to load .env file: {}", e);
        }
    }
    let config = match load_config(args.config_dir.clone()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    let ctx = match RelayerContext::new(config, &args.wallet_key) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("Wallet error: {}", e);
            std::process::exit(e.exit_code());
        }
    };
    tracing::info!("Relayer wallet address: {:?}", ctx.address());
    let store = match create_store(&args) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Database error: {}", e);
            std::process::exit(e.exit_code());
        }
    };
    // start all background services.
    // this does not block, will fire the services on background tasks.
    if let Err(e) =
        service::ignite(&ctx, store, &args.src_rpc, &args.dst_rpc).await
    {
        tracing::error!("{}", e);
        std::process::exit(e.exit_code());
    }
    // watch for signals
    let mut ctrlc_signal = unix::signal(unix::SignalKind::interrupt())?;
    let mut termination_signal = unix::signal(unix::SignalKind::terminate())?;
    let mut quit_signal = unix::signal(unix::SignalKind::quit())?;
    let shutdown = || {
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Lifecycle,
            shutdown = true
        );
        tracing::warn!("Shutting down...");
        // send shutdown signal to all of the application.
        ctx.shutdown();
        std::thread::sleep(std::time::Duration::from_millis(300));
        tracing::info!("Clean Exit ..");
    };
    tokio::select! {
        _ = ctrlc_signal.recv() => {
            tracing::warn!("Interrupted (Ctrl+C) ...");
            shutdown();
        },
        _ = termination_signal.recv() => {
            tracing::warn!("Got Terminate signal ...");
            shutdown();
        },
        _ = quit_signal.recv() => {
            tracing::warn!("Quitting ...");
            shutdown();
        },
    }
    Ok(())
}

fn setup_logger(verbosity: i32) -> anyhow::Result<()> {
    use tracing::Level;
    let log_level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("bpx_relayer={}", log_level).parse()?);
    let logger = tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(log_level)
        .with_env_filter(env_filter);
    // if we are not compiling for integration tests, we should use pretty logs
    #[cfg(not(feature = "integration-tests"))]
    let logger = logger.pretty();
    // otherwise, we should use json, which is easy to parse.
    #[cfg(feature = "integration-tests")]
    let logger = logger.json();

    logger.init();
    Ok(())
}

fn load_config<P>(config_dir: Option<P>) -> Result<BpxRelayerConfig>
where
    P: AsRef<Path>,
{
    let path = match config_dir {
        Some(p) => p.as_ref().to_path_buf(),
        None => {
            let dirs = ProjectDirs::from(
                PACKAGE_ID[0],
                PACKAGE_ID[1],
                PACKAGE_ID[2],
            );
            match dirs {
                Some(dirs) if dirs.config_dir().is_dir() => {
                    dirs.config_dir().to_path_buf()
                }
                // no config on disk, the built-in chain registry and
                // defaults apply
                _ => return Ok(BpxRelayerConfig::default()),
            }
        }
    };
    if !path.is_dir() {
        return Err(bpx_relayer::Error::Generic(
            "config path is not a directory",
        ));
    }
    tracing::trace!("Loading Config from {} ..", path.display());
    config::load(path)
}

fn create_store(opts: &Opts) -> Result<SledStore> {
    // check if we shall use the temp dir.
    if opts.tmp {
        tracing::debug!("Using temp dir for store");
        let store = SledStore::temporary()?;
        return Ok(store);
    }
    let dirs =
        ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
            .ok_or(bpx_relayer::Error::Generic(
                "failed to get project dirs",
            ))?;
    let db_path = dirs.data_local_dir().join("store");
    let store = SledStore::open(db_path)?;
    Ok(store)
}
