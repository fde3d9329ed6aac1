/* This file is part of fileferry.
 *
 * fileferry is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * fileferry is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with fileferry.  If not, see <http://www.gnu.org/licenses/>.
 */

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use fileferry::config::ServerConfig;
use fileferry::directory::UserDirectory;
use fileferry::server::Server;
use log::{error, info};

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";

#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "warn";

fn main() {
    // See https://docs.rs/env_logger/latest/env_logger/index.html for
    // details on fine-tuning logging behavior beyond the defaults.
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(DEFAULT_LOG_LEVEL)
    ).init();

    let config = match ServerConfig::load() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!("Failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all().build().unwrap();
    runtime.block_on(run(config));
}

async fn run(config: Arc<ServerConfig>) {
    let listener = match tokio::net::TcpListener::bind(&config.listen_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind on address {}: {err}", config.listen_address);
            std::process::exit(1);
        }
    };

    info!("listening on {}", config.listen_address);

    let directory = Arc::new(UserDirectory::new());
    let server = Server::start(config, directory);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((sock, addr)) => {
                        info!("accepted connection from {addr}");
                        server.add(sock).await;
                    }
                    Err(err) => error!("failed to accept connection: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl-C, shutting down");
                return;
            }
        }
    }
}
