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

//! Connection acceptor: a channel-fed background task hands each accepted
//! socket off to its own worker thread, one per connection.

use std::net::TcpStream as StdTcpStream;
use std::sync::Arc;

use log::error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::directory::UserDirectory;
use crate::session;

pub struct Server {
    incoming_send: mpsc::Sender<TcpStream>,
}

impl Server {
    pub fn start(config: Arc<ServerConfig>, directory: Arc<UserDirectory>) -> Server {
        let (incoming_send, mut incoming_recv) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(sock) = incoming_recv.recv().await {
                let config = config.clone();
                let directory = directory.clone();
                tokio::spawn(async move {
                    client_worker(sock, config, directory).await;
                });
            }
        });

        Server { incoming_send }
    }

    pub async fn add(&self, sock: TcpStream) {
        if let Err(err) = self.incoming_send.send(sock).await {
            error!("failed to hand off accepted connection: {err}");
        }
    }
}

/// Run one connection's session loop on a blocking thread. The wire
/// protocol's exact-byte-count framing reads map to synchronous
/// `std::net::TcpStream` I/O more directly than `tokio::io`, so the
/// session itself runs on `spawn_blocking`; only the accept loop and the
/// channel hand-off above stay on the async runtime.
async fn client_worker(sock: TcpStream, config: Arc<ServerConfig>, directory: Arc<UserDirectory>) {
    let std_sock = match sock.into_std() {
        Ok(std_sock) => std_sock,
        Err(err) => {
            error!("failed to convert accepted socket: {err}");
            return;
        }
    };
    if let Err(err) = std_sock.set_nonblocking(false) {
        error!("failed to set blocking mode on accepted socket: {err}");
        return;
    }

    let result = tokio::task::spawn_blocking(move || {
        run_blocking_session(std_sock, &config, &directory);
    }).await;

    if let Err(err) = result {
        error!("session worker panicked: {err}");
    }
}

fn run_blocking_session(mut sock: StdTcpStream, config: &ServerConfig, directory: &UserDirectory) {
    session::run_session(&mut sock, config, directory);
}
