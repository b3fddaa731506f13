// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Accepts control connections on tcp and on a unix socket

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::msg::MessageHandler;
use crate::pidfile;
use crate::Error;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub async fn bind_tcp(addr: &str) -> Result<TcpListener, Error> {
    let listener = TcpListener::bind(addr).await?;
    info!("tcp listen service started at {}", listener.local_addr()?);
    Ok(listener)
}

/// Binds the socket, replacing a leftover socket file from an earlier run
pub fn bind_unix(path: &Path) -> Result<UnixListener, Error> {
    pidfile::remove_file(path)?;
    let listener = UnixListener::bind(path)?;
    info!("unix listen service started at {}", path.display());
    Ok(listener)
}

pub fn serve_tcp(listener: TcpListener, handler: Arc<MessageHandler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "tcp client connected");
                    tokio::spawn(serve_connection(stream, Arc::clone(&handler)));
                }
                Err(e) => back_off("tcp", e).await,
            }
        }
    })
}

pub fn serve_unix(listener: UnixListener, handler: Arc<MessageHandler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    debug!("unix client connected");
                    tokio::spawn(serve_connection(stream, Arc::clone(&handler)));
                }
                Err(e) => back_off("unix", e).await,
            }
        }
    })
}

/// Pauses the accept loop after a failed accept, e.g. when out of file descriptors
async fn back_off(transport: &str, err: io::Error) {
    warn!("{} accept error: {}", transport, err);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn serve_connection<S>(stream: S, handler: Arc<MessageHandler>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match answer_lines(stream, &handler).await {
        Ok(()) => debug!("client quit"),
        Err(e) => warn!("client error: {}", e),
    }
}

/// Answers every request line until the client hangs up.
///
/// Lines that are not valid UTF-8 are decoded lossily, so they still get an error response.
pub async fn answer_lines<S>(stream: S, handler: &MessageHandler) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = handler.handle(line).await;
        writer.write_all(response.to_wire().as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}
