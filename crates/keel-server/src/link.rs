//! Per-link reader and writer tasks.
//!
//! Links are dumb pipes: the reader frames bytes into messages and forwards
//! them to the owner task, the writer drains a per-link queue. Neither
//! touches cluster state; all reactions happen in the single owner task.

use std::io;
use std::net::IpAddr;

use bytes::Bytes;
use keel_cluster::{LinkDecoder, LinkId, Message, NodeId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// Everything the owner task can hear from the link layer.
#[derive(Debug)]
pub enum LinkInput {
    /// A complete message arrived on a link.
    Message {
        link: LinkId,
        remote_ip: IpAddr,
        message: Message,
    },
    /// The link hit EOF or a socket error and is gone.
    Closed { link: LinkId },
    /// An outbound dial finished (either way).
    Connected {
        node: NodeId,
        result: io::Result<TcpStream>,
    },
}

/// Owner-side handle to one link: dropping it closes the outbound queue,
/// which ends the writer task and the socket with it.
#[derive(Debug)]
pub struct LinkHandle {
    pub out_tx: UnboundedSender<Bytes>,
}

/// Reads the socket, frames messages, forwards them to the owner.
pub async fn read_loop(
    link: LinkId,
    remote_ip: IpAddr,
    mut half: OwnedReadHalf,
    inbox: UnboundedSender<LinkInput>,
) {
    let mut decoder = LinkDecoder::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        match half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                trace!(?link, "link read side closed");
                let _ = inbox.send(LinkInput::Closed { link });
                return;
            }
            Ok(n) => {
                decoder.feed(&buf[..n]);
                while let Some(message) = decoder.next_message() {
                    if inbox
                        .send(LinkInput::Message {
                            link,
                            remote_ip,
                            message,
                        })
                        .is_err()
                    {
                        return; // owner is gone, shutdown in progress
                    }
                }
            }
        }
    }
}

/// Drains the outbound queue into the socket. Ends when the queue closes
/// (link dropped by the owner) or the socket errors; the reader side then
/// notices the closed connection.
pub async fn write_loop(mut rx: UnboundedReceiver<Bytes>, mut half: OwnedWriteHalf) {
    while let Some(bytes) = rx.recv().await {
        if half.write_all(&bytes).await.is_err() {
            return;
        }
    }
}
