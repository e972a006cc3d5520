//! TCP transport with newline-delimited JSON framing.
//!
//! Connections are bidirectional: every connection, dialed or accepted, gets
//! a reader that feeds the inbox, and the first envelope seen on an accepted
//! connection names a return route. That is how nodes answer clients that
//! have no listening address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use super::{Envelope, InboxSender, NetworkError, Transport};

type Writer = Arc<tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>>;

struct Inner {
    me: String,
    addrs: RwLock<HashMap<String, SocketAddr>>,
    connections: Mutex<HashMap<String, Writer>>,
    inbox: InboxSender,
}

#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl TcpTransport {
    /// `addrs` maps endpoint names to the addresses they listen on.
    pub fn new<I>(me: impl Into<String>, addrs: I, inbox: InboxSender) -> Self
    where
        I: IntoIterator<Item = (String, SocketAddr)>,
    {
        TcpTransport {
            inner: Arc::new(Inner {
                me: me.into(),
                addrs: RwLock::new(addrs.into_iter().collect()),
                connections: Mutex::new(HashMap::new()),
                inbox,
            }),
        }
    }

    /// Binds `addr` and accepts connections in the background. Returns the
    /// bound address, useful when binding port 0.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(endpoint = %self.inner.me, %local, "listening");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tracing::debug!(endpoint = %inner.me, %remote, "accepted connection");
                        let (reader, writer) = stream.into_split();
                        let writer = Arc::new(tokio::sync::Mutex::new(BufWriter::new(writer)));
                        tokio::spawn(read_loop(inner.clone(), reader, Some(writer)));
                    }
                    Err(err) => {
                        tracing::warn!(endpoint = %inner.me, error = %err, "accept failed");
                    }
                }
            }
        });
        Ok(local)
    }

    async fn connect(&self, target: &str) -> Result<Writer, NetworkError> {
        let addr = self
            .inner
            .addrs
            .read()
            .get(target)
            .copied()
            .ok_or_else(|| NetworkError::PeerNotFound(target.to_string()))?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(BufWriter::new(writer)));
        tokio::spawn(read_loop(self.inner.clone(), reader, None));

        self.inner
            .connections
            .lock()
            .insert(target.to_string(), writer.clone());
        tracing::debug!(endpoint = %self.inner.me, target, %addr, "connected");
        Ok(writer)
    }

    async fn writer_for(&self, target: &str) -> Result<Writer, NetworkError> {
        let cached = self.inner.connections.lock().get(target).cloned();
        match cached {
            Some(writer) => Ok(writer),
            None => self.connect(target).await,
        }
    }

    fn forget(&self, target: &str) {
        self.inner.connections.lock().remove(target);
    }
}

async fn write_line(writer: &Writer, line: &[u8]) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(line).await?;
    writer.flush().await
}

async fn read_loop(inner: Arc<Inner>, reader: OwnedReadHalf, reply_route: Option<Writer>) {
    let mut lines = BufReader::new(reader).lines();
    let mut reply_route = reply_route;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(endpoint = %inner.me, error = %err, "connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(endpoint = %inner.me, error = %err, "dropping undecodable frame");
                continue;
            }
        };

        if let Some(writer) = reply_route.take() {
            inner
                .connections
                .lock()
                .entry(envelope.from.clone())
                .or_insert(writer);
        }
        if inner.inbox.send(envelope).is_err() {
            break;
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, target: &str, envelope: Envelope) -> Result<(), NetworkError> {
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let writer = self.writer_for(target).await?;
        if let Err(err) = write_line(&writer, &line).await {
            tracing::debug!(endpoint = %self.inner.me, target, error = %err, "send failed, reconnecting");
            self.forget(target);
            let writer = self.connect(target).await?;
            if let Err(err) = write_line(&writer, &line).await {
                self.forget(target);
                return Err(err.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::common::crypto::Keypair;
    use crate::consensus::message::{KeyAnnounce, Message, PeerMessage};

    fn announce(from: &str) -> Envelope {
        let announce = KeyAnnounce::new(&Keypair::new_pair(), from, false);
        Envelope::new(from, Message::Peer(PeerMessage::KeyAnnounce(announce)))
    }

    #[tokio::test]
    async fn test_send_and_answer_over_same_connection() {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let server = TcpTransport::new("AlphaC", [], server_tx);
        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let client = TcpTransport::new("client", [("AlphaC".to_string(), addr)], client_tx);

        client.send("AlphaC", announce("client")).await.unwrap();
        let received = server_rx.recv().await.unwrap();
        assert_eq!(received.from, "client");

        // The server has no address for the client; it answers over the
        // connection the client opened.
        server.send("client", announce("AlphaC")).await.unwrap();
        assert_eq!(client_rx.recv().await.unwrap().from, "AlphaC");
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = TcpTransport::new("Alpha", [], tx);
        assert!(matches!(
            transport.send("Beta", announce("Alpha")).await,
            Err(NetworkError::PeerNotFound(_))
        ));
    }
}
