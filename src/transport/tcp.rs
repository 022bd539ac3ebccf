//! Newline-delimited JSON over TCP
//!
//! Both ends open with a hello line `{"SN": "<name>"}` that names the
//! connection. Every later line is handed to the [`MessageHandler`] with
//! that name. Sends are queued per connection and written by a tokio task,
//! so [`Transport::send`] can be called from any thread.

use super::{MessageHandler, Transport, TransportError};
use crate::function::wire::WireMessage;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

type Outbox = mpsc::UnboundedSender<String>;
type Reader = BufReader<OwnedReadHalf>;

/// Longest accepted line, newline excluded
pub const MAX_LINE: usize = 1 << 20;

/// Next line without its terminator; `None` at end of stream
async fn read_line(reader: &mut Reader) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_LINE {
        return Err(TransportError::LineTooLong(MAX_LINE).into());
    }
    String::from_utf8(buf)
        .map(Some)
        .context("Line is not valid UTF-8")
}

pub struct TcpTransport {
    name: String,
    handler: Arc<dyn MessageHandler>,
    peers: Mutex<HashMap<String, Outbox>>,
}

impl TcpTransport {
    pub fn new(name: &str, handler: Arc<dyn MessageHandler>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            handler,
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Bind and accept peers in the background; returns the bound address
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let local = listener.local_addr()?;
        log::info!("✓ {} listening on {}", self.name, local);

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        log::debug!("Connection from {}", remote);
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.attach(stream).await {
                                log::warn!("Handshake with {} failed: {:#}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(local)
    }

    /// Connect to `addr`; returns the peer's name from its hello
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<String> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        self.attach(stream).await
    }

    async fn attach(self: &Arc<Self>, stream: TcpStream) -> Result<String> {
        let (peer, reader, write) = self.handshake(stream).await?;
        self.serve(peer.clone(), reader, write);
        Ok(peer)
    }

    async fn handshake(
        &self,
        stream: TcpStream,
    ) -> Result<(String, Reader, OwnedWriteHalf)> {
        let (read, mut write) = stream.into_split();
        let hello = format!("{}\n", WireMessage::hello(&self.name));
        write.write_all(hello.as_bytes()).await?;

        let mut reader = BufReader::new(read);
        let first = read_line(&mut reader)
            .await?
            .context("Peer closed before hello")?;
        match WireMessage::parse(&first) {
            Ok(WireMessage::Hello(peer)) => Ok((peer, reader, write)),
            _ => bail!("Expected hello, got {}", first),
        }
    }

    fn serve(self: &Arc<Self>, peer: String, mut reader: Reader, mut write: OwnedWriteHalf) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let replaced = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.clone(), tx.clone());
        if replaced.is_some() {
            log::warn!("Peer {} reconnected, dropping old connection", peer);
        }
        log::info!("✓ Peer {} connected", peer);

        let writer_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let line = format!("{}\n", message);
                if let Err(e) = write.write_all(line.as_bytes()).await {
                    log::warn!("Write to {} failed: {}", writer_peer, e);
                    break;
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match read_line(&mut reader).await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => this.handler.on_received(&peer, &line),
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Read from {} failed: {:#}", peer, e);
                        break;
                    }
                }
            }
            let mut peers = this.peers.lock().unwrap_or_else(PoisonError::into_inner);
            if peers.get(&peer).is_some_and(|current| current.same_channel(&tx)) {
                peers.remove(&peer);
            }
            log::info!("Peer {} disconnected", peer);
        });
    }
}

impl Transport for TcpTransport {
    fn send(&self, peer: &str, message: &str) -> Result<()> {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let outbox = peers
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
        outbox
            .send(message.to_string())
            .map_err(|_| TransportError::Closed(peer.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Inbox(mpsc::UnboundedSender<(String, String)>);

    impl MessageHandler for Inbox {
        fn on_received(&self, peer: &str, message: &str) {
            let _ = self.0.send((peer.to_string(), message.to_string()));
        }
    }

    #[tokio::test]
    async fn test_hello_names_both_sides() {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let server = TcpTransport::new("bench", Arc::new(Inbox(server_tx)));
        let client = TcpTransport::new("dut-7", Arc::new(Inbox(client_tx)));

        let addr = server.listen("127.0.0.1:0").await.unwrap();
        let peer = client.connect(&addr.to_string()).await.unwrap();
        assert_eq!(peer, "bench");

        client.send("bench", r#"{"class":"RecordStopFunction"}"#).unwrap();
        let (from, message) = timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, "dut-7");
        assert_eq!(message, r#"{"class":"RecordStopFunction"}"#);
        assert_eq!(server.peers(), vec!["dut-7".to_string()]);

        server.send("dut-7", "{}").unwrap();
        let (from, _) = timeout(Duration::from_secs(2), client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, "bench");
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = TcpTransport::new("solo", Arc::new(Inbox(tx)));
        let err = transport.send("ghost", "{}").unwrap_err();
        assert_eq!(
            err.downcast_ref::<TransportError>(),
            Some(&TransportError::UnknownPeer("ghost".into()))
        );
    }

    #[tokio::test]
    async fn test_bad_hello_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let server = TcpTransport::new("bench", Arc::new(Inbox(tx)));
        let addr = server.listen("127.0.0.1:0").await.unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"{\"class\":\"RecordStopFunction\"}\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.peers().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_line_closes_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = TcpTransport::new("bench", Arc::new(Inbox(tx)));
        let addr = server.listen("127.0.0.1:0").await.unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let hello = format!("{}\n", WireMessage::hello("flood"));
        raw.write_all(hello.as_bytes()).await.unwrap();
        raw.write_all(b"{\"class\":\"RecordStopFunction\"}\n").await.unwrap();
        let (from, _) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, "flood");

        let mut line = vec![b'x'; MAX_LINE + 64];
        line.push(b'\n');
        let _ = raw.write_all(&line).await;
        for _ in 0..40 {
            if server.peers().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(server.peers().is_empty());
        assert!(rx.try_recv().is_err());
    }
}
