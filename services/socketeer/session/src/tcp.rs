//! Plain TCP transport.
//!
//! Accepts sockets on a [`TcpListener`] and turns each into a [`Link`]
//! backed by a reader task and a writer task. Listeners are managed by an
//! embedded [`EventSource`], so a [`crate::Server`] attaches to it like to
//! any other transport.

use crate::transport::{
    Accepted, ConnectionMeta, EventSource, Link, LinkCommand, LinkEvent, Listener, ListenerToken,
    TransportSource, LINK_EVENT_BUFFER,
};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// TCP listener feeding an [`EventSource`]
#[derive(Debug)]
pub struct TcpTransport {
    source: Arc<EventSource>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Bind and start accepting connections
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let source = Arc::new(EventSource::new());

        let accept_task = tokio::spawn(accept_loop(listener, source.clone()));
        info!("TCP transport listening on {}", local_addr);

        Ok(Self {
            source,
            local_addr,
            accept_task,
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Listener registry of this transport
    pub fn source(&self) -> Arc<EventSource> {
        self.source.clone()
    }
}

impl TransportSource for TcpTransport {
    fn add_listener(&self, listener: Listener) -> ListenerToken {
        self.source.add_listener(listener)
    }

    fn remove_listener(&self, token: ListenerToken) -> bool {
        self.source.remove_listener(token)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, source: Arc<EventSource>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
                }
                source.emit_headers(ConnectionMeta {
                    remote_addr: peer,
                    headers: Vec::new(),
                });
                if let Err(rejected) = source.emit_connection(spawn_link(stream, peer)) {
                    debug!(peer = %rejected.remote_addr, "Nobody is accepting, dropping connection");
                }
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                source.emit_error(e.to_string());
            }
        }
    }
}

fn spawn_link(stream: TcpStream, peer: SocketAddr) -> Accepted {
    let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_BUFFER);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (read_half, write_half) = stream.into_split();

    tokio::spawn(read_loop(read_half, event_tx, peer));
    tokio::spawn(write_loop(write_half, command_rx, peer));

    Accepted {
        remote_addr: peer,
        link: Link {
            events: event_rx,
            commands: command_tx,
        },
    }
}

async fn read_loop(mut reader: OwnedReadHalf, events: mpsc::Sender<LinkEvent>, peer: SocketAddr) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        // A silent peer must not keep the socket alive once the link is gone
        let read = tokio::select! {
            read = reader.read_buf(&mut buffer) => read,
            _ = events.closed() => {
                trace!(peer = %peer, "Link dropped, releasing socket");
                break;
            }
        };

        let event = match read {
            Ok(0) => LinkEvent::Closed,
            Ok(n) => {
                trace!(peer = %peer, "Read {} bytes", n);
                LinkEvent::Data(buffer.split().freeze())
            }
            Err(e) => LinkEvent::Error(e.to_string()),
        };

        let done = !matches!(event, LinkEvent::Data(_));
        if events.send(event).await.is_err() || done {
            break;
        }
        buffer.reserve(READ_BUFFER_SIZE);
    }
    trace!(peer = %peer, "Read loop finished");
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    peer: SocketAddr,
) {
    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Send(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(peer = %peer, "Write failed: {}", e);
                    break;
                }
            }
            LinkCommand::Close => break,
        }
    }
    if let Err(e) = writer.shutdown().await {
        trace!(peer = %peer, "Shutdown failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;
    use crate::error::CloseCause;
    use crate::events::ServerEvent;
    use crate::protocol::{build_hello, build_ping, FrameReader, ServerFrame};
    use crate::Server;
    use std::time::Duration;

    async fn read_frame(stream: &mut TcpStream, reader: &mut FrameReader) -> ServerFrame {
        loop {
            if let Some(frame) = reader.next_frame().unwrap() {
                return ServerFrame::from_frame(frame).unwrap();
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before a frame arrived");
            reader.push(&chunk[..n]);
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_reader_stops_when_link_dropped() {
        let (_silent_client, server_side) = socket_pair().await;
        let peer = server_side.peer_addr().unwrap();
        let (read_half, _write_half) = server_side.into_split();
        let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_BUFFER);

        let reader = tokio::spawn(read_loop(read_half, event_tx, peer));
        drop(event_rx);

        tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("reader kept the socket open for a silent peer")
            .unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_socket_released_after_heartbeat_timeout() {
        let transport = Arc::new(TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let options = ServerOptions::new()
            .heartbeat_interval(50u64)
            .heartbeat_timeout(50u64);
        let mut server = Server::new(&options).unwrap();
        let mut events = server.subscribe();
        server.listen(transport.clone()).unwrap();

        let mut client = TcpStream::connect(transport.local_addr()).await.unwrap();
        let mut reader = FrameReader::new();
        client.write_all(&build_hello()).await.unwrap();
        assert!(matches!(
            read_frame(&mut client, &mut reader).await,
            ServerFrame::Welcome { .. }
        ));

        loop {
            let record = events.recv().await.unwrap();
            if let ServerEvent::ConnectionClosed { cause, .. } = record.event {
                assert_eq!(cause, CloseCause::HeartbeatTimeout);
                break;
            }
        }

        // Drain the ping, then expect EOF from a fully released socket
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            let mut chunk = [0u8; 1024];
            loop {
                match client.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(drained.is_ok(), "server never closed the socket");

        // Writing to a socket the server has fully closed is answered with a reset
        let reset = tokio::time::timeout(Duration::from_secs(5), async {
            let mut chunk = [0u8; 16];
            loop {
                if client.write_all(&build_ping(1)).await.is_err() {
                    return;
                }
                if client.read(&mut chunk).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reset.is_ok(), "server side socket still open after close");
    }

    #[tokio::test]
    async fn test_handshake_over_tcp() {
        let transport = Arc::new(TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let mut server = Server::new(&ServerOptions::new().supports_resuming(true)).unwrap();
        server.listen(transport.clone()).unwrap();

        let mut client = TcpStream::connect(transport.local_addr()).await.unwrap();
        let mut reader = FrameReader::new();

        client.write_all(&build_hello()).await.unwrap();
        let session_id = match read_frame(&mut client, &mut reader).await {
            ServerFrame::Welcome {
                session_id: Some(session_id),
                resumed: false,
            } => session_id,
            other => panic!("expected welcome, got {:?}", other),
        };
        assert!(server.session(&session_id).unwrap().is_bound());

        client.write_all(&build_ping(42)).await.unwrap();
        assert_eq!(
            read_frame(&mut client, &mut reader).await,
            ServerFrame::Pong(42)
        );

        server.stop().unwrap();
        assert_eq!(server.connection_count(), 1);
    }
}
