//! Helpers shared by the end-to-end tests: nodes listening on loopback and a
//! minimal websocket client.

#![allow(dead_code)]

use braid_protocol::{codec, Message, MultipartAssembler, PeerId};
use braid_server::{handlers, Server, ServerConfig};
use braid_transport::{LinkConfig, LinkEvent, PeerLink, SocketHandle};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn config(id: u64) -> ServerConfig {
    ServerConfig {
        peer_id: Some(PeerId(id)),
        handshake_timeout: Duration::from_secs(2),
        sync_timeout: Duration::from_secs(5),
        close_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

/// A server listening on loopback.
pub struct Node {
    pub server: Server,
    pub address: String,
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Node {
    pub async fn spawn(config: ServerConfig) -> Self {
        Self::spawn_on(config, 0).await
    }

    pub async fn spawn_on(config: ServerConfig, port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = Server::new(config);
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn({
            let server = server.clone();
            async move {
                handlers::serve(listener, server, "/ws", async {
                    let _ = signal.await;
                })
                .await
                .unwrap();
            }
        });
        Self {
            server,
            address: format!("ws://127.0.0.1:{port}/ws"),
            port,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    pub fn id(&self) -> PeerId {
        self.server.id()
    }

    /// Trigger graceful shutdown and wait for the listener to stop.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            tokio::time::timeout(WAIT, task)
                .await
                .expect("node did not stop")
                .unwrap();
        }
    }
}

/// A TCP relay in front of a node whose connections can be cut abruptly.
pub struct Proxy {
    pub address: String,
    relays: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept: JoinHandle<()>,
}

impl Proxy {
    pub async fn spawn(target: &Node) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let upstream = format!("127.0.0.1:{}", target.port);
        let relays: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();
        let accept = tokio::spawn({
            let relays = Arc::clone(&relays);
            async move {
                while let Ok((mut inbound, _)) = listener.accept().await {
                    let upstream = upstream.clone();
                    let relay = tokio::spawn(async move {
                        if let Ok(mut outbound) = TcpStream::connect(upstream).await {
                            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                        }
                    });
                    relays.lock().push(relay);
                }
            }
        });
        Self {
            address: format!("ws://127.0.0.1:{port}/ws"),
            relays,
            accept,
        }
    }

    /// Drop every relayed connection without a websocket close.
    pub fn sever(&self) {
        for relay in self.relays.lock().drain(..) {
            relay.abort();
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.accept.abort();
        self.sever();
    }
}

/// Poll `condition` until it holds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Await `future` with the shared timeout.
pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// A websocket client speaking the client side of the protocol.
pub struct Client {
    handle: SocketHandle,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    multipart: MultipartAssembler,
}

impl Client {
    pub async fn connect(node: &Node) -> Self {
        let link = PeerLink::connect(&node.address, LinkConfig::default())
            .await
            .unwrap();
        let (handle, events) = link.into_parts();
        Self {
            handle,
            events,
            multipart: MultipartAssembler::new(Duration::from_secs(60)),
        }
    }

    pub fn send(&self, message: Message) {
        self.handle.send(&message).unwrap();
    }

    pub fn close(&self) {
        self.handle.close(1000, "Done");
    }

    /// Next complete message.
    pub async fn recv(&mut self) -> Message {
        loop {
            let event = within("client frame", self.events.recv())
                .await
                .expect("client link ended");
            let data = match event {
                LinkEvent::Message(data) => data,
                LinkEvent::Closed { code, reason } => panic!("client closed {code}: {reason}"),
            };
            match codec::decode(&data).unwrap() {
                Message::MultipartContainer {
                    id,
                    position,
                    length,
                    data,
                } => {
                    if let Some(frame) = self.multipart.push(id, position, length, data).unwrap() {
                        return codec::decode(&frame).unwrap();
                    }
                }
                message => return message,
            }
        }
    }

    /// Skip messages until `select` picks one.
    pub async fn recv_matching<T>(&mut self, mut select: impl FnMut(Message) -> Option<T>) -> T {
        loop {
            if let Some(found) = select(self.recv().await) {
                return found;
            }
        }
    }

    /// The close code once the server closes the socket.
    pub async fn closed(&mut self) -> u16 {
        loop {
            match within("client close", self.events.recv()).await {
                Some(LinkEvent::Closed { code, .. }) => return code,
                Some(LinkEvent::Message(_)) => {}
                None => return 1006,
            }
        }
    }
}
