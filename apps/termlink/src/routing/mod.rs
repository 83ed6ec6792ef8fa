//! Connection routing: accept inbound connections and pipe each one to the
//! upstream its handshake resolves to.

pub mod backoff;
pub mod classify;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::sync::watch;

use crate::error::{PipeError, RoutingError};
use crate::listener::{display_peer, Acceptor};

pub use backoff::AcceptBackoff;
pub use classify::{is_ignored_error, is_temporary_accept_error};
pub use upstream::{
    AuthPipe, ChallengeContext, ConnMetadata, RegistryResolver, Route, UpstreamAuth, UpstreamIo,
    UpstreamResolver, UpstreamStream,
};

/// Upper bound on the handshake of a single connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the protocol handshake on a fresh connection and produces a live pipe.
#[async_trait]
pub trait Negotiator<C: Send + 'static>: Send + Sync + 'static {
    type Piped: PipedConnection;

    async fn negotiate(&self, conn: C, peer: Option<SocketAddr>) -> Result<Self::Piped, PipeError>;
}

/// A bridged client/upstream pair.
#[async_trait]
pub trait PipedConnection: Send + 'static {
    /// Resolve when either side ends the pipe.
    async fn wait(&mut self) -> Result<(), PipeError>;

    /// Release both sides. Safe to call more than once.
    async fn close(&mut self);
}

/// Accept loop that hands every connection to a [`Negotiator`] on its own task.
pub struct Routing<N> {
    negotiator: Arc<N>,
    handshake_timeout: Duration,
    closed: Mutex<bool>,
    done: watch::Sender<bool>,
}

impl<N> Routing<N> {
    pub fn new(negotiator: N) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            negotiator: Arc::new(negotiator),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            closed: Mutex::new(false),
            done,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Stop accepting. Idempotent; in-flight pipes keep running.
    pub fn shutdown(&self) {
        let mut closed = match self.closed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *closed {
            return;
        }
        *closed = true;
        self.done.send_replace(true);
        info!("Routing shutdown requested");
    }

    /// Accept until shutdown or a fatal accept error.
    ///
    /// Never returns `Ok`: a requested shutdown surfaces as
    /// [`RoutingError::ListenerClosed`].
    pub async fn serve<A>(&self, mut acceptor: A) -> Result<(), RoutingError>
    where
        A: Acceptor,
        N: Negotiator<A::Conn>,
    {
        let mut done = self.done.subscribe();
        let mut backoff = AcceptBackoff::new();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = done.wait_for(|closed| *closed) => return Err(RoutingError::ListenerClosed),
                accepted = acceptor.accept() => accepted,
            };

            let (conn, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    if *done.borrow() {
                        return Err(RoutingError::ListenerClosed);
                    }
                    if is_temporary_accept_error(&err) {
                        let delay = backoff.next_delay();
                        error!("Accept error: {}; retrying in {:?}", err, delay);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    error!("Failed to accept connection: {}", err);
                    return Err(RoutingError::Accept(err));
                }
            };

            backoff.reset();
            debug!("[{}] accepted connection", display_peer(peer));
            tokio::spawn(pipe_connection(
                Arc::clone(&self.negotiator),
                conn,
                peer,
                self.handshake_timeout,
            ));
        }
    }
}

async fn pipe_connection<N, C>(negotiator: Arc<N>, conn: C, peer: Option<SocketAddr>, timeout: Duration)
where
    N: Negotiator<C>,
    C: Send + 'static,
{
    let addr = display_peer(peer);
    let mut handshake = tokio::spawn(async move { negotiator.negotiate(conn, peer).await });

    let outcome = tokio::select! {
        joined = &mut handshake => Some(joined),
        _ = tokio::time::sleep(timeout) => None,
    };

    let mut piped = match outcome {
        Some(Ok(Ok(piped))) => piped,
        Some(Ok(Err(err))) => {
            log_pipe_error(&addr, "connection establishing failed", &err);
            return;
        }
        Some(Err(join_err)) => {
            error!("[{}] handshake task failed: {}", addr, join_err);
            return;
        }
        None => {
            // Aborting drops the connection held by the handshake.
            handshake.abort();
            debug!("[{}] pipe establishing timeout", addr);
            return;
        }
    };

    debug!("[{}] pipe established", addr);
    let result = piped.wait().await;
    piped.close().await;

    match result {
        Ok(()) => debug!("[{}] pipe closed", addr),
        Err(err) => log_pipe_error(&addr, "error waiting for pipe", &err),
    }
}

fn log_pipe_error(addr: &str, context: &str, err: &PipeError) {
    if is_ignored_error(err) {
        debug!("[{}] {}: {}", addr, context, err);
    } else {
        error!("[{}] {}: {}", addr, context, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolveError;
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    struct MapResolver {
        routes: Mutex<HashMap<String, DuplexStream>>,
    }

    impl MapResolver {
        fn new(routes: Vec<(&str, DuplexStream)>) -> Arc<Self> {
            let routes = routes
                .into_iter()
                .map(|(user, stream)| (user.to_string(), stream))
                .collect();
            Arc::new(Self {
                routes: Mutex::new(routes),
            })
        }
    }

    #[async_trait]
    impl UpstreamResolver for MapResolver {
        async fn find_upstream(
            &self,
            conn: &ConnMetadata,
            _challenge: &ChallengeContext,
        ) -> Result<Route, ResolveError> {
            let upstream = self
                .routes
                .lock()
                .unwrap()
                .remove(&conn.user)
                .ok_or_else(|| ResolveError::UnknownClient(conn.user.clone()))?;
            Ok(Route {
                upstream: Box::new(upstream),
                auth: AuthPipe::none(conn.user.clone()),
            })
        }
    }

    /// Handshake: the client sends its session id followed by a newline.
    struct LineNegotiator {
        resolver: Arc<dyn UpstreamResolver>,
    }

    struct CopyPipe {
        client: DuplexStream,
        upstream: UpstreamStream,
    }

    #[async_trait]
    impl PipedConnection for CopyPipe {
        async fn wait(&mut self) -> Result<(), PipeError> {
            tokio::io::copy_bidirectional(&mut self.client, &mut self.upstream).await?;
            Ok(())
        }

        async fn close(&mut self) {
            let _ = self.client.shutdown().await;
            let _ = self.upstream.shutdown().await;
        }
    }

    async fn read_line(conn: &mut DuplexStream) -> io::Result<String> {
        let mut line = Vec::new();
        loop {
            let byte = conn.read_u8().await?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    #[async_trait]
    impl Negotiator<DuplexStream> for LineNegotiator {
        type Piped = CopyPipe;

        async fn negotiate(
            &self,
            mut conn: DuplexStream,
            peer: Option<SocketAddr>,
        ) -> Result<CopyPipe, PipeError> {
            let user = read_line(&mut conn).await?;
            let meta = ConnMetadata {
                user,
                remote_addr: peer,
            };
            let route = self
                .resolver
                .find_upstream(&meta, &ChallengeContext::default())
                .await?;
            Ok(CopyPipe {
                client: conn,
                upstream: route.upstream,
            })
        }
    }

    /// Never finishes its handshake.
    struct StallNegotiator {
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Negotiator<DuplexStream> for StallNegotiator {
        type Piped = CopyPipe;

        async fn negotiate(
            &self,
            conn: DuplexStream,
            _peer: Option<SocketAddr>,
        ) -> Result<CopyPipe, PipeError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _held = conn;
            std::future::pending().await
        }
    }

    struct MockAcceptor {
        incoming: mpsc::UnboundedReceiver<io::Result<DuplexStream>>,
    }

    #[async_trait]
    impl Acceptor for MockAcceptor {
        type Conn = DuplexStream;

        async fn accept(&mut self) -> io::Result<(DuplexStream, Option<SocketAddr>)> {
            match self.incoming.recv().await {
                Some(Ok(stream)) => Ok((stream, None)),
                Some(Err(err)) => Err(err),
                None => std::future::pending().await,
            }
        }
    }

    fn mock_acceptor() -> (mpsc::UnboundedSender<io::Result<DuplexStream>>, MockAcceptor) {
        let (tx, incoming) = mpsc::unbounded_channel();
        (tx, MockAcceptor { incoming })
    }

    fn line_routing(routes: Vec<(&str, DuplexStream)>) -> Arc<Routing<LineNegotiator>> {
        Arc::new(Routing::new(LineNegotiator {
            resolver: MapResolver::new(routes),
        }))
    }

    fn spawn_serve<N>(
        routing: &Arc<Routing<N>>,
        acceptor: MockAcceptor,
    ) -> tokio::task::JoinHandle<Result<(), RoutingError>>
    where
        N: Negotiator<DuplexStream>,
    {
        let routing = Arc::clone(routing);
        tokio::spawn(async move { routing.serve(acceptor).await })
    }

    fn connect(tx: &mpsc::UnboundedSender<io::Result<DuplexStream>>) -> DuplexStream {
        let (client, server_side) = duplex(4096);
        tx.send(Ok(server_side)).unwrap();
        client
    }

    async fn assert_closed_by_server(client: &mut DuplexStream) {
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("server did not close the connection");
        assert!(matches!(read, Ok(0)), "expected EOF, got {:?}", read);
    }

    #[tokio::test]
    async fn test_bridges_resolved_session_byte_for_byte() {
        let (upstream_near, mut upstream_far) = duplex(4096);
        let routing = line_routing(vec![("abc123", upstream_near)]);
        let (tx, acceptor) = mock_acceptor();
        let server = spawn_serve(&routing, acceptor);

        let mut client = connect(&tx);
        client.write_all(b"abc123\nhello upstream").await.unwrap();

        let mut buf = [0u8; 14];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello upstream");

        upstream_far.write_all(b"hello client").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello client");

        routing.shutdown();
        let result = server.await.unwrap();
        assert!(matches!(result, Err(RoutingError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_relay_in_flight_survives_shutdown() {
        let (upstream_near, mut upstream_far) = duplex(4096);
        let routing = line_routing(vec![("abc123", upstream_near)]);
        let (tx, acceptor) = mock_acceptor();
        let server = spawn_serve(&routing, acceptor);

        let mut client = connect(&tx);
        client.write_all(b"abc123\nfirst").await.unwrap();
        let mut buf = [0u8; 5];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");

        routing.shutdown();
        assert!(matches!(server.await.unwrap(), Err(RoutingError::ListenerClosed)));

        client.write_all(b"after").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), upstream_far.read_exact(&mut buf))
            .await
            .expect("relay stopped after shutdown")
            .unwrap();
        assert_eq!(&buf, b"after");

        upstream_far.write_all(b"reply").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn test_unknown_client_is_closed_and_serving_continues() {
        let (upstream_near, mut upstream_far) = duplex(4096);
        let routing = line_routing(vec![("abc123", upstream_near)]);
        let (tx, acceptor) = mock_acceptor();
        let server = spawn_serve(&routing, acceptor);

        let mut stranger = connect(&tx);
        stranger.write_all(b"xyz\n").await.unwrap();
        assert_closed_by_server(&mut stranger).await;

        let mut client = connect(&tx);
        client.write_all(b"abc123\nping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(!server.is_finished());
        routing.shutdown();
        assert!(matches!(server.await.unwrap(), Err(RoutingError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_before_serve_returns_listener_closed() {
        let routing = line_routing(vec![]);
        routing.shutdown();

        let (_tx, acceptor) = mock_acceptor();
        let result = routing.serve(acceptor).await;
        assert!(matches!(result, Err(RoutingError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_is_idempotent() {
        let routing = line_routing(vec![]);
        let (_tx, acceptor) = mock_acceptor();
        let server = spawn_serve(&routing, acceptor);

        let mut callers = Vec::new();
        for _ in 0..8 {
            let routing = Arc::clone(&routing);
            callers.push(tokio::spawn(async move { routing.shutdown() }));
        }
        for caller in callers {
            caller.await.unwrap();
        }
        routing.shutdown();

        assert!(matches!(server.await.unwrap(), Err(RoutingError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_stalled_handshake_is_abandoned_after_timeout() {
        let started = Arc::new(AtomicUsize::new(0));
        let routing = Arc::new(
            Routing::new(StallNegotiator {
                started: Arc::clone(&started),
            })
            .with_handshake_timeout(Duration::from_millis(50)),
        );
        let (tx, acceptor) = mock_acceptor();
        let server = spawn_serve(&routing, acceptor);

        let mut first = connect(&tx);
        assert_closed_by_server(&mut first).await;

        let _second = connect(&tx);
        tokio::time::timeout(Duration::from_secs(2), async {
            while started.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second connection was not accepted");

        routing.shutdown();
        assert!(matches!(server.await.unwrap(), Err(RoutingError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_temporary_accept_error_is_retried() {
        let (upstream_near, mut upstream_far) = duplex(4096);
        let routing = line_routing(vec![("abc123", upstream_near)]);
        let (tx, acceptor) = mock_acceptor();
        let server = spawn_serve(&routing, acceptor);

        tx.send(Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
            .unwrap();
        tx.send(Err(io::Error::from(io::ErrorKind::Interrupted)))
            .unwrap();

        let mut client = connect(&tx);
        client.write_all(b"abc123\nafter retry").await.unwrap();
        let mut buf = [0u8; 11];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"after retry");

        routing.shutdown();
        assert!(matches!(server.await.unwrap(), Err(RoutingError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_fatal_accept_error_ends_serve() {
        let routing = line_routing(vec![]);
        let (tx, acceptor) = mock_acceptor();
        let server = spawn_serve(&routing, acceptor);

        tx.send(Err(io::Error::new(io::ErrorKind::Other, "listener broken")))
            .unwrap();

        match server.await.unwrap() {
            Err(RoutingError::Accept(err)) => assert_eq!(err.to_string(), "listener broken"),
            other => panic!("expected accept error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_connections_only_known_sessions_relay() {
        let mut upstreams = HashMap::new();
        let mut routes = Vec::new();
        let names: Vec<String> = (0..6).map(|i| format!("s{}", i)).collect();
        for name in names.iter().step_by(2) {
            let (near, far) = duplex(4096);
            routes.push((name.as_str(), near));
            upstreams.insert(name.clone(), far);
        }
        let routing = line_routing(routes);
        let (tx, acceptor) = mock_acceptor();
        let server = spawn_serve(&routing, acceptor);

        let mut clients = Vec::new();
        for name in &names {
            let mut client = connect(&tx);
            client
                .write_all(format!("{}\n{}", name, name).as_bytes())
                .await
                .unwrap();
            clients.push((name.clone(), client));
        }

        for (name, mut client) in clients {
            match upstreams.get_mut(&name) {
                Some(upstream) => {
                    let mut buf = vec![0u8; name.len()];
                    upstream.read_exact(&mut buf).await.unwrap();
                    assert_eq!(buf, name.as_bytes());
                }
                None => assert_closed_by_server(&mut client).await,
            }
        }

        routing.shutdown();
        assert!(matches!(server.await.unwrap(), Err(RoutingError::ListenerClosed)));
    }
}
