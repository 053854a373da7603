//! The two concurrency models (spec.md §5, component I).
//!
//! Two selectable shapes, never mixed in one process: a thread-per-connection
//! model built on plain blocking `std::net`, and a single-threaded
//! edge-triggered reactor built on `mio`. Both bind a dual-stack IPv6
//! socket via `socket2` (native `std::net` can't disable `IPV6_V6ONLY`
//! before bind) and install the same signal-driven graceful shutdown.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use crate::config::Concurrency;
use crate::context::ServerContext;
use crate::dispatcher::dispatch_line;
use crate::pubsub::ClientSink;
use crate::replication::{ReplicaLink, StdReplicaLink, run_replica_worker};
use crate::session::{ClientSession, ReplicaofAction};
use crate::types::{LinkState, Role};

pub fn run(ctx: Arc<ServerContext>) -> std::io::Result<()> {
    match ctx.config.concurrency {
        Concurrency::Threaded => run_threaded(ctx),
        Concurrency::EventLoop => run_reactor(ctx),
    }
}

fn bind_dual_stack(port: u16) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false).ok();
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = format!("[::]:{port}").parse().expect("valid wildcard address");
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket)
}

fn spawn_maintenance_threads(ctx: Arc<ServerContext>) {
    let sweeper_ctx = ctx.clone();
    std::thread::spawn(move || {
        while sweeper_ctx.running.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_secs(1));
            let removed = sweeper_ctx.keyspace.lock().unwrap().sweep_expired();
            if removed > 0 {
                tracing::debug!("expiry sweep removed {removed} keys");
            }
        }
    });

    std::thread::spawn(move || {
        while ctx.running.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_secs(1));
            ctx.maybe_timed_save();
            crate::persistence::reap_finished_children();
        }
    });
}

fn spawn_signal_handler(ctx: Arc<ServerContext>) -> std::io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("received signal {sig}, beginning graceful shutdown");
            ctx.running.store(false, Ordering::Relaxed);
            info!("flushing final snapshot");
            ctx.save_now();
            info!("shutdown complete");
            std::process::exit(0);
        }
    });
    Ok(())
}

/// The socket-backed sink shared between a client's read loop and anyone
/// (another client's PUBLISH, a replication feed) who needs to push bytes
/// to it asynchronously.
struct ThreadSink(Mutex<StdTcpStream>);

impl ClientSink for ThreadSink {
    fn push(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Err(e) = self.0.lock().unwrap().write_all(bytes) {
            warn!("write to client failed: {e}");
        }
    }
}

fn run_threaded(ctx: Arc<ServerContext>) -> std::io::Result<()> {
    let socket = bind_dual_stack(ctx.config.port)?;
    let listener: StdTcpListener = socket.into();
    info!("listening on port {} (threaded)", ctx.config.port);

    spawn_signal_handler(ctx.clone())?;
    spawn_maintenance_threads(ctx.clone());

    for incoming in listener.incoming() {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }
        match incoming {
            Ok(stream) => {
                if ctx.active_clients.load(Ordering::Relaxed) >= ctx.config.max_clients {
                    warn!("max clients reached, dropping connection");
                    continue;
                }
                ctx.active_clients.fetch_add(1, Ordering::Relaxed);
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection_threaded(&ctx, stream) {
                        warn!("connection handler error: {e}");
                    }
                    ctx.active_clients.fetch_sub(1, Ordering::Relaxed);
                });
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
    Ok(())
}

fn handle_connection_threaded(ctx: &Arc<ServerContext>, stream: StdTcpStream) -> std::io::Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let id = ctx.next_client_id();
    info!("client {id} connected from {peer}");

    let write_handle = stream.try_clone()?;
    let sink: Arc<dyn ClientSink> = Arc::new(ThreadSink(Mutex::new(write_handle)));
    let mut session = ClientSession::new(id, peer.clone(), sink.clone());

    let reader_stream = stream.try_clone()?;
    let mut reader = std::io::BufReader::new(reader_stream);
    let mut line = String::new();

    loop {
        line.clear();
        use std::io::BufRead;
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }

        let reply = dispatch_line(ctx, &mut session, &line);
        sink.push(&reply);

        if let Some(port) = session.pending_replica_port.take() {
            promote_to_replica_threaded(ctx, &stream, &peer, port)?;
        }
        if let Some(action) = session.pending_replicaof.take() {
            apply_replicaof(ctx, action);
        }
    }

    ctx.pubsub.lock().unwrap().remove_client(id);
    info!("client {id} disconnected");
    Ok(())
}

fn promote_to_replica_threaded(
    ctx: &Arc<ServerContext>,
    stream: &StdTcpStream,
    peer: &str,
    advertised_port: u16,
) -> std::io::Result<()> {
    let ip = peer.split(':').next().unwrap_or(peer).to_string();

    let sync_stream = stream.try_clone()?;
    let sync_link = StdReplicaLink(Mutex::new(sync_stream));
    {
        let keyspace = ctx.keyspace.lock().unwrap();
        let engine = ctx.replication.lock().unwrap();
        engine.sync_replica(&sync_link as &dyn ReplicaLink, &keyspace);
    }

    let feed_stream = stream.try_clone()?;
    feed_stream.set_nonblocking(true)?;
    let feed_link: Box<dyn ReplicaLink> = Box::new(StdReplicaLink(Mutex::new(feed_stream)));
    ctx.replication.lock().unwrap().add_replica(feed_link, ip, advertised_port);
    Ok(())
}

fn apply_replicaof(ctx: &Arc<ServerContext>, action: ReplicaofAction) {
    match action {
        ReplicaofAction::Connect(host, port) => {
            ctx.replication.lock().unwrap().replicaof(host, port);
            let worker_ctx = ctx.clone();
            let listening_port = ctx.config.port;
            std::thread::spawn(move || run_replica_worker(worker_ctx, listening_port));
        }
        ReplicaofAction::NoOne => {
            let mut engine = ctx.replication.lock().unwrap();
            engine.role = Role::Primary;
            engine.link_state = LinkState::None;
            engine.primary_host = None;
            engine.primary_port = None;
        }
    }
}

// --- Reactor model -------------------------------------------------------

struct MioReplicaLink(Arc<Mutex<mio::net::TcpStream>>);

impl ReplicaLink for MioReplicaLink {
    fn write_line(&self, bytes: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(bytes)
    }
}

struct ReactorSink(Arc<Mutex<mio::net::TcpStream>>);

impl ClientSink for ReactorSink {
    fn push(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Err(e) = self.0.lock().unwrap().write_all(bytes) {
            warn!("reactor write to client failed: {e}");
        }
    }
}

struct ReactorConn {
    stream: Arc<Mutex<mio::net::TcpStream>>,
    session: ClientSession,
    buf: Vec<u8>,
    peer: String,
}

fn run_reactor(ctx: Arc<ServerContext>) -> std::io::Result<()> {
    use mio::net::TcpListener as MioTcpListener;
    use mio::{Events, Interest, Poll, Token};
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_mio::v1_0::Signals;

    const LISTENER: Token = Token(0);
    const SIGNALS: Token = Token(1);

    let socket = bind_dual_stack(ctx.config.port)?;
    socket.set_nonblocking(true)?;
    let std_listener: StdTcpListener = socket.into();
    let mut listener = MioTcpListener::from_std(std_listener);

    let mut poll = Poll::new()?;
    poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    poll.registry().register(&mut signals, SIGNALS, Interest::READABLE)?;

    info!("listening on port {} (reactor)", ctx.config.port);

    let mut connections: HashMap<Token, ReactorConn> = HashMap::new();
    let mut next_token = 2usize;
    let mut events = Events::with_capacity(ctx.config.max_events);
    let mut last_maintenance = Instant::now();

    'outer: loop {
        poll.poll(&mut events, Some(Duration::from_millis(100)))?;

        for event in events.iter() {
            match event.token() {
                LISTENER => loop {
                    match listener.accept() {
                        Ok((mut stream, addr)) => {
                            if ctx.active_clients.load(Ordering::Relaxed) >= ctx.config.max_clients {
                                warn!("max clients reached, dropping connection");
                                continue;
                            }
                            let token = Token(next_token);
                            next_token += 1;
                            if let Err(e) = poll.registry().register(&mut stream, token, Interest::READABLE) {
                                warn!("failed to register connection: {e}");
                                continue;
                            }
                            let id = ctx.next_client_id();
                            let shared = Arc::new(Mutex::new(stream));
                            let sink: Arc<dyn ClientSink> = Arc::new(ReactorSink(shared.clone()));
                            let peer = addr.to_string();
                            let session = ClientSession::new(id, peer.clone(), sink);
                            connections.insert(
                                token,
                                ReactorConn { stream: shared, session, buf: Vec::new(), peer },
                            );
                            ctx.active_clients.fetch_add(1, Ordering::Relaxed);
                            info!("client {id} connected from {addr}");
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            break;
                        }
                    }
                },
                SIGNALS => {
                    for sig in signals.pending() {
                        info!("received signal {sig}, beginning graceful shutdown");
                        ctx.running.store(false, Ordering::Relaxed);
                        info!("flushing final snapshot");
                        ctx.save_now();
                        info!("shutdown complete");
                        break 'outer;
                    }
                }
                token => {
                    let close = match connections.get_mut(&token) {
                        Some(conn) => service_reactor_connection(&ctx, conn),
                        None => false,
                    };
                    if close {
                        if let Some(conn) = connections.remove(&token) {
                            ctx.pubsub.lock().unwrap().remove_client(conn.session.id);
                            ctx.active_clients.fetch_sub(1, Ordering::Relaxed);
                            info!("client {} disconnected", conn.session.id);
                        }
                    }
                }
            }
        }

        if last_maintenance.elapsed() >= Duration::from_secs(1) {
            ctx.keyspace.lock().unwrap().sweep_expired();
            ctx.maybe_timed_save();
            crate::persistence::reap_finished_children();
            last_maintenance = Instant::now();
        }

        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }
    }
    Ok(())
}

/// Drains whatever is readable on one connection, dispatching each
/// complete line. Returns `true` if the connection should be torn down.
fn service_reactor_connection(ctx: &Arc<ServerContext>, conn: &mut ReactorConn) -> bool {
    let mut chunk = [0u8; 4096];
    loop {
        let read = {
            let mut stream = conn.stream.lock().unwrap();
            stream.read(&mut chunk)
        };
        match read {
            Ok(0) => return true,
            Ok(n) => conn.buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("read from client {} failed: {e}", conn.session.id);
                return true;
            }
        }
    }

    while let Some(pos) = conn.buf.iter().position(|&b| b == b'\n') {
        let line_bytes: Vec<u8> = conn.buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line_bytes).into_owned();

        let reply = dispatch_line(ctx, &mut conn.session, &line);
        if !reply.is_empty() {
            if let Err(e) = conn.stream.lock().unwrap().write_all(&reply) {
                warn!("write to client {} failed: {e}", conn.session.id);
                return true;
            }
        }

        if let Some(port) = conn.session.pending_replica_port.take() {
            let ip = conn.peer.split(':').next().unwrap_or(&conn.peer).to_string();
            let link: Box<dyn ReplicaLink> = Box::new(MioReplicaLink(conn.stream.clone()));
            {
                let keyspace = ctx.keyspace.lock().unwrap();
                let engine = ctx.replication.lock().unwrap();
                let sync_link = MioReplicaLink(conn.stream.clone());
                engine.sync_replica(&sync_link as &dyn ReplicaLink, &keyspace);
            }
            ctx.replication.lock().unwrap().add_replica(link, ip, port);
        }
        if let Some(action) = conn.session.pending_replicaof.take() {
            apply_replicaof(ctx, action);
        }
    }

    false
}

