//! Listener: accepts sockets and hands each to a new connection.
//!
//! The accept task owns the TCP listener and retries accept failures with
//! backoff. Each accepted socket gets its own setup task that disables
//! nagling, performs the TLS handshake where applicable (bounded by a
//! timeout so a stalled peer cannot wedge accepting), builds the connection,
//! and invokes the user callback. The server tracks live connections as weak
//! entries in a slab, so it can close them all on shutdown without extending
//! their lifetime.

use crate::{
    addr::{
        Address,
        Transport,
    },
    connection::{
        ConnShared,
        Connection,
    },
    error::{
        Error,
        Result,
    },
    tls,
    util::{
        try_denagle,
        IoStream,
    },
    Config,
};
use futures::{
    select_biased,
    FutureExt,
};
use parking_lot::Mutex;
use sbs::Repository;
use slab::Slab;
use std::{
    cmp::min,
    convert::Infallible,
    io,
    net::SocketAddr,
    panic::{
        catch_unwind,
        AssertUnwindSafe,
    },
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    time::{sleep, timeout},
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;


// exponential backoff parameters for failures in accepting new TCP
// connections
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(60);

// timeout for the TLS handshake to complete after a TCP connection is
// established, so connection exhaustion can't stall the listener
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

type ConnCallback = Arc<dyn Fn(Connection) + Send + Sync>;

/// Bind to `addr` and invoke `on_conn` with every accepted connection.
///
/// The callback runs on the connection's setup task; if it panics, the
/// panic is contained, the new connection is closed, and the listener keeps
/// accepting. An `ssl+sbs` address requires `config.pem_file`.
pub async fn listen<F>(
    repo: Arc<Repository>,
    addr: &str,
    on_conn: F,
    config: Config,
) -> Result<Server>
where
    F: Fn(Connection) + Send + Sync + 'static,
{
    let address = Address::parse(addr)?;
    let acceptor = match address.transport {
        Transport::Tcp => None,
        Transport::Ssl => {
            let pem_file = config.pem_file.as_deref().ok_or_else(|| {
                Error::Transport(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "pem_file is required to listen on an ssl address",
                ))
            })?;
            Some(tls::acceptor(pem_file)?)
        }
    };

    let listener = TcpListener::bind((address.host.as_str(), address.port)).await?;
    let local = listener.local_addr()?;
    let bound = Address {
        transport: address.transport,
        host: local.ip().to_string(),
        port: local.port(),
    };
    info!(%bound, "listening");

    let shared = Arc::new(ServerShared {
        addresses: vec![bound],
        lockable: Mutex::new(ServerLockableState { conns: Slab::new() }),
        closing: CancellationToken::new(),
        closed_send: watch::channel(false).0,
    });
    tokio::spawn(accept_task(
        Arc::clone(&shared),
        listener,
        acceptor,
        Arc::new(on_conn),
        repo,
        config,
    ));
    Ok(Server { shared })
}

/// Handle to a listening chatter server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    addresses: Vec<Address>,
    lockable: Mutex<ServerLockableState>,
    // trips once when the server begins closing
    closing: CancellationToken,
    // flips to true once accepting has stopped and every accepted
    // connection's closure completed
    closed_send: watch::Sender<bool>,
}

struct ServerLockableState {
    // weak so the listener never keeps a dead connection alive; pruned
    // opportunistically on registration
    conns: Slab<Weak<ConnShared>>,
}

impl Server {
    /// Addresses actually bound, after port 0 resolution.
    pub fn addresses(&self) -> &[Address] {
        &self.shared.addresses
    }

    /// Stop accepting, close every still-open accepted connection, and wait
    /// until all of that completed. Idempotent.
    pub async fn close(&self) {
        self.shared.closing.cancel();
        self.wait_closed().await;
    }

    /// Wait until the server is fully closed, without initiating shutdown.
    pub async fn wait_closed(&self) {
        let mut closed = self.shared.closed_send.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed_send.borrow()
    }
}


async fn accept_task(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    on_conn: ConnCallback,
    repo: Arc<Repository>,
    config: Config,
) {
    select_biased! {
        _ = shared.closing.cancelled().fuse() => {
            trace!("accept task shutting down because shut down requested");
        }
        _ = accept_loop(&shared, &listener, &acceptor, &on_conn, &repo, &config).fuse() => {
            unreachable!("accept loop never returns");
        }
    }

    // stop accepting before tearing down the connections
    drop(listener);
    let conns = {
        let mut lock = shared.lockable.lock();
        lock.conns
            .drain()
            .filter_map(|weak| weak.upgrade())
            .collect::<Vec<_>>()
    };
    for conn in conns {
        Connection::from_shared(conn).close().await;
    }
    // send_replace stores the value even with no receiver subscribed yet
    shared.closed_send.send_replace(true);
    trace!("server closed");
}

async fn accept_loop(
    shared: &Arc<ServerShared>,
    listener: &TcpListener,
    acceptor: &Option<TlsAcceptor>,
    on_conn: &ConnCallback,
    repo: &Arc<Repository>,
    config: &Config,
) -> Infallible {
    let mut backoff = ACCEPT_BACKOFF_MIN;
    loop {
        match listener.accept().await {
            Ok((tcp, peer)) => {
                backoff = ACCEPT_BACKOFF_MIN;
                tokio::spawn(setup_task(
                    Arc::clone(shared),
                    tcp,
                    peer,
                    acceptor.clone(),
                    Arc::clone(on_conn),
                    Arc::clone(repo),
                    config.clone(),
                ));
            }
            Err(e) => {
                error!(%e, "accept error (retrying in {:.3} s)", backoff.as_secs_f32());
                sleep(backoff).await;
                backoff = min(backoff * 2, ACCEPT_BACKOFF_MAX);
            }
        }
    }
}

// per-socket setup: nagle off, TLS handshake if applicable, connection
// construction, registration, user callback
async fn setup_task(
    shared: Arc<ServerShared>,
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    on_conn: ConnCallback,
    repo: Arc<Repository>,
    config: Config,
) {
    try_denagle(&tcp);
    let local = match tcp.local_addr() {
        Ok(local) => local,
        Err(e) => {
            debug!(%e, "dropping accepted socket");
            return;
        }
    };
    let transport = shared.addresses[0].transport;

    let stream: IoStream = match &acceptor {
        None => Box::new(tcp),
        Some(acceptor) => {
            let handshake = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp));
            let stream = select_biased! {
                _ = shared.closing.cancelled().fuse() => return,
                result = handshake.fuse() => match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        debug!(%e, %peer, "tls handshake error");
                        return;
                    }
                    Err(_) => {
                        debug!(%peer, "tls handshake timeout");
                        return;
                    }
                },
            };
            Box::new(stream)
        }
    };

    let local_address = Address {
        transport,
        host: local.ip().to_string(),
        port: local.port(),
    };
    let remote_address = Address {
        transport,
        host: peer.ip().to_string(),
        port: peer.port(),
    };
    debug!(%remote_address, "accepted connection");
    let conn = Connection::new(repo, stream, local_address, remote_address, &config);

    // register for shutdown, unless the server is already closing
    {
        let mut lock = shared.lockable.lock();
        if shared.closing.is_cancelled() {
            drop(lock);
            conn.close().await;
            return;
        }
        lock.conns.retain(|_, weak| weak.strong_count() > 0);
        lock.conns.insert(conn.downgrade());
    }

    // hand off to the user; contain a panicking callback
    let result = catch_unwind(AssertUnwindSafe(|| on_conn(conn.clone())));
    if result.is_err() {
        error!("connection callback panicked (closing connection)");
        conn.close().await;
    }
}
