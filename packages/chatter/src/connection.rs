//! A single chatter connection and its duplex task pipeline.
//!
//! Four tasks cooperate over one byte stream. The reader task decodes
//! inbound frames, answers pings, and pushes user-visible messages onto the
//! receive queue (suspending when a bounded queue is full, which
//! backpressures the peer). The writer task drains one FIFO outbound queue
//! fed by user sends, the ping task, and pong responses. The ping task
//! probes the peer whenever input goes idle and closes the connection when a
//! probe goes unanswered. The timeout task sleeps until the earliest pending
//! conversation deadline and fires the registered callbacks.
//!
//! All four tasks race their inner loop against one cancellation token; an
//! error inside any loop cancels the token, which stops the others. A
//! supervisor task joins them, after which the connection is closed: the
//! writer has drained what it could within a grace window and half-closed
//! the stream, pending conversation timeouts are abandoned without firing,
//! and a pending `receive` fails.
//!
//! Message IDs are allocated and messages enqueued under one mutex, so the
//! order of frames on the wire is the order of ID allocation across every
//! producer. The peer relies on this: inbound IDs must be strictly
//! increasing.

use crate::{
    addr::{
        Address,
        Transport,
    },
    codec,
    conv::{
        Conversation,
        ConvRegistry,
        TimeoutCb,
    },
    error::{
        Error,
        Result,
    },
    tls,
    util::{
        queue,
        some_or_pending,
        try_denagle,
        IoStream,
        QueueReceiver,
        QueueSender,
    },
    wire::{
        Data,
        Msg,
        WireData,
        WireMsg,
        CHATTER_MODULE,
        PING_TYPE,
        PONG_TYPE,
    },
    Config,
};
use futures::{
    select_biased,
    FutureExt,
};
use parking_lot::Mutex;
use sbs::{
    Repository,
    Value,
};
use std::{
    convert::Infallible,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    io::{
        split,
        AsyncWriteExt,
        ReadHalf,
        WriteHalf,
    },
    net::TcpStream,
    sync::{
        mpsc::{
            unbounded_channel,
            UnboundedReceiver,
            UnboundedSender,
        },
        watch,
        Mutex as AsyncMutex,
        Notify,
    },
    time::{
        sleep,
        sleep_until,
        timeout,
        Instant,
    },
};
use tokio_util::sync::CancellationToken;


// how long the writer keeps flushing already-enqueued messages once the
// connection starts closing
const WRITE_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Connect to a chatter peer listening on `addr`.
///
/// Fails if the address is invalid, the peer is absent, or the TLS
/// handshake fails. With an `ssl+sbs` address, `config.pem_file` optionally
/// supplies a client certificate; the server's certificate is not verified.
pub async fn connect(repo: Arc<Repository>, addr: &str, config: Config) -> Result<Connection> {
    let address = Address::parse(addr)?;
    let tcp = TcpStream::connect((address.host.as_str(), address.port)).await?;
    try_denagle(&tcp);
    let local = tcp.local_addr()?;
    let peer = tcp.peer_addr()?;

    let stream: IoStream = match address.transport {
        Transport::Tcp => Box::new(tcp),
        Transport::Ssl => {
            let connector = tls::connector(config.pem_file.as_deref())?;
            let server_name = tls::server_name(&address.host)?;
            Box::new(connector.connect(server_name, tcp).await?)
        }
    };

    let local_address = Address {
        transport: address.transport,
        host: local.ip().to_string(),
        port: local.port(),
    };
    let remote_address = Address {
        transport: address.transport,
        host: peer.ip().to_string(),
        port: peer.port(),
    };
    debug!(%local_address, %remote_address, "connected");
    Ok(Connection::new(repo, stream, local_address, remote_address, &config))
}

/// Handle to one chatter connection. Cheap to clone; all clones refer to the
/// same connection.
///
/// Dropping the handles does not close the connection; call
/// [`Connection::close`], or rely on the peer, a protocol error, or a ping
/// timeout to end it.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnShared>,
}

/// Options for [`Connection::send_with`]. The default is how `send` behaves:
/// open a fresh conversation, `last` and `token` set, no response timeout.
pub struct SendOpts {
    /// Conversation to continue; `None` opens a new one owned by this peer.
    pub conv: Option<Conversation>,
    /// Whether this message ends the conversation.
    pub last: bool,
    /// Turn-taking flag, preserved end-to-end.
    pub token: bool,
    /// Arm a response timeout for the conversation. A later send on the same
    /// conversation re-arms it, dropping the earlier deadline and callback.
    pub timeout: Option<Duration>,
    /// Fired if the timeout expires before the peer answers.
    pub timeout_cb: Option<TimeoutCb>,
}

impl Default for SendOpts {
    fn default() -> Self {
        SendOpts {
            conv: None,
            last: true,
            token: true,
            timeout: None,
            timeout_cb: None,
        }
    }
}

// state shared between the connection handles and the connection's tasks
pub(crate) struct ConnShared {
    repo: Arc<Repository>,
    local_address: Address,
    remote_address: Address,
    // every producer enqueues here; only the writer task consumes
    send_send: UnboundedSender<WireMsg>,
    // only `receive` consumes; only the reader task produces
    recv_recv: AsyncMutex<QueueReceiver<Msg>>,
    lockable: Mutex<ConnLockableState>,
    // trips once when the connection begins closing, for any reason
    closing: CancellationToken,
    // pinged by the reader on every inbound frame
    activity: Notify,
    // pinged when a new conversation deadline is registered
    timeouts_changed: Notify,
    // flips to true once every task has exited
    closed_send: watch::Sender<bool>,
}

struct ConnLockableState {
    registry: ConvRegistry,
}

impl ConnShared {
    // allocate the next message id and enqueue in one locked step, so wire
    // order matches id order across user sends, pings, and pongs
    fn enqueue(&self, build: impl FnOnce(u64) -> WireMsg) -> Result<u64> {
        if self.closing.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let mut lock = self.lockable.lock();
        let id = lock.registry.allocate_id();
        self.send_send
            .send(build(id))
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(id)
    }

    pub(crate) fn initiate_close(&self) {
        self.closing.cancel();
    }
}

impl Connection {
    pub(crate) fn new(
        repo: Arc<Repository>,
        stream: IoStream,
        local_address: Address,
        remote_address: Address,
        config: &Config,
    ) -> Self {
        let (read, write) = split(stream);
        let (send_send, send_recv) = unbounded_channel();
        let (recv_send, recv_recv) = queue(config.queue_maxsize);
        let (closed_send, _) = watch::channel(false);
        let shared = Arc::new(ConnShared {
            repo,
            local_address,
            remote_address,
            send_send,
            recv_recv: AsyncMutex::new(recv_recv),
            lockable: Mutex::new(ConnLockableState {
                registry: ConvRegistry::new(),
            }),
            closing: CancellationToken::new(),
            activity: Notify::new(),
            timeouts_changed: Notify::new(),
            closed_send,
        });
        tokio::spawn(conn_task(
            Arc::clone(&shared),
            read,
            write,
            send_recv,
            recv_send,
            config.ping_timeout,
        ));
        Connection { shared }
    }

    pub(crate) fn from_shared(shared: Arc<ConnShared>) -> Self {
        Connection { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnShared> {
        Arc::downgrade(&self.shared)
    }

    /// Send `data`, opening a new conversation this peer owns and closing it
    /// with the same message. See [`Connection::send_with`].
    pub fn send(&self, data: Data) -> Result<Conversation> {
        self.send_with(data, SendOpts::default())
    }

    /// Encode `data` and enqueue it for transmission. Never suspends; frames
    /// reach the wire in the order sends were accepted. Fails with
    /// [`Error::ConnectionClosed`] once the connection began closing, or
    /// with [`Error::Schema`] if `data` does not conform to its type under
    /// the connection's repository.
    pub fn send_with(&self, data: Data, opts: SendOpts) -> Result<Conversation> {
        let SendOpts {
            conv,
            last,
            token,
            timeout,
            timeout_cb,
        } = opts;
        let payload = self
            .shared
            .repo
            .encode(data.module.as_deref(), &data.ty, &data.data)?;

        if self.shared.closing.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let mut lock = self.shared.lockable.lock();
        let id = lock.registry.allocate_id();
        let conv = conv.unwrap_or(Conversation {
            first_id: id,
            owner: true,
        });
        let msg = WireMsg {
            id,
            first: conv.first_id,
            owner: conv.owner,
            token,
            last,
            data: WireData {
                module: data.module,
                ty: data.ty,
                data: payload,
            },
        };
        self.shared
            .send_send
            .send(msg)
            .map_err(|_| Error::ConnectionClosed)?;

        if last {
            // the conversation is over; nothing left to time out
            lock.registry.cancel(conv.first_id);
        } else if let Some(timeout) = timeout {
            let timeout_cb = timeout_cb.unwrap_or_else(|| Box::new(|_| ()));
            lock.registry
                .register_timeout(conv, Instant::now() + timeout, timeout_cb);
            drop(lock);
            self.shared.timeouts_changed.notify_one();
        }
        Ok(conv)
    }

    /// Receive the next message, suspending until one is available. Fails
    /// with [`Error::ConnectionClosed`] once the connection is closed and
    /// the receive queue is drained.
    pub async fn receive(&self) -> Result<Msg> {
        let mut recv = self.shared.recv_recv.lock().await;
        recv.recv().await.ok_or(Error::ConnectionClosed)
    }

    /// Initiate shutdown and wait until it completes. Idempotent.
    pub async fn close(&self) {
        self.shared.initiate_close();
        self.wait_closed().await;
    }

    /// Wait until the connection is fully closed, without initiating
    /// shutdown.
    pub async fn wait_closed(&self) {
        let mut closed = self.shared.closed_send.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed_send.borrow()
    }

    pub fn local_address(&self) -> &Address {
        &self.shared.local_address
    }

    pub fn remote_address(&self) -> &Address {
        &self.shared.remote_address
    }
}


// supervisor: spawns the four pipeline tasks, joins them, and marks the
// connection closed
async fn conn_task(
    shared: Arc<ConnShared>,
    read: ReadHalf<IoStream>,
    write: WriteHalf<IoStream>,
    send_recv: UnboundedReceiver<WireMsg>,
    recv_send: QueueSender<Msg>,
    ping_timeout: Duration,
) {
    let tasks = [
        tokio::spawn(reader_task(Arc::clone(&shared), read, recv_send)),
        tokio::spawn(writer_task(Arc::clone(&shared), write, send_recv)),
        tokio::spawn(ping_task(Arc::clone(&shared), ping_timeout)),
        tokio::spawn(timeout_task(Arc::clone(&shared))),
    ];
    for task in tasks {
        if task.await.is_err() {
            // a panicked task can no longer stop the others; make sure the
            // token is tripped
            shared.closing.cancel();
        }
    }

    // pending conversation timeouts are abandoned without firing; the
    // connection loss supersedes them
    shared.lockable.lock().registry.clear_pending();
    // send_replace stores the value even with no receiver subscribed yet
    shared.closed_send.send_replace(true);
    trace!("connection closed");
}

async fn reader_task(
    shared: Arc<ConnShared>,
    mut read: ReadHalf<IoStream>,
    recv_send: QueueSender<Msg>,
) {
    select_biased! {
        _ = shared.closing.cancelled().fuse() => {
            trace!("reader task shutting down because shut down requested");
        }
        result = reader_loop(&shared, &mut read, &recv_send).fuse() => {
            let e = match result {
                Err(e) => e,
                Ok(never) => match never {},
            };
            debug!(%e, "reader task error (closing connection)");
            shared.closing.cancel();
        }
    }
    // the reader owns the queue sender; dropping it here wakes a pending
    // `receive` once the queue drains
}

async fn reader_loop(
    shared: &ConnShared,
    read: &mut ReadHalf<IoStream>,
    recv_send: &QueueSender<Msg>,
) -> std::result::Result<Infallible, Error> {
    let mut last_id = 0;
    loop {
        let msg = codec::read_msg(read, &shared.repo).await?;
        shared.activity.notify_one();

        if msg.id <= last_id {
            return Err(Error::Protocol(format!(
                "inbound id {} not greater than previous id {}",
                msg.id, last_id,
            )));
        }
        last_id = msg.id;
        // `first` is an id in the conversation owner's id space, so its
        // relation to the sender's id is only checkable on owner-sent
        // frames; a reply legitimately carries first > id whenever the
        // owner's counter is ahead of the responder's
        if msg.owner && msg.first > msg.id {
            return Err(Error::Protocol(format!(
                "conversation id {} greater than message id {}",
                msg.first, msg.id,
            )));
        }

        // keep-alive traffic is consumed here, never delivered
        if msg.data.module.as_deref() == Some(CHATTER_MODULE) {
            handle_internal(shared, &msg)?;
            continue;
        }

        let value = shared
            .repo
            .decode(msg.data.module.as_deref(), &msg.data.ty, &msg.data.data)
            .map_err(|e| Error::Protocol(format!("decoding payload: {}", e)))?;

        // a reply on a conversation we own (wire owner bit clear) disarms
        // its pending timeout. the pending map is keyed by our own first
        // ids, and a peer-owned conversation can carry a colliding first id,
        // so peer-owned frames must leave it alone
        if !msg.owner {
            shared.lockable.lock().registry.cancel(msg.first);
        }

        let received = Msg {
            conv: Conversation {
                first_id: msg.first,
                owner: !msg.owner,
            },
            first: msg.id == msg.first,
            last: msg.last,
            token: msg.token,
            data: Data {
                module: msg.data.module,
                ty: msg.data.ty,
                data: value,
            },
        };
        // suspends while a bounded queue is full, backpressuring the peer
        if recv_send.send(received).await.is_err() {
            return Err(Error::ConnectionClosed);
        }
    }
}

fn handle_internal(shared: &ConnShared, msg: &WireMsg) -> Result<()> {
    match msg.data.ty.as_str() {
        PING_TYPE => {
            trace!("ping received, enqueueing pong");
            let payload = shared
                .repo
                .encode(Some(CHATTER_MODULE), PONG_TYPE, &Value::Record(vec![]))?;
            shared.enqueue(|id| WireMsg {
                id,
                first: msg.first,
                owner: !msg.owner,
                token: true,
                last: true,
                data: WireData {
                    module: Some(CHATTER_MODULE.to_owned()),
                    ty: PONG_TYPE.to_owned(),
                    data: payload,
                },
            })?;
            Ok(())
        }
        PONG_TYPE => {
            // the pong already counted as input activity, which is what
            // disarms the ping task's probe
            trace!("pong received");
            Ok(())
        }
        ty => Err(Error::Protocol(format!(
            "unknown internal message type {:?}",
            ty,
        ))),
    }
}

async fn writer_task(
    shared: Arc<ConnShared>,
    mut write: WriteHalf<IoStream>,
    mut send_recv: UnboundedReceiver<WireMsg>,
) {
    select_biased! {
        _ = shared.closing.cancelled().fuse() => {
            trace!("writer task shutting down because shut down requested");
        }
        result = writer_loop(&shared, &mut write, &mut send_recv).fuse() => {
            let e = match result {
                Err(e) => e,
                Ok(never) => match never {},
            };
            debug!(%e, "writer task error (closing connection)");
            shared.closing.cancel();
        }
    }

    // drain what was already enqueued, best effort within a grace window,
    // then half-close the stream
    let drain = async {
        while let Ok(msg) = send_recv.try_recv() {
            if codec::write_msg(&mut write, &shared.repo, &msg).await.is_err() {
                return;
            }
        }
        let _ = write.shutdown().await;
    };
    let _ = timeout(WRITE_DRAIN_GRACE, drain).await;
}

async fn writer_loop(
    shared: &ConnShared,
    write: &mut WriteHalf<IoStream>,
    send_recv: &mut UnboundedReceiver<WireMsg>,
) -> std::result::Result<Infallible, Error> {
    loop {
        let msg = some_or_pending(send_recv.recv()).await;
        codec::write_msg(write, &shared.repo, &msg).await?;
    }
}

async fn ping_task(shared: Arc<ConnShared>, ping_timeout: Duration) {
    select_biased! {
        _ = shared.closing.cancelled().fuse() => {
            trace!("ping task shutting down because shut down requested");
        }
        result = ping_loop(&shared, ping_timeout).fuse() => {
            let e = match result {
                Err(e) => e,
                Ok(never) => match never {},
            };
            debug!(%e, "ping task closing connection");
            shared.closing.cancel();
        }
    }
}

async fn ping_loop(
    shared: &ConnShared,
    ping_timeout: Duration,
) -> std::result::Result<Infallible, Error> {
    let payload = shared
        .repo
        .encode(Some(CHATTER_MODULE), PING_TYPE, &Value::Record(vec![]))?;
    loop {
        // any inbound frame restarts the idle interval
        select_biased! {
            _ = shared.activity.notified().fuse() => continue,
            _ = sleep(ping_timeout).fuse() => {}
        }

        // input went idle; probe with a ping on a fresh conversation
        shared.enqueue(|id| WireMsg {
            id,
            first: id,
            owner: true,
            token: true,
            last: false,
            data: WireData {
                module: Some(CHATTER_MODULE.to_owned()),
                ty: PING_TYPE.to_owned(),
                data: payload.clone(),
            },
        })?;
        trace!("input idle, ping sent");

        select_biased! {
            _ = shared.activity.notified().fuse() => continue,
            _ = sleep(ping_timeout).fuse() => return Err(Error::PingTimeout),
        }
    }
}

async fn timeout_task(shared: Arc<ConnShared>) {
    select_biased! {
        _ = shared.closing.cancelled().fuse() => {
            trace!("timeout task shutting down because shut down requested");
        }
        _ = timeout_loop(&shared).fuse() => unreachable!("timeout loop never returns"),
    }
}

async fn timeout_loop(shared: &ConnShared) {
    loop {
        let deadline = shared.lockable.lock().registry.next_deadline();
        match deadline {
            // nothing pending; sleep until a registration pings us
            None => shared.timeouts_changed.notified().await,
            Some(deadline) => {
                select_biased! {
                    // a new registration may have moved the earliest
                    // deadline; recompute
                    _ = shared.timeouts_changed.notified().fuse() => {}
                    _ = sleep_until(deadline).fuse() => {
                        let expired =
                            shared.lockable.lock().registry.tick(Instant::now());
                        for (conv, timeout_cb) in expired {
                            trace!(first_id = conv.first_id, "conversation timeout");
                            timeout_cb(conv);
                        }
                    }
                }
            }
        }
    }
}
