//! Chatter: a bidirectional, message-oriented transport between two peers
//! over plain TCP or TLS.
//!
//! Messages are length-framed envelopes carrying a typed payload encoded in
//! the SBS binary format (see the `sbs` crate). Every message belongs to a
//! conversation: a logical exchange correlated by the ID of its opening
//! message, owned by the peer that opened it. Connections keep themselves
//! alive with an internal ping/pong sub-protocol that users never see, and
//! can arm per-conversation response timeouts.
//!
//! Both peers must share the envelope schema: merge [`sbs_repo`] with your
//! application's modules and hand the result to [`connect`] and [`listen`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), chatter::Error> {
//! let mut repo = chatter::sbs_repo();
//! repo.register("Example", "Msg", sbs::Schema::Integer);
//! let repo = Arc::new(repo);
//!
//! let (conn_send, mut conn_recv) = mpsc::unbounded_channel();
//! let server = chatter::listen(
//!     Arc::clone(&repo),
//!     "tcp+sbs://127.0.0.1:24000",
//!     move |conn| { let _ = conn_send.send(conn); },
//!     chatter::Config::default(),
//! ).await?;
//!
//! let client = chatter::connect(
//!     Arc::clone(&repo),
//!     "tcp+sbs://127.0.0.1:24000",
//!     chatter::Config::default(),
//! ).await?;
//! let server_conn = conn_recv.recv().await.unwrap();
//!
//! client.send(chatter::Data::new(
//!     Some("Example".to_owned()),
//!     "Msg",
//!     sbs::Value::Integer(123),
//! ))?;
//! let msg = server_conn.receive().await?;
//! assert_eq!(msg.data.data, sbs::Value::Integer(123));
//!
//! client.close().await;
//! server.close().await;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

mod addr;
mod codec;
mod connection;
mod conv;
mod error;
mod server;
mod tls;
mod util;
mod wire;

pub use crate::{
    addr::{
        Address,
        Transport,
    },
    connection::{
        connect,
        Connection,
        SendOpts,
    },
    conv::{
        Conversation,
        TimeoutCb,
    },
    error::{
        Error,
        Result,
    },
    server::{
        listen,
        Server,
    },
    wire::{
        sbs_repo,
        Data,
        Msg,
    },
};

use std::{
    path::PathBuf,
    time::Duration,
};


/// Connection configuration shared by [`connect`] and [`listen`].
#[derive(Debug, Clone)]
pub struct Config {
    /// If no frame at all arrives within this window, probe the peer with a
    /// ping; an unanswered probe after another such window closes the
    /// connection.
    pub ping_timeout: Duration,
    /// Bound on the receive queue; the reader stops consuming input while
    /// the queue is full, backpressuring the peer. 0 means unbounded.
    pub queue_maxsize: usize,
    /// Pem file with certificate chain and private key. Mandatory for a TLS
    /// listener; optional client certificate for a TLS client.
    pub pem_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ping_timeout: Duration::from_secs(20),
            queue_maxsize: 0,
            pem_file: None,
        }
    }
}
