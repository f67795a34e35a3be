//! Minimal chatter round trip over loopback.

use chatter::{
    Config,
    Data,
};
use sbs::{
    schema,
    Value,
};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut repo = chatter::sbs_repo();
    repo.register("Example", "Msg", schema!(integer));
    let repo = Arc::new(repo);

    let (conn_send, mut conn_recv) = mpsc::unbounded_channel();
    let server = chatter::listen(
        Arc::clone(&repo),
        "tcp+sbs://127.0.0.1:0",
        move |conn| {
            let _ = conn_send.send(conn);
        },
        Config::default(),
    )
    .await?;
    let address = server.addresses()[0].to_string();
    println!("listening on {}", address);

    let client = chatter::connect(Arc::clone(&repo), &address, Config::default()).await?;
    let server_conn = conn_recv.recv().await.expect("listener produced no connection");

    client.send(Data::new(
        Some("Example".to_owned()),
        "Msg",
        Value::Integer(123),
    ))?;
    let msg = server_conn.receive().await?;
    println!("received {:?}", msg.data.data);

    client.close().await;
    server.close().await;
    Ok(())
}
