//! Verifies two `TransportCoordinator`s exchange a ping/pong pair over a
//! real TCP loopback connection, end to end through `PeerChannel`'s
//! encode/decode framing.

use backup_peer::message::PeerMessage;
use backup_peer::transport::{SessionManagerConfig, TransportCoordinator};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[tokio::test]
async fn ping_sent_over_one_coordinator_is_received_by_the_other() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (server_inbound_tx, mut server_inbound_rx) = mpsc::channel(8);
    let server = TransportCoordinator::new(SessionManagerConfig::default(), server_inbound_tx);

    let (client_inbound_tx, _client_inbound_rx) = mpsc::channel(8);
    let client = TransportCoordinator::new(SessionManagerConfig::default(), client_inbound_tx);

    let accept_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        stream
    });

    let client_stream = TcpStream::connect(addr).await.unwrap();
    let server_stream = accept_task.await.unwrap();

    server.adopt("peer-client", server_stream).await.unwrap();
    client.adopt("peer-server", client_stream).await.unwrap();

    client
        .send("peer-server", PeerMessage::Ping { ts: 42 })
        .await
        .unwrap();

    let (from, message) = tokio::time::timeout(std::time::Duration::from_secs(5), server_inbound_rx.recv())
        .await
        .expect("message arrives before timeout")
        .expect("channel stays open");

    assert_eq!(from, "peer-client");
    assert!(matches!(message, PeerMessage::Ping { ts: 42 }));
}
