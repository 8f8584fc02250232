mod common;

use amiko_pay::domain::identity::AcceptAll;
use amiko_pay::domain::ports::MessageReceiver;
use amiko_pay::domain::transaction::Address;
use amiko_pay::error::LinkError;
use amiko_pay::infrastructure::amiko_link::{AmikoLinkHandler, SCHEME};
use amiko_pay::infrastructure::link::{Link, LinkState};
use amiko_pay::infrastructure::registry::{SchemeHandler, SchemeRegistry};
use amiko_pay::infrastructure::tcp::{Acceptor, TcpAcceptor};
use common::eventually;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Collector {
    messages: Mutex<Vec<Vec<u8>>>,
}

impl MessageReceiver for Collector {
    fn deliver(&self, message: Vec<u8>) {
        self.messages.lock().push(message);
    }
}

fn handler(seed: u8) -> Arc<AmikoLinkHandler> {
    Arc::new(
        AmikoLinkHandler::new(Address::new([seed; 20]), Arc::new(AcceptAll))
            .with_poll_interval(Duration::from_millis(20)),
    )
}

async fn operational(link: &Link) -> bool {
    eventually(Duration::from_secs(5), || async { link.state() == LinkState::Operational }).await
}

#[tokio::test]
async fn test_message_round_trip_through_loopback_peer() {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0", Duration::from_secs(5))
        .await
        .unwrap();
    let port = acceptor.local_addr().unwrap().port();
    let server_address = Address::new([2; 20]);

    let factory = SchemeRegistry::new().register(SCHEME, handler(1)).build();
    let uri = format!("{SCHEME}://127.0.0.1:{port}/{server_address}");
    let (client, accepted) = tokio::join!(factory.make(&uri), acceptor.accept());

    let client = client.unwrap();
    let server = Arc::new(handler(2).accept(accepted.unwrap()));
    assert_eq!(client.state(), LinkState::Pending);

    // The server echoes everything it receives.
    server.set_receiver(Some(server.clone()));
    let collector = Arc::new(Collector::default());
    client.set_receiver(Some(collector.clone()));

    // Queued while pending, flushed once the handshake is done.
    client.send_message(b"test".to_vec()).unwrap();
    client.start();
    server.start();
    assert!(operational(&client).await);
    assert!(operational(&server).await);

    assert!(
        eventually(Duration::from_secs(5), || async {
            !collector.messages.lock().is_empty()
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*collector.messages.lock(), vec![b"test".to_vec()]);

    client.stop().await;
    server.stop().await;
    assert_eq!(client.state(), LinkState::Closed);
    assert!(matches!(
        client.send_message(b"late".to_vec()),
        Err(LinkError::Closed)
    ));
}

#[tokio::test]
async fn test_random_messages_keep_their_order() {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0", Duration::from_secs(5))
        .await
        .unwrap();
    let port = acceptor.local_addr().unwrap().port();
    let factory = SchemeRegistry::new().register(SCHEME, handler(1)).build();
    let uri = format!("{SCHEME}://127.0.0.1:{port}");
    let (client, accepted) = tokio::join!(factory.make(&uri), acceptor.accept());
    let client = client.unwrap();
    let server = handler(2).accept(accepted.unwrap());

    let collector = Arc::new(Collector::default());
    server.set_receiver(Some(collector.clone()));
    client.start();
    server.start();

    let mut rng = rand::thread_rng();
    let messages: Vec<Vec<u8>> = (0..50)
        .map(|_| {
            let mut message = vec![0u8; rng.gen_range(1..8192)];
            rng.fill(&mut message[..]);
            message
        })
        .collect();
    for message in &messages {
        client.send_message(message.clone()).unwrap();
    }

    assert!(
        eventually(Duration::from_secs(10), || async {
            collector.messages.lock().len() == messages.len()
        })
        .await
    );
    assert_eq!(*collector.messages.lock(), messages);
    assert_eq!(server.dropped_messages(), 0);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_peer_with_wrong_address_is_closed() {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0", Duration::from_secs(5))
        .await
        .unwrap();
    let port = acceptor.local_addr().unwrap().port();
    let factory = SchemeRegistry::new().register(SCHEME, handler(1)).build();

    let expected = Address::new([7; 20]);
    let uri = format!("{SCHEME}://127.0.0.1:{port}/{expected}");
    let (client, accepted) = tokio::join!(factory.make(&uri), acceptor.accept());
    let client = client.unwrap();
    let server = handler(2).accept(accepted.unwrap());

    client.start();
    server.start();
    assert!(
        eventually(Duration::from_secs(5), || async {
            client.state() == LinkState::Closed
        })
        .await
    );
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_scheme_fails_construction() {
    let factory = SchemeRegistry::new().register(SCHEME, handler(1)).build();

    for uri in ["carrierpigeon://somewhere", "not a uri"] {
        assert!(matches!(
            factory.make(uri).await,
            Err(LinkError::ConstructionFailed(_))
        ));
    }
}

#[tokio::test]
async fn test_unreachable_peer_fails_construction() {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0", Duration::from_millis(10))
        .await
        .unwrap();
    let port = acceptor.local_addr().unwrap().port();
    drop(acceptor);

    let factory = SchemeRegistry::new().register(SCHEME, handler(1)).build();
    let result = factory.make(&format!("{SCHEME}://127.0.0.1:{port}")).await;
    assert!(matches!(result, Err(LinkError::ConstructionFailed(_))));
}
