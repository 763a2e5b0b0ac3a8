//! Tests de bout en bout du transport et du listener de recherche sur des
//! sockets loopback unicast (le multicast n'est pas toujours disponible en
//! CI).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use pmossdp::protocol::DataCallback;
use pmossdp::search::{SearchOptions, SsdpSearchListener};
use pmossdp::{HeadersCallback, SsdpSource, SsdpTransport};

const SEARCH_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
    CACHE-CONTROL: max-age=1800\r\n\
    ST: upnp:rootdevice\r\n\
    USN: uuid:fake::upnp:rootdevice\r\n\
    LOCATION: http://192.168.1.50/desc.xml\r\n\
    EXT:\r\n\
    \r\n";

#[tokio::test]
async fn test_transport_decodes_and_filters_datagrams() {
    let source: SocketAddr = "127.0.0.1:0".parse().unwrap();
    // Cible unicast arbitraire : le socket est lié sur la source
    let target: SocketAddr = "127.0.0.1:1900".parse().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_data: DataCallback = Arc::new(move |request_line, headers| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send((request_line, headers));
        })
    });

    let transport = SsdpTransport::start(&source, &target, None, on_data)
        .await
        .unwrap();
    let local = transport.local_addr().unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(SEARCH_RESPONSE, local).await.unwrap();
    // Trafic étranger sur le même port : doit être éliminé sans bruit
    sender.send_to(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", local).await.unwrap();

    let (request_line, headers) = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("valid packet should be delivered")
        .unwrap();
    assert_eq!(request_line, "HTTP/1.1 200 OK");
    assert_eq!(headers.get("st"), Some("upnp:rootdevice"));
    assert_eq!(headers.meta.udn.as_deref(), Some("uuid:fake"));

    // Le paquet non SSDP ne produit aucun callback
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    transport.close();
}

#[tokio::test]
async fn test_transport_on_connect_fires_once() {
    let source: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let target: SocketAddr = "127.0.0.1:1900".parse().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_data: DataCallback = Arc::new(|_, _| Box::pin(async {}));
    let on_connect = Box::new(move |transport: Arc<SsdpTransport>| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(transport.local_addr().unwrap());
        }) as futures::future::BoxFuture<'static, ()>
    });

    let transport = SsdpTransport::start(&source, &target, Some(on_connect), on_data)
        .await
        .unwrap();

    let connected_addr = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("on_connect should fire")
        .unwrap();
    assert_eq!(connected_addr, transport.local_addr().unwrap());
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    transport.close();
}

/// Fait tourner un faux device : répond au premier M-SEARCH reçu et
/// retourne la requête pour inspection.
async fn fake_device(socket: UdpSocket) -> String {
    let mut buf = [0u8; 2048];
    let (len, from) = socket.recv_from(&mut buf).await.unwrap();
    socket.send_to(SEARCH_RESPONSE, from).await.unwrap();
    String::from_utf8_lossy(&buf[..len]).to_string()
}

#[tokio::test]
async fn test_unicast_search_round_trip() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let device_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let device_addr = device_socket.local_addr().unwrap();
    let device = tokio::spawn(fake_device(device_socket));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: HeadersCallback = Arc::new(move |headers| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(headers);
        })
    });

    let mut listener = SsdpSearchListener::new(
        callback,
        SearchOptions {
            source: Some("127.0.0.1:0".parse().unwrap()),
            target: Some(device_addr),
            ..SearchOptions::default()
        },
    );
    tokio_test::assert_ok!(listener.start().await);
    tokio_test::assert_ok!(listener.search(None).await);

    let headers = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("search response should be delivered")
        .unwrap();
    assert_eq!(headers.meta.source, SsdpSource::Search);
    assert_eq!(headers.meta.udn.as_deref(), Some("uuid:fake"));
    assert_eq!(headers.get("location"), Some("http://192.168.1.50/desc.xml"));

    // La requête émise est un M-SEARCH bien formé
    let msearch = device.await.unwrap();
    assert!(msearch.starts_with("M-SEARCH * HTTP/1.1\r\n"));
    assert!(msearch.contains("MAN:\"ssdp:discover\""));
    assert!(msearch.contains("ST:ssdp:all"));

    listener.stop();
}

#[tokio::test]
async fn test_search_helper_collects_during_window() {
    let device_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let device_addr = device_socket.local_addr().unwrap();
    let device = tokio::spawn(fake_device(device_socket));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: HeadersCallback = Arc::new(move |headers| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(headers);
        })
    });

    // La fonction ne rend la main qu'après la fenêtre de collecte
    pmossdp::search(
        callback,
        Duration::from_secs(1),
        "upnp:rootdevice",
        Some("127.0.0.1:0".parse().unwrap()),
        Some(device_addr),
    )
    .await
    .unwrap();

    let headers = rx.try_recv().expect("response collected during the window");
    assert_eq!(headers.meta.udn.as_deref(), Some("uuid:fake"));

    let msearch = device.await.unwrap();
    assert!(msearch.contains("ST:upnp:rootdevice"));
}
