//! Tests du tracker : cycle de vie des devices, détection de changement,
//! expiration.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, Utc};

use pmossdp::packet::decode_packet;
use pmossdp::tracker::same_headers_differ;
use pmossdp::{CaseInsensitiveMap, SsdpDeviceTracker, SsdpHeaders, SsdpSource};

fn test_addrs() -> (SocketAddr, SocketAddr) {
    (
        "192.168.1.2:1900".parse().unwrap(),
        "192.168.1.1:1900".parse().unwrap(),
    )
}

/// Construit les en-têtes d'une réponse de recherche décodée.
fn search_headers(usn: &str, st: &str, location: &str) -> SsdpHeaders {
    let packet = format!(
        "HTTP/1.1 200 OK\r\n\
         CACHE-CONTROL: max-age=1800\r\n\
         ST: {st}\r\n\
         USN: {usn}\r\n\
         LOCATION: {location}\r\n\
         EXT:\r\n\
         \r\n"
    );
    let (local, remote) = test_addrs();
    let (_, headers) = decode_packet(packet.as_bytes(), &local, &remote).unwrap();
    headers
}

/// Construit les en-têtes d'une annonce alive ou update décodée.
fn notify_headers(usn: &str, nt: &str, nts: &str, location: &str) -> SsdpHeaders {
    let packet = format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         CACHE-CONTROL: max-age=1800\r\n\
         LOCATION: {location}\r\n\
         NT: {nt}\r\n\
         NTS: {nts}\r\n\
         USN: {usn}\r\n\
         BOOTID.UPNP.ORG: 1\r\n\
         CONFIGID.UPNP.ORG: 1\r\n\
         \r\n"
    );
    let (local, remote) = test_addrs();
    let (_, headers) = decode_packet(packet.as_bytes(), &local, &remote).unwrap();
    headers
}

/// Construit les en-têtes d'un byebye (sans LOCATION).
fn byebye_headers(usn: &str, nt: &str) -> SsdpHeaders {
    let packet = format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         NT: {nt}\r\n\
         NTS: ssdp:byebye\r\n\
         USN: {usn}\r\n\
         \r\n"
    );
    let (local, remote) = test_addrs();
    let (_, headers) = decode_packet(packet.as_bytes(), &local, &remote).unwrap();
    headers
}

#[tokio::test]
async fn test_resighting_is_alive_not_changed() {
    let tracker = SsdpDeviceTracker::new();
    let mut state = tracker.lock().await;
    let headers = search_headers(
        "uuid:dev1::upnp:rootdevice",
        "upnp:rootdevice",
        "http://192.168.1.1:80/desc.xml",
    );

    // Premier sighting : nouveau device, donc changement
    let event = state.see_search(&headers).expect("first sighting propagates");
    assert_eq!(event.source, SsdpSource::SearchChanged);

    // Sighting identique : propagé quand même, mais comme alive
    let event = state.see_search(&headers).expect("resighting propagates");
    assert_eq!(event.source, SsdpSource::SearchAlive);
}

#[tokio::test]
async fn test_byebye_removes_device_and_always_propagates() {
    let tracker = SsdpDeviceTracker::new();
    let mut state = tracker.lock().await;

    let alive = notify_headers(
        "uuid:dev2::upnp:rootdevice",
        "upnp:rootdevice",
        "ssdp:alive",
        "http://192.168.1.1:80/desc.xml",
    );
    state.see_advertisement(&alive).expect("alive propagates");
    assert!(state.devices().contains_key("uuid:dev2"));

    let byebye = byebye_headers("uuid:dev2::upnp:rootdevice", "upnp:rootdevice");
    let event = state.unsee_advertisement(&byebye).expect("byebye propagates");
    assert_eq!(event.source, SsdpSource::AdvertisementByebye);
    assert_eq!(event.device.udn(), "uuid:dev2");
    assert!(state.devices().is_empty());

    // Second byebye : le device a déjà disparu, rien à propager
    assert!(state.unsee_advertisement(&byebye).is_none());
}

#[tokio::test]
async fn test_cross_family_location_is_not_a_change() {
    let tracker = SsdpDeviceTracker::new();
    let mut state = tracker.lock().await;

    let v4 = search_headers(
        "uuid:dev3::upnp:rootdevice",
        "upnp:rootdevice",
        "http://192.168.1.1:80/desc.xml",
    );
    let event = state.see_search(&v4).unwrap();
    assert_eq!(event.source, SsdpSource::SearchChanged);

    // Même device, location IPv6 distincte : la famille seule ne compte pas
    let v6 = search_headers(
        "uuid:dev3::upnp:rootdevice",
        "upnp:rootdevice",
        "http://[2001:db8::1]:80/desc.xml",
    );
    let event = state.see_search(&v6).unwrap();
    assert_eq!(event.source, SsdpSource::SearchAlive);

    let mut locations = event.device.locations();
    locations.sort();
    assert_eq!(
        locations,
        vec![
            "http://192.168.1.1:80/desc.xml",
            "http://[2001:db8::1]:80/desc.xml",
        ]
    );
}

#[tokio::test]
async fn test_same_family_location_is_a_change() {
    let tracker = SsdpDeviceTracker::new();
    let mut state = tracker.lock().await;

    let first = search_headers(
        "uuid:dev4::upnp:rootdevice",
        "upnp:rootdevice",
        "http://192.168.1.1:80/desc.xml",
    );
    state.see_search(&first).unwrap();

    let moved = search_headers(
        "uuid:dev4::upnp:rootdevice",
        "upnp:rootdevice",
        "http://192.168.1.99:80/desc.xml",
    );
    let event = state.see_search(&moved).unwrap();
    assert_eq!(event.source, SsdpSource::SearchChanged);
}

#[tokio::test]
async fn test_ttl_expiry_purges_device() {
    let tracker = SsdpDeviceTracker::new();
    let mut state = tracker.lock().await;

    let headers = search_headers(
        "uuid:dev5::upnp:rootdevice",
        "upnp:rootdevice",
        "http://192.168.1.1:80/desc.xml",
    );
    state.see_search(&headers).unwrap();
    assert_eq!(state.devices().len(), 1);

    // Avant l'échéance, rien ne bouge
    state.purge_devices(Some(Utc::now() + Duration::seconds(1700)));
    assert_eq!(state.devices().len(), 1);

    // max-age=1800 dépassé : le device disparaît
    state.purge_devices(Some(Utc::now() + Duration::seconds(1801)));
    assert!(state.devices().is_empty());
}

#[tokio::test]
async fn test_loopback_and_link_local_locations_rejected() {
    let tracker = SsdpDeviceTracker::new();
    let mut state = tracker.lock().await;

    for location in [
        "http://127.0.0.1/x.xml",
        "http://[::1]/x.xml",
        "http://169.254.1.1/x.xml",
    ] {
        let headers = search_headers("uuid:bad::upnp:rootdevice", "upnp:rootdevice", location);
        assert!(
            state.see_search(&headers).is_none(),
            "location {location} should be rejected"
        );
    }
    assert!(state.devices().is_empty());
}

#[tokio::test]
async fn test_search_without_udn_or_st_rejected() {
    let tracker = SsdpDeviceTracker::new();
    let mut state = tracker.lock().await;

    // USN sans préfixe uuid: -> pas d'UDN
    let headers = search_headers("not-a-uuid", "upnp:rootdevice", "http://192.168.1.1/d.xml");
    assert!(state.see_search(&headers).is_none());

    // Pas de ST
    let (local, remote) = test_addrs();
    let packet = b"HTTP/1.1 200 OK\r\nUSN: uuid:x\r\nLOCATION: http://192.168.1.1/d.xml\r\n\r\n";
    let (_, headers) = decode_packet(packet, &local, &remote).unwrap();
    assert!(state.see_search(&headers).is_none());
}

#[tokio::test]
async fn test_update_always_propagates() {
    let tracker = SsdpDeviceTracker::new();
    let mut state = tracker.lock().await;

    let alive = notify_headers(
        "uuid:dev6::upnp:rootdevice",
        "upnp:rootdevice",
        "ssdp:alive",
        "http://192.168.1.1:80/desc.xml",
    );
    state.see_advertisement(&alive).expect("new device propagates");

    // Annonce identique : rien de neuf, pas de propagation
    assert!(state.see_advertisement(&alive).is_none());

    // Un update identique doit quand même être propagé
    let update = notify_headers(
        "uuid:dev6::upnp:rootdevice",
        "upnp:rootdevice",
        "ssdp:update",
        "http://192.168.1.1:80/desc.xml",
    );
    let event = state.see_advertisement(&update).expect("update propagates");
    assert_eq!(event.source, SsdpSource::AdvertisementUpdate);
}

#[tokio::test]
async fn test_new_service_type_propagates() {
    let tracker = SsdpDeviceTracker::new();
    let mut state = tracker.lock().await;

    let root = search_headers(
        "uuid:dev7::upnp:rootdevice",
        "upnp:rootdevice",
        "http://192.168.1.1:80/desc.xml",
    );
    state.see_search(&root).unwrap();

    // Même device vu pour un nouveau type de service
    let service = search_headers(
        "uuid:dev7::urn:schemas-upnp-org:service:WANIPConnection:1",
        "urn:schemas-upnp-org:service:WANIPConnection:1",
        "http://192.168.1.1:80/desc.xml",
    );
    let event = state.see_search(&service).unwrap();
    assert_eq!(event.source, SsdpSource::SearchChanged);
    assert_eq!(
        event.device_or_service_type,
        "urn:schemas-upnp-org:service:WANIPConnection:1"
    );
    assert_eq!(state.devices().len(), 1);
}

#[tokio::test]
async fn test_combined_headers_advertisement_wins() {
    let tracker = SsdpDeviceTracker::new();
    let mut state = tracker.lock().await;

    let mut search = search_headers(
        "uuid:dev8::upnp:rootdevice",
        "upnp:rootdevice",
        "http://192.168.1.1:80/desc.xml",
    );
    search.fields.insert("BOOTID.UPNP.ORG", "1");
    state.see_search(&search).unwrap();

    let mut alive = notify_headers(
        "uuid:dev8::upnp:rootdevice",
        "upnp:rootdevice",
        "ssdp:alive",
        "http://192.168.1.1:80/desc.xml",
    );
    alive.fields.insert("BOOTID.UPNP.ORG", "2");
    let event = state.see_advertisement(&alive).unwrap();

    let combined = event.device.combined_headers("upnp:rootdevice");
    assert_eq!(combined.get("bootid.upnp.org"), Some("2"));
    assert_eq!(combined.get("ext"), Some(""));
}

#[tokio::test]
async fn test_wan_common_interface_discovery() {
    let tracker = SsdpDeviceTracker::new();
    let mut state = tracker.lock().await;

    let headers = search_headers(
        "uuid:test::urn:schemas-upnp-org:service:WANCommonInterfaceConfig:1",
        "urn:schemas-upnp-org:service:WANCommonInterfaceConfig:1",
        "http://192.168.1.1:80/RootDevice.xml",
    );
    let event = state.see_search(&headers).expect("sighting propagates");
    assert_eq!(event.source, SsdpSource::SearchChanged);

    let device = state.devices().get("uuid:test").expect("device tracked");
    assert_eq!(device.location(), Some("http://192.168.1.1:80/RootDevice.xml"));
}

#[test]
fn test_same_headers_differ_policy() {
    let current = CaseInsensitiveMap::from([
        ("ST", "upnp:rootdevice"),
        ("BOOTID.UPNP.ORG", "1"),
        ("SERVER", "Linux UPnP/1.1 Test/1.0"),
    ]);

    // Valeur changée sur un en-tête comparé
    let changed = CaseInsensitiveMap::from([("BOOTID.UPNP.ORG", "2")]);
    assert!(same_headers_differ(&current, &changed));

    // En-tête absent du nouveau message : pas un changement
    let partial = CaseInsensitiveMap::from([("ST", "upnp:rootdevice")]);
    assert!(!same_headers_differ(&current, &partial));

    // Les en-têtes ignorés ne comptent pas
    let server_only = CaseInsensitiveMap::from([("SERVER", "Other/2.0")]);
    assert!(!same_headers_differ(&current, &server_only));
}

#[tokio::test]
async fn test_shared_tracker_linearizes_concurrent_sightings() {
    let tracker = Arc::new(SsdpDeviceTracker::new());

    // Deux « listeners » concurrents alimentent le même tracker
    let mut handles = Vec::new();
    for index in 0..8 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            let headers = search_headers(
                &format!("uuid:shared-{index}::upnp:rootdevice"),
                "upnp:rootdevice",
                "http://192.168.1.1:80/desc.xml",
            );
            let mut state = tracker.lock().await;
            state.see_search(&headers).is_some()
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    assert_eq!(tracker.devices().await.len(), 8);
}
