use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509NameBuilder, X509};
use std::path::Path;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use transporter::config::Config;
use transporter::metrics::Protocol;
use transporter::{Subscriber, Subscriptor, Transport, TransporterError};

async fn open(dir: &Path) -> Transport {
    Transport::open(&Config::with_conf_dir(dir)).await.unwrap()
}

fn certs_dir(dir: &Path, id: &str) -> std::path::PathBuf {
    dir.join("certs").join(id)
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn rsa_identity(days_valid: u32) -> (PKey<Private>, X509) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "device").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(days_valid).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (key, builder.build())
}

fn bundle(passphrase: &str) -> Vec<u8> {
    let (key, cert) = rsa_identity(30);
    Pkcs12::builder()
        .name("device")
        .pkey(&key)
        .cert(&cert)
        .build2(passphrase)
        .unwrap()
        .to_der()
        .unwrap()
}

#[tokio::test]
async fn add_generates_fresh_ids() {
    let tmp = TempDir::new().unwrap();
    let transport = open(tmp.path()).await;

    let first = transport
        .add_subscriber(Subscriber::new("http://example.com/a", false))
        .await
        .unwrap();
    let second = transport
        .add_subscriber(Subscriber::new("http://example.com/b", false))
        .await
        .unwrap();
    assert!(!first.is_empty());
    assert_ne!(first, second);
    assert_eq!(transport.get_subscriber(&first).await.unwrap().id, first);

    let mut preset = Subscriber::new("http://example.com/c", false);
    preset.id = "chosen".to_string();
    assert!(matches!(
        transport.add_subscriber(preset).await,
        Err(TransporterError::Validation(_))
    ));
    assert_eq!(transport.list_subscribers().await.len(), 2);
}

#[tokio::test]
async fn delete_waits_for_all_references() {
    let tmp = TempDir::new().unwrap();
    let transport = open(tmp.path()).await;
    let id = transport
        .add_subscriber(Subscriber::new("tcp://127.0.0.1:9000", false))
        .await
        .unwrap();
    let (_, cert) = rsa_identity(30);
    transport
        .set_trust_anchor(&id, &cert.to_pem().unwrap())
        .await
        .unwrap();
    assert!(certs_dir(tmp.path(), &id).exists());

    let route = transport
        .define_subscriptor(Subscriptor::new("route", "", id.as_str(), false))
        .await
        .unwrap();
    assert!(matches!(
        transport.delete_subscriber(&id).await,
        Err(TransporterError::Conflict(_))
    ));

    transport.delete_subscriptor(&route).await.unwrap();
    transport.delete_subscriber(&id).await.unwrap();
    assert!(!certs_dir(tmp.path(), &id).exists());
}

#[tokio::test]
async fn set_is_locked_by_enabled_routes_only() {
    let tmp = TempDir::new().unwrap();
    let transport = open(tmp.path()).await;
    let id = transport
        .add_subscriber(Subscriber::new("udp://127.0.0.1:9000", false))
        .await
        .unwrap();

    let route = transport
        .define_subscriptor(Subscriptor::new("route", "", id.as_str(), true))
        .await
        .unwrap();
    let mut changed = transport.get_subscriber(&id).await.unwrap();
    changed.uri = "udp://127.0.0.1:9001".to_string();
    assert!(matches!(
        transport.set_subscriber(changed.clone()).await,
        Err(TransporterError::Conflict(_))
    ));

    let mut paused = transport.get_subscriptor(&route).await.unwrap();
    paused.enable = false;
    transport.update_subscriptor(paused).await.unwrap();
    transport.set_subscriber(changed).await.unwrap();
    assert_eq!(
        transport.get_subscriber(&id).await.unwrap().uri,
        "udp://127.0.0.1:9001"
    );
}

#[tokio::test]
async fn report_reaches_tcp_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let received = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = String::new();
        socket.read_to_string(&mut buf).await.unwrap();
        buf
    });

    let tmp = TempDir::new().unwrap();
    let transport = open(tmp.path()).await;
    let id = transport
        .add_subscriber(Subscriber::new(format!("tcp://127.0.0.1:{}", port), true))
        .await
        .unwrap();
    let route = transport
        .define_subscriptor(Subscriptor::new("route", "", id.as_str(), true))
        .await
        .unwrap();

    transport.send_report(&route, "hello").await;

    assert_eq!(received.await.unwrap(), "hello");
    assert_eq!(transport.metrics()[&Protocol::Tcp].delivered, 1);
}

#[tokio::test]
async fn unreachable_broker_stores_nothing() {
    let tmp = TempDir::new().unwrap();
    let transport = open(tmp.path()).await;
    let uri = format!("mqtt://127.0.0.1:{}/topic?clientid=c1", free_port());
    let subscriber =
        Subscriber::new(uri, true).with_property("Transporter.MQTT.Timeout", "300");

    let err = transport.add_subscriber(subscriber).await.unwrap_err();
    assert!(matches!(err, TransporterError::Transport(_)));
    assert!(transport.list_subscribers().await.is_empty());
    assert!(!tmp.path().join("subscribers.json").exists());
}

#[tokio::test]
async fn keystore_needs_issued_token() {
    let tmp = TempDir::new().unwrap();
    let transport = open(tmp.path()).await;
    let dev = transport
        .add_subscriber(Subscriber::new("https://example.com/in", true))
        .await
        .unwrap();
    let dev = dev.as_str();

    let err = transport
        .set_keystore(dev, &bundle("pw"), "never-issued")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "No passphrase specified");
    assert!(!certs_dir(tmp.path(), dev).exists());

    let token = transport.issue_passphrase_token(b"pw").unwrap();
    transport
        .set_keystore(dev, &bundle("pw"), &token)
        .await
        .unwrap();
    assert!(transport.has_keystore(dev).await);
    assert!(!transport.has_trust_anchor(dev).await);

    // tokens are single use
    assert!(transport
        .set_keystore(dev, &bundle("pw"), &token)
        .await
        .is_err());

    transport.delete_keystore(dev).await.unwrap();
    assert!(!transport.has_keystore(dev).await);
}

#[tokio::test]
async fn wrong_passphrase_is_a_certificate_error() {
    let tmp = TempDir::new().unwrap();
    let transport = open(tmp.path()).await;
    let dev = transport
        .add_subscriber(Subscriber::new("https://example.com/in", false))
        .await
        .unwrap();
    let token = transport.issue_passphrase_token(b"wrong").unwrap();
    let err = transport
        .set_keystore(&dev, &bundle("right"), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, TransporterError::Certificate(_)));
    assert!(!transport.has_keystore(&dev).await);
}

#[tokio::test]
async fn trust_anchor_needs_subscriber_and_pem() {
    let tmp = TempDir::new().unwrap();
    let transport = open(tmp.path()).await;
    let (_, cert) = rsa_identity(30);
    let err = transport
        .set_trust_anchor("unknown", &cert.to_pem().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, TransporterError::NotFound(_)));

    let dev = transport
        .add_subscriber(Subscriber::new("https://example.com/in", false))
        .await
        .unwrap();
    let err = transport
        .set_trust_anchor(&dev, b"not a certificate")
        .await
        .unwrap_err();
    assert!(matches!(err, TransporterError::Certificate(_)));
    assert!(!transport.has_trust_anchor(&dev).await);
}

#[tokio::test]
async fn cert_operations_need_a_known_subscriber() {
    let tmp = TempDir::new().unwrap();
    let transport = open(tmp.path()).await;
    let victim = tmp.path().join("victim");
    std::fs::create_dir(&victim).unwrap();
    std::fs::write(victim.join("key"), b"k").unwrap();

    assert!(!transport.has_keystore("../victim").await);
    assert!(matches!(
        transport.delete_keystore("../victim").await,
        Err(TransporterError::NotFound(_))
    ));
    assert!(matches!(
        transport.delete_trust_anchor("unknown").await,
        Err(TransporterError::NotFound(_))
    ));
    assert!(victim.join("key").exists());
}

#[tokio::test]
async fn registry_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let (enabled, disabled) = {
        let transport = open(tmp.path()).await;
        let enabled = transport
            .add_subscriber(
                Subscriber::new("udp://127.0.0.1:9000", true)
                    .with_property("Transporter.UDP.Timeout", "100"),
            )
            .await
            .unwrap();
        let disabled = transport
            .add_subscriber(Subscriber::new("https://example.com/in", false))
            .await
            .unwrap();
        transport.shutdown().await;
        (enabled, disabled)
    };

    let transport = open(tmp.path()).await;
    let restored = transport.get_subscriber(&enabled).await.unwrap();
    assert!(restored.enable);
    assert_eq!(restored.uri, "udp://127.0.0.1:9000");
    assert_eq!(
        restored.properties.get("Transporter.UDP.Timeout").map(String::as_str),
        Some("100")
    );
    assert!(transport.has_provider(&enabled).await);

    let restored = transport.get_subscriber(&disabled).await.unwrap();
    assert!(!restored.enable);
    assert!(!transport.has_provider(&disabled).await);
}
