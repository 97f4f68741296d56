use super::{within, ProviderContext};
use crate::error::{Result, TransporterError};
use crate::metrics::{Protocol, SharedMetrics};
use crate::models::Subscriber;
use crate::properties::{apply_properties, parse_timeout, PropertyRule, TCP_TIMEOUT, UDP_TIMEOUT};
use log::{debug, error};
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Udp,
}

impl SocketKind {
    fn protocol(self) -> Protocol {
        match self {
            SocketKind::Tcp => Protocol::Tcp,
            SocketKind::Udp => Protocol::Udp,
        }
    }
}

#[derive(Debug, Clone)]
struct SocketSettings {
    timeout: Duration,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1_000),
        }
    }
}

fn apply_timeout(s: &mut SocketSettings, v: &str) -> std::result::Result<(), String> {
    s.timeout = parse_timeout(v)?;
    Ok(())
}

static TCP_RULES: &[PropertyRule<SocketSettings>] = &[PropertyRule {
    key: TCP_TIMEOUT,
    apply: apply_timeout,
}];

static UDP_RULES: &[PropertyRule<SocketSettings>] = &[PropertyRule {
    key: UDP_TIMEOUT,
    apply: apply_timeout,
}];

/// Dials the target for every publish, writes the payload and hangs up.
#[derive(Debug)]
pub struct SocketProvider {
    kind: SocketKind,
    address: String,
    timeout: Duration,
    metrics: SharedMetrics,
}

impl SocketProvider {
    pub fn new(subscriber: &Subscriber, url: &Url, ctx: &ProviderContext) -> Result<Self> {
        let (kind, rules, name) = match url.scheme().to_ascii_lowercase().as_str() {
            "tcp" => (SocketKind::Tcp, TCP_RULES, "TCP"),
            "udp" => (SocketKind::Udp, UDP_RULES, "UDP"),
            other => {
                return Err(TransporterError::validation(format!(
                    "Unknown scheme '{}'",
                    other
                )))
            }
        };
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host,
            _ => return Err(TransporterError::validation("No host specified")),
        };
        let port = url
            .port()
            .ok_or_else(|| TransporterError::validation("No port specified"))?;

        let settings = apply_properties(
            name,
            rules,
            &subscriber.properties,
            &SocketSettings::default(),
        )?;

        Ok(Self {
            kind,
            address: format!("{}:{}", host, port),
            timeout: settings.timeout,
            metrics: ctx.metrics.clone(),
        })
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub async fn publish(&self, _topic: &str, payload: &str) {
        let result = match self.kind {
            SocketKind::Tcp => self.send_tcp(payload.as_bytes()).await,
            SocketKind::Udp => self.send_udp(payload.as_bytes()).await,
        };
        match result {
            Ok(()) => {
                debug!("Sent {} bytes to {}", payload.len(), self.address);
                self.metrics.delivered(self.kind.protocol());
            }
            Err(e) => {
                error!("Write to server {} failed: {}", self.address, e);
                self.metrics.failed(self.kind.protocol());
            }
        }
    }

    async fn send_tcp(&self, payload: &[u8]) -> io::Result<()> {
        let mut stream = within(self.timeout, TcpStream::connect(&self.address))
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        stream.write_all(payload).await?;
        stream.shutdown().await
    }

    async fn send_udp(&self, payload: &[u8]) -> io::Result<()> {
        let target = within(self.timeout, lookup_host(&self.address))
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "lookup timed out"))??
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        socket.send(payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::context;
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn build(uri: &str, props: &[(&str, &str)]) -> Result<(SocketProvider, ProviderContext, TempDir)> {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path());
        let mut subscriber = Subscriber::new(uri, true);
        for (k, v) in props {
            subscriber = subscriber.with_property(*k, *v);
        }
        let provider = SocketProvider::new(&subscriber, &Url::parse(uri).unwrap(), &ctx)?;
        Ok((provider, ctx, tmp))
    }

    #[test]
    fn port_is_mandatory() {
        let err = build("tcp://localhost", &[]).unwrap_err();
        assert!(matches!(err, TransporterError::Validation(msg) if msg.contains("port")));
    }

    #[test]
    fn timeout_key_follows_scheme() {
        assert!(build("udp://localhost:9000", &[(UDP_TIMEOUT, "20")]).is_ok());
        assert!(build("udp://localhost:9000", &[(TCP_TIMEOUT, "20")]).is_err());
        assert!(build("tcp://localhost:9000", &[(TCP_TIMEOUT, "-20")]).is_err());
    }

    #[tokio::test]
    async fn tcp_publish_delivers_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reader = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).await.unwrap();
            received
        });

        let (provider, ctx, _tmp) = build(&format!("tcp://127.0.0.1:{}", port), &[]).unwrap();
        provider.publish("", "hello").await;

        assert_eq!(reader.await.unwrap(), "hello");
        assert_eq!(ctx.metrics.counts(Protocol::Tcp).delivered, 1);
    }

    #[tokio::test]
    async fn udp_publish_delivers_datagram() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();

        let (provider, _ctx, _tmp) = build(&format!("udp://127.0.0.1:{}", port), &[]).unwrap();
        provider.publish("", "ping").await;

        let mut buf = [0u8; 16];
        let n = socket.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn zero_timeout_means_no_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            for _ in 0..5 {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = String::new();
                socket.read_to_string(&mut buf).await.unwrap();
                received.push(buf);
            }
            received
        });

        let (provider, ctx, _tmp) =
            build(&format!("tcp://127.0.0.1:{}", port), &[(TCP_TIMEOUT, "0")]).unwrap();
        for _ in 0..5 {
            provider.publish("", "tick").await;
        }

        assert_eq!(reader.await.unwrap(), vec!["tick"; 5]);
        assert_eq!(ctx.metrics.counts(Protocol::Tcp).delivered, 5);
        assert_eq!(ctx.metrics.counts(Protocol::Tcp).failed, 0);
    }

    #[tokio::test]
    async fn refused_dial_is_swallowed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (provider, ctx, _tmp) = build(&format!("tcp://127.0.0.1:{}", port), &[]).unwrap();
        provider.publish("", "lost").await;
        assert_eq!(ctx.metrics.counts(Protocol::Tcp).failed, 1);
    }
}
