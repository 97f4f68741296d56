//! Device-to-cloud events for Azure IoT Hub over MQTT.
//!
//! The connection string rides in the URI: `azure://HostName=..;DeviceId=..;SharedAccessKey=..`.
//! Every publish connects, sends one event tagged with a random message id,
//! and disconnects again.

use super::{within, ProviderContext};
use crate::error::{Result, TransporterError};
use crate::metrics::Protocol;
use crate::models::Subscriber;
use crate::properties::{
    apply_properties, parse_bool, parse_timeout, PropertyRule, AZURE_ON_DEMAND, AZURE_TIMEOUT,
};
use log::{debug, error, info};
use openssl::base64;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, Transport,
};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use url::form_urlencoded;

const HUB_PORT: u16 = 8883;
const API_VERSION: &str = "2021-04-12";
const TOKEN_LIFETIME_SECS: i64 = 3_600;
const SCHEME_PREFIX: &str = "azure://";

#[derive(Debug, Clone)]
struct AzureSettings {
    timeout: Duration,
    on_demand: bool,
}

impl Default for AzureSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1_000),
            on_demand: false,
        }
    }
}

static AZURE_RULES: &[PropertyRule<AzureSettings>] = &[
    PropertyRule {
        key: AZURE_TIMEOUT,
        apply: |s, v| {
            s.timeout = parse_timeout(v)?;
            Ok(())
        },
    },
    PropertyRule {
        key: AZURE_ON_DEMAND,
        apply: |s, v| {
            s.on_demand = parse_bool(AZURE_ON_DEMAND, v)?;
            Ok(())
        },
    },
];

/// Parsed `HostName=..;DeviceId=..;SharedAccessKey=..`.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    shared_access_key: String,
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut host_name = None;
        let mut device_id = None;
        let mut key = None;
        for part in raw.split(';').filter(|p| !p.trim().is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(|| {
                TransporterError::validation(format!("Malformed connection string part '{}'", part))
            })?;
            match name.trim() {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "SharedAccessKey" => key = Some(value.to_string()),
                _ => {}
            }
        }
        let missing = |field: &str| {
            TransporterError::validation(format!("Connection string is missing {}", field))
        };
        Ok(Self {
            host_name: host_name.filter(|v| !v.is_empty()).ok_or_else(|| missing("HostName"))?,
            device_id: device_id.filter(|v| !v.is_empty()).ok_or_else(|| missing("DeviceId"))?,
            shared_access_key: key
                .filter(|v| !v.is_empty())
                .ok_or_else(|| missing("SharedAccessKey"))?,
        })
    }

    /// SharedAccessSignature for the device resource, valid until `expiry`
    /// (unix seconds).
    pub fn sas_token(&self, expiry: i64) -> Result<String> {
        let resource = format!("{}/devices/{}", self.host_name, self.device_id);
        let encoded_resource = url_encode(&resource);
        let to_sign = format!("{}\n{}", encoded_resource, expiry);

        let key = base64::decode_block(&self.shared_access_key).map_err(|e| {
            TransporterError::validation(format!("SharedAccessKey is not valid base64: {}", e))
        })?;
        let pkey = PKey::hmac(&key)?;
        let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
        signer.update(to_sign.as_bytes())?;
        let signature = base64::encode_block(&signer.sign_to_vec()?);

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}",
            encoded_resource,
            url_encode(&signature),
            expiry
        ))
    }

    fn username(&self) -> String {
        format!(
            "{}/{}/?api-version={}",
            self.host_name, self.device_id, API_VERSION
        )
    }

    fn events_topic(&self, message_id: &str) -> String {
        format!(
            "devices/{}/messages/events/%24.mid={}",
            self.device_id, message_id
        )
    }
}

fn url_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Random 16-byte message id, hex encoded.
fn generate_message_id() -> Result<String> {
    let mut bytes = [0u8; 16];
    openssl::rand::rand_bytes(&mut bytes)?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

struct DeviceSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

pub struct AzureProvider {
    connection: ConnectionString,
    settings: AzureSettings,
    ctx: ProviderContext,
    session: Mutex<Option<DeviceSession>>,
}

impl fmt::Debug for AzureProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureProvider")
            .field("connection", &self.connection)
            .field("settings", &self.settings)
            .finish()
    }
}

impl AzureProvider {
    pub async fn new(subscriber: &Subscriber, ctx: &ProviderContext) -> Result<Self> {
        let raw = subscriber
            .uri
            .strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| TransporterError::validation("Unknown scheme for azure transporter"))?;
        let connection = ConnectionString::parse(raw)?;

        let settings = apply_properties(
            "Azure",
            AZURE_RULES,
            &subscriber.properties,
            &AzureSettings::default(),
        )?;

        let provider = Self {
            connection,
            settings,
            ctx: ctx.clone(),
            session: Mutex::new(None),
        };

        if !provider.settings.on_demand {
            let mut session = provider.session.lock().await;
            let connected = provider.connect(&mut session).await;
            drop(session);
            if let Err(e) = connected {
                error!(
                    "Failed to connect to azure subscriptor {}",
                    provider.connection.host_name
                );
                return Err(e);
            }
        }

        Ok(provider)
    }

    fn options(&self) -> Result<MqttOptions> {
        let expiry = time::OffsetDateTime::now_utc().unix_timestamp() + TOKEN_LIFETIME_SECS;
        let mut options = MqttOptions::new(
            self.connection.device_id.clone(),
            self.connection.host_name.clone(),
            HUB_PORT,
        );
        options.set_credentials(self.connection.username(), self.connection.sas_token(expiry)?);
        options.set_transport(Transport::tls_with_default_config());
        options.set_keep_alive(Duration::from_secs(30));
        Ok(options)
    }

    /// Opens a session unless one is already open.
    async fn connect(&self, slot: &mut Option<DeviceSession>) -> Result<()> {
        if slot.is_some() {
            return Ok(());
        }
        let (client, mut eventloop) = AsyncClient::new(self.options()?, 10);
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(format!("connection refused: {:?}", ack.code))
                        };
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e.to_string()),
                }
            }
        };
        match within(self.settings.timeout, handshake).await {
            Some(Ok(())) => {
                debug!("Connected to {}", self.connection.host_name);
                *slot = Some(DeviceSession { client, eventloop });
                Ok(())
            }
            Some(Err(e)) => Err(TransporterError::transport(e)),
            None => Err(TransporterError::transport(format!(
                "Connecting to {} timed out",
                self.connection.host_name
            ))),
        }
    }

    async fn send(&self, session: &mut DeviceSession, payload: &str) -> Result<()> {
        let topic = self.connection.events_topic(&generate_message_id()?);
        session
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| TransporterError::transport(e.to_string()))?;

        let eventloop = &mut session.eventloop;
        let acknowledged = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::PubAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(TransporterError::transport(e.to_string())),
                }
            }
        };
        within(self.settings.timeout, acknowledged)
            .await
            .ok_or_else(|| TransporterError::transport("Sending event timed out"))?
    }

    async fn close(session: DeviceSession) {
        let DeviceSession {
            client,
            mut eventloop,
        } = session;
        if client.try_disconnect().is_ok() {
            // flush the DISCONNECT packet
            let _ = timeout(Duration::from_millis(200), eventloop.poll()).await;
        }
    }

    pub async fn publish(&self, _topic: &str, payload: &str) {
        let mut slot = self.session.lock().await;
        if let Err(e) = self.connect(&mut slot).await {
            error!("Failed to connect to azure subscriptor: {}", e);
            self.ctx.metrics.failed(Protocol::Azure);
            return;
        }
        let Some(mut session) = slot.take() else {
            return;
        };
        match self.send(&mut session, payload).await {
            Ok(()) => self.ctx.metrics.delivered(Protocol::Azure),
            Err(e) => {
                error!("{}", e);
                self.ctx.metrics.failed(Protocol::Azure);
            }
        }
        Self::close(session).await;
    }

    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            Self::close(session).await;
            info!("Azure session for {} closed", self.connection.device_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::context;
    use super::*;
    use tempfile::TempDir;

    const RAW: &str = "HostName=hub.azure-devices.net;DeviceId=dev1;SharedAccessKey=c2VjcmV0a2V5";

    #[test]
    fn connection_string_is_parsed() {
        let cs = ConnectionString::parse(RAW).unwrap();
        assert_eq!(cs.host_name, "hub.azure-devices.net");
        assert_eq!(cs.device_id, "dev1");
        assert_eq!(cs.username(), "hub.azure-devices.net/dev1/?api-version=2021-04-12");
        assert!(!format!("{:?}", cs).contains("c2VjcmV0a2V5"));
    }

    #[test]
    fn missing_device_is_rejected() {
        let err = ConnectionString::parse("HostName=hub;SharedAccessKey=abc").unwrap_err();
        assert!(matches!(err, TransporterError::Validation(msg) if msg.contains("DeviceId")));
    }

    #[test]
    fn sas_token_shape() {
        let cs = ConnectionString::parse(RAW).unwrap();
        let token = cs.sas_token(1_700_000_000).unwrap();
        assert!(token.starts_with("SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fdev1&sig="));
        assert!(token.ends_with("&se=1700000000"));
        // deterministic for the same expiry
        assert_eq!(token, cs.sas_token(1_700_000_000).unwrap());
    }

    #[test]
    fn message_ids_are_random_hex() {
        let a = generate_message_id().unwrap();
        let b = generate_message_id().unwrap();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn on_demand_skips_eager_connect() {
        let tmp = TempDir::new().unwrap();
        let subscriber = Subscriber::new(format!("azure://{}", RAW), true)
            .with_property(AZURE_ON_DEMAND, "true");
        let provider = AzureProvider::new(&subscriber, &context(tmp.path()))
            .await
            .unwrap();
        assert!(provider.settings.on_demand);
        assert!(provider.session.lock().await.is_none());
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn zero_timeout_is_accepted() {
        let tmp = TempDir::new().unwrap();
        let subscriber = Subscriber::new(format!("azure://{}", RAW), true)
            .with_property(AZURE_ON_DEMAND, "1")
            .with_property(AZURE_TIMEOUT, "0");
        let provider = AzureProvider::new(&subscriber, &context(tmp.path()))
            .await
            .unwrap();
        assert_eq!(provider.settings.timeout, Duration::ZERO);
    }

    #[tokio::test]
    async fn bad_on_demand_value_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let subscriber = Subscriber::new(format!("azure://{}", RAW), true)
            .with_property(AZURE_ON_DEMAND, "sometimes");
        let err = AzureProvider::new(&subscriber, &context(tmp.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransporterError::Validation(_)));
    }
}
