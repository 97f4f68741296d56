use super::{userinfo, within, ProviderContext};
use crate::error::{Result, TransporterError};
use crate::metrics::Protocol;
use crate::models::Subscriber;
use crate::properties::{
    apply_properties, parse_queue_size, parse_timeout, PropertyRule, MQTT_TIMEOUT,
    RESEND_QUEUE_SIZE,
};
use log::{debug, error, info, warn};
use percent_encoding::percent_decode_str;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use std::fmt;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_retry::strategy::ExponentialBackoff;
use url::Url;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
struct MqttSettings {
    timeout: Duration,
    queue_size: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10_000),
            queue_size: 10,
        }
    }
}

static MQTT_RULES: &[PropertyRule<MqttSettings>] = &[
    PropertyRule {
        key: MQTT_TIMEOUT,
        apply: |s, v| {
            s.timeout = parse_timeout(v)?;
            Ok(())
        },
    },
    PropertyRule {
        key: RESEND_QUEUE_SIZE,
        apply: |s, v| {
            s.queue_size = parse_queue_size(v)?;
            Ok(())
        },
    },
];

/// A running client: the handle used to publish plus the task that drives
/// the event loop and reconnects.
struct Session {
    client: AsyncClient,
    state: watch::Receiver<ClientState>,
    task: JoinHandle<()>,
}

impl Session {
    fn start(options: MqttOptions, ctx: &ProviderContext, cap: usize, broker: &str) -> Self {
        let (client, eventloop) = AsyncClient::new(options, cap);
        let (state_tx, state) = watch::channel(ClientState::Connecting);
        let task = tokio::spawn(run_event_loop(
            eventloop,
            state_tx,
            broker.to_string(),
            ctx.retry_interval,
            ctx.max_retry_interval,
        ));
        Self {
            client,
            state,
            task,
        }
    }

    async fn stop(mut self) {
        if *self.state.borrow() == ClientState::Connected && self.client.try_disconnect().is_ok()
        {
            let _ = tokio::time::timeout(DISCONNECT_GRACE, &mut self.task).await;
        }
        self.task.abort();
    }
}

/// Publishes to `<base topic>/<sub-topic>` on an MQTT broker.
pub struct MqttProvider {
    options: MqttOptions,
    broker: String,
    topic: String,
    qos: QoS,
    settings: MqttSettings,
    tls: bool,
    ctx: ProviderContext,
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for MqttProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttProvider")
            .field("broker", &self.broker)
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("tls", &self.tls)
            .field("timeout", &self.settings.timeout)
            .field("queue_size", &self.settings.queue_size)
            .finish()
    }
}

impl MqttProvider {
    /// `mqtt` connects now and fails if the broker does not answer within the
    /// timeout. `mqtts` waits for [`MqttProvider::set_tls`].
    pub async fn new(subscriber: &Subscriber, url: &Url, ctx: &ProviderContext) -> Result<Self> {
        let tls = match url.scheme() {
            "mqtt" => false,
            "mqtts" => true,
            other => {
                return Err(TransporterError::validation(format!(
                    "Unknown scheme '{}'",
                    other
                )))
            }
        };

        let topic = base_topic(url)?;

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(TransporterError::validation("No MQTT host specified")),
        };
        let port = match url.port() {
            Some(port) if port != 0 => port,
            _ if tls => DEFAULT_TLS_PORT,
            _ => DEFAULT_PORT,
        };

        let mut client_id = None;
        let mut qos_raw = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "clientid" => client_id = Some(value.into_owned()),
                "qos" => qos_raw = Some(value.into_owned()),
                _ => {}
            }
        }
        let client_id = client_id.filter(|id| !id.is_empty()).ok_or_else(|| {
            TransporterError::validation(
                "clientid must be set as URI query parameter for MQTT transporter",
            )
        })?;
        let qos_level = match qos_raw.as_deref() {
            None | Some("") => 0,
            Some(raw) => raw.parse::<u8>().ok().filter(|q| *q <= 2).ok_or_else(|| {
                TransporterError::validation(format!("Invalid MQTT qos value '{}'", raw))
            })?,
        };

        let settings = apply_properties(
            "MQTT",
            MQTT_RULES,
            &subscriber.properties,
            &MqttSettings::default(),
        )?;

        let mut options = MqttOptions::new(client_id, host.clone(), port);
        options.set_keep_alive(KEEP_ALIVE);
        if qos_level > 0 {
            options.set_clean_session(false);
        }
        let (user, password) = userinfo(url);
        if !user.is_empty() {
            options.set_credentials(user, password.unwrap_or_default());
        }

        let provider = Self {
            options,
            broker: format!("{}:{}", host, port),
            topic,
            qos: qos_from_level(qos_level),
            settings,
            tls,
            ctx: ctx.clone(),
            session: Mutex::new(None),
        };

        if !tls {
            provider.connect(provider.options.clone()).await?;
        }

        Ok(provider)
    }

    /// Replaces any running session with one using `options` and waits for
    /// the broker's CONNACK.
    async fn connect(&self, options: MqttOptions) -> Result<()> {
        debug!("Configuring MQTT broker at {}...", self.broker);
        let mut state = {
            let mut session = self.session.lock().await;
            if let Some(old) = session.take() {
                old.stop().await;
            }
            let fresh = Session::start(options, &self.ctx, self.settings.queue_size, &self.broker);
            let state = fresh.state.clone();
            *session = Some(fresh);
            state
        };

        if wait_connected(&mut state, self.settings.timeout).await {
            Ok(())
        } else {
            error!("Connection failed");
            Err(TransporterError::transport(format!(
                "Can't connect to mqtt at {}",
                self.broker
            )))
        }
    }

    fn full_topic(&self, topic: &str) -> String {
        join_topic(&self.topic, topic)
    }

    pub fn state(&self) -> Option<ClientState> {
        self.session
            .try_lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| *s.state.borrow()))
    }

    /// Queues the message without waiting for the broker. A full queue drops
    /// the new message.
    pub async fn publish(&self, topic: &str, payload: &str) {
        let full_topic = self.full_topic(topic);
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            warn!("MQTT client for {} is not started, dropping message", self.broker);
            self.ctx.metrics.dropped(Protocol::Mqtt);
            return;
        };

        match session
            .client
            .try_publish(full_topic.clone(), self.qos, false, payload.as_bytes().to_vec())
        {
            Ok(()) => {
                debug!("Message queued for '{}'", full_topic);
                self.ctx.metrics.queued(Protocol::Mqtt);
            }
            Err(e) => {
                debug!("queue size exceeded for '{}': {}", full_topic, e);
                self.ctx.metrics.dropped(Protocol::Mqtt);
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.stop().await;
            info!("MQTT client for {} stopped", self.broker);
        }
    }

    /// Rebuilds the client with TLS material of `id` and reconnects. A plain
    /// `mqtt` broker keeps its running session.
    pub async fn set_tls(&self, id: &str) -> Result<()> {
        if !self.tls {
            debug!("{} is not a TLS broker, session kept", self.broker);
            return Ok(());
        }
        let material = self.ctx.certs.load(id);
        let mut options = self.options.clone();
        options.set_transport(Transport::Tls(material.mqtt_configuration()?));
        self.connect(options).await
    }
}

impl Drop for MqttProvider {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.task.abort();
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    state: watch::Sender<ClientState>,
    broker: String,
    retry_interval: Duration,
    max_retry_interval: Duration,
) {
    let mut backoff = reconnect_backoff(retry_interval, max_retry_interval);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connection established to {}", broker);
                    state.send_replace(ClientState::Connected);
                    backoff = reconnect_backoff(retry_interval, max_retry_interval);
                } else {
                    warn!("Broker {} refused connection: {:?}", broker, ack.code);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                state.send_replace(ClientState::Disconnected);
                break;
            }
            Ok(event) => {
                debug!("Unhandled event: {:?}", event);
            }
            Err(e) => {
                let delay = backoff.next().unwrap_or(max_retry_interval);
                error!(
                    "Connection lost to {}: {}. Retrying in {:?}...",
                    broker, e, delay
                );
                state.send_replace(ClientState::Disconnected);
                sleep(delay).await;
                state.send_replace(ClientState::Connecting);
            }
        }
    }
}

/// `retry, 2*retry, 4*retry, ...` capped at `max`, never exhausted.
fn reconnect_backoff(retry: Duration, max: Duration) -> ExponentialBackoff {
    let factor = (retry.as_millis() as u64 / 2).max(1);
    ExponentialBackoff::from_millis(2)
        .factor(factor)
        .max_delay(max)
}

async fn wait_connected(state: &mut watch::Receiver<ClientState>, timeout: Duration) -> bool {
    matches!(
        within(timeout, state.wait_for(|s| *s == ClientState::Connected)).await,
        Some(Ok(_))
    )
}

/// The decoded URI path without its leading slash. Wildcards are refused.
fn base_topic(url: &Url) -> Result<String> {
    if url.path().is_empty() {
        return Err(TransporterError::validation(
            "MQTT topic must be specified using the path of the URI",
        ));
    }
    let decoded = percent_decode_str(url.path())
        .decode_utf8()
        .map_err(|_| TransporterError::validation("MQTT topic must be valid UTF-8"))?;
    let path: &str = &decoded;
    if path.contains('#') || path.contains('+') || url.fragment().is_some() {
        return Err(TransporterError::validation(
            "MQTT topic should not contain '#' or '+'",
        ));
    }
    Ok(path.strip_prefix('/').unwrap_or(path).to_string())
}

fn join_topic(base: &str, topic: &str) -> String {
    match (base.is_empty(), topic.is_empty()) {
        (_, true) => base.to_string(),
        (true, false) => topic.to_string(),
        (false, false) => format!("{}/{}", base, topic),
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}
