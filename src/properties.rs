//! Rule-table validation of the flat `properties` map carried by a subscriber.
//!
//! Each protocol declares a static slice of [`PropertyRule`]s. A key that is
//! not in the table, or a value its rule cannot parse, rejects the whole map:
//! settings are applied to a scratch copy and only returned when every key
//! passed.

use crate::error::{Result, TransporterError};
use std::collections::HashMap;
use std::time::Duration;

pub const RESEND_QUEUE_SIZE: &str = "Transporter.ResendQueueSize";
pub const MQTT_TIMEOUT: &str = "Transporter.MQTT.Timeout";
pub const HTTP_TIMEOUT: &str = "Transporter.HTTP.Timeout";
pub const HTTP_METHOD: &str = "Transporter.HTTP.Method";
pub const HTTPS_BYPASS_SSL_VERIFICATION: &str = "Transporter.HTTPS.BypassSSLVerification";
pub const MIME_TYPE: &str = "MimeType";
pub const TCP_TIMEOUT: &str = "Transporter.TCP.Timeout";
pub const UDP_TIMEOUT: &str = "Transporter.UDP.Timeout";
pub const AZURE_TIMEOUT: &str = "Transporter.Azure.Timeout";
pub const AZURE_ON_DEMAND: &str = "Transporter.Azure.OnDemand";

/// Parses, range-checks and stores one property value into `T`.
pub type Apply<T> = fn(&mut T, &str) -> std::result::Result<(), String>;

pub struct PropertyRule<T> {
    pub key: &'static str,
    pub apply: Apply<T>,
}

/// Applies `properties` to a copy of `defaults` using `rules`.
pub fn apply_properties<T: Clone>(
    protocol: &str,
    rules: &[PropertyRule<T>],
    properties: &HashMap<String, String>,
    defaults: &T,
) -> Result<T> {
    let mut settings = defaults.clone();
    for (key, value) in properties {
        if key.is_empty() {
            continue;
        }
        let rule = rules.iter().find(|rule| rule.key == key).ok_or_else(|| {
            TransporterError::validation(format!(
                "Unknown property key '{}' for {} transporter",
                key, protocol
            ))
        })?;
        (rule.apply)(&mut settings, value).map_err(TransporterError::Validation)?;
    }
    Ok(settings)
}

/// Non-negative integer milliseconds. Zero means no deadline.
pub fn parse_timeout(value: &str) -> std::result::Result<Duration, String> {
    match value.trim().parse::<i64>() {
        Ok(ms) if ms >= 0 => Ok(Duration::from_millis(ms as u64)),
        _ => Err(format!("Invalid timeout value '{}'", value)),
    }
}

pub fn parse_queue_size(value: &str) -> std::result::Result<usize, String> {
    match value.trim().parse::<i64>() {
        Ok(size) if size > 0 => Ok(size as usize),
        _ => Err(format!("Invalid queuesize value '{}'", value)),
    }
}

/// Accepts the same spellings as the usual `1/t/true` family.
pub fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, String> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(format!("Invalid {} '{}'", key, value)),
    }
}

pub const HTTP_METHODS: [&str; 6] = ["DELETE", "GET", "HEAD", "OPTIONS", "POST", "PUT"];

pub fn parse_http_method(value: &str) -> std::result::Result<String, String> {
    let method = value.trim().to_uppercase();
    if method.is_empty() {
        return Err("HTTP method not specified".to_string());
    }
    if HTTP_METHODS.contains(&method.as_str()) {
        Ok(method)
    } else {
        Err(format!("Invalid HTTP method value '{}'", value))
    }
}
