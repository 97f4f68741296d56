//! Routes reports to MQTT, HTTP, TCP, UDP and Azure IoT Hub subscribers.

pub mod config;
pub mod error;
pub mod keystore;
pub mod metrics;
pub mod models;
pub mod properties;
pub mod provider;
pub mod rest_server;
pub mod subscribers;
pub mod subscriptors;
pub mod tls;
pub mod transport;

pub use error::{Result, TransporterError};
pub use models::{Subscriber, Subscriptor};
pub use transport::Transport;
