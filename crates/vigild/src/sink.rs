//! Result delivery: MQTT publish of the resolved name and HTTP upload of the
//! captured snapshot.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("invalid broker address: {0}")]
    BrokerAddress(String),
    #[error("publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),
    #[error("upload failed: {0}")]
    Upload(#[from] reqwest::Error),
    #[error("upload rejected with status {0}")]
    Rejected(u16),
}

/// Body of the snapshot upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadReport {
    #[serde(rename = "base64Image")]
    pub base64_image: String,
    pub member_id: serde_json::Value,
    pub timestamp: String,
}

/// Destination for identification results. Delivery is best effort:
/// callers log failures and move on.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Announce the resolved username (or `"unknown"`).
    async fn publish(&self, message: &str) -> Result<(), SinkError>;

    /// Upload the captured snapshot with its member id.
    async fn upload(&self, report: &UploadReport) -> Result<(), SinkError>;
}

/// Fire-and-forget MQTT publisher (QoS 0).
pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
}

impl MqttPublisher {
    /// Configure the client for `addr` (`mqtt://[user:pass@]host:port`) and
    /// spawn its event loop on the current runtime. Connection happens in the
    /// background; publishes issued while disconnected are queued or lost.
    pub fn connect(addr: &str, topic: &str) -> Result<Self, SinkError> {
        let url = url::Url::parse(addr).map_err(|e| SinkError::BrokerAddress(format!("{addr}: {e}")))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SinkError::BrokerAddress(format!("{addr}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        let mut options = MqttOptions::new(format!("vigil-{}", Uuid::new_v4()), host, port);
        options.set_keep_alive(Duration::from_secs(20));
        if let Some(password) = url.password() {
            options.set_credentials(url.username(), password);
        }

        let (client, event_loop) = AsyncClient::new(options, 16);
        tokio::spawn(drive_event_loop(event_loop));
        tracing::info!(host, port, topic, "MQTT publisher configured");

        Ok(Self {
            client,
            topic: topic.to_string(),
        })
    }

    pub async fn publish(&self, message: &str) -> Result<(), SinkError> {
        self.client
            .publish(&self.topic, QoS::AtMostOnce, false, message.as_bytes().to_vec())
            .await?;
        tracing::info!(topic = %self.topic, message, "result published");
        Ok(())
    }
}

async fn drive_event_loop(mut event_loop: EventLoop) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("connected to MQTT broker");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("disconnected from MQTT broker");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "MQTT connection error; retrying");
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

/// JSON POST of capture snapshots.
pub struct HttpUploader {
    client: reqwest::Client,
    url: String,
}

impl HttpUploader {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }

    pub async fn upload(&self, report: &UploadReport) -> Result<(), SinkError> {
        let response = self.client.post(&self.url).json(report).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Rejected(status.as_u16()));
        }
        tracing::info!(status = status.as_u16(), member_id = %report.member_id, "snapshot uploaded");
        Ok(())
    }
}

/// Production sink: MQTT for the name, HTTP for the snapshot.
pub struct RemoteSink {
    mqtt: MqttPublisher,
    uploader: HttpUploader,
}

impl RemoteSink {
    pub fn new(mqtt: MqttPublisher, uploader: HttpUploader) -> Self {
        Self { mqtt, uploader }
    }
}

#[async_trait]
impl ResultSink for RemoteSink {
    async fn publish(&self, message: &str) -> Result<(), SinkError> {
        self.mqtt.publish(message).await
    }

    async fn upload(&self, report: &UploadReport) -> Result<(), SinkError> {
        self.uploader.upload(report).await
    }
}
