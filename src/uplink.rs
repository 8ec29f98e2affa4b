//! ==============================================================================
//! uplink.rs - pushes readings to the remote endpoint
//! ==============================================================================
//!
//! purpose:
//!     turns a Reading into the flat json Payload and POSTs it.
//!     a failed send is logged and dropped: no retry, no queue. the caller
//!     always gets a Delivery back, never an error.
//!
//! relationships:
//!     - used by: runtime.rs (uplink task)
//!     - uses: domain.rs (Payload)
//!
//! ==============================================================================

use crate::config::UplinkConfig;
use crate::domain::{Payload, Reading};
use anyhow::{Context, Result};
use reqwest::StatusCode;
use std::time::Duration;

/// what happened to one POST
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// 2xx from the endpoint
    Accepted(StatusCode),
    /// endpoint answered with anything else
    Rejected(StatusCode),
    /// no response at all (connect, timeout, ...)
    Failed(String),
}

#[derive(Clone)]
pub struct UplinkClient {
    client: reqwest::Client,
    endpoint_url: String,
    user_id: String,
    plant_id: String,
}

impl UplinkClient {
    pub fn new(config: &UplinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build http client")?;

        Ok(Self {
            client,
            endpoint_url: config.endpoint_url.clone(),
            user_id: config.user_id.clone(),
            plant_id: config.plant_id.clone(),
        })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn payload(&self, reading: &Reading) -> Payload {
        Payload::from_reading(reading, &self.user_id, &self.plant_id)
    }

    pub async fn send(&self, reading: &Reading) -> Delivery {
        let payload = self.payload(reading);
        tracing::info!("Sending {} to API", payload.sensor_type);

        match self.client.post(&self.endpoint_url).json(&payload).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    tracing::info!("Sent: {:?}, Status: {}", payload, status.as_u16());
                    Delivery::Accepted(status)
                } else {
                    tracing::warn!("Sent: {:?}, Status: {}", payload, status.as_u16());
                    Delivery::Rejected(status)
                }
            }
            Err(e) => {
                tracing::warn!("Send of {} failed, dropping it: {}", payload.sensor_type, e);
                Delivery::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SensorKind;

    fn config(endpoint_url: String) -> UplinkConfig {
        UplinkConfig {
            endpoint_url,
            user_id: "u1".to_string(),
            plant_id: "p1".to_string(),
            request_timeout_ms: 500,
        }
    }

    /// an address nothing listens on
    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}/sensors", port)
    }

    #[test]
    fn test_payload_uses_configured_identity() {
        let client = UplinkClient::new(&config("http://localhost/sensors".to_string())).unwrap();
        let payload = client.payload(&Reading::now(SensorKind::Humidity, 41.5, "2"));
        assert_eq!(
            payload,
            Payload {
                measurement: 41.5,
                user_id: "u1".to_string(),
                user_plant_id: "p1".to_string(),
                sensor_type: "humidity".to_string(),
                sensor_id: "2".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_not_an_error() {
        let client = UplinkClient::new(&config(closed_port_url())).unwrap();
        let reading = Reading::now(SensorKind::Lux, 120.0, "1");

        // repeated failures keep returning a Delivery instead of bubbling up
        for _ in 0..3 {
            let delivery = client.send(&reading).await;
            assert!(matches!(delivery, Delivery::Failed(_)), "{:?}", delivery);
        }
    }
}
