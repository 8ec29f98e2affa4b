//! ==============================================================================
//! sensors.rs - sensor bank: open, guard and close the four channels
//! ==============================================================================
//!
//! purpose:
//!     opens every configured channel in a fixed order and hands each one out
//!     wrapped in an OpenChannel guard. the guard closes the device exactly
//!     once, whether the owner closes it explicitly, returns early or panics.
//!
//! relationships:
//!     - uses: hal.rs (ChannelProvider / SensorChannel)
//!     - used by: runtime.rs (one OpenChannel per polling task)
//!
//! ==============================================================================

use crate::config::SensorsConfig;
use crate::domain::SensorKind;
use crate::hal::{ChannelProvider, SensorChannel, SensorError};

/// an attached channel plus the id it reports under
pub struct OpenChannel {
    kind: SensorKind,
    sensor_id: String,
    inner: Option<Box<dyn SensorChannel>>,
}

impl OpenChannel {
    pub fn new(sensor_id: impl Into<String>, channel: Box<dyn SensorChannel>) -> Self {
        Self {
            kind: channel.kind(),
            sensor_id: sensor_id.into(),
            inner: Some(channel),
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    pub fn read(&mut self) -> Result<f64, SensorError> {
        match self.inner.as_mut() {
            Some(channel) => channel.read(),
            None => Err(SensorError::Closed),
        }
    }

    /// idempotent; only the first call reaches the device
    pub fn close(&mut self) -> Result<(), SensorError> {
        match self.inner.take() {
            Some(mut channel) => {
                let result = channel.close();
                match &result {
                    Ok(()) => tracing::debug!("Closed {} channel {}", self.kind, self.sensor_id),
                    Err(e) => tracing::warn!("Closing {} channel {} failed: {}", self.kind, self.sensor_id, e),
                }
                result
            }
            None => Ok(()),
        }
    }
}

impl Drop for OpenChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// the four opened channels, in `SensorKind::ALL` order
pub struct SensorBank {
    channels: Vec<OpenChannel>,
}

impl SensorBank {
    /// open and attach every sensor; the first failure aborts startup
    ///
    /// channels opened before the failure are closed (via their guards) before
    /// the error is returned.
    pub fn open_all(
        provider: &dyn ChannelProvider,
        config: &SensorsConfig,
    ) -> Result<Self, SensorError> {
        let timeout = config.attach_timeout();
        let mut channels = Vec::with_capacity(SensorKind::ALL.len());

        for kind in SensorKind::ALL {
            let channel_config = config.channel(kind);
            tracing::info!(
                "Opening {} sensor on hub port {} (waiting up to {}ms for attachment)",
                kind,
                channel_config.hub_port,
                timeout.as_millis()
            );
            let channel = provider.open(kind, channel_config.hub_port, timeout)?;
            channels.push(OpenChannel::new(channel_config.sensor_id.clone(), channel));
        }

        Ok(Self { channels })
    }

    /// hand the guards to their polling tasks
    pub fn into_channels(self) -> Vec<OpenChannel> {
        self.channels
    }

    /// close every channel, reporting the first failure
    pub fn close_all(&mut self) -> Result<(), SensorError> {
        let mut first_err = None;
        for channel in &mut self.channels {
            if let Err(e) = channel.close() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
