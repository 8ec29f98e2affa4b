//! ==============================================================================
//! runtime.rs - polling tasks and the uplink task
//! ==============================================================================
//!
//! purpose:
//!     wires the sensor bank to the uplink. every sensor gets its own polling
//!     task so a slow POST never stalls a read; readings that pass the deadband
//!     travel over a bounded channel to a single uplink task.
//!
//! shutdown:
//!     one CancellationToken is shared by all tasks. ctrl-c (main.rs) or a
//!     failed read cancels it; each polling task then closes its own channel.
//!
//! ```text
//!     ┌──────────────┐
//!     │ temperature  │──┐
//!     ├──────────────┤  │   mpsc    ┌────────┐   POST
//!     │ lux          │──┼─────────▶ │ uplink │ ─────────▶ endpoint
//!     ├──────────────┤  │           └────────┘
//!     │ humidity     │──┤
//!     ├──────────────┤  │
//!     │ voltage      │──┘
//!     └──────────────┘
//! ```
//!
//! relationships:
//!     - used by: main.rs
//!     - uses: sensors.rs, filter.rs, uplink.rs
//!
//! ==============================================================================

use crate::config::NodeConfig;
use crate::domain::{Reading, SensorKind, SoilMoisture};
use crate::filter::Deadband;
use crate::hal::{ChannelProvider, SensorError};
use crate::sensors::{OpenChannel, SensorBank};
use crate::uplink::{Delivery, UplinkClient};

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const READING_QUEUE: usize = 32;

/// per-task polling knobs
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub change_threshold: f64,
    pub show_sensor_data: bool,
}

impl PollSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            interval: config.polling.interval(),
            change_threshold: config.polling.change_threshold,
            show_sensor_data: config.logging.show_sensor_data,
        }
    }
}

/// delivery counts from the uplink task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UplinkStats {
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
}

impl UplinkStats {
    fn record(&mut self, delivery: &Delivery) {
        match delivery {
            Delivery::Accepted(_) => self.accepted += 1,
            Delivery::Rejected(_) => self.rejected += 1,
            Delivery::Failed(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.accepted + self.rejected + self.failed
    }
}

fn log_reading(reading: &Reading) {
    info!("{}", reading.describe());
    if reading.kind == SensorKind::Voltage && SoilMoisture::classify(reading.value).is_none() {
        warn!(
            "Voltage of soil is currently at {} which is out of bounds. Please check sensor connection.",
            reading.value
        );
    }
}

/// read one sensor until cancelled, forwarding readings that left the deadband
///
/// a read error cancels the whole node. the channel is closed before returning
/// on every path.
#[tracing::instrument(skip_all, fields(sensor = %channel.kind()))]
pub async fn task_poll_sensor(
    token: CancellationToken,
    mut channel: OpenChannel,
    settings: PollSettings,
    tx: mpsc::Sender<Reading>,
) -> Result<(), SensorError> {
    debug!("Started.");
    let kind = channel.kind();
    let sensor_id = channel.sensor_id().to_string();
    let mut band = Deadband::new(settings.change_threshold);

    let result = loop {
        if token.is_cancelled() {
            break Ok(());
        }

        // vendor calls block, keep them off the async workers
        let (returned, value) = match tokio::task::spawn_blocking(move || {
            let value = channel.read();
            (channel, value)
        })
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                // the channel was dropped (and closed) with the blocking task
                error!("Read task for {} died: {}", kind, e);
                token.cancel();
                return Err(SensorError::Bridge(format!("read task failed: {}", e)));
            }
        };
        channel = returned;

        match value {
            Ok(value) => {
                if band.update(value) {
                    let reading = Reading::now(kind, value, sensor_id.as_str());
                    if settings.show_sensor_data {
                        log_reading(&reading);
                    }
                    // a full queue must not keep us from seeing the cancel
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break Ok(()),
                        sent = tx.send(reading) => {
                            if sent.is_err() {
                                debug!("Uplink gone, stopping.");
                                break Ok(());
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!("An error occurred reading {}: {}", kind, e);
                token.cancel();
                break Err(e);
            }
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(()),
            _ = tokio::time::sleep(settings.interval) => {}
        }
    };

    // close failures are logged by the guard
    let _ = channel.close();
    debug!("Stopped.");
    result
}

/// send readings one at a time until cancelled or every sender is gone
///
/// cancellation wins over queued readings and abandons an in-flight POST.
#[tracing::instrument(skip_all)]
pub async fn task_uplink(
    token: CancellationToken,
    client: UplinkClient,
    mut rx: mpsc::Receiver<Reading>,
) -> UplinkStats {
    debug!("Started, posting to {}", client.endpoint_url());
    let mut stats = UplinkStats::default();
    loop {
        let reading = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Cancelled.");
                break;
            },
            next = rx.recv() => match next {
                Some(reading) => reading,
                None => break,
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Cancelled, dropping in-flight {} send.", reading.kind);
                break;
            },
            delivery = client.send(&reading) => stats.record(&delivery),
        }
    }
    stats
}

/// open the sensors and run the node until `token` is cancelled
///
/// returns an error when a sensor cannot be attached or a read fails; in both
/// cases every channel that was opened has been closed by the time this
/// returns.
pub async fn run(
    config: &NodeConfig,
    provider: Arc<dyn ChannelProvider>,
    token: CancellationToken,
) -> Result<UplinkStats> {
    let client = UplinkClient::new(&config.uplink)?;
    let settings = PollSettings::from_config(config);

    let sensors = config.sensors.clone();
    let mut bank =
        tokio::task::spawn_blocking(move || SensorBank::open_all(provider.as_ref(), &sensors))
            .await
            .context("sensor startup task failed")?
            .context("failed to open sensor channels")?;

    // interrupted while attaching: nothing was polled yet
    if token.is_cancelled() {
        info!("Interrupted during startup, closing sensor channels");
        bank.close_all()?;
        return Ok(UplinkStats::default());
    }

    info!("Polling sensors, press Ctrl-C to exit...");

    let tracker = TaskTracker::new();
    let (tx, rx) = mpsc::channel(READING_QUEUE);

    let uplink = tracker.spawn(task_uplink(token.clone(), client, rx));
    let pollers: Vec<_> = bank
        .into_channels()
        .into_iter()
        .map(|channel| tracker.spawn(task_poll_sensor(token.clone(), channel, settings, tx.clone())))
        .collect();
    drop(tx);
    tracker.close();

    let mut first_err: Option<anyhow::Error> = None;
    for handle in pollers {
        let outcome = match handle.await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => anyhow!(e).context("sensor read failed"),
            Err(e) => anyhow!("polling task panicked: {}", e),
        };
        token.cancel();
        first_err.get_or_insert(outcome);
    }

    let stats = uplink.await.context("uplink task failed")?;
    tracker.wait().await;
    info!(
        "Closed sensor channels ({} sent, {} rejected, {} failed)",
        stats.accepted, stats.rejected, stats.failed
    );

    match first_err {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}
