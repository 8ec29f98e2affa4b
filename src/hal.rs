//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface to the four hub-port sensor channels.
//!     abstracts away the difference between running next to a real Phidget
//!     hub (vendor python SDK) and a development machine (using mocks).
//!
//! design philosophy:
//!     - "Compile Anywhere": no vendor library is linked into this binary.
//!     - "One Handle Per Sensor": a channel is opened once, read many times,
//!       closed once.
//!
//! relationships:
//!     - used by: sensors.rs (opens the bank, guards the handles)
//!     - uses: python3 + Phidget22 (via long-lived subprocess per channel)
//!
//! why subprocess to python?:
//!     the vendor ships its SDK as a native library with python bindings.
//!     keeping the python process alive per channel preserves the
//!     open -> attach -> read -> close lifecycle without linking C code here.
//!
//! ==============================================================================

use crate::domain::SensorKind;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    /// error raised inside the vendor SDK
    #[error("PhidgetException {code} ({description}): {details}")]
    Sdk {
        code: i64,
        description: String,
        details: String,
    },
    #[error("sensor bridge failure: {0}")]
    Bridge(String),
    #[error("sensor bridge timed out: {0}")]
    Timeout(String),
    #[error("sensor io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel already closed")]
    Closed,
}

/// one opened (attached) sensor channel
pub trait SensorChannel: Send {
    fn kind(&self) -> SensorKind;
    /// current value in the SDK's native unit
    fn read(&mut self) -> Result<f64, SensorError>;
    fn close(&mut self) -> Result<(), SensorError>;
}

/// opens channels on a hub port and waits for attachment
pub trait ChannelProvider: Send + Sync {
    fn open(
        &self,
        kind: SensorKind,
        hub_port: u8,
        attach_timeout: Duration,
    ) -> Result<Box<dyn SensorChannel>, SensorError>;
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For development machines and tests)
// ==============================================================================================

fn nominal(kind: SensorKind) -> f64 {
    match kind {
        SensorKind::Temperature => 22.0,
        SensorKind::Lux => 300.0,
        SensorKind::Humidity => 45.0,
        SensorKind::Voltage => 0.35,
    }
}

#[derive(Default)]
struct MockCounters {
    opens: HashMap<SensorKind, AtomicUsize>,
    closes: HashMap<SensorKind, AtomicUsize>,
}

impl MockCounters {
    fn new() -> Self {
        let mut counters = Self::default();
        for kind in SensorKind::ALL {
            counters.opens.insert(kind, AtomicUsize::new(0));
            counters.closes.insert(kind, AtomicUsize::new(0));
        }
        counters
    }

    fn bump(map: &HashMap<SensorKind, AtomicUsize>, kind: SensorKind) {
        if let Some(count) = map.get(&kind) {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn get(map: &HashMap<SensorKind, AtomicUsize>, kind: SensorKind) -> usize {
        map.get(&kind).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0)
    }
}

/// in-memory channels
///
/// each channel plays back its scripted values, then keeps repeating the last
/// one. unscripted sensors report a fixed nominal value.
#[derive(Clone)]
pub struct MockProvider {
    scripts: HashMap<SensorKind, Vec<f64>>,
    fail_attach: HashSet<SensorKind>,
    fail_read_after: HashMap<SensorKind, usize>,
    read_delay: Duration,
    attach_delay: Duration,
    counters: Arc<MockCounters>,
}

impl MockProvider {
    pub fn new() -> Self {
        tracing::info!("Using MOCK sensor channels (No hardware access)");
        Self {
            scripts: HashMap::new(),
            fail_attach: HashSet::new(),
            fail_read_after: HashMap::new(),
            read_delay: Duration::ZERO,
            attach_delay: Duration::ZERO,
            counters: Arc::new(MockCounters::new()),
        }
    }

    pub fn with_values(mut self, kind: SensorKind, values: Vec<f64>) -> Self {
        self.scripts.insert(kind, values);
        self
    }

    /// opening this sensor fails as if attachment timed out
    pub fn failing_attach(mut self, kind: SensorKind) -> Self {
        self.fail_attach.insert(kind);
        self
    }

    /// reads succeed `reads` times, then error
    pub fn failing_read_after(mut self, kind: SensorKind, reads: usize) -> Self {
        self.fail_read_after.insert(kind, reads);
        self
    }

    /// every read blocks this long, like a slow vendor call
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// every attach blocks this long before it completes
    pub fn with_attach_delay(mut self, delay: Duration) -> Self {
        self.attach_delay = delay;
        self
    }

    pub fn open_count(&self, kind: SensorKind) -> usize {
        MockCounters::get(&self.counters.opens, kind)
    }

    pub fn close_count(&self, kind: SensorKind) -> usize {
        MockCounters::get(&self.counters.closes, kind)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelProvider for MockProvider {
    fn open(
        &self,
        kind: SensorKind,
        hub_port: u8,
        attach_timeout: Duration,
    ) -> Result<Box<dyn SensorChannel>, SensorError> {
        tracing::debug!("[MOCK] Opening {} on hub port {}", kind, hub_port);
        std::thread::sleep(self.attach_delay);
        if self.fail_attach.contains(&kind) {
            return Err(SensorError::Sdk {
                code: 3,
                description: "Timed Out".to_string(),
                details: format!(
                    "waitForAttachment on port {} did not complete within {}ms",
                    hub_port,
                    attach_timeout.as_millis()
                ),
            });
        }
        MockCounters::bump(&self.counters.opens, kind);

        let values: VecDeque<f64> = self.scripts.get(&kind).cloned().unwrap_or_default().into();
        Ok(Box::new(MockChannel {
            kind,
            last: values.front().copied().unwrap_or_else(|| nominal(kind)),
            values,
            reads_left: self.fail_read_after.get(&kind).copied(),
            read_delay: self.read_delay,
            counters: self.counters.clone(),
        }))
    }
}

struct MockChannel {
    kind: SensorKind,
    values: VecDeque<f64>,
    last: f64,
    reads_left: Option<usize>,
    read_delay: Duration,
    counters: Arc<MockCounters>,
}

impl SensorChannel for MockChannel {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn read(&mut self) -> Result<f64, SensorError> {
        std::thread::sleep(self.read_delay);
        if let Some(left) = self.reads_left.as_mut() {
            if *left == 0 {
                return Err(SensorError::Sdk {
                    code: 52,
                    description: "Unknown or Invalid Value".to_string(),
                    details: format!("{} channel returned no value", self.kind),
                });
            }
            *left -= 1;
        }
        if let Some(value) = self.values.pop_front() {
            self.last = value;
        }
        Ok(self.last)
    }

    fn close(&mut self) -> Result<(), SensorError> {
        tracing::debug!("[MOCK] Closing {}", self.kind);
        MockCounters::bump(&self.counters.closes, self.kind);
        Ok(())
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (Phidget22 python SDK)
// ==============================================================================================

/// bridge program run as `python3 -c BRIDGE <kind> <hub_port> <timeout_ms>`
///
/// protocol: one json object per line on stdout. the first line reports the
/// attach result, then each `read` line on stdin gets a value, `close` (or
/// stdin reaching eof) closes the vendor channel. SIGINT is ignored so a
/// terminal ctrl-c cannot kill the bridge before the node asks it to close.
const BRIDGE: &str = r#"
import json, signal, sys
signal.signal(signal.SIGINT, signal.SIG_IGN)
from Phidget22.PhidgetException import PhidgetException

def reply(**kw):
    print(json.dumps(kw), flush=True)

def fail(ex):
    reply(ok=False, code=int(ex.code), description=str(ex.description), details=str(ex.details))

kind, port, timeout = sys.argv[1], int(sys.argv[2]), int(sys.argv[3])
if kind == "temperature":
    from Phidget22.Devices.TemperatureSensor import TemperatureSensor as Channel
    getter = "getTemperature"
elif kind == "lux":
    from Phidget22.Devices.LightSensor import LightSensor as Channel
    getter = "getIlluminance"
elif kind == "humidity":
    from Phidget22.Devices.HumiditySensor import HumiditySensor as Channel
    getter = "getHumidity"
else:
    from Phidget22.Devices.VoltageRatioInput import VoltageRatioInput as Channel
    getter = "getVoltageRatio"

ch = Channel()
try:
    ch.setHubPort(port)
    ch.openWaitForAttachment(timeout)
    reply(ok=True)
except PhidgetException as ex:
    fail(ex)
    sys.exit(1)

for line in sys.stdin:
    cmd = line.strip()
    if cmd == "read":
        try:
            reply(ok=True, value=getattr(ch, getter)())
        except PhidgetException as ex:
            fail(ex)
    elif cmd == "close":
        break

try:
    ch.close()
    reply(ok=True)
except PhidgetException as ex:
    fail(ex)
"#;

/// slack on top of the attach timeout for interpreter startup and imports
const BRIDGE_STARTUP: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct BridgeReply {
    ok: bool,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

impl BridgeReply {
    fn parse(line: &str) -> Result<Self, SensorError> {
        let reply: BridgeReply = serde_json::from_str(line.trim())
            .map_err(|e| SensorError::Bridge(format!("bad reply {:?}: {}", line.trim(), e)))?;
        if reply.ok {
            return Ok(reply);
        }
        Err(SensorError::Sdk {
            code: reply.code.unwrap_or(-1),
            description: reply.description.unwrap_or_default(),
            details: reply.details.unwrap_or_default(),
        })
    }
}

pub struct Phidget22Provider {
    python: String,
    python_path: Option<String>,
    reply_timeout: Duration,
}

impl Phidget22Provider {
    pub fn new(python: impl Into<String>, reply_timeout: Duration) -> Self {
        let python = python.into();
        tracing::info!("Using PHIDGET22 sensor channels via {}", python);
        Self { python, python_path: None, reply_timeout }
    }

    /// extra module directory (PYTHONPATH) holding the vendor SDK
    pub fn with_python_path(mut self, path: impl Into<String>) -> Self {
        self.python_path = Some(path.into());
        self
    }
}

impl ChannelProvider for Phidget22Provider {
    fn open(
        &self,
        kind: SensorKind,
        hub_port: u8,
        attach_timeout: Duration,
    ) -> Result<Box<dyn SensorChannel>, SensorError> {
        let channel = PhidgetChannel::spawn(self, kind, hub_port, attach_timeout)?;
        Ok(Box::new(channel))
    }
}

struct PhidgetChannel {
    kind: SensorKind,
    child: Child,
    stdin: ChildStdin,
    replies: mpsc::Receiver<std::io::Result<String>>,
    reply_timeout: Duration,
}

/// forwards bridge stdout lines so replies can be awaited with a deadline
///
/// the thread ends once the bridge's stdout closes.
fn spawn_reader(
    kind: SensorKind,
    stdout: ChildStdout,
) -> std::io::Result<mpsc::Receiver<std::io::Result<String>>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(format!("{}-bridge", kind))
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

impl PhidgetChannel {
    fn spawn(
        provider: &Phidget22Provider,
        kind: SensorKind,
        hub_port: u8,
        attach_timeout: Duration,
    ) -> Result<Self, SensorError> {
        let mut command = Command::new(&provider.python);
        command
            .arg("-c")
            .arg(BRIDGE)
            .arg(kind.as_str())
            .arg(hub_port.to_string())
            .arg(attach_timeout.as_millis().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(path) = &provider.python_path {
            command.env("PYTHONPATH", path);
        }
        #[cfg(unix)]
        {
            // keep the bridges out of the terminal's foreground group
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command.spawn()?;

        let pipes = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => spawn_reader(kind, stdout).map(|rx| (stdin, rx)),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "bridge pipes unavailable",
            )),
        };
        let (stdin, replies) = match pipes {
            Ok(pipes) => pipes,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        // Drop takes care of the child if the attach reply is an error
        let mut channel = Self {
            kind,
            child,
            stdin,
            replies,
            reply_timeout: provider.reply_timeout,
        };
        channel.reply(attach_timeout + BRIDGE_STARTUP)?;
        tracing::debug!("{} attached on hub port {}", kind, hub_port);
        Ok(channel)
    }

    /// a bridge that misses the deadline is killed, later replies would be
    /// out of step with our requests
    fn reply(&mut self, timeout: Duration) -> Result<BridgeReply, SensorError> {
        match self.replies.recv_timeout(timeout) {
            Ok(Ok(line)) => BridgeReply::parse(&line),
            Ok(Err(e)) => Err(e.into()),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let _ = self.child.kill();
                Err(SensorError::Timeout(format!(
                    "{} bridge gave no reply within {}ms",
                    self.kind,
                    timeout.as_millis()
                )))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(SensorError::Bridge(format!("{} bridge exited", self.kind)))
            }
        }
    }

    fn request(&mut self, command: &str) -> Result<BridgeReply, SensorError> {
        writeln!(self.stdin, "{}", command)?;
        self.stdin.flush()?;
        self.reply(self.reply_timeout)
    }
}

impl SensorChannel for PhidgetChannel {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn read(&mut self) -> Result<f64, SensorError> {
        self.request("read")?
            .value
            .ok_or_else(|| SensorError::Bridge(format!("{} reply carried no value", self.kind)))
    }

    fn close(&mut self) -> Result<(), SensorError> {
        let result = self.request("close").map(|_| ());
        if result.is_err() {
            let _ = self.child.kill();
        }
        self.child.wait()?;
        result
    }
}

impl Drop for PhidgetChannel {
    fn drop(&mut self) {
        // no-op when the bridge already exited after `close`
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(10);

    #[test]
    fn test_mock_plays_script_then_repeats() {
        let provider = MockProvider::new().with_values(SensorKind::Lux, vec![1.0, 2.0]);
        let mut ch = provider.open(SensorKind::Lux, 1, TIMEOUT).unwrap();
        assert_eq!(ch.read().unwrap(), 1.0);
        assert_eq!(ch.read().unwrap(), 2.0);
        assert_eq!(ch.read().unwrap(), 2.0);
        assert_eq!(ch.kind(), SensorKind::Lux);
    }

    #[test]
    fn test_mock_nominal_values() {
        let provider = MockProvider::new();
        let mut ch = provider.open(SensorKind::Voltage, 3, TIMEOUT).unwrap();
        assert_eq!(ch.read().unwrap(), 0.35);
    }

    #[test]
    fn test_mock_attach_failure_is_sdk_error() {
        let provider = MockProvider::new().failing_attach(SensorKind::Humidity);
        let err = provider.open(SensorKind::Humidity, 2, TIMEOUT).err().unwrap();
        assert!(matches!(err, SensorError::Sdk { code: 3, .. }));
        assert!(err.to_string().starts_with("PhidgetException 3 (Timed Out): "));
        assert_eq!(provider.open_count(SensorKind::Humidity), 0);
    }

    #[test]
    fn test_mock_read_failure_and_close_count() {
        let provider = MockProvider::new().failing_read_after(SensorKind::Temperature, 1);
        let mut ch = provider.open(SensorKind::Temperature, 0, TIMEOUT).unwrap();
        assert!(ch.read().is_ok());
        assert!(ch.read().is_err());
        ch.close().unwrap();
        assert_eq!(provider.close_count(SensorKind::Temperature), 1);
    }

    #[test]
    fn test_bridge_reply_ok() {
        let reply = BridgeReply::parse("{\"ok\": true, \"value\": 23.5}\n").unwrap();
        assert_eq!(reply.value, Some(23.5));
    }

    #[test]
    fn test_bridge_reply_exception_triplet() {
        let line = r#"{"ok": false, "code": 13, "description": "Timed Out", "details": "port 2"}"#;
        match BridgeReply::parse(line) {
            Err(SensorError::Sdk { code, description, details }) => {
                assert_eq!(code, 13);
                assert_eq!(description, "Timed Out");
                assert_eq!(details, "port 2");
            }
            other => panic!("unexpected {:?}", other.map(|r| r.value)),
        }
    }

    #[test]
    fn test_bridge_reply_garbage() {
        assert!(matches!(BridgeReply::parse("Traceback ..."), Err(SensorError::Bridge(_))));
    }

    #[test]
    fn test_missing_interpreter_is_io_error() {
        let provider =
            Phidget22Provider::new("/nonexistent/python-for-sensor-node", Duration::from_secs(1));
        let err = provider.open(SensorKind::Temperature, 0, TIMEOUT).err().unwrap();
        assert!(matches!(err, SensorError::Io(_)));
    }

    #[test]
    fn test_mock_delays() {
        let provider = MockProvider::new()
            .with_attach_delay(Duration::from_millis(20))
            .with_read_delay(Duration::from_millis(20));
        let started = std::time::Instant::now();
        let mut ch = provider.open(SensorKind::Lux, 1, TIMEOUT).unwrap();
        ch.read().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    // --------------------------------------------------------------------------
    // bridge tests against a stand-in Phidget22 package (need python3 on PATH)
    // --------------------------------------------------------------------------
    #[cfg(unix)]
    mod bridge {
        use super::*;
        use std::path::{Path, PathBuf};
        use std::time::Instant;
        use tempfile::TempDir;

        const EXCEPTION_PY: &str = r#"
class PhidgetException(Exception):
    def __init__(self, code, description, details):
        super().__init__(description)
        self.code = code
        self.description = description
        self.details = details
"#;

        const TEMPERATURE_PY: &str = r#"
import os, time

EVENTS = "@EVENTS@"

def log(event):
    with open(EVENTS, "a") as f:
        f.write(event + "\n")

class TemperatureSensor:
    def setHubPort(self, port):
        self.port = port

    def openWaitForAttachment(self, timeout):
        log("open %d" % os.getpid())

    def getTemperature(self):
        time.sleep(@READ_DELAY@)
        return 21.0

    def close(self):
        log("close")
"#;

        fn python_available() -> bool {
            Command::new("python3")
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        }

        /// lays out Phidget22/{PhidgetException,Devices/TemperatureSensor}.py
        fn fake_sdk(read_delay_secs: f64) -> (TempDir, PathBuf) {
            let dir = tempfile::tempdir().unwrap();
            let events = dir.path().join("events.log");
            let devices = dir.path().join("Phidget22").join("Devices");
            std::fs::create_dir_all(&devices).unwrap();
            std::fs::write(dir.path().join("Phidget22").join("__init__.py"), "").unwrap();
            std::fs::write(dir.path().join("Phidget22").join("PhidgetException.py"), EXCEPTION_PY)
                .unwrap();
            std::fs::write(devices.join("__init__.py"), "").unwrap();
            let sensor = TEMPERATURE_PY
                .replace("@EVENTS@", &events.display().to_string())
                .replace("@READ_DELAY@", &read_delay_secs.to_string());
            std::fs::write(devices.join("TemperatureSensor.py"), sensor).unwrap();
            (dir, events)
        }

        fn provider(dir: &Path, reply_timeout: Duration) -> Phidget22Provider {
            Phidget22Provider::new("python3", reply_timeout)
                .with_python_path(dir.display().to_string())
        }

        fn events(path: &Path) -> Vec<String> {
            std::fs::read_to_string(path)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        #[test]
        fn test_sigint_does_not_skip_vendor_close() {
            if !python_available() {
                return;
            }
            let (dir, log) = fake_sdk(0.0);
            let mut ch = provider(dir.path(), Duration::from_secs(5))
                .open(SensorKind::Temperature, 0, Duration::from_millis(500))
                .unwrap();
            assert_eq!(ch.read().unwrap(), 21.0);

            // what a terminal ctrl-c delivers to every process in the group
            let pid = events(&log)
                .iter()
                .find_map(|e| e.strip_prefix("open ").map(str::to_string))
                .unwrap();
            let status = Command::new("sh")
                .arg("-c")
                .arg(format!("kill -INT {}", pid))
                .status()
                .unwrap();
            assert!(status.success());
            std::thread::sleep(Duration::from_millis(200));

            ch.close().unwrap();
            assert_eq!(events(&log).iter().filter(|e| *e == "close").count(), 1);
        }

        #[test]
        fn test_close_reaches_vendor_close_once() {
            if !python_available() {
                return;
            }
            let (dir, log) = fake_sdk(0.0);
            let mut ch = provider(dir.path(), Duration::from_secs(5))
                .open(SensorKind::Temperature, 0, Duration::from_millis(500))
                .unwrap();
            ch.close().unwrap();
            drop(ch);
            assert_eq!(events(&log).iter().filter(|e| *e == "close").count(), 1);
        }

        #[test]
        fn test_hung_bridge_read_times_out() {
            if !python_available() {
                return;
            }
            let (dir, _log) = fake_sdk(30.0);
            let mut ch = provider(dir.path(), Duration::from_millis(300))
                .open(SensorKind::Temperature, 0, Duration::from_millis(500))
                .unwrap();

            let started = Instant::now();
            assert!(matches!(ch.read(), Err(SensorError::Timeout(_))));
            // the timed out bridge was killed, so close cannot hang either
            assert!(ch.close().is_err());
            assert!(started.elapsed() < Duration::from_secs(5));
        }
    }
}
