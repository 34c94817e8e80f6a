//! Serial port management
//!
//! Owns every open serial connection: enumeration, 8N1 framing, writes,
//! on-demand reads, and a per-port reader thread that performs blocking
//! line-oriented reads and hands each line to the pipeline. Reader
//! threads hold no shared lock while blocked on the port.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serialport::{DataBits, Parity, SerialPort, SerialPortInfo, SerialPortType, StopBits};
use tracing::{error, info, warn};

use crate::error::SerialError;
use crate::models::RawLine;

/// Callback invoked on the reader thread for every complete line.
pub type LineCallback = Arc<dyn Fn(RawLine) + Send + Sync>;

/// A reader thread exits after this many consecutive failed reads.
const MAX_READ_FAILURES: u32 = 5;

/// Bound on joining a reader thread during close.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One entry of the `list_ports` response.
#[derive(Debug, Clone, Serialize)]
pub struct PortDescriptor {
    pub port: String,
    pub description: String,
    pub hwid: String,
    pub manufacturer: String,
    pub product: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// Settings snapshot of an open port, for `get_port_info`.
#[derive(Debug, Clone, Serialize)]
pub struct OpenPortInfo {
    pub port: String,
    pub baudrate: u32,
    pub bytesize: u8,
    pub parity: String,
    pub stopbits: u8,
    pub timeout: f64,
    pub is_open: bool,
}

struct Connection {
    /// Command-side handle for writes and on-demand reads; the reader
    /// thread owns an independent clone.
    handle: Box<dyn SerialPort>,
    baudrate: u32,
    timeout: Duration,
    stop: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

/// Manager for multiple concurrent serial connections.
pub struct SerialManager {
    connections: Mutex<HashMap<String, Connection>>,
    /// Epoch for the monotonic timestamps stamped onto raw lines.
    started: Instant,
}

impl SerialManager {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    /// Enumerate serial ports visible to the system.
    pub fn list_ports(&self) -> Vec<PortDescriptor> {
        match serialport::available_ports() {
            Ok(ports) => {
                info!(count = ports.len(), "enumerated serial ports");
                ports.into_iter().map(describe_port).collect()
            }
            Err(e) => {
                error!("error listing serial ports: {e}");
                Vec::new()
            }
        }
    }

    /// Open a port at 8N1 and start its reader thread.
    ///
    /// An existing connection on the same port is closed first. The
    /// callback runs on the reader thread, once per received line.
    pub fn open_port(
        &self,
        port: &str,
        baudrate: u32,
        timeout: Duration,
        callback: LineCallback,
    ) -> Result<(), SerialError> {
        // Reopening replaces the existing connection
        let _ = self.close_port(port);

        let handle = serialport::new(port, baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open()?;
        let reader_handle = handle.try_clone()?;

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let port = port.to_string();
            let stop = stop.clone();
            let epoch = self.started;
            thread::Builder::new()
                .name(format!("serial-read-{port}"))
                .spawn(move || reader_loop(port, reader_handle, stop, callback, epoch))?
        };

        info!(port, baudrate, "opened serial port");
        self.connections.lock().unwrap().insert(
            port.to_string(),
            Connection {
                handle,
                baudrate,
                timeout,
                stop,
                reader: Some(reader),
            },
        );
        Ok(())
    }

    /// Close a port: signal the reader, join it with a bounded wait,
    /// then drop the connection.
    pub fn close_port(&self, port: &str) -> Result<(), SerialError> {
        let mut conn = self
            .connections
            .lock()
            .unwrap()
            .remove(port)
            .ok_or_else(|| SerialError::PortNotOpen(port.to_string()))?;

        conn.stop.store(true, Ordering::Relaxed);
        if let Some(reader) = conn.reader.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if reader.is_finished() {
                let _ = reader.join();
            } else {
                // The thread is stuck in a blocking read; dropping the
                // handle lets it exit on its next timeout.
                warn!(port, "reader thread did not stop in time, detaching");
            }
        }

        info!(port, "closed serial port");
        Ok(())
    }

    /// Close every open port, reporting the first failure.
    pub fn close_all_ports(&self) -> Result<(), SerialError> {
        let ports: Vec<String> = self.connections.lock().unwrap().keys().cloned().collect();
        let mut result = Ok(());
        for port in ports {
            if let Err(e) = self.close_port(&port) {
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Write raw data to an open port.
    pub fn write_port(&self, port: &str, data: &str) -> Result<usize, SerialError> {
        let mut connections = self.connections.lock().unwrap();
        let conn = connections
            .get_mut(port)
            .ok_or_else(|| SerialError::PortNotOpen(port.to_string()))?;

        conn.handle.write_all(data.as_bytes())?;
        conn.handle.flush()?;
        info!(port, bytes = data.len(), "wrote to serial port");
        Ok(data.len())
    }

    /// Write data followed by a newline.
    pub fn write_port_line(&self, port: &str, data: &str) -> Result<usize, SerialError> {
        self.write_port(port, &format!("{data}\n"))
    }

    /// Read up to `num_bytes` (or whatever is waiting) from a port.
    pub fn read_port(&self, port: &str, num_bytes: Option<usize>) -> Result<String, SerialError> {
        let mut connections = self.connections.lock().unwrap();
        let conn = connections
            .get_mut(port)
            .ok_or_else(|| SerialError::PortNotOpen(port.to_string()))?;

        let wanted = match num_bytes {
            Some(n) => n,
            None => conn.handle.bytes_to_read()? as usize,
        };
        if wanted == 0 {
            return Ok(String::new());
        }

        let mut buf = vec![0u8; wanted];
        match conn.handle.read(&mut buf) {
            Ok(n) => Ok(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one line (up to a newline or the port timeout).
    pub fn read_port_line(&self, port: &str) -> Result<String, SerialError> {
        let mut connections = self.connections.lock().unwrap();
        let conn = connections
            .get_mut(port)
            .ok_or_else(|| SerialError::PortNotOpen(port.to_string()))?;

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match conn.handle.read(&mut byte) {
                Ok(1) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                    if line.len() >= 4096 {
                        break;
                    }
                }
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
    }

    pub fn is_port_open(&self, port: &str) -> bool {
        self.connections.lock().unwrap().contains_key(port)
    }

    /// Settings of an open port, `None` when the port is not open.
    pub fn port_info(&self, port: &str) -> Option<OpenPortInfo> {
        let connections = self.connections.lock().unwrap();
        let conn = connections.get(port)?;

        let bytesize = match conn.handle.data_bits() {
            Ok(DataBits::Five) => 5,
            Ok(DataBits::Six) => 6,
            Ok(DataBits::Seven) => 7,
            _ => 8,
        };
        let parity = match conn.handle.parity() {
            Ok(Parity::Odd) => "odd",
            Ok(Parity::Even) => "even",
            _ => "none",
        };
        let stopbits = match conn.handle.stop_bits() {
            Ok(StopBits::Two) => 2,
            _ => 1,
        };

        Some(OpenPortInfo {
            port: port.to_string(),
            baudrate: conn.baudrate,
            bytesize,
            parity: parity.to_string(),
            stopbits,
            timeout: conn.timeout.as_secs_f64(),
            is_open: true,
        })
    }
}

impl Default for SerialManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocking read loop run on the per-port reader thread.
fn reader_loop(
    port: String,
    mut handle: Box<dyn SerialPort>,
    stop: Arc<AtomicBool>,
    callback: LineCallback,
    epoch: Instant,
) {
    info!(port = %port, "reader thread started");
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 512];
    let mut failures = 0u32;

    while !stop.load(Ordering::Relaxed) {
        match handle.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => {
                failures = 0;
                buffer.extend_from_slice(&chunk[..n]);
                drain_lines(&mut buffer, |line| {
                    callback(RawLine {
                        port: port.clone(),
                        line,
                        timestamp: epoch.elapsed().as_secs_f64(),
                    });
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                failures += 1;
                warn!(port = %port, error = %e, "serial read failed");
                if failures >= MAX_READ_FAILURES {
                    error!(port = %port, "too many consecutive read failures, reader exiting");
                    break;
                }
            }
        }
    }
    info!(port = %port, "reader thread stopped");
}

/// Split complete lines off the front of `buffer`, emitting each one
/// lossily decoded with the terminator stripped. Empty lines are
/// dropped; a trailing partial line stays buffered.
fn drain_lines(buffer: &mut Vec<u8>, mut emit: impl FnMut(String)) {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line_bytes);
        let line = text.trim_end_matches(|c| c == '\r' || c == '\n');
        if !line.is_empty() {
            emit(line.to_string());
        }
    }
}

fn describe_port(info: SerialPortInfo) -> PortDescriptor {
    match info.port_type {
        SerialPortType::UsbPort(usb) => {
            let serial_suffix = usb
                .serial_number
                .as_deref()
                .map(|s| format!(" SER={s}"))
                .unwrap_or_default();
            PortDescriptor {
                port: info.port_name,
                description: usb.product.clone().unwrap_or_else(|| "N/A".to_string()),
                hwid: format!("USB VID:PID={:04X}:{:04X}{serial_suffix}", usb.vid, usb.pid),
                manufacturer: usb.manufacturer.unwrap_or_else(|| "N/A".to_string()),
                product: usb.product.unwrap_or_else(|| "N/A".to_string()),
                vid: Some(usb.vid),
                pid: Some(usb.pid),
            }
        }
        _ => PortDescriptor {
            port: info.port_name,
            description: "N/A".to_string(),
            hwid: "N/A".to_string(),
            manufacturer: "N/A".to_string(),
            product: "N/A".to_string(),
            vid: None,
            pid: None,
        },
    }
}
