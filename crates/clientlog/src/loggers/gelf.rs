// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! GELF 1.1 backend over UDP or TCP.
//!
//! UDP payloads may be gzip or zlib compressed and are split into GELF chunks
//! when they exceed one datagram. TCP frames are uncompressed JSON terminated
//! by a null byte. Connections are opened lazily and dropped on error; TCP
//! retries a failed write once on a fresh connection.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use flate2::{
    write::{GzEncoder, ZlibEncoder},
    Compression,
};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{GelfCompression, GelfProtocol, GelfSettings};
use crate::enrich::{LogRecord, FIELD_HOSTNAME, FIELD_LEVEL, FIELD_MSG, FIELD_TIME, FIELD_VERSION};
use crate::errors::LoggerError;
use crate::loggers::Logger;
use crate::proc::clock;
use crate::truncate::size::{
    escaped_char_len, escaped_content_len, estimated_size, member_size, quoted_len,
};
use crate::truncate::DEFAULT_MARKER;

pub const GELF_VERSION: &str = "1.1";
pub const DEFAULT_UDP_MAX_MESSAGE_SIZE: usize = 8192;
pub const DEFAULT_TCP_MAX_MESSAGE_SIZE: usize = usize::MAX;

/// Largest datagram sent unchunked.
pub const MAX_DATAGRAM_SIZE: usize = 1420;
pub const MAX_CHUNKS: usize = 128;
const CHUNK_MAGIC: [u8; 2] = [0x1e, 0x0f];
const CHUNK_HEADER_SIZE: usize = 12;

const FIELD_SHORT_MESSAGE: &str = "short_message";
const FIELD_FULL_MESSAGE: &str = "full_message";
const DEFAULT_SYSLOG_LEVEL: u8 = 6;
/// Graylog rejects an empty `short_message`.
const EMPTY_SHORT_MESSAGE: &str = "-";

#[derive(Debug)]
enum Connection {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

#[derive(Debug)]
pub struct GelfLogger {
    name: String,
    host: String,
    port: u16,
    protocol: GelfProtocol,
    compression: GelfCompression,
    timeout: Duration,
    max_message_size: usize,
    marker: String,
    connection: Mutex<Option<Connection>>,
    closed: AtomicBool,
    message_ids: AtomicU64,
}

impl GelfLogger {
    #[must_use]
    pub fn new(name: &str, settings: &GelfSettings, max_message_size: usize) -> Self {
        let max_message_size = match (max_message_size, settings.protocol) {
            (0, GelfProtocol::Udp) => DEFAULT_UDP_MAX_MESSAGE_SIZE,
            (0, GelfProtocol::Tcp) => DEFAULT_TCP_MAX_MESSAGE_SIZE,
            (size, _) => size,
        };
        if settings.protocol == GelfProtocol::Tcp && settings.compression != GelfCompression::None
        {
            warn!(destination = %name, "compression is not supported over TCP, sending uncompressed");
        }

        GelfLogger {
            name: name.to_string(),
            host: settings.host.clone(),
            port: settings.port,
            protocol: settings.protocol,
            compression: settings.compression,
            timeout: Duration::from_secs(settings.timeout_secs.max(1)),
            max_message_size,
            marker: DEFAULT_MARKER.to_string(),
            connection: Mutex::new(None),
            closed: AtomicBool::new(false),
            message_ids: AtomicU64::new(0),
        }
    }

    /// Marker appended to cut message fields.
    #[must_use]
    pub fn with_marker(mut self, marker: &str) -> Self {
        self.marker = marker.to_string();
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn resolve(&self) -> Result<SocketAddr, LoggerError> {
        lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| LoggerError::InvalidConfig {
                name: self.name.clone(),
                reason: format!("could not resolve {}", self.address()),
            })
    }

    async fn connect(&self) -> Result<Connection, LoggerError> {
        let addr = self.resolve().await?;
        let connection = match self.protocol {
            GelfProtocol::Udp => {
                let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(addr).await?;
                Connection::Udp(socket)
            }
            GelfProtocol::Tcp => Connection::Tcp(TcpStream::connect(addr).await?),
        };
        debug!(destination = %self.name, address = %addr, "connected to GELF endpoint");
        Ok(connection)
    }

    fn next_message_id(&self) -> [u8; 8] {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let sequence = self.message_ids.fetch_add(1, Ordering::Relaxed);
        (nanos ^ sequence.rotate_left(32)).to_be_bytes()
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), LoggerError> {
        let mut guard = self.connection.lock().await;

        match self.protocol {
            GelfProtocol::Udp => {
                let datagrams = if payload.len() <= MAX_DATAGRAM_SIZE {
                    vec![payload]
                } else {
                    chunk_datagrams(&payload, self.next_message_id())?
                };
                if guard.is_none() {
                    *guard = Some(self.connect().await?);
                }
                let sent = match guard.as_ref() {
                    Some(Connection::Udp(socket)) => send_datagrams(socket, &datagrams).await,
                    _ => Err(std::io::ErrorKind::NotConnected.into()),
                };
                if let Err(e) = sent {
                    *guard = None;
                    return Err(e.into());
                }
                Ok(())
            }
            GelfProtocol::Tcp => {
                let mut frame = payload;
                frame.push(0);

                let first_attempt = match guard.as_mut() {
                    Some(Connection::Tcp(stream)) => stream.write_all(&frame).await,
                    _ => Err(std::io::ErrorKind::NotConnected.into()),
                };
                if first_attempt.is_ok() {
                    return Ok(());
                }

                *guard = None;
                let mut connection = self.connect().await?;
                if let Connection::Tcp(stream) = &mut connection {
                    stream.write_all(&frame).await?;
                }
                *guard = Some(connection);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Logger for GelfLogger {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    async fn log(&self, record: LogRecord) -> Result<(), LoggerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LoggerError::Closed(self.name.clone()));
        }

        let message = build_message(&record, self.max_message_size, &self.marker);
        let json = serde_json::to_vec(&Value::Object(message))?;
        let payload = match self.protocol {
            GelfProtocol::Udp => compress(json, self.compression)?,
            GelfProtocol::Tcp => json,
        };

        tokio::time::timeout(self.timeout, self.send(payload))
            .await
            .map_err(|_| LoggerError::Timeout {
                address: self.address(),
            })?
    }

    async fn close(&self) -> Result<(), LoggerError> {
        self.closed.store(true, Ordering::Release);
        let connection = self.connection.lock().await.take();
        if let Some(Connection::Tcp(mut stream)) = connection {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

/// Converts a canonical record into a GELF 1.1 message whose serialized
/// size stays within `max_size` where the message fields allow it.
///
/// When the additional fields leave no room for any of the short message,
/// the largest of them are dropped until a non-empty prefix fits.
#[must_use]
pub fn build_message(record: &LogRecord, max_size: usize, marker: &str) -> Map<String, Value> {
    let mut message = Map::new();
    message.insert("version".to_string(), Value::from(GELF_VERSION));

    let host = match record.get(FIELD_HOSTNAME) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => "unknown".to_string(),
    };
    message.insert("host".to_string(), Value::from(host));

    let timestamp = record
        .get(FIELD_TIME)
        .and_then(Value::as_str)
        .and_then(clock::unix_seconds)
        .unwrap_or_else(clock::now_unix_seconds);
    message.insert("timestamp".to_string(), Value::from(timestamp));
    message.insert(
        "level".to_string(),
        Value::from(syslog_level(record.get(FIELD_LEVEL))),
    );

    for (key, value) in record {
        if matches!(
            key.as_str(),
            FIELD_HOSTNAME | FIELD_MSG | FIELD_TIME | FIELD_LEVEL | FIELD_VERSION
        ) {
            continue;
        }
        let field = additional_field_name(key);
        if field == "_id" {
            continue;
        }
        let value = match value {
            Value::Null => continue,
            Value::String(_) | Value::Number(_) => value.clone(),
            Value::Bool(b) => Value::from(b.to_string()),
            other => Value::from(other.to_string()),
        };
        message.insert(field, value);
    }

    let msg = match record.get(FIELD_MSG) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let short = match msg.lines().next() {
        Some(line) if !line.is_empty() => line.to_string(),
        _ => EMPTY_SHORT_MESSAGE.to_string(),
    };
    let full = msg.contains('\n').then_some(msg);

    message.insert(FIELD_SHORT_MESSAGE.to_string(), Value::from(""));
    let (short, mut remaining) = loop {
        let remaining =
            max_size.saturating_sub(estimated_size(&Value::Object(message.clone())));
        let fitted = fit_with_marker(&short, remaining, marker);
        if !fitted.is_empty() {
            break (fitted, remaining);
        }
        if !drop_largest_additional_field(&mut message) {
            let first: String = short.chars().take(1).collect();
            break (first, remaining);
        }
    };
    remaining = remaining.saturating_sub(escaped_content_len(&short));
    message.insert(FIELD_SHORT_MESSAGE.to_string(), Value::from(short));

    if let Some(full) = full {
        // `,"full_message":""`
        let overhead = 1 + quoted_len(FIELD_FULL_MESSAGE) + 1 + 2;
        if remaining > overhead {
            let full = fit_with_marker(&full, remaining - overhead, marker);
            message.insert(FIELD_FULL_MESSAGE.to_string(), Value::from(full));
        }
    }

    message
}

/// `text` if its escaped form fits `budget` bytes; otherwise a prefix plus
/// the marker, or a bare prefix when even the marker does not fit.
fn fit_with_marker(text: &str, budget: usize, marker: &str) -> String {
    if escaped_content_len(text) <= budget {
        return text.to_string();
    }
    let marker_len = escaped_content_len(marker);
    if marker_len <= budget {
        let mut cut = prefix_within(text, budget - marker_len).to_string();
        cut.push_str(marker);
        cut
    } else {
        prefix_within(text, budget).to_string()
    }
}

/// Removes the `_` field contributing the most bytes. Returns `false` when
/// none is left.
fn drop_largest_additional_field(message: &mut Map<String, Value>) -> bool {
    let largest = message
        .iter()
        .filter(|(key, _)| key.starts_with('_'))
        .map(|(key, value)| (member_size(key, value), key.clone()))
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
    match largest {
        Some((size, key)) => {
            debug!(field = %key, size, "dropping GELF field to fit short_message");
            message.remove(&key);
            true
        }
        None => false,
    }
}

/// Longest prefix of `text` whose escaped form is at most `budget` bytes.
fn prefix_within(text: &str, budget: usize) -> &str {
    let mut used = 0;
    for (index, c) in text.char_indices() {
        used += escaped_char_len(c);
        if used > budget {
            return &text[..index];
        }
    }
    text
}

/// `_`-prefixed field name restricted to the GELF key alphabet.
fn additional_field_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.starts_with('_') {
        sanitized
    } else {
        format!("_{sanitized}")
    }
}

/// Syslog severity (0-7) for a numeric or named record level.
///
/// Bunyan levels map onto syslog, values already in 0-7 pass through and
/// anything unrecognized is informational.
#[must_use]
pub fn syslog_level(level: Option<&Value>) -> u8 {
    match level {
        Some(Value::Number(n)) => n.as_f64().map_or(DEFAULT_SYSLOG_LEVEL, numeric_syslog_level),
        Some(Value::String(s)) => {
            let name = s.trim().to_ascii_lowercase();
            match name.as_str() {
                "emerg" | "emergency" | "panic" => 0,
                "alert" => 1,
                "crit" | "critical" | "fatal" => 2,
                "err" | "error" => 3,
                "warn" | "warning" => 4,
                "notice" => 5,
                "info" | "informational" => 6,
                "debug" | "trace" => 7,
                _ => name
                    .parse::<f64>()
                    .map_or(DEFAULT_SYSLOG_LEVEL, numeric_syslog_level),
            }
        }
        _ => DEFAULT_SYSLOG_LEVEL,
    }
}

fn numeric_syslog_level(value: f64) -> u8 {
    if (0.0..=7.0).contains(&value) && value.fract() == 0.0 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let level = value as u8;
        return level;
    }
    match value {
        v if v >= 60.0 => 2,
        v if v >= 50.0 => 3,
        v if v >= 40.0 => 4,
        v if v >= 30.0 => 6,
        v if v >= 10.0 => 7,
        _ => DEFAULT_SYSLOG_LEVEL,
    }
}

async fn send_datagrams(socket: &UdpSocket, datagrams: &[Vec<u8>]) -> std::io::Result<()> {
    for datagram in datagrams {
        socket.send(datagram).await?;
    }
    Ok(())
}

fn compress(data: Vec<u8>, compression: GelfCompression) -> Result<Vec<u8>, LoggerError> {
    match compression {
        GelfCompression::None => Ok(data),
        GelfCompression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            Ok(encoder.finish()?)
        }
        GelfCompression::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Splits `data` into GELF chunks sharing `message_id`.
///
/// # Errors
///
/// [`LoggerError::TooManyChunks`] when more than [`MAX_CHUNKS`] are needed.
pub fn chunk_datagrams(data: &[u8], message_id: [u8; 8]) -> Result<Vec<Vec<u8>>, LoggerError> {
    let chunk_size = MAX_DATAGRAM_SIZE - CHUNK_HEADER_SIZE;
    let count = data.len().div_ceil(chunk_size);
    if count > MAX_CHUNKS {
        return Err(LoggerError::TooManyChunks {
            size: data.len(),
            max: MAX_CHUNKS,
        });
    }

    Ok(data
        .chunks(chunk_size)
        .enumerate()
        .map(|(sequence, body)| {
            let mut datagram = Vec::with_capacity(CHUNK_HEADER_SIZE + body.len());
            datagram.extend_from_slice(&CHUNK_MAGIC);
            datagram.extend_from_slice(&message_id);
            // Both fit in a byte once the chunk count is checked.
            datagram.push(u8::try_from(sequence).unwrap_or(u8::MAX));
            datagram.push(u8::try_from(count).unwrap_or(u8::MAX));
            datagram.extend_from_slice(body);
            datagram
        })
        .collect())
}
