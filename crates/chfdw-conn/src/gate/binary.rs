//! Native (binary) protocol driver.
//!
//! Speaks the ClickHouse TCP protocol at a fixed client revision: a hello
//! exchange carrying the credentials, then one query packet plus an empty
//! data block per statement, answered by a stream of server packets that
//! ends with `EndOfStream` or an exception.
//!
//! # Architecture
//!
//! ```text
//! BinaryConnection
//!   ├── BufReader<Transport>   plain TCP or TLS (gate::tcp)
//!   ├── wire                   varuint / string / little-endian codec
//!   └── read_packet()          Data → Block (column-major, decoded to text)
//!                              Exception → ConnError::Remote
//!                              Progress / ProfileInfo / Log / … → skipped
//! ```

mod wire;

use std::io::{BufReader, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use chfdw_core::{ConnectionDetails, DriverKind};

use super::tcp::Transport;
use super::{Column, Cursor, DriverSettings, RemoteConnection, Row};
use crate::error::{ConnError, ConnResult};

// ── Protocol constants ───────────────────────────────────────────────

const CLIENT_VERSION_MAJOR: u64 = 1;
const CLIENT_VERSION_MINOR: u64 = 1;
const CLIENT_REVISION: u64 = 54213;

const REVISION_WITH_BLOCK_INFO: u64 = 51903;
const REVISION_WITH_TOTAL_ROWS_IN_PROGRESS: u64 = 51554;
const REVISION_WITH_CLIENT_INFO: u64 = 54032;
const REVISION_WITH_SERVER_TIMEZONE: u64 = 54058;
const REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;

mod client_packet {
    pub const HELLO: u64 = 0;
    pub const QUERY: u64 = 1;
    pub const DATA: u64 = 2;
    pub const CANCEL: u64 = 3;
}

mod server_packet {
    pub const HELLO: u64 = 0;
    pub const DATA: u64 = 1;
    pub const EXCEPTION: u64 = 2;
    pub const PROGRESS: u64 = 3;
    pub const PONG: u64 = 4;
    pub const END_OF_STREAM: u64 = 5;
    pub const PROFILE_INFO: u64 = 6;
    pub const TOTALS: u64 = 7;
    pub const EXTREMES: u64 = 8;
    pub const LOG: u64 = 10;
    pub const TABLE_COLUMNS: u64 = 11;
}

/// Query processing stage: run to completion.
const STAGE_COMPLETE: u64 = 2;
const QUERY_KIND_INITIAL: u8 = 1;
const INTERFACE_TCP: u8 = 1;

static QUERY_SEQ: AtomicU64 = AtomicU64::new(1);

/// Limits on block shape; anything larger is treated as a corrupt stream.
const MAX_BLOCK_COLUMNS: u64 = 1 << 16;
const MAX_BLOCK_ROWS: u64 = 1 << 24;
const MAX_FIXED_STRING_WIDTH: usize = 1 << 20;

// ── Server identity ──────────────────────────────────────────────────

/// What the server reported in its hello.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
    pub timezone: Option<String>,
}

// ── Packets ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Block {
    columns: Vec<Column>,
    /// Column-major values.
    data: Vec<Vec<Option<String>>>,
    rows: usize,
}

#[derive(Debug)]
enum ServerPacket {
    Data(Block),
    Exception(ConnError),
    EndOfStream,
    /// Progress, profile info, logs and other packets with no effect on the
    /// result.
    Ignored,
}

// ── Connection ───────────────────────────────────────────────────────

/// A connection speaking the native protocol.
#[derive(Debug)]
pub struct BinaryConnection {
    /// `None` once disconnected.
    stream: Option<BufReader<Transport>>,
    server: ServerInfo,
    /// `min(client revision, server revision)`.
    revision: u64,
    client_name: String,
    /// A query was sent and its packet stream was not read to the end.
    in_flight: bool,
}

impl BinaryConnection {
    /// Open the socket and perform the hello exchange.
    pub fn connect(details: &ConnectionDetails, settings: &DriverSettings) -> ConnResult<Self> {
        let transport = Transport::connect(&details.host, details.port, details.secure, settings)?;
        let mut stream = BufReader::new(transport);

        let server = handshake(&mut stream, details, &settings.client_name)
            .map_err(|e| ConnError::connect(details.target(), e.to_string()))?;
        let revision = server.revision.min(CLIENT_REVISION);

        tracing::debug!(
            host = %details.host,
            port = details.port,
            database = %details.database,
            server = %server.name,
            server_revision = server.revision,
            "established native connection"
        );

        Ok(Self {
            stream: Some(stream),
            server,
            revision,
            client_name: settings.client_name.clone(),
            in_flight: false,
        })
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    fn send_query(&mut self, sql: &str) -> ConnResult<()> {
        let query_id = format!(
            "chfdw-{}-{}",
            std::process::id(),
            QUERY_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let mut buf = Vec::with_capacity(sql.len() + 128);
        wire::write_varuint(&mut buf, client_packet::QUERY);
        wire::write_string(&mut buf, &query_id);
        if self.revision >= REVISION_WITH_CLIENT_INFO {
            write_client_info(&mut buf, &self.client_name, self.revision);
        }
        // No per-query settings.
        wire::write_string(&mut buf, "");
        wire::write_varuint(&mut buf, STAGE_COMPLETE);
        wire::write_varuint(&mut buf, 0);
        wire::write_string(&mut buf, sql);
        write_empty_block(&mut buf, self.revision);

        let stream = self.stream.as_mut().ok_or(ConnError::Closed)?;
        stream.get_mut().write_all(&buf)?;
        stream.get_mut().flush()?;
        self.in_flight = true;
        Ok(())
    }

    fn next_packet(&mut self) -> ConnResult<ServerPacket> {
        let revision = self.revision;
        let stream = self.stream.as_mut().ok_or(ConnError::Closed)?;
        read_packet(stream, revision)
    }
}

impl RemoteConnection for BinaryConnection {
    fn driver(&self) -> DriverKind {
        DriverKind::Binary
    }

    fn execute(&mut self, sql: &str) -> ConnResult<Cursor> {
        if self.stream.is_none() {
            return Err(ConnError::Closed);
        }
        if self.in_flight {
            self.cancel()?;
        }
        self.send_query(sql)?;

        let mut columns: Vec<Column> = Vec::new();
        let mut rows: Vec<Row> = Vec::new();
        loop {
            match self.next_packet()? {
                ServerPacket::Data(block) => {
                    if columns.is_empty() {
                        columns = block.columns;
                    }
                    for i in 0..block.rows {
                        rows.push(block.data.iter().map(|col| col[i].clone()).collect());
                    }
                }
                ServerPacket::Exception(err) => {
                    self.in_flight = false;
                    return Err(err);
                }
                ServerPacket::EndOfStream => {
                    self.in_flight = false;
                    return Ok(Cursor::new(columns, rows));
                }
                ServerPacket::Ignored => {}
            }
        }
    }

    fn cancel(&mut self) -> ConnResult<bool> {
        if !self.in_flight {
            return Ok(false);
        }
        let stream = self.stream.as_mut().ok_or(ConnError::Closed)?;
        let mut buf = Vec::with_capacity(1);
        wire::write_varuint(&mut buf, client_packet::CANCEL);
        stream.get_mut().write_all(&buf)?;
        stream.get_mut().flush()?;

        loop {
            match self.next_packet()? {
                ServerPacket::EndOfStream | ServerPacket::Exception(_) => break,
                ServerPacket::Data(_) | ServerPacket::Ignored => {}
            }
        }
        self.in_flight = false;
        tracing::debug!(server = %self.server.name, "cancelled native query");
        Ok(true)
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.get_ref().shutdown();
        }
        self.in_flight = false;
    }
}

// ── Handshake ────────────────────────────────────────────────────────

fn handshake(
    stream: &mut BufReader<Transport>,
    details: &ConnectionDetails,
    client_name: &str,
) -> ConnResult<ServerInfo> {
    let mut buf = Vec::with_capacity(64);
    wire::write_varuint(&mut buf, client_packet::HELLO);
    wire::write_string(&mut buf, client_name);
    wire::write_varuint(&mut buf, CLIENT_VERSION_MAJOR);
    wire::write_varuint(&mut buf, CLIENT_VERSION_MINOR);
    wire::write_varuint(&mut buf, CLIENT_REVISION);
    wire::write_string(&mut buf, &details.database);
    wire::write_string(&mut buf, details.username.as_deref().unwrap_or("default"));
    wire::write_string(&mut buf, details.password.as_deref().unwrap_or(""));
    stream.get_mut().write_all(&buf)?;
    stream.get_mut().flush()?;

    match wire::read_varuint(stream)? {
        server_packet::HELLO => {
            let name = wire::read_string(stream)?;
            let version_major = wire::read_varuint(stream)?;
            let version_minor = wire::read_varuint(stream)?;
            let revision = wire::read_varuint(stream)?;
            let timezone = if revision >= REVISION_WITH_SERVER_TIMEZONE {
                Some(wire::read_string(stream)?)
            } else {
                None
            };
            Ok(ServerInfo {
                name,
                version_major,
                version_minor,
                revision,
                timezone,
            })
        }
        server_packet::EXCEPTION => Err(read_exception(stream)?),
        other => Err(ConnError::protocol(format!(
            "unexpected packet {other} during handshake"
        ))),
    }
}

fn write_client_info(buf: &mut Vec<u8>, client_name: &str, revision: u64) {
    wire::write_u8(buf, QUERY_KIND_INITIAL);
    wire::write_string(buf, "");
    wire::write_string(buf, "");
    wire::write_string(buf, "0.0.0.0:0");
    wire::write_u8(buf, INTERFACE_TCP);
    wire::write_string(buf, &std::env::var("USER").unwrap_or_default());
    wire::write_string(buf, &std::env::var("HOSTNAME").unwrap_or_default());
    wire::write_string(buf, client_name);
    wire::write_varuint(buf, CLIENT_VERSION_MAJOR);
    wire::write_varuint(buf, CLIENT_VERSION_MINOR);
    wire::write_varuint(buf, CLIENT_REVISION);
    if revision >= REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO {
        wire::write_string(buf, "");
    }
}

/// Data packet with no columns: marks the end of client-side data.
fn write_empty_block(buf: &mut Vec<u8>, revision: u64) {
    wire::write_varuint(buf, client_packet::DATA);
    wire::write_string(buf, "");
    if revision >= REVISION_WITH_BLOCK_INFO {
        wire::write_varuint(buf, 1);
        wire::write_u8(buf, 0);
        wire::write_varuint(buf, 2);
        wire::write_i32(buf, -1);
        wire::write_varuint(buf, 0);
    }
    wire::write_varuint(buf, 0);
    wire::write_varuint(buf, 0);
}

// ── Server packets ───────────────────────────────────────────────────

fn read_packet(r: &mut impl Read, revision: u64) -> ConnResult<ServerPacket> {
    let code = wire::read_varuint(r)?;
    match code {
        server_packet::DATA => {
            wire::read_string(r)?;
            Ok(ServerPacket::Data(read_block(r, revision)?))
        }
        server_packet::EXCEPTION => Ok(ServerPacket::Exception(read_exception(r)?)),
        server_packet::PROGRESS => {
            wire::read_varuint(r)?;
            wire::read_varuint(r)?;
            if revision >= REVISION_WITH_TOTAL_ROWS_IN_PROGRESS {
                wire::read_varuint(r)?;
            }
            Ok(ServerPacket::Ignored)
        }
        server_packet::PONG => Ok(ServerPacket::Ignored),
        server_packet::END_OF_STREAM => Ok(ServerPacket::EndOfStream),
        server_packet::PROFILE_INFO => {
            wire::read_varuint(r)?;
            wire::read_varuint(r)?;
            wire::read_varuint(r)?;
            wire::read_u8(r)?;
            wire::read_varuint(r)?;
            wire::read_u8(r)?;
            Ok(ServerPacket::Ignored)
        }
        server_packet::TOTALS | server_packet::EXTREMES | server_packet::LOG => {
            wire::read_string(r)?;
            read_block(r, revision)?;
            Ok(ServerPacket::Ignored)
        }
        server_packet::TABLE_COLUMNS => {
            wire::read_string(r)?;
            wire::read_string(r)?;
            Ok(ServerPacket::Ignored)
        }
        other => Err(ConnError::protocol(format!("unknown server packet {other}"))),
    }
}

/// Read an exception chain; nested causes are appended to the message.
fn read_exception(r: &mut impl Read) -> ConnResult<ConnError> {
    let code = wire::read_i32(r)?;
    let name = wire::read_string(r)?;
    let mut message = wire::read_string(r)?;
    let _stack_trace = wire::read_string(r)?;
    let mut nested = wire::read_u8(r)? != 0;
    while nested {
        wire::read_i32(r)?;
        wire::read_string(r)?;
        let cause = wire::read_string(r)?;
        wire::read_string(r)?;
        nested = wire::read_u8(r)? != 0;
        message.push_str(": ");
        message.push_str(&cause);
    }
    Ok(ConnError::Remote {
        code,
        name,
        message,
    })
}

fn read_block(r: &mut impl Read, revision: u64) -> ConnResult<Block> {
    if revision >= REVISION_WITH_BLOCK_INFO {
        loop {
            match wire::read_varuint(r)? {
                0 => break,
                1 => {
                    wire::read_u8(r)?;
                }
                2 => {
                    wire::read_i32(r)?;
                }
                field => {
                    return Err(ConnError::protocol(format!(
                        "unknown block info field {field}"
                    )));
                }
            }
        }
    }

    let num_columns = read_count(r, MAX_BLOCK_COLUMNS, "columns")?;
    let rows = read_count(r, MAX_BLOCK_ROWS, "rows")?;
    let mut block = Block {
        columns: Vec::new(),
        data: Vec::new(),
        rows,
    };
    for _ in 0..num_columns {
        let name = wire::read_string(r)?;
        let type_name = wire::read_string(r)?;
        let column_type = ColumnType::parse(&type_name)?;
        block.data.push(column_type.read(r, rows)?);
        block.columns.push(Column { name, type_name });
    }
    Ok(block)
}

fn read_count(r: &mut impl Read, limit: u64, what: &str) -> ConnResult<usize> {
    let count = wire::read_varuint(r)?;
    if count > limit {
        return Err(ConnError::protocol(format!(
            "block declares {count} {what}, limit is {limit}"
        )));
    }
    Ok(count as usize)
}

// ── Column decoding ──────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
enum ColumnType {
    UInt(usize),
    Int(usize),
    Float32,
    Float64,
    String,
    FixedString(usize),
    Date,
    DateTime,
    Nullable(Box<ColumnType>),
}

impl ColumnType {
    fn parse(type_name: &str) -> ConnResult<Self> {
        let parsed = match type_name {
            "UInt8" | "Bool" => ColumnType::UInt(1),
            "UInt16" => ColumnType::UInt(2),
            "UInt32" => ColumnType::UInt(4),
            "UInt64" => ColumnType::UInt(8),
            "Int8" => ColumnType::Int(1),
            "Int16" => ColumnType::Int(2),
            "Int32" => ColumnType::Int(4),
            "Int64" => ColumnType::Int(8),
            "Float32" => ColumnType::Float32,
            "Float64" => ColumnType::Float64,
            "String" => ColumnType::String,
            "Date" => ColumnType::Date,
            "DateTime" => ColumnType::DateTime,
            _ if type_name.starts_with("DateTime(") => ColumnType::DateTime,
            _ => {
                if let Some(inner) = unwrap_type(type_name, "Nullable") {
                    ColumnType::Nullable(Box::new(Self::parse(inner)?))
                } else if let Some(n) = unwrap_type(type_name, "FixedString") {
                    let n = n
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n <= MAX_FIXED_STRING_WIDTH)
                        .ok_or_else(|| {
                            ConnError::protocol(format!("bad FixedString width in {type_name}"))
                        })?;
                    ColumnType::FixedString(n)
                } else {
                    return Err(ConnError::protocol(format!(
                        "unsupported column type {type_name}"
                    )));
                }
            }
        };
        Ok(parsed)
    }

    fn read(&self, r: &mut impl Read, rows: usize) -> ConnResult<Vec<Option<String>>> {
        let mut values = Vec::new();
        match self {
            ColumnType::Nullable(inner) => {
                let null_map = wire::read_exact_vec(r, rows)?;
                let inner_values = inner.read(r, rows)?;
                for (is_null, value) in null_map.into_iter().zip(inner_values) {
                    values.push(if is_null != 0 { None } else { value });
                }
            }
            ColumnType::UInt(width) => {
                for _ in 0..rows {
                    let v = read_uint(r, *width)?;
                    values.push(Some(v.to_string()));
                }
            }
            ColumnType::Int(width) => {
                for _ in 0..rows {
                    let v = read_uint(r, *width)?;
                    let shift = 64 - 8 * *width as u32;
                    let signed = ((v << shift) as i64) >> shift;
                    values.push(Some(signed.to_string()));
                }
            }
            ColumnType::Float32 => {
                for _ in 0..rows {
                    let v = f32::from_le_bytes(wire::read_array(r)?);
                    values.push(Some(v.to_string()));
                }
            }
            ColumnType::Float64 => {
                for _ in 0..rows {
                    let v = f64::from_le_bytes(wire::read_array(r)?);
                    values.push(Some(v.to_string()));
                }
            }
            ColumnType::String => {
                for _ in 0..rows {
                    values.push(Some(wire::read_string(r)?));
                }
            }
            ColumnType::FixedString(n) => {
                for _ in 0..rows {
                    let bytes = wire::read_exact_vec(r, *n)?;
                    values.push(Some(String::from_utf8_lossy(&bytes).into_owned()));
                }
            }
            ColumnType::Date => {
                for _ in 0..rows {
                    let days = u16::from_le_bytes(wire::read_array(r)?);
                    values.push(Some(format_date(days)?));
                }
            }
            ColumnType::DateTime => {
                for _ in 0..rows {
                    let secs = u32::from_le_bytes(wire::read_array(r)?);
                    values.push(Some(format_datetime(secs)?));
                }
            }
        }
        Ok(values)
    }
}

fn unwrap_type<'a>(type_name: &'a str, wrapper: &str) -> Option<&'a str> {
    type_name
        .strip_prefix(wrapper)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn read_uint(r: &mut impl Read, width: usize) -> ConnResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf[..width])?;
    Ok(u64::from_le_bytes(buf))
}

fn format_date(days: u16) -> ConnResult<String> {
    let epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
        .ok_or_else(|| ConnError::protocol("invalid epoch"))?;
    let date = epoch
        .checked_add_days(chrono::Days::new(u64::from(days)))
        .ok_or_else(|| ConnError::protocol(format!("date out of range: {days}")))?;
    Ok(date.format("%Y-%m-%d").to_string())
}

/// DateTime values are rendered in UTC.
fn format_datetime(secs: u32) -> ConnResult<String> {
    let ts = chrono::DateTime::from_timestamp(i64::from(secs), 0)
        .ok_or_else(|| ConnError::protocol(format!("timestamp out of range: {secs}")))?;
    Ok(ts.format("%Y-%m-%d %H:%M:%S").to_string())
}
