//! Minimal logical-replication client.
//!
//! `tokio-postgres` cannot open a connection with the `replication=database`
//! startup parameter, so the walsender conversation is spoken directly:
//! startup and authentication, the replication-grammar simple queries
//! (`IDENTIFY_SYSTEM`, `CREATE_REPLICATION_SLOT`, `START_REPLICATION`),
//! and the CopyBoth sub-protocol that carries XLogData and keepalive
//! frames downstream and standby status updates upstream.
//!
//! Message codecs come from `postgres-protocol`, the same layer
//! `tokio-postgres` is built on. TLS is not supported here; the `sslmode`
//! setting applies to regular connections only.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication;
use postgres_protocol::authentication::sasl::{self, ScramSha256};
use postgres_protocol::message::backend::{self, Message};
use postgres_protocol::message::frontend;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use savor_common::{Error, Result};
use savor_config::PostgresConfig;

use crate::lsn::Lsn;

/// Microseconds between the Unix epoch and Postgres' 2000-01-01 epoch.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Result of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: String,
    pub xlog_pos: Lsn,
    pub db_name: Option<String>,
}

/// Result of `CREATE_REPLICATION_SLOT`.
#[derive(Debug, Clone)]
pub struct CreatedSlot {
    pub slot_name: String,
    pub consistent_point: Lsn,
}

/// One frame received while streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// A chunk of decoded WAL with its start and server-end positions.
    XLogData {
        wal_start: Lsn,
        server_wal_end: Lsn,
        payload: Bytes,
    },
    /// Primary keepalive; `reply_requested` demands an immediate standby
    /// status update.
    Keepalive {
        server_wal_end: Lsn,
        reply_requested: bool,
    },
    /// A sub-protocol tag this client does not know. Skipped upstream.
    Other(u8),
}

/// A dedicated replication connection to the server.
pub struct ReplicationClient {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl ReplicationClient {
    /// Open a `replication=database` connection and authenticate.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| Error::Network(format!("replication connect failed: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Network(e.to_string()))?;

        let mut client = Self {
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::with_capacity(1024),
        };

        let params = [
            ("user", config.user.as_str()),
            ("database", config.database.as_str()),
            ("replication", "database"),
            ("application_name", "savor-cdc"),
        ];
        frontend::startup_message(params, &mut client.write_buf).map_err(proto_err)?;
        client.flush().await?;

        client.authenticate(config).await?;
        client.wait_ready().await?;
        debug!("replication connection established");
        Ok(client)
    }

    /// Run `IDENTIFY_SYSTEM`.
    pub async fn identify_system(&mut self) -> Result<SystemIdentity> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Protocol("IDENTIFY_SYSTEM returned no rows".into()))?;

        let xlog_pos = row
            .get(2)
            .and_then(|v| v.as_deref())
            .ok_or_else(|| Error::Protocol("IDENTIFY_SYSTEM missing xlogpos".into()))?
            .parse()?;

        Ok(SystemIdentity {
            system_id: row
                .first()
                .and_then(|v| v.clone())
                .unwrap_or_default(),
            timeline: row.get(1).and_then(|v| v.clone()).unwrap_or_default(),
            xlog_pos,
            db_name: row.get(3).and_then(|v| v.clone()),
        })
    }

    /// Create a non-temporary logical slot with the given output plugin.
    pub async fn create_replication_slot(
        &mut self,
        slot: &str,
        plugin: &str,
    ) -> Result<CreatedSlot> {
        let sql = format!("CREATE_REPLICATION_SLOT \"{slot}\" LOGICAL {plugin}");
        let rows = self.simple_query(&sql).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Protocol("CREATE_REPLICATION_SLOT returned no rows".into()))?;

        let consistent_point = row
            .get(1)
            .and_then(|v| v.as_deref())
            .ok_or_else(|| Error::Protocol("slot creation missing consistent_point".into()))?
            .parse()?;

        Ok(CreatedSlot {
            slot_name: row.first().and_then(|v| v.clone()).unwrap_or_default(),
            consistent_point,
        })
    }

    /// Start streaming from `start` with the given plugin options. Returns
    /// once the server switches into CopyBoth mode.
    pub async fn start_replication(
        &mut self,
        slot: &str,
        start: Lsn,
        plugin_options: &[(&str, &str)],
    ) -> Result<()> {
        let options = plugin_options
            .iter()
            .map(|(k, v)| format!("\"{k}\" '{v}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("START_REPLICATION SLOT \"{slot}\" LOGICAL {start} ({options})");

        frontend::query(&sql, &mut self.write_buf).map_err(proto_err)?;
        self.flush().await?;

        loop {
            match self.read_message().await? {
                Message::CopyBothResponse(_) => return Ok(()),
                Message::ErrorResponse(body) => return Err(server_error(body)),
                Message::NoticeResponse(_) | Message::ParameterStatus(_) => continue,
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message awaiting CopyBothResponse: {}",
                        message_name(&other)
                    )))
                }
            }
        }
    }

    /// Receive one replication event, bounded by `deadline`.
    ///
    /// `Ok(None)` means the deadline passed or a skippable frame arrived;
    /// both send the caller back around its loop. A server error frame is
    /// fatal.
    pub async fn receive(&mut self, deadline: Instant) -> Result<Option<ReplicationEvent>> {
        let message = match tokio::time::timeout_at(deadline, self.read_message()).await {
            Err(_) => return Ok(None),
            Ok(message) => message?,
        };

        match message {
            Message::CopyData(body) => {
                let event = parse_event(body.into_bytes())?;
                if let ReplicationEvent::Other(tag) = event {
                    trace!(tag, "skipping unknown replication frame");
                    return Ok(None);
                }
                Ok(Some(event))
            }
            Message::ErrorResponse(body) => Err(server_error(body)),
            Message::NoticeResponse(_) | Message::ParameterStatus(_) => Ok(None),
            other => Err(Error::Protocol(format!(
                "replication stream interrupted by {}",
                message_name(&other)
            ))),
        }
    }

    /// Send a standby status update confirming `lsn`.
    pub async fn standby_status_update(&mut self, lsn: Lsn) -> Result<()> {
        let body = encode_standby_status(lsn, pg_timestamp_now());
        frontend::CopyData::new(body)
            .map_err(proto_err)?
            .write(&mut self.write_buf);
        self.flush().await
    }

    async fn authenticate(&mut self, config: &PostgresConfig) -> Result<()> {
        loop {
            match self.read_message().await? {
                Message::AuthenticationOk => return Ok(()),
                Message::AuthenticationCleartextPassword => {
                    frontend::password_message(config.password.as_bytes(), &mut self.write_buf)
                        .map_err(proto_err)?;
                    self.flush().await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let hashed = authentication::md5_hash(
                        config.user.as_bytes(),
                        config.password.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hashed.as_bytes(), &mut self.write_buf)
                        .map_err(proto_err)?;
                    self.flush().await?;
                }
                Message::AuthenticationSasl(body) => {
                    self.authenticate_scram(&config.password, body).await?;
                    return Ok(());
                }
                Message::ErrorResponse(body) => return Err(server_error(body)),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during authentication: {}",
                        message_name(&other)
                    )))
                }
            }
        }
    }

    async fn authenticate_scram(
        &mut self,
        password: &str,
        body: backend::AuthenticationSaslBody,
    ) -> Result<()> {
        let mut offers_scram = false;
        let mut mechanisms = body.mechanisms();
        while let Some(mechanism) = mechanisms.next().map_err(proto_err)? {
            if mechanism == sasl::SCRAM_SHA_256 {
                offers_scram = true;
            }
        }
        if !offers_scram {
            return Err(Error::Protocol(
                "server offered no supported SASL mechanism".into(),
            ));
        }

        let mut scram =
            ScramSha256::new(password.as_bytes(), sasl::ChannelBinding::unsupported());

        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)
            .map_err(proto_err)?;
        self.flush().await?;

        match self.read_message().await? {
            Message::AuthenticationSaslContinue(body) => {
                scram.update(body.data()).map_err(proto_err)?;
            }
            Message::ErrorResponse(body) => return Err(server_error(body)),
            other => {
                return Err(Error::Protocol(format!(
                    "expected SASL continue, got {}",
                    message_name(&other)
                )))
            }
        }

        frontend::sasl_response(scram.message(), &mut self.write_buf).map_err(proto_err)?;
        self.flush().await?;

        match self.read_message().await? {
            Message::AuthenticationSaslFinal(body) => {
                scram.finish(body.data()).map_err(proto_err)?;
            }
            Message::ErrorResponse(body) => return Err(server_error(body)),
            other => {
                return Err(Error::Protocol(format!(
                    "expected SASL final, got {}",
                    message_name(&other)
                )))
            }
        }

        match self.read_message().await? {
            Message::AuthenticationOk => Ok(()),
            Message::ErrorResponse(body) => Err(server_error(body)),
            other => Err(Error::Protocol(format!(
                "expected AuthenticationOk, got {}",
                message_name(&other)
            ))),
        }
    }

    /// Consume session-setup messages until the server is ready.
    async fn wait_ready(&mut self) -> Result<()> {
        loop {
            match self.read_message().await? {
                Message::ReadyForQuery(_) => return Ok(()),
                Message::ParameterStatus(_)
                | Message::BackendKeyData(_)
                | Message::NoticeResponse(_) => continue,
                Message::ErrorResponse(body) => return Err(server_error(body)),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message before ReadyForQuery: {}",
                        message_name(&other)
                    )))
                }
            }
        }
    }

    /// Run a simple query and collect its text rows.
    async fn simple_query(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        frontend::query(sql, &mut self.write_buf).map_err(proto_err)?;
        self.flush().await?;

        let mut rows = Vec::new();
        loop {
            match self.read_message().await? {
                Message::RowDescription(_)
                | Message::CommandComplete(_)
                | Message::EmptyQueryResponse
                | Message::NoticeResponse(_)
                | Message::ParameterStatus(_) => continue,
                Message::DataRow(body) => rows.push(row_values(&body)?),
                Message::ReadyForQuery(_) => return Ok(rows),
                Message::ErrorResponse(body) => return Err(server_error(body)),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message in query response: {}",
                        message_name(&other)
                    )))
                }
            }
        }
    }

    async fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = Message::parse(&mut self.read_buf).map_err(proto_err)? {
                return Ok(message);
            }
            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            if n == 0 {
                return Err(Error::Network(
                    "replication connection closed by server".into(),
                ));
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream
            .write_all(&self.write_buf)
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        self.write_buf.clear();
        Ok(())
    }
}

/// Parse one CopyData payload into a replication event.
pub(crate) fn parse_event(mut data: Bytes) -> Result<ReplicationEvent> {
    if data.is_empty() {
        return Err(Error::Protocol("empty replication frame".into()));
    }
    let tag = data.get_u8();
    match tag {
        b'w' => {
            if data.remaining() < 24 {
                return Err(Error::Protocol("truncated XLogData frame".into()));
            }
            let wal_start = Lsn(data.get_u64());
            let server_wal_end = Lsn(data.get_u64());
            let _send_time = data.get_i64();
            Ok(ReplicationEvent::XLogData {
                wal_start,
                server_wal_end,
                payload: data,
            })
        }
        b'k' => {
            if data.remaining() < 17 {
                return Err(Error::Protocol("truncated keepalive frame".into()));
            }
            let server_wal_end = Lsn(data.get_u64());
            let _send_time = data.get_i64();
            let reply_requested = data.get_u8() != 0;
            Ok(ReplicationEvent::Keepalive {
                server_wal_end,
                reply_requested,
            })
        }
        other => Ok(ReplicationEvent::Other(other)),
    }
}

/// Encode the body of a standby status update ('r') frame.
///
/// Write, flush, and apply all report the same position: the tailer
/// considers WAL handled once the decoded changes are on the bus.
pub(crate) fn encode_standby_status(lsn: Lsn, client_time_micros: i64) -> BytesMut {
    let mut body = BytesMut::with_capacity(34);
    body.put_u8(b'r');
    body.put_u64(lsn.0);
    body.put_u64(lsn.0);
    body.put_u64(lsn.0);
    body.put_i64(client_time_micros);
    body.put_u8(0);
    body
}

/// Current time in Postgres replication-protocol form: microseconds since
/// 2000-01-01 00:00:00 UTC.
pub(crate) fn pg_timestamp_now() -> i64 {
    let unix_micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    unix_micros - PG_EPOCH_OFFSET_MICROS
}

fn row_values(body: &backend::DataRowBody) -> Result<Vec<Option<String>>> {
    let buffer = body.buffer();
    let mut values = Vec::new();
    let mut ranges = body.ranges();
    while let Some(range) = ranges.next().map_err(proto_err)? {
        values.push(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()));
    }
    Ok(values)
}

fn server_error(body: backend::ErrorResponseBody) -> Error {
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();

    let mut fields = body.fields();
    while let Ok(Some(field)) = fields.next() {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }

    Error::Database(format!("{severity} {code}: {message}"))
}

fn proto_err(e: std::io::Error) -> Error {
    Error::Protocol(e.to_string())
}

fn message_name(message: &Message) -> &'static str {
    match message {
        Message::AuthenticationOk => "AuthenticationOk",
        Message::CommandComplete(_) => "CommandComplete",
        Message::CopyData(_) => "CopyData",
        Message::CopyDone => "CopyDone",
        Message::DataRow(_) => "DataRow",
        Message::EmptyQueryResponse => "EmptyQueryResponse",
        Message::ErrorResponse(_) => "ErrorResponse",
        Message::NoticeResponse(_) => "NoticeResponse",
        Message::ParameterStatus(_) => "ParameterStatus",
        Message::ReadyForQuery(_) => "ReadyForQuery",
        Message::RowDescription(_) => "RowDescription",
        _ => "unexpected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xlogdata_frame(wal_start: u64, wal_end: u64, payload: &[u8]) -> Bytes {
        let mut frame = BytesMut::new();
        frame.put_u8(b'w');
        frame.put_u64(wal_start);
        frame.put_u64(wal_end);
        frame.put_i64(0);
        frame.put_slice(payload);
        frame.freeze()
    }

    #[test]
    fn test_parse_xlogdata() {
        let event = parse_event(xlogdata_frame(100, 200, b"{\"change\":[]}")).unwrap();
        match event {
            ReplicationEvent::XLogData {
                wal_start,
                server_wal_end,
                payload,
            } => {
                assert_eq!(wal_start, Lsn(100));
                assert_eq!(server_wal_end, Lsn(200));
                assert_eq!(&payload[..], b"{\"change\":[]}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_keepalive() {
        let mut frame = BytesMut::new();
        frame.put_u8(b'k');
        frame.put_u64(300);
        frame.put_i64(0);
        frame.put_u8(1);

        let event = parse_event(frame.freeze()).unwrap();
        assert_eq!(
            event,
            ReplicationEvent::Keepalive {
                server_wal_end: Lsn(300),
                reply_requested: true,
            }
        );
    }

    #[test]
    fn test_parse_unknown_tag() {
        let event = parse_event(Bytes::from_static(b"z123")).unwrap();
        assert_eq!(event, ReplicationEvent::Other(b'z'));
    }

    #[test]
    fn test_parse_truncated_frames() {
        assert!(parse_event(Bytes::new()).is_err());
        assert!(parse_event(Bytes::from_static(b"w\x00\x00")).is_err());
        assert!(parse_event(Bytes::from_static(b"k\x00")).is_err());
    }

    #[test]
    fn test_encode_standby_status() {
        let body = encode_standby_status(Lsn(0x0000_0001_0000_0002), 99);
        assert_eq!(body.len(), 34);
        assert_eq!(body[0], b'r');
        // Write, flush and apply carry the same LSN.
        assert_eq!(&body[1..9], &body[9..17]);
        assert_eq!(&body[9..17], &body[17..25]);
        assert_eq!(body[33], 0);
    }

    #[test]
    fn test_pg_timestamp_is_past_2020() {
        // 2020-01-01 in the Postgres epoch.
        let micros_2020 = (1_577_836_800i64 - 946_684_800) * 1_000_000;
        assert!(pg_timestamp_now() > micros_2020);
    }
}
