use std::io::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{decode_stored_response, encode_stored_response, Repository, StoreError, StoredResponse};

/// Network-KV backend speaking the RESP text protocol over a single lazy
/// TCP connection. Only `AUTH`, `SELECT`, `GET` and `SET [NX]` are emitted.
pub struct RedisRepository {
    client: RedisClient,
}

impl RedisRepository {
    pub fn new(addr: String, password: String, db: i64, op_timeout: Duration) -> Self {
        Self {
            client: RedisClient::new(addr, password, db, op_timeout),
        }
    }
}

#[async_trait]
impl Repository for RedisRepository {
    async fn get(&self, key: &str) -> Result<Option<StoredResponse>, StoreError> {
        match self.client.get(key).await? {
            Some(payload) => Ok(Some(decode_stored_response(&payload)?)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &StoredResponse,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        let payload = encode_stored_response(value)?;
        self.client.set(key, &payload, overwrite).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.client.close().await
    }
}

type Conn = BufReader<TcpStream>;

/// Minimal RESP client. All I/O is serialized by the connection mutex, so
/// at most one command is in flight per repository. Any transport or
/// protocol failure drops the connection; the next operation reconnects
/// (and re-authenticates).
struct RedisClient {
    addr: String,
    password: String,
    db: i64,
    op_timeout: Duration,
    conn: Mutex<Option<Conn>>,
}

impl RedisClient {
    fn new(addr: String, password: String, db: i64, op_timeout: Duration) -> Self {
        Self {
            addr,
            password,
            db,
            op_timeout,
            conn: Mutex::new(None),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut slot = self.conn.lock().await;
        match self.command(&mut slot, &["GET", key]).await? {
            Reply::Bulk(data) => Ok(Some(data)),
            Reply::Nil => Ok(None),
            Reply::Error(text) => Err(StoreError::Redis(text)),
            other => Err(StoreError::UnexpectedReply(other.kind().to_string())),
        }
    }

    async fn set(&self, key: &str, payload: &[u8], overwrite: bool) -> Result<(), StoreError> {
        let value = String::from_utf8_lossy(payload);
        let mut args = vec!["SET", key, value.as_ref()];
        if !overwrite {
            args.push("NX");
        }

        let mut slot = self.conn.lock().await;
        match self.command(&mut slot, &args).await? {
            // A nil reply means NX found an existing entry; the call
            // succeeds silently.
            Reply::Nil => Ok(()),
            Reply::Simple(_) => Ok(()),
            Reply::Error(text) => Err(StoreError::Redis(text)),
            other => Err(StoreError::UnexpectedReply(other.kind().to_string())),
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut slot = self.conn.lock().await;
        if let Some(mut conn) = slot.take() {
            conn.get_mut().shutdown().await?;
        }
        Ok(())
    }

    /// Sends one command and reads one reply, resetting the connection on
    /// any transport or framing failure so the next call starts clean. An
    /// error reply is a valid exchange and keeps the connection.
    async fn command(&self, slot: &mut Option<Conn>, args: &[&str]) -> Result<Reply, StoreError> {
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(StoreError::Protocol("connection unavailable".to_string()));
        };

        let op_timeout = self.op_timeout;
        let result = async {
            write_command(conn, args, op_timeout).await?;
            read_reply(conn, op_timeout).await
        }
        .await;

        if result.is_err() {
            *slot = None;
        }
        result
    }

    async fn connect(&self) -> Result<Conn, StoreError> {
        let stream = timeout(self.op_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| StoreError::Timeout)??;
        let mut conn = BufReader::new(stream);

        if !self.password.is_empty() {
            self.handshake_command(&mut conn, &["AUTH", &self.password])
                .await?;
        }
        if self.db != 0 {
            let db = self.db.to_string();
            self.handshake_command(&mut conn, &["SELECT", &db]).await?;
        }
        Ok(conn)
    }

    /// AUTH/SELECT must answer `+OK`; anything else aborts the connection
    /// attempt.
    async fn handshake_command(&self, conn: &mut Conn, args: &[&str]) -> Result<(), StoreError> {
        write_command(conn, args, self.op_timeout).await?;
        match read_reply(conn, self.op_timeout).await? {
            Reply::Simple(_) => Ok(()),
            Reply::Error(text) => Err(StoreError::Redis(text)),
            other => Err(StoreError::UnexpectedReply(other.kind().to_string())),
        }
    }
}

#[derive(Debug)]
enum Reply {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    Nil,
}

impl Reply {
    fn kind(&self) -> &'static str {
        match self {
            Reply::Simple(_) => "simple string",
            Reply::Error(_) => "error",
            Reply::Int(_) => "integer",
            Reply::Bulk(_) => "bulk string",
            Reply::Nil => "nil",
        }
    }
}

async fn write_command<W>(writer: &mut W, args: &[&str], op_timeout: Duration) -> Result<(), StoreError>
where
    W: AsyncWrite + Unpin,
{
    let frame = build_resp_command(args);
    timeout(op_timeout, writer.write_all(&frame))
        .await
        .map_err(|_| StoreError::Timeout)??;
    Ok(())
}

fn build_resp_command(args: &[&str]) -> Vec<u8> {
    let mut frame = Vec::new();
    let _ = write!(frame, "*{}\r\n", args.len());
    for arg in args {
        let _ = write!(frame, "${}\r\n", arg.len());
        frame.extend_from_slice(arg.as_bytes());
        frame.extend_from_slice(b"\r\n");
    }
    frame
}

/// Reads a single reply framed by the RESP type prefixes. The commands this
/// client emits never elicit array replies, so `*` is rejected as a framing
/// error like any other unknown prefix.
async fn read_reply<R>(reader: &mut R, op_timeout: Duration) -> Result<Reply, StoreError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    timeout(op_timeout, reader.read_until(b'\n', &mut line))
        .await
        .map_err(|_| StoreError::Timeout)??;

    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    if line.is_empty() {
        return Err(StoreError::Protocol("empty reply".to_string()));
    }

    let prefix = line[0];
    let payload = String::from_utf8_lossy(&line[1..]).into_owned();

    match prefix {
        b'+' => Ok(Reply::Simple(payload)),
        b'-' => Ok(Reply::Error(payload)),
        b':' => {
            let value = payload
                .parse::<i64>()
                .map_err(|_| StoreError::Protocol(format!("bad integer reply: {payload}")))?;
            Ok(Reply::Int(value))
        }
        b'$' => {
            let size = payload
                .parse::<i64>()
                .map_err(|_| StoreError::Protocol(format!("bad bulk length: {payload}")))?;
            if size == -1 {
                return Ok(Reply::Nil);
            }
            let size = usize::try_from(size)
                .map_err(|_| StoreError::Protocol(format!("bad bulk length: {size}")))?;
            // Payload plus the trailing CRLF.
            let mut buf = vec![0u8; size + 2];
            timeout(op_timeout, reader.read_exact(&mut buf))
                .await
                .map_err(|_| StoreError::Timeout)??;
            buf.truncate(size);
            Ok(Reply::Bulk(buf))
        }
        other => Err(StoreError::Protocol(format!(
            "unknown reply prefix: {:?}",
            other as char
        ))),
    }
}
