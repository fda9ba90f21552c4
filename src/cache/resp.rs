//! Minimal client side of the Redis serialization protocol (RESP2).

use anyhow::{anyhow, bail, Context, Result};
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::Simple(s) if s == "OK")
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            RespValue::Bulk(Some(bytes)) => String::from_utf8(bytes).ok(),
            RespValue::Simple(s) => Some(s),
            _ => None,
        }
    }
}

/// Connection target parsed from `redis://[:password@]host[:port][/db]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisAddress {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: Option<u32>,
}

impl RedisAddress {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("redis://")
            .ok_or_else(|| anyhow!("unsupported cache url (expected redis://): {url}"))?;

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };
        let (password, host_port) = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                let password = userinfo.split_once(':').map_or(userinfo, |(_, p)| p);
                ((!password.is_empty()).then(|| password.to_string()), host_port)
            }
            None => (None, authority),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .with_context(|| format!("invalid port in cache url: {url}"))?,
            ),
            None => (host_port, 6379),
        };
        if host.is_empty() {
            bail!("missing host in cache url: {url}");
        }
        let db = if path.is_empty() {
            None
        } else {
            Some(
                path.parse::<u32>()
                    .with_context(|| format!("invalid database in cache url: {url}"))?,
            )
        };

        Ok(Self {
            host: host.to_string(),
            port,
            password,
            db,
        })
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one RESP value.
pub fn read_value<'a, R>(reader: &'a mut R) -> BoxFuture<'a, Result<RespValue>>
where
    R: AsyncBufRead + Unpin + Send,
{
    async move {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            bail!("connection closed");
        }
        let line = line
            .strip_suffix("\r\n")
            .ok_or_else(|| anyhow!("unterminated RESP line"))?;
        let Some(kind) = line.chars().next() else {
            bail!("empty RESP line");
        };
        let payload = &line[kind.len_utf8()..];

        match kind {
            '+' => Ok(RespValue::Simple(payload.to_string())),
            '-' => Ok(RespValue::Error(payload.to_string())),
            ':' => Ok(RespValue::Integer(payload.parse()?)),
            '$' => {
                let len: i64 = payload.parse()?;
                if len < 0 {
                    return Ok(RespValue::Bulk(None));
                }
                if len > MAX_BULK_LEN {
                    bail!("bulk string of {len} bytes exceeds limit");
                }
                let mut data = vec![0; len as usize + 2];
                reader.read_exact(&mut data).await?;
                if !data.ends_with(b"\r\n") {
                    bail!("bulk string not terminated by CRLF");
                }
                data.truncate(len as usize);
                Ok(RespValue::Bulk(Some(data)))
            }
            '*' => {
                let len: i64 = payload.parse()?;
                if len < 0 {
                    return Ok(RespValue::Array(None));
                }
                let mut items = Vec::with_capacity(len.min(1024) as usize);
                for _ in 0..len {
                    items.push(read_value(&mut *reader).await?);
                }
                Ok(RespValue::Array(Some(items)))
            }
            other => Err(anyhow!("unknown RESP type marker {other:?}")),
        }
    }
    .boxed()
}

/// One TCP connection with strictly sequential request/reply use.
pub struct RespConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RespConnection {
    pub fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    pub async fn command(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        self.writer.write_all(&encode_command(args)).await?;
        self.writer.flush().await?;
        read_value(&mut self.reader).await
    }

    /// Whether the server side is gone while no request is outstanding.
    /// EOF or a socket error means closed. So do unsolicited bytes, since
    /// the next reply could no longer be matched to its request.
    pub fn peer_closed(&mut self) -> bool {
        if !self.reader.buffer().is_empty() {
            return true;
        }
        let mut byte = [0u8; 1];
        match self.reader.get_mut().peek(&mut byte).now_or_never() {
            None => false,
            Some(Ok(_)) | Some(Err(_)) => true,
        }
    }

    /// Send several commands at once and read one reply per command.
    pub async fn pipeline(&mut self, commands: &[Vec<&[u8]>]) -> Result<Vec<RespValue>> {
        let mut buf = Vec::new();
        for args in commands {
            buf.extend_from_slice(&encode_command(args));
        }
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(read_value(&mut self.reader).await?);
        }
        Ok(replies)
    }
}
