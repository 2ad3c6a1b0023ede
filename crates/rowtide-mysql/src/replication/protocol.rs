//! Client side of the replication wire protocol.
//!
//! Covers what the binlog connection needs and nothing more: the v10
//! handshake with `mysql_native_password` / `caching_sha2_password`
//! (fast path), plain `COM_QUERY` for session variables, registration as
//! a replica and `COM_BINLOG_DUMP`. Metadata queries go through
//! `mysql_async` instead.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use rowtide_core::Position;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::framer::{parse_error_packet, Frame, MAX_PACKET_LEN, PACKET_HEADER_LEN};
use crate::error::{CanalError, CanalResult};

pub mod capability {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;
}

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

const UTF8MB4_GENERAL_CI: u8 = 45;
const NATIVE_PASSWORD: &str = "mysql_native_password";
const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

const CLIENT_FLAGS: u32 = capability::CLIENT_PROTOCOL_41
    | capability::CLIENT_SECURE_CONNECTION
    | capability::CLIENT_LONG_PASSWORD
    | capability::CLIENT_TRANSACTIONS
    | capability::CLIENT_PLUGIN_AUTH
    | capability::CLIENT_DEPRECATE_EOF;

/// Initial handshake packet sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub character_set: u8,
    pub status_flags: u16,
    /// Scramble used as the password salt.
    pub auth_data: Vec<u8>,
    pub auth_plugin: String,
}

impl Handshake {
    pub fn parse(data: &[u8]) -> CanalResult<Self> {
        if data.first() == Some(&0xFF) {
            return Err(server_error(data));
        }

        let handshake = Self::decode(data)
            .map_err(|e| CanalError::Connection(format!("malformed handshake: {e}")))?;
        if handshake.protocol_version != 10 {
            return Err(CanalError::Connection(format!(
                "unsupported protocol version {}",
                handshake.protocol_version
            )));
        }
        Ok(handshake)
    }

    fn decode(data: &[u8]) -> std::io::Result<Self> {
        let mut c = Cursor::new(data);
        let protocol_version = c.read_u8()?;
        let server_version = read_null_terminated(&mut c)?;
        let connection_id = c.read_u32::<LittleEndian>()?;

        let mut auth_data = vec![0u8; 8];
        c.read_exact(&mut auth_data)?;
        c.read_u8()?;

        let cap_lower = c.read_u16::<LittleEndian>()?;
        let character_set = c.read_u8()?;
        let status_flags = c.read_u16::<LittleEndian>()?;
        let cap_upper = c.read_u16::<LittleEndian>()?;
        let capabilities = (u32::from(cap_upper) << 16) | u32::from(cap_lower);

        let auth_len = usize::from(c.read_u8()?);
        let mut reserved = [0u8; 10];
        c.read_exact(&mut reserved)?;

        let part2_len = auth_len.saturating_sub(8).max(13);
        let mut part2 = vec![0u8; part2_len];
        c.read_exact(&mut part2)?;
        if let Some(nul) = part2.iter().position(|&b| b == 0) {
            part2.truncate(nul);
        }
        auth_data.extend_from_slice(&part2);

        let auth_plugin = if capabilities & capability::CLIENT_PLUGIN_AUTH != 0 {
            read_null_terminated(&mut c).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capabilities,
            character_set,
            status_flags,
            auth_data,
            auth_plugin,
        })
    }
}

fn read_null_terminated(c: &mut Cursor<&[u8]>) -> std::io::Result<String> {
    let mut out = Vec::new();
    loop {
        match c.read_u8()? {
            0 => break,
            b => out.push(b),
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn server_error(packet: &[u8]) -> CanalError {
    match parse_error_packet(packet) {
        Frame::Error { code, message } => CanalError::Server { code, message },
        _ => CanalError::Connection("unexpected error packet".into()),
    }
}

/// SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))
pub fn scramble_native(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + salt)
pub fn scramble_caching_sha2(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let hash1 = Sha256::digest(password.as_bytes());
    let hash2 = Sha256::digest(hash1);
    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(salt);
    let hash3 = hasher.finalize();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}

fn scramble(plugin: &str, password: &str, salt: &[u8]) -> CanalResult<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD => Ok(scramble_native(password, salt)),
        CACHING_SHA2_PASSWORD => Ok(scramble_caching_sha2(password, salt)),
        other => Err(CanalError::Connection(format!(
            "unsupported auth plugin {other}"
        ))),
    }
}

/// An authenticated connection speaking the replication protocol.
pub struct ReplicationConnection<S> {
    stream: BufReader<S>,
    seq: u8,
    handshake: Handshake,
}

impl<S> std::fmt::Debug for ReplicationConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationConnection")
            .field("server_version", &self.handshake.server_version)
            .field("connection_id", &self.handshake.connection_id)
            .finish_non_exhaustive()
    }
}

impl ReplicationConnection<TcpStream> {
    pub async fn connect(addr: &str, user: &str, password: &str) -> CanalResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CanalError::Connection(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, user, password).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ReplicationConnection<S> {
    /// Read the server greeting and authenticate.
    pub async fn handshake(stream: S, user: &str, password: &str) -> CanalResult<Self> {
        let mut stream = BufReader::new(stream);
        let (packet, seq) = read_packet(&mut stream).await?;
        let handshake = Handshake::parse(&packet)?;

        debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            auth_plugin = %handshake.auth_plugin,
            "received handshake"
        );

        let mut conn = Self {
            stream,
            seq: seq.wrapping_add(1),
            handshake,
        };
        conn.authenticate(user, password).await?;
        Ok(conn)
    }

    pub fn server_version(&self) -> &str {
        &self.handshake.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.handshake.connection_id
    }

    async fn authenticate(&mut self, user: &str, password: &str) -> CanalResult<()> {
        let plugin = if self.handshake.auth_plugin.is_empty() {
            NATIVE_PASSWORD.to_string()
        } else {
            self.handshake.auth_plugin.clone()
        };
        let auth = scramble(&plugin, password, &self.handshake.auth_data)?;

        let mut response = BytesMut::with_capacity(64 + user.len() + auth.len());
        response.put_u32_le(CLIENT_FLAGS);
        response.put_u32_le(MAX_PACKET_LEN as u32);
        response.put_u8(UTF8MB4_GENERAL_CI);
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth.len() as u8);
        response.put_slice(&auth);
        response.put_slice(plugin.as_bytes());
        response.put_u8(0);
        self.write_packet(&response).await?;

        let mut plugin = plugin;
        loop {
            let resp = self.read_packet().await?;
            match resp.first() {
                Some(0x00) => {
                    debug!(plugin = %plugin, "authenticated");
                    return Ok(());
                }
                Some(0xFF) => return Err(server_error(&resp)),
                Some(0xFE) => {
                    let mut c = Cursor::new(&resp[1..]);
                    plugin = read_null_terminated(&mut c)
                        .map_err(|e| CanalError::Connection(format!("malformed auth switch: {e}")))?;
                    let mut salt = resp[1 + c.position() as usize..].to_vec();
                    if salt.last() == Some(&0) {
                        salt.pop();
                    }
                    debug!(plugin = %plugin, "auth switch");
                    let auth = scramble(&plugin, password, &salt)?;
                    self.write_packet(&auth).await?;
                }
                // caching_sha2_password: fast auth succeeded, OK packet follows
                Some(0x01) if resp.get(1) == Some(&0x03) => {}
                Some(0x01) if resp.get(1) == Some(&0x04) => {
                    return Err(CanalError::Connection(
                        "caching_sha2_password full authentication requires a secure connection"
                            .into(),
                    ));
                }
                Some(other) => {
                    return Err(CanalError::Connection(format!(
                        "unexpected auth response 0x{other:02X}"
                    )));
                }
                None => return Err(CanalError::Connection("empty auth response".into())),
            }
        }
    }

    async fn read_packet(&mut self) -> CanalResult<Vec<u8>> {
        let (packet, seq) = read_packet(&mut self.stream).await?;
        self.seq = seq.wrapping_add(1);
        Ok(packet)
    }

    async fn write_packet(&mut self, payload: &[u8]) -> CanalResult<()> {
        let mut out = BytesMut::with_capacity(payload.len() + PACKET_HEADER_LEN);
        let mut chunks = payload.chunks(MAX_PACKET_LEN).peekable();
        if chunks.peek().is_none() {
            out.put_slice(&[0, 0, 0, self.seq]);
            self.seq = self.seq.wrapping_add(1);
        }
        for chunk in chunks {
            let len = chunk.len() as u32;
            out.put_slice(&len.to_le_bytes()[..3]);
            out.put_u8(self.seq);
            out.put_slice(chunk);
            self.seq = self.seq.wrapping_add(1);
        }
        // a payload that fills whole packets ends with an empty one
        if !payload.is_empty() && payload.len() % MAX_PACKET_LEN == 0 {
            out.put_slice(&[0, 0, 0, self.seq]);
            self.seq = self.seq.wrapping_add(1);
        }

        let stream = self.stream.get_mut();
        stream.write_all(&out).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn command(&mut self, payload: &[u8]) -> CanalResult<()> {
        self.seq = 0;
        self.write_packet(payload).await
    }

    /// Run a statement and discard any result set.
    pub async fn query(&mut self, sql: &str) -> CanalResult<()> {
        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(COM_QUERY);
        packet.put_slice(sql.as_bytes());
        self.command(&packet).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(server_error(&resp)),
            Some(_) => self.drain_result_set(&resp).await,
            None => Err(CanalError::Connection("empty query response".into())),
        }
    }

    async fn drain_result_set(&mut self, column_count: &[u8]) -> CanalResult<()> {
        let columns = u64::from(column_count[0]);
        for _ in 0..columns {
            self.read_packet().await?;
        }
        loop {
            let packet = self.read_packet().await?;
            match packet.first() {
                Some(0xFE) if packet.len() < MAX_PACKET_LEN => return Ok(()),
                Some(0xFF) => return Err(server_error(&packet)),
                _ => {}
            }
        }
    }

    /// `COM_REGISTER_SLAVE`, so the connection shows up in `SHOW REPLICAS`.
    pub async fn register_replica(&mut self, server_id: u32, port: u16) -> CanalResult<()> {
        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(COM_REGISTER_SLAVE);
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname
        packet.put_u8(0); // user
        packet.put_u8(0); // password
        packet.put_u16_le(port);
        packet.put_u32_le(0); // replication rank
        packet.put_u32_le(0); // master id
        self.command(&packet).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => {
                debug!(server_id, "registered as replica");
                Ok(())
            }
            Some(0xFF) => Err(server_error(&resp)),
            _ => Err(CanalError::Connection(
                "unexpected response to COM_REGISTER_SLAVE".into(),
            )),
        }
    }

    /// Request events from `position` on and hand back the raw stream.
    ///
    /// From here on the server only sends event, EOF and error packets, which
    /// [`PacketFramer`](super::framer::PacketFramer) splits.
    pub async fn start_binlog_dump(
        mut self,
        position: &Position,
        server_id: u32,
    ) -> CanalResult<BufReader<S>> {
        let mut packet = BytesMut::with_capacity(position.name.len() + 11);
        packet.put_u8(COM_BINLOG_DUMP);
        packet.put_u32_le(position.pos);
        packet.put_u16_le(0);
        packet.put_u32_le(server_id);
        packet.put_slice(position.name.as_bytes());
        self.command(&packet).await?;

        info!(position = %position, server_id, "started binlog dump");
        Ok(self.stream)
    }
}

async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R) -> CanalResult<(Vec<u8>, u8)> {
    use tokio::io::AsyncReadExt;

    let mut payload = Vec::new();
    loop {
        let mut header = [0u8; PACKET_HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CanalError::Connection("server closed the connection".into())
            } else {
                CanalError::Io(e)
            }
        })?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let seq = header[3];

        let start = payload.len();
        payload.resize(start + len, 0);
        stream.read_exact(&mut payload[start..]).await?;

        if len < MAX_PACKET_LEN {
            return Ok((payload, seq));
        }
    }
}
