//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! Reads the first TLS record straight off the client socket and pulls the
//! hostname out of the `server_name` extension without terminating TLS. The
//! record is kept verbatim so it can be replayed to the upstream, which then
//! sees an untouched ClientHello.
//!
//! TLS record:
//! - byte 0: record type (0x16 = Handshake)
//! - bytes 1-2: version
//! - bytes 3-4: record length
//! - bytes 5+: handshake message
//!
//! Handshake ClientHello (offsets into the record body):
//! - byte 0: handshake type (0x01 = ClientHello)
//! - bytes 1-3: length
//! - bytes 4-5: client version
//! - bytes 6-37: random (32 bytes)
//! - byte 38: session ID length
//! - variable: session ID
//! - 2 bytes: cipher suites length
//! - variable: cipher suites
//! - 1 byte: compression methods length
//! - variable: compression methods
//! - 2 bytes: extensions length
//! - variable: extensions

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProxyError;

/// TLS record type for handshake messages.
pub const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake type for ClientHello.
pub const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Extension type for server_name.
pub const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// server_name entry type for a DNS hostname.
pub const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Lowest record version that can carry SNI (TLS 1.0).
const MIN_VERSION: [u8; 2] = [3, 1];

/// Handshake type, inner length, client version and random.
const FIXED_HEADER_LEN: usize = 1 + 3 + 2 + 4 + 28;

/// The first TLS record exactly as the client sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsRecord {
    pub record_type: [u8; 1],
    pub version: [u8; 2],
    pub length: [u8; 2],
    pub body: Vec<u8>,
}

impl TlsRecord {
    /// The four chunks in wire order, for byte-exact replay.
    pub fn chunks(&self) -> [&[u8]; 4] {
        [&self.record_type, &self.version, &self.length, &self.body]
    }

    /// Declared body length.
    pub fn declared_len(&self) -> usize {
        u16::from_be_bytes(self.length) as usize
    }

    /// Header and body concatenated.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.chunks().concat()
    }
}

/// A sniffed ClientHello: the SNI hostname plus the record it came from.
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub hostname: String,
    pub record: TlsRecord,
}

/// Read the first TLS record off `stream` and extract its SNI hostname.
///
/// Consumes exactly the record header and the declared body length, nothing
/// more, so the remainder of the client stream can be relayed untouched.
pub async fn sniff_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<ClientHello, ProxyError> {
    let mut record_type = [0u8; 1];
    stream
        .read_exact(&mut record_type)
        .await
        .map_err(|e| ProxyError::network("TLS header - couldn't read first byte", e))?;
    if record_type[0] != RECORD_TYPE_HANDSHAKE {
        return Err(ProxyError::Protocol("TLS header - not TLS."));
    }

    let mut version = [0u8; 2];
    stream
        .read_exact(&mut version)
        .await
        .map_err(|e| ProxyError::network("TLS header - couldn't read version bytes", e))?;
    if version < MIN_VERSION {
        return Err(ProxyError::Protocol(
            "TLS header - SSL < 3.1, SNI not supported.",
        ));
    }

    let mut length = [0u8; 2];
    stream
        .read_exact(&mut length)
        .await
        .map_err(|e| ProxyError::network("TLS header - couldn't read restLength bytes", e))?;

    let record_len = u16::from_be_bytes(length) as usize;
    if record_len == 0 {
        return Err(ProxyError::Protocol(
            "TLS header - couldn't read rest of bytes: empty record.",
        ));
    }

    let mut body = vec![0u8; record_len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| ProxyError::network("TLS header - couldn't read rest of bytes", e))?;

    let hostname = parse_client_hello(&body)?;

    Ok(ClientHello {
        hostname,
        record: TlsRecord {
            record_type,
            version,
            length,
            body,
        },
    })
}

/// Bounds-checked reads over the record body.
///
/// Skips may run past the end; only actual reads fail.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn skip(&mut self, n: usize) {
        self.pos = self.pos.saturating_add(n);
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProxyError> {
        let end = self.pos.checked_add(n).ok_or(TRUNCATED)?;
        let bytes = self.data.get(self.pos..end).ok_or(TRUNCATED)?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, ProxyError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProxyError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read `n` bytes at the cursor without moving it.
    fn peek(&self, n: usize) -> Result<&'a [u8], ProxyError> {
        let end = self.pos.checked_add(n).ok_or(TRUNCATED)?;
        self.data.get(self.pos..end).ok_or(TRUNCATED)
    }
}

const TRUNCATED: ProxyError =
    ProxyError::Protocol("TLS header parsing problem - truncated ClientHello.");

/// Extract the SNI hostname from a ClientHello record body.
///
/// Walks the extensions until a hostname is set. After a `server_name`
/// extension the cursor moves on by the declared extension length in
/// addition to the 5 bytes already read for the name header; the two only
/// matter when the name is empty and the walk continues.
pub fn parse_client_hello(body: &[u8]) -> Result<String, ProxyError> {
    let record_len = body.len();
    let mut cursor = Cursor::new(body);

    if cursor.peek(1)?[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(ProxyError::Protocol(
            "TLS header parsing problem - not a ClientHello.",
        ));
    }
    cursor.skip(FIXED_HEADER_LEN);

    let session_id_len = cursor.u8()? as usize;
    cursor.skip(session_id_len);

    let cipher_suites_len = cursor.u16()? as usize;
    cursor.skip(cipher_suites_len);

    let compression_len = cursor.u8()? as usize;
    cursor.skip(compression_len);

    if cursor.pos > record_len {
        return Err(ProxyError::Protocol(
            "TLS header parsing problem - no extensions.",
        ));
    }

    // Overall extensions length, not validated.
    cursor.skip(2);

    let mut hostname: Option<String> = None;
    while cursor.pos < record_len && hostname.as_deref().map_or(true, str::is_empty) {
        let extension_type = cursor.u16()?;
        let extension_len = cursor.u16()? as usize;

        if extension_type == EXTENSION_SERVER_NAME {
            // Server name list length; a single entry is assumed.
            cursor.skip(2);

            if cursor.u8()? != NAME_TYPE_HOST_NAME {
                return Err(ProxyError::Protocol(
                    "TLS header parsing problem - not a hostname.",
                ));
            }
            let name_len = cursor.u16()? as usize;
            let name = cursor.peek(name_len)?;
            let name = std::str::from_utf8(name).map_err(|_| {
                ProxyError::Protocol("TLS header parsing problem - hostname is not valid UTF-8.")
            })?;
            hostname = Some(name.to_string());
        }

        cursor.skip(extension_len);
    }

    match hostname {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(ProxyError::Protocol(
            "TLS header parsing problem - no hostname found.",
        )),
    }
}
