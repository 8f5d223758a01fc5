//! NBD client implementation.
//!
//! A minimal fixed-newstyle client, used to drive servers in tests and
//! simulations. Requests are issued one at a time.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// NBD client for connecting to NBD servers.
pub struct NbdClient<S> {
    stream: S,
    cookie_counter: AtomicU64,
    /// Size of the export in bytes.
    pub size_bytes: u64,
    /// Transmission flags advertised by the server.
    pub transmission_flags: u16,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Connect to an NBD server and negotiate the export with `NBD_OPT_GO`.
    pub async fn connect(mut stream: S, export_name: &str) -> Result<Self, NbdError> {
        read_greeting(&mut stream).await?;

        // Send NBD_OPT_GO
        let name_bytes = export_name.as_bytes();
        let opt_data_len = 4 + name_bytes.len() + 2; // name_len + name + info_count
        write_option_header(&mut stream, NBD_OPT_GO, opt_data_len as u32).await?;

        // Write option data: name length, name, info request count (0)
        stream
            .write_all(&(name_bytes.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(name_bytes).await?;
        stream.write_all(&0u16.to_be_bytes()).await?; // no info requests

        // Read option replies until we get NBD_REP_ACK
        let mut size_bytes = 0u64;
        let mut transmission_flags = 0u16;
        loop {
            let mut reply_header = [0u8; 20];
            stream.read_exact(&mut reply_header).await?;

            let magic = u64::from_be_bytes(reply_header[0..8].try_into().unwrap());
            if magic != NBD_OPTION_REPLY_MAGIC {
                return Err(NbdError::InvalidMagic {
                    expected: NBD_OPTION_REPLY_MAGIC,
                    actual: magic,
                });
            }
            let reply_type = u32::from_be_bytes(reply_header[12..16].try_into().unwrap());
            let reply_len = u32::from_be_bytes(reply_header[16..20].try_into().unwrap()) as usize;

            // Bound allocation to prevent DoS from malicious servers
            if reply_len > OPTION_REPLY_MAX_BYTES {
                return Err(NbdError::RequestTooLarge {
                    length_bytes: reply_len as u32,
                    max_bytes: OPTION_REPLY_MAX_BYTES as u32,
                });
            }

            let mut reply_data = vec![0u8; reply_len];
            stream.read_exact(&mut reply_data).await?;

            if reply_type == NBD_REP_INFO && reply_len >= 12 {
                let info_type = u16::from_be_bytes(reply_data[0..2].try_into().unwrap());
                if info_type == NBD_INFO_EXPORT {
                    size_bytes = u64::from_be_bytes(reply_data[2..10].try_into().unwrap());
                    transmission_flags = u16::from_be_bytes(reply_data[10..12].try_into().unwrap());
                }
            } else if reply_type == NBD_REP_ACK {
                break;
            } else if reply_type >= 0x80000000 {
                return Err(NbdError::NegotiationFailed {
                    reason: "option negotiation failed",
                });
            }
        }

        Ok(Self::new(stream, size_bytes, transmission_flags))
    }

    /// Connect with the older `NBD_OPT_EXPORT_NAME` option.
    ///
    /// The server answers with a bare size/flags record instead of option
    /// replies, padded with zeroes unless both sides agreed on no-zeroes.
    pub async fn connect_export_name(mut stream: S, export_name: &str) -> Result<Self, NbdError> {
        let no_zeroes = read_greeting(&mut stream).await?;

        let name_bytes = export_name.as_bytes();
        write_option_header(&mut stream, NBD_OPT_EXPORT_NAME, name_bytes.len() as u32).await?;
        stream.write_all(name_bytes).await?;

        let mut resp = [0u8; 10];
        stream.read_exact(&mut resp).await?;
        let size_bytes = u64::from_be_bytes(resp[0..8].try_into().unwrap());
        let transmission_flags = u16::from_be_bytes(resp[8..10].try_into().unwrap());

        if !no_zeroes {
            let mut padding = [0u8; NBD_EXPORT_NAME_PADDING];
            stream.read_exact(&mut padding).await?;
        }

        Ok(Self::new(stream, size_bytes, transmission_flags))
    }

    fn new(stream: S, size_bytes: u64, transmission_flags: u16) -> Self {
        Self {
            stream,
            cookie_counter: AtomicU64::new(0),
            size_bytes,
            transmission_flags,
        }
    }

    fn next_cookie(&self) -> u64 {
        self.cookie_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_request(
        &mut self,
        command: NbdCommand,
        offset: u64,
        length: u32,
    ) -> Result<u64, NbdError> {
        let cookie = self.next_cookie();
        let req = NbdRequest {
            flags: 0,
            command,
            cookie,
            offset,
            length,
        };
        self.stream.write_all(&req.to_bytes()).await?;
        Ok(cookie)
    }

    /// Read a reply and check it answers `cookie`.
    ///
    /// Returns the error code the server sent; the caller decides whether a
    /// payload follows.
    async fn read_reply(&mut self, cookie: u64) -> Result<u32, NbdError> {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        self.stream.read_exact(&mut buf).await?;
        let reply = NbdReply::from_bytes(&buf)?;

        if reply.cookie != cookie {
            return Err(NbdError::CookieMismatch {
                expected: cookie,
                actual: reply.cookie,
            });
        }
        Ok(reply.error)
    }

    async fn execute_request(
        &mut self,
        command: NbdCommand,
        offset: u64,
        length: u32,
    ) -> Result<(), NbdError> {
        let cookie = self.send_request(command, offset, length).await?;
        match self.read_reply(cookie).await? {
            NBD_OK => Ok(()),
            code => Err(NbdError::ServerError { code }),
        }
    }

    /// Read data from the device.
    ///
    /// The server always sends `length` bytes after the reply header, even
    /// for a failed read, so the payload is consumed before an error is
    /// returned.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        let cookie = self.send_request(NbdCommand::Read, offset, length).await?;
        let error = self.read_reply(cookie).await?;

        let mut data = BytesMut::with_capacity(length as usize);
        data.resize(length as usize, 0);
        self.stream.read_exact(&mut data).await.map_err(|e| {
            NbdError::Io(io::Error::other(format!(
                "failed to read {} bytes of response data at offset {}: {}",
                length, offset, e
            )))
        })?;

        if error != NBD_OK {
            return Err(NbdError::ServerError { code: error });
        }
        Ok(data.freeze())
    }

    /// Write data to the device.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        let cookie = self
            .send_request(NbdCommand::Write, offset, data.len() as u32)
            .await?;
        self.stream.write_all(data).await?;

        match self.read_reply(cookie).await? {
            NBD_OK => Ok(()),
            code => Err(NbdError::ServerError { code }),
        }
    }

    /// Flush pending writes.
    pub async fn flush(&mut self) -> Result<(), NbdError> {
        self.execute_request(NbdCommand::Flush, 0, 0).await
    }

    /// Trim a range (hint that data is no longer needed).
    pub async fn trim(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        self.execute_request(NbdCommand::Trim, offset, length).await
    }

    /// Disconnect from the server. No reply is expected.
    pub async fn disconnect(mut self) -> Result<(), NbdError> {
        self.send_request(NbdCommand::Disconnect, 0, 0).await?;
        Ok(())
    }

    /// Check if the server supports flush.
    pub fn supports_flush(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_SEND_FLUSH) != 0
    }

    /// Check if the export is read-only.
    pub fn is_read_only(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_READ_ONLY) != 0
    }
}

/// Read the server greeting and answer with client flags.
///
/// Returns whether both sides agreed to skip the export-name padding.
async fn read_greeting<S>(stream: &mut S) -> Result<bool, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; 18];
    stream.read_exact(&mut hello).await?;

    let magic = u64::from_be_bytes(hello[0..8].try_into().unwrap());
    if magic != NBD_MAGIC {
        return Err(NbdError::InvalidMagic {
            expected: NBD_MAGIC,
            actual: magic,
        });
    }

    let opts_magic = u64::from_be_bytes(hello[8..16].try_into().unwrap());
    if opts_magic != NBD_OPTS_MAGIC {
        return Err(NbdError::NegotiationFailed {
            reason: "invalid opts magic",
        });
    }

    let flags = u16::from_be_bytes(hello[16..18].try_into().unwrap());
    let no_zeroes = (flags & NBD_FLAG_NO_ZEROES) != 0;

    let client_flags =
        NBD_FLAG_C_FIXED_NEWSTYLE | if no_zeroes { NBD_FLAG_C_NO_ZEROES } else { 0 };
    stream.write_all(&client_flags.to_be_bytes()).await?;
    Ok(no_zeroes)
}

async fn write_option_header<S>(stream: &mut S, option: u32, length: u32) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let mut opt_header = [0u8; 16];
    opt_header[0..8].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
    opt_header[8..12].copy_from_slice(&option.to_be_bytes());
    opt_header[12..16].copy_from_slice(&length.to_be_bytes());
    stream.write_all(&opt_header).await?;
    Ok(())
}
