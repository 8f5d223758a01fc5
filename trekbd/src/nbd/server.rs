//! NBD server implementation.
//!
//! The `NbdServer` owns the exported block device and serves one connection
//! at a time: handshake, option negotiation, then the transmission loop. It
//! is transport-agnostic and works with any async stream (TCP or in-memory).
//!
//! For accepting connections in a loop, see `Daemon::listen()` which uses
//! the `Listener` trait.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

// Protocol types from the nbd crate
use nbd::*;

use crate::device::{BlockDevice, DeviceResult};
use crate::error::DeviceError;
use crate::types::{SectorRange, is_sector_aligned};

/// Maximum length for option data during negotiation.
/// This prevents unbounded allocation from malicious clients.
const OPTION_DATA_MAX_BYTES: usize = 64 * 1024; // 64 KiB

/// What a client sees once negotiation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdExport {
    pub size_bytes: u64,
    pub read_only: bool,
}

impl NbdExport {
    pub fn transmission_flags(&self) -> u16 {
        let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;
        if self.read_only {
            flags |= NBD_FLAG_READ_ONLY;
        }
        flags
    }
}

/// NBD server owning the exported device.
///
/// Each call to [`serve`](Self::serve) borrows the device for the duration of
/// one session; the device itself stays open across sessions and is only
/// released by [`close`](Self::close).
pub struct NbdServer {
    device: Box<dyn BlockDevice>,
    read_only: bool,
}

impl NbdServer {
    pub fn new(device: Box<dyn BlockDevice>, read_only: bool) -> Self {
        Self { device, read_only }
    }

    /// Export parameters, with the size taken from the device's capacity.
    pub fn export(&self) -> NbdExport {
        NbdExport {
            size_bytes: self.device.capacity(),
            read_only: self.read_only,
        }
    }

    pub fn device(&self) -> &dyn BlockDevice {
        self.device.as_ref()
    }

    /// Serve a single NBD connection over any async stream.
    ///
    /// Returns when the client disconnects or the session hits a protocol
    /// error. Device faults are reported to the client and do not end the
    /// session.
    pub async fn serve<S>(&mut self, mut stream: S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let export = self.export();
        let no_zeroes = handshake(&mut stream).await?;
        negotiate_options(&mut stream, &export, no_zeroes).await?;
        transmission(&mut stream, self.device.as_mut(), &export).await
    }

    /// Release the device. Further sessions will see every I/O fail.
    pub async fn close(&mut self) -> DeviceResult<()> {
        self.device.close().await
    }
}

async fn handshake<S>(stream: &mut S) -> Result<bool, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; 18];
    hello[0..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
    hello[8..16].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
    let flags = NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES;
    hello[16..18].copy_from_slice(&flags.to_be_bytes());
    stream.write_all(&hello).await?;

    let client_flags = stream.read_u32().await?;
    debug!(client_flags = format_args!("{client_flags:#x}"), "NBD client flags");

    Ok((client_flags & NBD_FLAG_C_NO_ZEROES) != 0)
}

/// Run the option haggling loop until the client picks an export.
async fn negotiate_options<S>(
    stream: &mut S,
    export: &NbdExport,
    no_zeroes: bool,
) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut header = [0u8; 16];
        stream.read_exact(&mut header).await?;

        let magic = u64::from_be_bytes([
            header[0], header[1], header[2], header[3], header[4], header[5], header[6],
            header[7],
        ]);
        if magic != NBD_OPTS_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_OPTS_MAGIC,
                actual: magic,
            });
        }

        let option = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        let length = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);

        // Bound allocation to prevent DoS from malicious clients
        if length as usize > OPTION_DATA_MAX_BYTES {
            return Err(NbdError::RequestTooLarge {
                length_bytes: length,
                max_bytes: OPTION_DATA_MAX_BYTES as u32,
            });
        }

        let mut data = vec![0u8; length as usize];
        stream.read_exact(&mut data).await?;

        debug!(option, length, "NBD option");

        match option {
            NBD_OPT_EXPORT_NAME => {
                info!(export = %String::from_utf8_lossy(&data), "export selected");
                let mut resp = [0u8; 10];
                resp[0..8].copy_from_slice(&export.size_bytes.to_be_bytes());
                resp[8..10].copy_from_slice(&export.transmission_flags().to_be_bytes());
                stream.write_all(&resp).await?;
                if !no_zeroes {
                    stream.write_all(&[0u8; NBD_EXPORT_NAME_PADDING]).await?;
                }
                return Ok(());
            }
            NBD_OPT_GO => {
                info!(export = %go_export_name(&data), "export selected");
                let mut info = [0u8; 12];
                info[0..2].copy_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
                info[2..10].copy_from_slice(&export.size_bytes.to_be_bytes());
                info[10..12].copy_from_slice(&export.transmission_flags().to_be_bytes());
                send_reply(stream, option, NBD_REP_INFO, &info).await?;
                send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                return Ok(());
            }
            _ => {
                warn!(option, "NBD option not supported, acknowledging");
                send_reply(stream, option, NBD_REP_ACK, &[]).await?;
            }
        }
    }
}

/// Export name carried in a GO payload, if the payload is well formed.
fn go_export_name(data: &[u8]) -> String {
    let Some(len) = data.get(0..4) else {
        return String::new();
    };
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    data.get(4..4 + len)
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .unwrap_or_default()
}

async fn send_reply<S>(
    stream: &mut S,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let mut header = [0u8; 20];
    header[0..8].copy_from_slice(&NBD_OPTION_REPLY_MAGIC.to_be_bytes());
    header[8..12].copy_from_slice(&option.to_be_bytes());
    header[12..16].copy_from_slice(&reply_type.to_be_bytes());
    header[16..20].copy_from_slice(&(data.len() as u32).to_be_bytes());
    stream.write_all(&header).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(())
}

async fn transmission<S>(
    stream: &mut S,
    device: &mut dyn BlockDevice,
    export: &NbdExport,
) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut req_buf = [0u8; NbdRequest::SIZE_BYTES];

    loop {
        match stream.read_exact(&mut req_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let req = match NbdRequest::from_bytes(&req_buf) {
            Ok(req) => req,
            Err(NbdError::UnsupportedCommand { command }) => {
                let cookie = NbdRequest::peek_cookie(&req_buf);
                warn!(command, cookie, "unsupported NBD command");
                stream
                    .write_all(&NbdReply::error(cookie, NBD_EINVAL).to_bytes())
                    .await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        debug!(
            command = ?req.command,
            cookie = req.cookie,
            offset = req.offset,
            length = req.length,
            "NBD request"
        );

        match req.command {
            NbdCommand::Read => {
                let length = req.length as usize;
                match read_export(device, req.offset, length).await {
                    Ok(data) => {
                        stream
                            .write_all(&NbdReply::ok(req.cookie).to_bytes())
                            .await?;
                        stream.write_all(&data).await?;
                    }
                    Err(e) => {
                        log_device_error("read", &e, req.offset, length);
                        stream
                            .write_all(&NbdReply::error(req.cookie, NBD_EIO).to_bytes())
                            .await?;
                        stream.write_all(&vec![0u8; length]).await?;
                    }
                }
            }
            NbdCommand::Write => {
                let len = req.length as usize;
                let mut data = BytesMut::zeroed(len);
                stream.read_exact(&mut data).await?;

                if export.read_only {
                    warn!(offset = req.offset, length = len, "write to read-only export");
                    stream
                        .write_all(&NbdReply::error(req.cookie, NBD_EINVAL).to_bytes())
                        .await?;
                    continue;
                }

                let err = match write_export(device, req.offset, &data).await {
                    Ok(()) => NBD_OK,
                    Err(e) => {
                        log_device_error("write", &e, req.offset, len);
                        NBD_EIO
                    }
                };
                stream
                    .write_all(
                        &NbdReply {
                            error: err,
                            cookie: req.cookie,
                        }
                        .to_bytes(),
                    )
                    .await?;
            }
            NbdCommand::Disconnect => return Ok(()),
            NbdCommand::Flush => {
                let err = match device.flush().await {
                    Ok(()) => NBD_OK,
                    Err(e) => {
                        warn!(error = %e, "flush error");
                        NBD_EIO
                    }
                };
                stream
                    .write_all(
                        &NbdReply {
                            error: err,
                            cookie: req.cookie,
                        }
                        .to_bytes(),
                    )
                    .await?;
            }
            NbdCommand::Trim => {
                warn!(cookie = req.cookie, "trim not supported");
                stream
                    .write_all(&NbdReply::error(req.cookie, NBD_EINVAL).to_bytes())
                    .await?;
            }
        }
    }
}

/// Requests past the end of the export are the client's mistake and only
/// logged at debug; anything else is a device fault.
fn log_device_error(op: &'static str, err: &DeviceError, offset: u64, length: usize) {
    if err.is_range_error() {
        debug!(op, error = %err, offset, length, "request out of range");
    } else {
        warn!(op, error = %err, offset, length, "device error");
    }
}

/// Sector-aligned reads go straight to the device; anything else takes the
/// byte-addressed path.
async fn read_export(
    device: &mut dyn BlockDevice,
    offset: u64,
    length: usize,
) -> Result<Bytes, DeviceError> {
    let ss = device.sector_size();
    if is_sector_aligned(offset, length as u64, ss) {
        let range = SectorRange::new(offset / ss as u64, length as u64 / ss as u64);
        return device.read_blocks(range.lba, range.count).await;
    }
    device.read(offset, length).await
}

async fn write_export(
    device: &mut dyn BlockDevice,
    offset: u64,
    data: &[u8],
) -> Result<(), DeviceError> {
    let ss = device.sector_size();
    if is_sector_aligned(offset, data.len() as u64, ss) {
        let range = SectorRange::new(offset / ss as u64, data.len() as u64 / ss as u64);
        return device.write_blocks(range.lba, range.count, data).await;
    }
    device.write(offset, data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileBlockDevice;
    use crate::types::SECTOR_SIZE;
    use nbd::NbdClient;
    use tempfile::TempDir;
    use tokio::io::{DuplexStream, duplex};

    const SECTORS: u64 = 64;

    /// Server over a patterned image: byte `i` of sector `s` is `s as u8`.
    async fn make_server(dir: &TempDir, read_only: bool) -> NbdServer {
        let path = dir.path().join("disk.img");
        let image: Vec<u8> = (0..SECTORS as usize * SECTOR_SIZE)
            .map(|i| (i / SECTOR_SIZE) as u8)
            .collect();
        std::fs::write(&path, image).unwrap();
        let device = FileBlockDevice::open(&path).await.unwrap();
        NbdServer::new(Box::new(device), read_only)
    }

    fn image(dir: &TempDir) -> Vec<u8> {
        std::fs::read(dir.path().join("disk.img")).unwrap()
    }

    async fn read_greeting(client: &mut DuplexStream) {
        let mut hello = [0u8; 18];
        client.read_exact(&mut hello).await.unwrap();
        assert_eq!(&hello[0..8], &NBD_MAGIC.to_be_bytes());
        assert_eq!(&hello[8..16], &NBD_OPTS_MAGIC.to_be_bytes());
        assert_eq!(u16::from_be_bytes([hello[16], hello[17]]), 0x0003);
    }

    async fn send_option(client: &mut DuplexStream, option: u32, data: &[u8]) {
        client.write_u64(NBD_OPTS_MAGIC).await.unwrap();
        client.write_u32(option).await.unwrap();
        client.write_u32(data.len() as u32).await.unwrap();
        client.write_all(data).await.unwrap();
    }

    async fn send_request(
        client: &mut DuplexStream,
        command: u16,
        cookie: u64,
        offset: u64,
        length: u32,
    ) {
        let mut req = [0u8; NbdRequest::SIZE_BYTES];
        req[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        req[6..8].copy_from_slice(&command.to_be_bytes());
        req[8..16].copy_from_slice(&cookie.to_be_bytes());
        req[16..24].copy_from_slice(&offset.to_be_bytes());
        req[24..28].copy_from_slice(&length.to_be_bytes());
        client.write_all(&req).await.unwrap();
    }

    async fn read_reply(client: &mut DuplexStream) -> NbdReply {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        client.read_exact(&mut buf).await.unwrap();
        NbdReply::from_bytes(&buf).unwrap()
    }

    #[tokio::test]
    async fn export_name_handshake_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(&dir, false).await;
        let (mut client, server_stream) = duplex(1024 * 1024);

        let client_side = async move {
            read_greeting(&mut client).await;
            client.write_u32(NBD_FLAG_C_FIXED_NEWSTYLE).await.unwrap();
            send_option(&mut client, NBD_OPT_EXPORT_NAME, b"export").await;

            assert_eq!(client.read_u64().await.unwrap(), SECTORS * 512);
            let flags = client.read_u16().await.unwrap();
            assert_eq!(flags & NBD_FLAG_HAS_FLAGS, NBD_FLAG_HAS_FLAGS);
            assert_eq!(flags & NBD_FLAG_READ_ONLY, 0);
            let mut padding = [0xFFu8; NBD_EXPORT_NAME_PADDING];
            client.read_exact(&mut padding).await.unwrap();
            assert!(padding.iter().all(|&b| b == 0));

            send_request(&mut client, NBD_CMD_READ, 0x1122334455667788, 0, 512).await;
            let mut raw = [0u8; NbdReply::SIZE_BYTES];
            client.read_exact(&mut raw).await.unwrap();
            assert_eq!(&raw[0..4], &[0x67, 0x44, 0x66, 0x98]);
            assert_eq!(&raw[4..8], &[0, 0, 0, 0]);
            assert_eq!(&raw[8..16], &0x1122334455667788u64.to_be_bytes());
            let mut sector = [0xFFu8; 512];
            client.read_exact(&mut sector).await.unwrap();
            assert!(sector.iter().all(|&b| b == 0));

            send_request(&mut client, NBD_CMD_DISCONNECT, 1, 0, 0).await;
        };

        let (result, ()) = tokio::join!(server.serve(server_stream), client_side);
        result.unwrap();
    }

    #[tokio::test]
    async fn no_zeroes_skips_padding() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(&dir, true).await;
        let (mut client, server_stream) = duplex(1024 * 1024);

        let client_side = async move {
            read_greeting(&mut client).await;
            client
                .write_u32(NBD_FLAG_C_FIXED_NEWSTYLE | NBD_FLAG_C_NO_ZEROES)
                .await
                .unwrap();
            send_option(&mut client, NBD_OPT_EXPORT_NAME, b"").await;

            assert_eq!(client.read_u64().await.unwrap(), SECTORS * 512);
            let flags = client.read_u16().await.unwrap();
            assert_eq!(flags & NBD_FLAG_READ_ONLY, NBD_FLAG_READ_ONLY);

            // The next bytes are already a reply, not padding.
            send_request(&mut client, NBD_CMD_FLUSH, 7, 0, 0).await;
            let reply = read_reply(&mut client).await;
            assert_eq!((reply.error, reply.cookie), (NBD_OK, 7));
        };

        let (result, ()) = tokio::join!(server.serve(server_stream), client_side);
        result.unwrap();
    }

    #[tokio::test]
    async fn unknown_options_are_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(&dir, false).await;
        let (mut client, server_stream) = duplex(1024 * 1024);

        let client_side = async move {
            read_greeting(&mut client).await;
            client.write_u32(NBD_FLAG_C_FIXED_NEWSTYLE).await.unwrap();

            for option in [NBD_OPT_LIST, 42] {
                send_option(&mut client, option, b"ignored").await;
                assert_eq!(client.read_u64().await.unwrap(), NBD_OPTION_REPLY_MAGIC);
                assert_eq!(client.read_u32().await.unwrap(), option);
                assert_eq!(client.read_u32().await.unwrap(), NBD_REP_ACK);
                assert_eq!(client.read_u32().await.unwrap(), 0);
            }

            send_option(&mut client, NBD_OPT_EXPORT_NAME, b"export").await;
            assert_eq!(client.read_u64().await.unwrap(), SECTORS * 512);
        };

        // The client hangs up after negotiating; that is a clean close.
        let (result, ()) = tokio::join!(server.serve(server_stream), client_side);
        result.unwrap();
    }

    #[tokio::test]
    async fn bad_option_magic_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(&dir, false).await;
        let (mut client, server_stream) = duplex(1024 * 1024);

        let client_side = async move {
            read_greeting(&mut client).await;
            client.write_u32(NBD_FLAG_C_FIXED_NEWSTYLE).await.unwrap();
            client.write_u64(0xdead_beef).await.unwrap();
            client.write_u64(0).await.unwrap();
            client
        };

        let (result, _client) = tokio::join!(server.serve(server_stream), client_side);
        assert!(matches!(result, Err(NbdError::InvalidMagic { .. })));
    }

    #[tokio::test]
    async fn bad_request_magic_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(&dir, false).await;
        let (mut client, server_stream) = duplex(1024 * 1024);

        let client_side = async move {
            read_greeting(&mut client).await;
            client.write_u32(NBD_FLAG_C_NO_ZEROES).await.unwrap();
            send_option(&mut client, NBD_OPT_EXPORT_NAME, b"").await;
            let mut resp = [0u8; 10];
            client.read_exact(&mut resp).await.unwrap();
            client.write_all(&[0xAA; NbdRequest::SIZE_BYTES]).await.unwrap();
            client
        };

        let (result, _client) = tokio::join!(server.serve(server_stream), client_side);
        assert!(matches!(result, Err(NbdError::InvalidMagic { .. })));
    }

    #[tokio::test]
    async fn oversized_request_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(&dir, false).await;
        let (mut client, server_stream) = duplex(1024 * 1024);

        let client_side = async move {
            read_greeting(&mut client).await;
            client.write_u32(NBD_FLAG_C_NO_ZEROES).await.unwrap();
            send_option(&mut client, NBD_OPT_EXPORT_NAME, b"").await;
            let mut resp = [0u8; 10];
            client.read_exact(&mut resp).await.unwrap();
            send_request(&mut client, NBD_CMD_READ, 1, 0, NBD_MAX_PAYLOAD_SIZE + 1).await;
            client
        };

        let (result, _client) = tokio::join!(server.serve(server_stream), client_side);
        assert!(matches!(result, Err(NbdError::RequestTooLarge { .. })));
    }

    #[tokio::test]
    async fn client_roundtrip_with_go() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(&dir, false).await;
        let (client, server_stream) = duplex(1024 * 1024);

        let client_side = async move {
            let mut client = NbdClient::connect(client, "anything").await.unwrap();
            assert_eq!(client.size_bytes, SECTORS * 512);
            assert!(client.supports_flush());
            assert!(!client.is_read_only());

            // Aligned
            client.write(4096, &[0xAB; 2048]).await.unwrap();
            assert_eq!(&client.read(4096, 2048).await.unwrap()[..], &[0xAB; 2048]);

            // Unaligned, spanning a sector boundary
            client.write(1000, b"0123456789abcdefghijklmnopqrstuvwxyz").await.unwrap();
            let data = client.read(990, 56).await.unwrap();
            assert_eq!(&data[..10], &[1u8; 10]);
            assert_eq!(&data[10..46], b"0123456789abcdefghijklmnopqrstuvwxyz");
            assert_eq!(&data[46..], &[2u8; 10]);

            client.flush().await.unwrap();
            client.disconnect().await.unwrap();
        };

        let (result, ()) = tokio::join!(server.serve(server_stream), client_side);
        result.unwrap();

        let image = image(&dir);
        assert!(image[4096..6144].iter().all(|&b| b == 0xAB));
        assert_eq!(&image[1000..1036], b"0123456789abcdefghijklmnopqrstuvwxyz");
    }

    #[tokio::test]
    async fn read_only_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(&dir, true).await;
        let before = image(&dir);
        let (client, server_stream) = duplex(1024 * 1024);

        let client_side = async move {
            let mut client = NbdClient::connect(client, "export").await.unwrap();
            assert!(client.is_read_only());
            let err = client.write(0, &[0xFF; 512]).await.unwrap_err();
            assert!(matches!(err, NbdError::ServerError { code: NBD_EINVAL }));

            // The payload was drained; the session is still in sync.
            assert_eq!(&client.read(0, 512).await.unwrap()[..], &[0u8; 512]);
            client.disconnect().await.unwrap();
        };

        let (result, ()) = tokio::join!(server.serve(server_stream), client_side);
        result.unwrap();
        assert_eq!(image(&dir), before);
    }

    #[tokio::test]
    async fn trim_and_unknown_commands_are_einval() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(&dir, false).await;
        let (mut client, server_stream) = duplex(1024 * 1024);

        let client_side = async move {
            read_greeting(&mut client).await;
            client.write_u32(NBD_FLAG_C_NO_ZEROES).await.unwrap();
            send_option(&mut client, NBD_OPT_EXPORT_NAME, b"").await;
            let mut resp = [0u8; 10];
            client.read_exact(&mut resp).await.unwrap();

            send_request(&mut client, NBD_CMD_TRIM, 10, 0, 512).await;
            let reply = read_reply(&mut client).await;
            assert_eq!((reply.error, reply.cookie), (NBD_EINVAL, 10));

            send_request(&mut client, 9, 11, 0, 512).await;
            let reply = read_reply(&mut client).await;
            assert_eq!((reply.error, reply.cookie), (NBD_EINVAL, 11));

            // Still serving.
            send_request(&mut client, NBD_CMD_READ, 12, 512, 512).await;
            let reply = read_reply(&mut client).await;
            assert_eq!((reply.error, reply.cookie), (NBD_OK, 12));
            let mut sector = [0u8; 512];
            client.read_exact(&mut sector).await.unwrap();
            assert!(sector.iter().all(|&b| b == 1));

            send_request(&mut client, NBD_CMD_DISCONNECT, 13, 0, 0).await;
        };

        let (result, ()) = tokio::join!(server.serve(server_stream), client_side);
        result.unwrap();
    }

    #[tokio::test]
    async fn out_of_range_read_is_eio_with_zero_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(&dir, false).await;
        let (mut client, server_stream) = duplex(1024 * 1024);

        let client_side = async move {
            read_greeting(&mut client).await;
            client.write_u32(NBD_FLAG_C_NO_ZEROES).await.unwrap();
            send_option(&mut client, NBD_OPT_EXPORT_NAME, b"").await;
            let mut resp = [0u8; 10];
            client.read_exact(&mut resp).await.unwrap();

            send_request(&mut client, NBD_CMD_READ, 3, (SECTORS - 1) * 512, 1024).await;
            let reply = read_reply(&mut client).await;
            assert_eq!((reply.error, reply.cookie), (NBD_EIO, 3));
            let mut payload = [0xFFu8; 1024];
            client.read_exact(&mut payload).await.unwrap();
            assert!(payload.iter().all(|&b| b == 0));

            send_request(&mut client, NBD_CMD_WRITE, 4, SECTORS * 512, 512).await;
            client.write_all(&[0xCC; 512]).await.unwrap();
            let reply = read_reply(&mut client).await;
            assert_eq!((reply.error, reply.cookie), (NBD_EIO, 4));

            send_request(&mut client, NBD_CMD_DISCONNECT, 5, 0, 0).await;
        };

        let (result, ()) = tokio::join!(server.serve(server_stream), client_side);
        result.unwrap();
    }

    #[tokio::test]
    async fn device_stays_open_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = make_server(&dir, false).await;

        for round in 0..2u8 {
            let (client, server_stream) = duplex(1024 * 1024);
            let client_side = async move {
                let mut client = NbdClient::connect(client, "export").await.unwrap();
                client.write(0, &[round; 512]).await.unwrap();
                client.disconnect().await.unwrap();
            };
            let (result, ()) = tokio::join!(server.serve(server_stream), client_side);
            result.unwrap();
        }
        assert_eq!(image(&dir)[0], 1);

        server.close().await.unwrap();
        let (client, server_stream) = duplex(1024 * 1024);
        let client_side = async move {
            let mut client = NbdClient::connect(client, "export").await.unwrap();
            assert!(matches!(
                client.read(0, 512).await,
                Err(NbdError::ServerError { code: NBD_EIO })
            ));
            client.disconnect().await.unwrap();
        };
        let (result, ()) = tokio::join!(server.serve(server_stream), client_side);
        result.unwrap();
    }
}
