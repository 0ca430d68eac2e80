use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::thread;

use common::wire::{read_frame_blocking, write_frame_blocking};
use flate2::Compression;
use flate2::write::GzEncoder;
use log::{debug, info, warn};

use crate::TransferOptions;
use crate::error::TransferError;
use crate::frame::{TransferAck, TransferHeader, TransferTrailer};

const COPY_BUF: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub layer: u32,
    /// Uncompressed archive size.
    pub raw_bytes: u64,
    /// Bytes written to the socket, frames included.
    pub wire_bytes: u64,
}

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `src` into `dst`, feeding every byte to `hasher`. Returns the byte count.
pub(crate) fn copy_hashing<R: Read + ?Sized, W: Write + ?Sized>(
    src: &mut R,
    dst: &mut W,
    hasher: &mut crc32fast::Hasher,
) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
}

fn dial(dest: &str, opts: &TransferOptions) -> Result<TcpStream, TransferError> {
    let attempts = opts.dial_attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        let result = dest.to_socket_addrs().and_then(|addrs| {
            let mut err = io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing");
            for addr in addrs {
                match TcpStream::connect_timeout(&addr, opts.connect_timeout) {
                    Ok(stream) => return Ok(stream),
                    Err(e) => err = e,
                }
            }
            Err(err)
        });
        match result {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!("[transfer] dial {dest} attempt {attempt}/{attempts} failed: {e}");
                last = Some(e);
                if attempt < attempts {
                    thread::sleep(opts.retry_backoff * attempt);
                }
            }
        }
    }
    Err(TransferError::Connect {
        addr: dest.to_string(),
        source: last.unwrap_or_else(|| io::Error::other("no dial attempt made")),
    })
}

/// Push one archived layer to the receiver at `dest` and wait for its ack.
pub fn send_file_blocking(
    dest: &str,
    file: &Path,
    header: &TransferHeader,
    opts: &TransferOptions,
) -> Result<SendReport, TransferError> {
    let mut source = BufReader::new(File::open(file)?);
    let stream = dial(dest, opts)?;
    stream.set_read_timeout(Some(opts.io_timeout))?;
    stream.set_write_timeout(Some(opts.io_timeout))?;
    stream.set_nodelay(true)?;
    debug!(
        "[transfer] sending layer {}/{} ({}) to {dest}",
        header.layer,
        header.total,
        file.display()
    );

    let mut writer = CountingWriter {
        inner: BufWriter::new(stream.try_clone()?),
        count: 0,
    };
    write_frame_blocking(&mut writer, header)?;

    let mut hasher = crc32fast::Hasher::new();
    let mut encoder = GzEncoder::new(&mut writer, Compression::new(opts.compression_level));
    let raw_bytes = copy_hashing(&mut source, &mut encoder, &mut hasher)?;
    encoder.finish()?;

    let trailer = TransferTrailer {
        length: raw_bytes,
        crc32: hasher.finalize(),
    };
    write_frame_blocking(&mut writer, &trailer)?;
    let wire_bytes = writer.count;
    drop(writer);

    let mut reader = BufReader::new(&stream);
    let ack: TransferAck = read_frame_blocking(&mut reader)?;
    let _ = stream.shutdown(Shutdown::Both);
    if !ack.accepted || ack.layer != header.layer {
        return Err(TransferError::Rejected {
            layer: header.layer,
            reason: ack
                .reason
                .unwrap_or_else(|| format!("acknowledged layer {}", ack.layer)),
        });
    }

    info!(
        "[transfer] layer {} sent to {dest}: {raw_bytes} bytes raw, {wire_bytes} bytes on the wire",
        header.layer
    );
    Ok(SendReport {
        layer: header.layer,
        raw_bytes,
        wire_bytes,
    })
}

/// Async wrapper around [`send_file_blocking`].
pub async fn send_layer(
    dest: String,
    file: PathBuf,
    header: TransferHeader,
    opts: TransferOptions,
) -> Result<SendReport, TransferError> {
    tokio::task::spawn_blocking(move || send_file_blocking(&dest, &file, &header, &opts))
        .await
        .map_err(|e| TransferError::Join(e.to_string()))?
}
