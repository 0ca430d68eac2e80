use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use common::wire::{read_frame_blocking, write_frame_blocking};
use flate2::bufread::GzDecoder;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::TransferOptions;
use crate::error::TransferError;
use crate::frame::{TransferAck, TransferHeader, TransferTrailer};
use crate::sender::copy_hashing;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const DRAIN_LIMIT: u64 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedLayer {
    pub layer: u32,
    pub path: PathBuf,
    pub bytes: u64,
    pub origin: String,
}

/// Accepts pushed layers into a directory.
pub struct Receiver {
    listener: TcpListener,
    dir: PathBuf,
    opts: TransferOptions,
}

impl Receiver {
    /// Bind the listener now so senders can connect as soon as they learn
    /// about this node, even before [`Receiver::receive_layers`] runs.
    pub fn bind(
        addr: &str,
        dir: impl Into<PathBuf>,
        opts: TransferOptions,
    ) -> Result<Self, TransferError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!(
            "[transfer] receiver listening on {} into {}",
            listener.local_addr()?,
            dir.display()
        );
        Ok(Self {
            listener,
            dir,
            opts,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Accept sessions until every layer announced by the senders is on disk.
    /// Archives come back ordered by layer index.
    pub fn receive_blocking(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedLayer>, TransferError> {
        let started = Instant::now();
        let mut received: BTreeMap<u32, ReceivedLayer> = BTreeMap::new();
        let mut total: Option<u32> = None;

        loop {
            if total.is_some_and(|t| received.len() as u32 >= t) {
                break;
            }
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if started.elapsed() >= deadline {
                return Err(TransferError::Timeout {
                    received: received.len(),
                    total,
                });
            }

            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            match self.handle_session(stream, total) {
                Ok((header, layer)) => {
                    total = Some(header.total);
                    received.insert(layer.layer, layer);
                }
                Err(e) => warn!("[transfer] session from {peer} failed: {e}"),
            }
        }

        info!(
            "[transfer] received {} layers into {}",
            received.len(),
            self.dir.display()
        );
        Ok(received.into_values().collect())
    }

    /// Async wrapper around [`Receiver::receive_blocking`]; consumes the receiver.
    pub async fn receive_layers(
        self,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<Vec<ReceivedLayer>, TransferError> {
        tokio::task::spawn_blocking(move || self.receive_blocking(deadline, &cancel))
            .await
            .map_err(|e| TransferError::Join(e.to_string()))?
    }

    fn handle_session(
        &self,
        stream: TcpStream,
        expected_total: Option<u32>,
    ) -> Result<(TransferHeader, ReceivedLayer), TransferError> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.opts.io_timeout))?;
        stream.set_write_timeout(Some(self.opts.io_timeout))?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        let header: TransferHeader = read_frame_blocking(&mut reader)?;
        if let Err(reason) = check_header(&header, expected_total) {
            reply(&mut writer, header.layer, Some(reason.clone()));
            drain(&mut reader);
            return Err(TransferError::InvalidHeader(reason));
        }

        let part = self.dir.join(format!("layer-{}.tar.part", header.layer));
        let done = self.dir.join(format!("layer-{}.tar", header.layer));
        let bytes = match receive_body(&mut reader, &part, header.layer).and_then(|bytes| {
            fs::rename(&part, &done)?;
            Ok(bytes)
        }) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&part);
                reply(&mut writer, header.layer, Some(e.to_string()));
                drain(&mut reader);
                return Err(e);
            }
        };
        reply(&mut writer, header.layer, None);

        debug!(
            "[transfer] layer {}/{} from {} stored at {} ({bytes} bytes)",
            header.layer,
            header.total,
            header.origin,
            done.display()
        );
        let layer = ReceivedLayer {
            layer: header.layer,
            path: done,
            bytes,
            origin: header.origin.clone(),
        };
        Ok((header, layer))
    }
}

fn check_header(header: &TransferHeader, expected_total: Option<u32>) -> Result<(), String> {
    if header.total == 0 || header.layer == 0 || header.layer > header.total {
        return Err(format!(
            "layer {} out of range 1..={}",
            header.layer, header.total
        ));
    }
    match expected_total {
        Some(t) if t != header.total => Err(format!(
            "sender announced {} layers, earlier sessions announced {t}",
            header.total
        )),
        _ => Ok(()),
    }
}

fn receive_body(
    reader: &mut BufReader<TcpStream>,
    part: &Path,
    layer: u32,
) -> Result<u64, TransferError> {
    let mut file = BufWriter::new(File::create(part)?);
    let mut hasher = crc32fast::Hasher::new();
    let length = {
        let mut decoder = GzDecoder::new(&mut *reader);
        copy_hashing(&mut decoder, &mut file, &mut hasher)?
    };
    file.flush()?;
    file.get_ref().sync_all()?;

    let trailer: TransferTrailer = read_frame_blocking(reader)?;
    let crc = hasher.finalize();
    if trailer.length != length || trailer.crc32 != crc {
        return Err(TransferError::Integrity {
            layer,
            expected_len: trailer.length,
            actual_len: length,
            expected_crc: trailer.crc32,
            actual_crc: crc,
        });
    }
    Ok(length)
}

/// Read whatever the sender still has in flight so closing the socket does
/// not reset the connection before the sender reads its ack.
fn drain(reader: &mut BufReader<TcpStream>) {
    let _ = io::copy(&mut reader.take(DRAIN_LIMIT), &mut io::sink());
}

fn reply(writer: &mut TcpStream, layer: u32, failure: Option<String>) {
    let ack = TransferAck {
        layer,
        accepted: failure.is_none(),
        reason: failure,
    };
    if let Err(e) = write_frame_blocking(writer, &ack) {
        debug!("[transfer] could not ack layer {layer}: {e}");
    }
}
