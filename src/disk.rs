//! The writer: a dedicated task that owns the destination files.
//!
//! Sessions hand over assembled pieces through a [`DiskHandle`]; the task
//! hashes each piece, persists valid ones, and reports the verdict to the
//! coordinator through an alert channel. Hashing and file I/O run on the
//! blocking thread pool so the event loop is never stalled.
//!
//! The same module hosts the resume scan that runs before any peer session
//! is opened: it derives the already-complete pieces purely by reading and
//! hashing what is on disk, so no sidecar state files are needed.

use std::{
    fs::{self, File, OpenOptions},
    io,
    ops::Range,
    os::unix::io::AsRawFd,
    path::Path,
    sync::{Arc, Mutex},
};

use nix::sys::uio::{pread, pwrite};
use sha1::{Digest, Sha1};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task,
};

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, StorageInfo},
    Bitfield, FileIndex, PieceIndex, Sha1Hash,
};

pub(crate) type AlertReceiver = UnboundedReceiver<Alert>;
type AlertSender = UnboundedSender<Alert>;
type CommandReceiver = UnboundedReceiver<Command>;
type CommandSender = UnboundedSender<Command>;

/// The commands the disk task accepts.
enum Command {
    /// Verify and persist a fully assembled piece.
    WritePiece { index: PieceIndex, data: Vec<u8> },
    /// Sync all open files and stop the task.
    Shutdown,
}

/// What the disk task reports back to the coordinator.
pub(crate) enum Alert {
    /// The verdict on a piece: verified and written, or a hash mismatch.
    PieceCompletion { index: PieceIndex, is_valid: bool },
    /// Disk failure. Fatal to the whole engine.
    Error(Error),
}

/// A cheaply cloneable handle through which sessions queue pieces for
/// writing.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    pub fn write_piece(&self, index: PieceIndex, data: Vec<u8>) -> Result<()> {
        self.0
            .send(Command::WritePiece { index, data })
            .map_err(|_| Error::Channel)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.0.send(Command::Shutdown).map_err(|_| Error::Channel)
    }
}

/// The entity responsible for persisting downloaded pieces and verifying
/// their integrity.
pub(crate) struct Disk {
    storage: StorageInfo,
    /// The expected piece hashes, in piece order.
    piece_hashes: Arc<Vec<Sha1Hash>>,
    /// The destination files, in torrent order. Opened lazily on first
    /// write and pre-sized to their declared length.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    cmd_port: CommandReceiver,
    alert_chan: AlertSender,
}

impl Disk {
    pub fn new(
        storage: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
    ) -> (Self, DiskHandle, AlertReceiver) {
        debug_assert_eq!(piece_hashes.len(), storage.piece_count);
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let files = storage
            .files
            .iter()
            .map(|info| {
                Mutex::new(TorrentFile {
                    info: info.clone(),
                    handle: None,
                })
            })
            .collect();
        (
            Self {
                storage,
                piece_hashes: Arc::new(piece_hashes),
                files: Arc::new(files),
                cmd_port,
                alert_chan,
            },
            DiskHandle(cmd_chan),
            alert_port,
        )
    }

    /// Runs the disk task until shutdown or channel failure.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("starting disk task");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::WritePiece { index, data } => {
                    self.write_piece(index, data).await?;
                }
                Command::Shutdown => {
                    log::info!("shutting down disk task");
                    self.flush();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Verifies and writes a single piece on the blocking thread pool,
    /// then alerts the coordinator of the outcome.
    ///
    /// Invalid input (a bad piece index) must not kill the disk task; it is
    /// logged and dropped.
    async fn write_piece(
        &mut self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("saving piece {} ({} bytes) to disk", index, data.len());

        let file_range = match self.storage.files_intersecting_piece(index) {
            Ok(file_range) => file_range,
            Err(_) => {
                log::warn!("not saving piece with invalid index {}", index);
                return Ok(());
            }
        };
        debug_assert_eq!(
            data.len() as u32,
            self.storage.piece_len(index).expect("invalid piece index")
        );

        let torrent_offset = self.storage.torrent_piece_offset(index);
        let download_dir = self.storage.download_dir.clone();
        let files = Arc::clone(&self.files);
        let piece_hashes = Arc::clone(&self.piece_hashes);

        // hashing a whole piece and syncing it to disk are too expensive for
        // the event loop
        let write_result: io::Result<bool> = task::spawn_blocking(move || {
            let digest = Sha1::digest(&data);
            if digest.as_slice() != piece_hashes[index] {
                log::warn!(
                    "piece {} hash mismatch: expected {}, got {}",
                    index,
                    hex::encode(&piece_hashes[index]),
                    hex::encode(digest)
                );
                return Ok(false);
            }
            write_piece_to_files(
                &files,
                &download_dir,
                file_range,
                torrent_offset,
                &data,
            )?;
            Ok(true)
        })
        .await
        // the closure doesn't panic, so until better strategies are devised
        // unwrap here
        .expect("disk write task panicked");

        match write_result {
            Ok(is_valid) => {
                if is_valid {
                    log::debug!("piece {} written to disk", index);
                } else {
                    log::warn!("piece {} failed verification", index);
                }
                self.alert_chan
                    .send(Alert::PieceCompletion { index, is_valid })?;
            }
            Err(e) => {
                log::error!("disk write error for piece {}: {}", index, e);
                self.alert_chan.send(Alert::Error(Error::Storage(e)))?;
            }
        }

        Ok(())
    }

    /// Syncs every file that was opened during the download.
    fn flush(&self) {
        for file in self.files.iter() {
            let file = file.lock().unwrap();
            if let Some(handle) = &file.handle {
                if let Err(e) = handle.sync_all() {
                    log::warn!("failed to sync {:?}: {}", file.info.path, e);
                }
            }
        }
    }
}

/// A destination file and its lazily opened handle.
struct TorrentFile {
    info: FileInfo,
    handle: Option<File>,
}

impl TorrentFile {
    /// Opens the file on first touch, creating missing parent directories
    /// and pre-sizing it to its declared length (sparse where the platform
    /// supports it).
    fn ensure_open(&mut self, download_dir: &Path) -> io::Result<&File> {
        if self.handle.is_none() {
            let path = download_dir.join(&self.info.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            log::info!("opening file {:?}", path);
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            if handle.metadata()?.len() < self.info.len {
                handle.set_len(self.info.len)?;
            }
            self.handle = Some(handle);
        }
        Ok(self.handle.as_ref().expect("file was just opened"))
    }

    /// Writes the whole buffer at the given file offset, continuing through
    /// partial writes.
    fn write_all_at(
        &mut self,
        download_dir: &Path,
        buf: &[u8],
        offset: u64,
    ) -> io::Result<()> {
        let fd = self.ensure_open(download_dir)?.as_raw_fd();
        let mut written = 0;
        while written < buf.len() {
            let n = pwrite(
                fd,
                &buf[written..],
                (offset + written as u64) as i64,
            )
            .map_err(nix_to_io)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write piece bytes",
                ));
            }
            written += n;
        }
        Ok(())
    }
}

/// Writes a verified piece buffer into the files its byte range overlaps.
fn write_piece_to_files(
    files: &[Mutex<TorrentFile>],
    download_dir: &Path,
    file_range: Range<FileIndex>,
    mut torrent_offset: u64,
    data: &[u8],
) -> io::Result<()> {
    let mut written = 0;
    for file in files[file_range].iter() {
        let mut file = file.lock().unwrap();
        let slice = file
            .info
            .get_slice(torrent_offset, (data.len() - written) as u64);
        file.write_all_at(
            download_dir,
            &data[written..written + slice.len as usize],
            slice.offset,
        )?;
        written += slice.len as usize;
        torrent_offset += slice.len;
    }
    // the piece's files must cover the whole buffer
    debug_assert_eq!(written, data.len());
    Ok(())
}

/// Scans the destination for pieces that are already complete, by reading
/// each piece's byte range and comparing hashes. Missing or short files
/// simply yield unset bits; nothing is ever written.
///
/// This performs blocking I/O and is run on the blocking thread pool by the
/// engine, before any peer session is opened.
pub(crate) fn verify_existing_pieces(
    storage: &StorageInfo,
    piece_hashes: &[Sha1Hash],
) -> Result<Bitfield> {
    debug_assert_eq!(piece_hashes.len(), storage.piece_count);
    let mut own_pieces = Bitfield::repeat(false, storage.piece_count);

    let handles: Vec<Option<File>> = storage
        .files
        .iter()
        .map(|info| File::open(storage.download_dir.join(&info.path)).ok())
        .collect();
    if handles.iter().all(Option::is_none) {
        return Ok(own_pieces);
    }

    let mut buf = vec![0; storage.piece_len as usize];
    'pieces: for index in 0..storage.piece_count {
        let piece_len = storage.piece_len(index)? as usize;
        let mut torrent_offset = storage.torrent_piece_offset(index);
        let mut filled = 0;
        for file_index in storage.files_intersecting_piece(index)? {
            let handle = match &handles[file_index] {
                Some(handle) => handle,
                // a missing file leaves the piece incomplete
                None => continue 'pieces,
            };
            let slice = storage.files[file_index]
                .get_slice(torrent_offset, (piece_len - filled) as u64);
            if read_exact_at(
                handle,
                &mut buf[filled..filled + slice.len as usize],
                slice.offset,
            )
            .is_err()
            {
                // a short or unreadable file likewise
                continue 'pieces;
            }
            filled += slice.len as usize;
            torrent_offset += slice.len;
        }
        debug_assert_eq!(filled, piece_len);
        if Sha1::digest(&buf[..piece_len]).as_slice() == piece_hashes[index] {
            own_pieces.set(index, true);
        }
    }

    log::info!(
        "resume scan found {}/{} complete pieces",
        own_pieces.count_ones(),
        storage.piece_count
    );
    Ok(own_pieces)
}

/// Reads exactly `buf.len()` bytes at the given file offset, or fails.
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let mut filled = 0;
    while filled < buf.len() {
        let n = pread(fd, &mut buf[filled..], (offset + filled as u64) as i64)
            .map_err(nix_to_io)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(())
}

fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    /// Two files over two pieces:
    ///
    /// piece 0 covers a[0..10] + b[0..6], piece 1 covers b[6..20].
    fn storage(download_dir: PathBuf) -> StorageInfo {
        StorageInfo {
            piece_count: 2,
            piece_len: 16,
            last_piece_len: 14,
            download_len: 30,
            download_dir,
            files: vec![
                FileInfo {
                    path: PathBuf::from("archive/a"),
                    len: 10,
                    torrent_offset: 0,
                },
                FileInfo {
                    path: PathBuf::from("archive/b"),
                    len: 20,
                    torrent_offset: 10,
                },
            ],
        }
    }

    fn content() -> Vec<u8> {
        (0..30).collect()
    }

    fn hashes(content: &[u8], piece_len: usize) -> Vec<Sha1Hash> {
        content
            .chunks(piece_len)
            .map(|piece| {
                let mut hash = [0; 20];
                hash.copy_from_slice(&Sha1::digest(piece));
                hash
            })
            .collect()
    }

    fn file_mutexes(storage: &StorageInfo) -> Vec<Mutex<TorrentFile>> {
        storage
            .files
            .iter()
            .map(|info| {
                Mutex::new(TorrentFile {
                    info: info.clone(),
                    handle: None,
                })
            })
            .collect()
    }

    #[test]
    fn pieces_are_split_across_file_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path().to_path_buf());
        let content = content();
        let files = file_mutexes(&storage);

        for index in 0..2 {
            let piece_len = storage.piece_len(index).unwrap() as usize;
            let offset = storage.torrent_piece_offset(index);
            write_piece_to_files(
                &files,
                &storage.download_dir,
                storage.files_intersecting_piece(index).unwrap(),
                offset,
                &content[offset as usize..offset as usize + piece_len],
            )
            .unwrap();
        }

        assert_eq!(
            fs::read(dir.path().join("archive/a")).unwrap(),
            &content[..10]
        );
        assert_eq!(
            fs::read(dir.path().join("archive/b")).unwrap(),
            &content[10..]
        );
    }

    #[test]
    fn files_are_presized_on_first_touch() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path().to_path_buf());
        let content = content();
        let files = file_mutexes(&storage);

        // writing only piece 0 touches b, which must come out pre-sized to
        // its declared 20 bytes
        write_piece_to_files(
            &files,
            &storage.download_dir,
            storage.files_intersecting_piece(0).unwrap(),
            0,
            &content[..16],
        )
        .unwrap();

        let b = fs::metadata(dir.path().join("archive/b")).unwrap();
        assert_eq!(b.len(), 20);
    }

    #[test]
    fn resume_scan_reports_only_verifiable_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path().to_path_buf());
        let content = content();
        let piece_hashes = hashes(&content, 16);

        // an empty destination has nothing to resume
        let scanned = verify_existing_pieces(&storage, &piece_hashes).unwrap();
        assert_eq!(scanned.count_ones(), 0);

        // write piece 0 only: b is pre-sized, so piece 1's range reads as
        // zeroes and must not verify
        let files = file_mutexes(&storage);
        write_piece_to_files(
            &files,
            &storage.download_dir,
            storage.files_intersecting_piece(0).unwrap(),
            0,
            &content[..16],
        )
        .unwrap();
        let scanned = verify_existing_pieces(&storage, &piece_hashes).unwrap();
        assert!(scanned[0]);
        assert!(!scanned[1]);

        // completing piece 1 makes the scan report a full torrent
        write_piece_to_files(
            &files,
            &storage.download_dir,
            storage.files_intersecting_piece(1).unwrap(),
            16,
            &content[16..],
        )
        .unwrap();
        let scanned = verify_existing_pieces(&storage, &piece_hashes).unwrap();
        assert!(scanned.all());
    }
}
