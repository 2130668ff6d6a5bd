//! The engine's entry points: wiring the resume scan, the disk task, the
//! tracker and the coordinator together for one download.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::{sync::RwLock, task};

use crate::{
    conf::Conf,
    disk::{self, Disk},
    error::Result,
    metainfo::Metainfo,
    piece_map::PieceMap,
    storage_info::StorageInfo,
    torrent::{Torrent, TorrentContext},
    tracker::Tracker,
};

/// Downloads the torrent described by the metainfo into the configured
/// directory and returns when the content is complete and flushed.
///
/// The destination is scanned first: pieces that already verify against the
/// metainfo are kept as they are, and if everything is already there the
/// engine returns without opening a single connection.
///
/// Peers are discovered through the metainfo's tracker, if it has one;
/// `extra_peers` are dialed directly, which allows tracker-less operation
/// when the caller already knows seeds.
pub async fn download(
    conf: Conf,
    metainfo: Metainfo,
    extra_peers: Vec<SocketAddr>,
) -> Result<()> {
    let info_hash = metainfo.info_hash()?;
    log::info!(
        "downloading torrent {} ({})",
        metainfo.info.name,
        hex::encode(&info_hash)
    );

    let storage =
        StorageInfo::new(&metainfo, conf.torrent.download_dir.clone());
    let piece_hashes = metainfo.piece_hashes();

    // derive already-complete pieces by hashing what's on disk
    let resumed = {
        let storage = storage.clone();
        let piece_hashes = piece_hashes.clone();
        task::spawn_blocking(move || {
            disk::verify_existing_pieces(&storage, &piece_hashes)
        })
        .await
        .expect("resume scan task panicked")?
    };

    let mut piece_map = PieceMap::new(&storage);
    let mut resumed_len = 0;
    for index in 0..storage.piece_count {
        if resumed[index] {
            piece_map.mark_resumed(index);
            resumed_len += u64::from(storage.piece_len(index)?);
        }
    }
    if piece_map.is_complete() {
        log::info!("destination already holds the complete torrent");
        return Ok(());
    }
    let left = storage.download_len - resumed_len;

    let tracker = metainfo.trackers().into_iter().next().map(|url| {
        Tracker::new(url, info_hash, conf.engine.client_id, conf.engine.port)
    });

    let (mut disk, disk_handle, disk_alert_port) =
        Disk::new(storage.clone(), piece_hashes);
    let disk_join = task::spawn(async move { disk.start().await });

    let ctx = Arc::new(TorrentContext {
        info_hash,
        client_id: conf.engine.client_id,
        storage,
    });
    let mut torrent = Torrent::new(
        ctx,
        conf.torrent,
        Arc::new(RwLock::new(piece_map)),
        disk_handle.clone(),
        disk_alert_port,
        tracker,
        extra_peers,
        left,
    );
    let result = torrent.start().await;

    // flush whatever was opened, even on the error path
    disk_handle.shutdown().ok();
    let disk_result = disk_join.await.expect("disk task panicked");
    result.and(disk_result)
}

/// Scans the destination and reports how many of the torrent's pieces are
/// already complete, without opening any connection or writing anything.
pub async fn verify(conf: &Conf, metainfo: &Metainfo) -> Result<(usize, usize)> {
    let storage =
        StorageInfo::new(metainfo, conf.torrent.download_dir.clone());
    let piece_hashes = metainfo.piece_hashes();
    let piece_count = storage.piece_count;

    let resumed = task::spawn_blocking(move || {
        disk::verify_existing_pieces(&storage, &piece_hashes)
    })
    .await
    .expect("verify scan task panicked")?;

    Ok((resumed.count_ones(), piece_count))
}
