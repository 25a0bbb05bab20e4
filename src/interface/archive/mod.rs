//! Frame file transfers requested by an OBCP
// (c) 2025 Ross Younger
//!
//! The OBCP sends a DS manifest listing `(path, size, frame id)` for each file.
//! We acknowledge it, fetch the files in groups (in parallel within a group),
//! and finish with a DE message carrying the aggregate result and one result per file.
//!
//! Every file gets its own record in the transaction store, published on
//! [`FRAMES_CHANNEL`] as the transfer progresses and discarded when it is done.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument as _, debug, error, info, warn};

use super::collaborators::{FrameIndex, TransferRecord};
use super::link::{Inbound, SossHandler, SossSender};
use super::{Error, HostFilter};
use crate::protocol::soss::{FileSpec, PacketType, SequenceNumber, SossBody, SossMessage};
use crate::store::{TransactionStore, fields};
use crate::util::stats::batch_summary;
use crate::util::time::{aside_path, now_seconds};

mod inband;
mod transfer;

pub use inband::{FitsProgram, InbandReceiver, inband_channel};
pub use transfer::{Fetch, TransferMethod, command_line, default_username, fetch_file};

/// Event channel carrying per-frame transfer records
pub const FRAMES_CHANNEL: &str = "frames";
/// Manifest path meaning the file will arrive in-band
pub const MEMORY_DATA: &str = "MEMORY-DATA";

/// Store tag for a frame
#[must_use]
pub fn frame_tag(frame_id: &str) -> String {
    format!("mon.frame.{frame_id}.INSint")
}

/// Archive behaviour, as configured
#[derive(Clone, Debug)]
pub struct ArchiveSettings {
    /// Where fetched files go
    pub fits_dir: PathBuf,
    /// How files are fetched
    pub method: TransferMethod,
    /// Login name for the transfer; empty means [`default_username`]
    pub username: String,
    /// Non-standard port for the transfer protocol
    pub transfer_port: Option<u16>,
    /// Most files fetched at once
    pub group_size: usize,
    /// Time limit for each group
    pub data_timeout: Duration,
    /// Time limit for each in-band frame
    pub inband_timeout: Duration,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            fits_dir: PathBuf::from("/tmp"),
            method: TransferMethod::default(),
            username: String::new(),
            transfer_port: None,
            group_size: 10,
            data_timeout: Duration::from_secs(240),
            inband_timeout: Duration::from_secs(25),
        }
    }
}

/// Fetches single files and does the bookkeeping around each one
#[derive(Debug)]
pub struct FileSaver {
    my_host: String,
    settings: ArchiveSettings,
    store: Arc<TransactionStore>,
    index: Arc<dyn FrameIndex>,
    inband: Option<InbandReceiver>,
}

impl FileSaver {
    /// Constructor
    #[must_use]
    pub fn new(
        my_host: &str,
        settings: ArchiveSettings,
        store: Arc<TransactionStore>,
        index: Arc<dyn FrameIndex>,
    ) -> Self {
        Self {
            my_host: my_host.to_string(),
            settings,
            store,
            index,
            inband: None,
        }
    }

    /// Enables in-band receipt of files
    #[must_use]
    pub fn with_inband(mut self, receiver: InbandReceiver) -> Self {
        self.inband = Some(receiver);
        self
    }

    /// Where a frame is stored
    #[must_use]
    pub fn destination(&self, frame_id: &str) -> PathBuf {
        self.settings.fits_dir.join(format!("{frame_id}.fits"))
    }

    /// Fetches one file. Returns its status (0 for success).
    pub async fn save(&self, file: &FileSpec, from_host: &str) -> i32 {
        let tag = frame_tag(&file.frame_id);
        let dest = self.destination(&file.frame_id);
        self.store.setvals(
            &[FRAMES_CHANNEL],
            &tag,
            fields(json!({
                "time_start": now_seconds(),
                "file_path": dest.display().to_string(),
                "src_path": file.path,
            })),
        );

        let mut record = TransferRecord {
            frame_id: file.frame_id.clone(),
            dst_host: self.my_host.clone(),
            ..Default::default()
        };
        let (status, message) = match self.fetch(file, from_host, &dest, &mut record).await {
            Ok(()) => {
                let msg = format!("received file {}.fits", file.frame_id);
                info!("{msg}");
                record.res_code = 0;
                (0, msg)
            }
            Err(e) => {
                let msg = format!("reception error for file {}.fits: {e}", file.frame_id);
                error!("{msg}");
                record.res_code = -1;
                (1, msg)
            }
        };
        record.res_str.clone_from(&message);
        if record.time_done.is_empty() {
            record.time_done = Local::now().to_rfc3339();
        }
        if let Err(e) = self.index.record_transfer(&record) {
            warn!("failed to record transfer of {}: {e:#}", file.frame_id);
        }

        self.store.setvals(
            &[FRAMES_CHANNEL],
            &tag,
            fields(json!({
                "time_done": now_seconds(),
                "file_size": file.size,
                "status": status,
                "message": message,
                "done": true,
            })),
        );
        self.store.discard(&tag);
        status
    }

    async fn fetch(
        &self,
        file: &FileSpec,
        from_host: &str,
        dest: &Path,
        record: &mut TransferRecord,
    ) -> Result<(), Error> {
        if dest.exists() {
            let aside = aside_path(dest, &Local::now());
            warn!(
                "file {} exists; renaming to {}",
                dest.display(),
                aside.display()
            );
            tokio::fs::rename(dest, &aside).await?;
        }

        if file.path == MEMORY_DATA || self.settings.method == TransferMethod::Rpc {
            self.fetch_inband(file, from_host, dest, record).await?;
        } else {
            let username = if self.settings.username.is_empty() {
                default_username()
            } else {
                self.settings.username.clone()
            };
            let fetch = Fetch {
                host: from_host,
                path: &file.path,
                dest,
                username: &username,
                port: self.settings.transfer_port,
            };
            fetch_file(self.settings.method, &fetch, record).await?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o440)).await?;
        }
        let actual = tokio::fs::metadata(dest).await?.len();
        if actual != file.size {
            return Err(Error::SizeMismatch {
                expected: file.size,
                actual,
            });
        }
        Ok(())
    }

    async fn fetch_inband(
        &self,
        file: &FileSpec,
        from_host: &str,
        dest: &Path,
        record: &mut TransferRecord,
    ) -> Result<(), Error> {
        info!("waiting for {} in-band", file.frame_id);
        record.time_start = Local::now().to_rfc3339();
        record.src_host = from_host.to_string();
        record.src_path = file.path.clone();
        record.dst_path = dest.display().to_string();
        record.xfer_method = TransferMethod::Rpc.to_string();
        let Some(receiver) = &self.inband else {
            return Err(Error::Transfer("in-band transfer is not enabled".into()));
        };
        let result = receiver
            .receive(&file.frame_id, dest, self.settings.inband_timeout)
            .await;
        record.time_done = Local::now().to_rfc3339();
        let _ = result?;
        Ok(())
    }
}

/// The file transfer interface
#[derive(Debug)]
pub struct Archive {
    seq: SequenceNumber,
    filter: HostFilter,
    saver: Arc<FileSaver>,
    sender: Arc<SossSender>,
}

impl Archive {
    /// Constructor
    #[must_use]
    pub fn new(saver: FileSaver, filter: HostFilter, sender: Arc<SossSender>) -> Self {
        Self {
            seq: SequenceNumber::default(),
            filter,
            saver: Arc::new(saver),
            sender,
        }
    }

    async fn reply(&self, to: &str, body: SossBody) -> Result<(), Error> {
        let m = SossMessage::new(
            &self.saver.my_host,
            to,
            self.seq.bump(),
            PacketType::Data,
            body,
        );
        Ok(self.sender.send(&m).await?)
    }

    /// Fetches one group of files concurrently.
    ///
    /// Each file gets its own task, so a group never waits for a worker pool slot.
    /// Files that have not finished when the group times out count as failed;
    /// their tasks run on and tidy up their own store records.
    async fn run_group(&self, files: &[FileSpec], from_host: &str) -> Vec<i32> {
        let deadline = Instant::now() + self.saver.settings.data_timeout;
        let waiters: Vec<_> = files
            .iter()
            .map(|file| {
                let (tx, rx) = oneshot::channel();
                let saver = self.saver.clone();
                let file = file.clone();
                let from = from_host.to_string();
                drop(tokio::spawn(
                    async move {
                        let status = saver.save(&file, &from).await;
                        let _ = tx.send(status);
                    }
                    .in_current_span(),
                ));
                rx
            })
            .collect();

        let mut timed_out = false;
        let mut results = Vec::with_capacity(files.len());
        for (file, mut rx) in files.iter().zip(waiters) {
            let status = if timed_out {
                rx.try_recv().ok()
            } else {
                match timeout_at(deadline, &mut rx).await {
                    Ok(status) => status.ok(),
                    Err(_) => {
                        error!("timed out waiting for file transfers");
                        timed_out = true;
                        rx.try_recv().ok()
                    }
                }
            };
            results.push(status.unwrap_or_else(|| {
                error!("no result for {} when the group finished", file.frame_id);
                1
            }));
        }
        results
    }

    async fn process(&self, message: Inbound) -> Result<(), Error> {
        let sender = message.sender();
        if !self.filter.allows(&sender) {
            warn!("host {sender} not in filter list; dropping request");
            return Ok(());
        }
        if message.msg_type != "DS" {
            return Err(Error::UnexpectedMessage {
                kind: message.msg_type,
                sender,
            });
        }
        let seq = message.header.seq_num;
        let cmd_time = now_seconds();
        let files = match message.body {
            Ok(SossBody::FileManifest { files }) => files,
            Ok(other) => {
                return Err(Error::UnexpectedMessage {
                    kind: other.msg_type().to_string(),
                    sender,
                });
            }
            Err(e) => {
                error!("payload format error: {e}");
                self.reply(&sender, SossBody::Ack { seq, result: 1 }).await?;
                return Ok(());
            }
        };
        let ack_time = now_seconds();
        self.reply(&sender, SossBody::Ack { seq, result: 0 }).await?;

        let store = &self.saver.store;
        let mut total_bytes = 0;
        for file in &files {
            total_bytes += file.size;
            store.setvals(
                &[FRAMES_CHANNEL],
                &frame_tag(&file.frame_id),
                fields(json!({
                    "cmd_time": cmd_time,
                    "ack_time": ack_time,
                    "seq_num": seq,
                    "payload": message.payload,
                })),
            );
        }
        if files.is_empty() {
            info!("empty frame list");
            return self
                .reply(
                    &sender,
                    SossBody::DataEnd {
                        seq,
                        result: 0,
                        statuses: Vec::new(),
                    },
                )
                .await;
        }

        let group_size = self.saver.settings.group_size.max(1);
        let rounds = files.len().div_ceil(group_size);
        let started = Instant::now();
        let mut statuses = Vec::with_capacity(files.len());
        for (k, group) in files.chunks(group_size).enumerate() {
            info!("round {}/{rounds} (group of {})", k + 1, group.len());
            statuses.extend(self.run_group(group, &sender).await);
        }
        let elapsed = started.elapsed();

        let result = i32::from(statuses.iter().any(|s| *s != 0));
        debug!("file results {statuses:?}");
        self.reply(
            &sender,
            SossBody::DataEnd {
                seq,
                result,
                statuses,
            },
        )
        .await?;
        if result != 0 {
            return Err(Error::Transfer("file transfer request failed".into()));
        }
        info!("{}", batch_summary(files.len(), total_bytes, elapsed));
        Ok(())
    }
}

#[async_trait]
impl SossHandler for Archive {
    async fn handle(&self, message: Inbound) {
        let seq = message.header.seq_num;
        let from = message.sender();
        if let Err(e) = self.process(message).await {
            error!("file transfer seq {seq} from {from}: {e}");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{
        Archive, ArchiveSettings, FRAMES_CHANNEL, FileSaver, InbandReceiver, TransferMethod,
        frame_tag, inband_channel,
    };
    use crate::container::WorkerPool;
    use crate::interface::HostFilter;
    use crate::interface::collaborators::{FrameIndex, TransferRecord};
    use crate::interface::link::{Inbound, SossHandler as _, SossSender};
    use crate::protocol::soss::{FileSpec, PacketType, SossBody, SossMessage};
    use crate::store::TransactionStore;
    use crate::transport::LazyClient;
    use crate::util::test_protocol::SossRecorder;

    #[derive(Debug, Default)]
    struct Index(Mutex<Vec<TransferRecord>>);

    impl FrameIndex for Index {
        fn record_transfer(&self, record: &TransferRecord) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct Fixture {
        archive: Archive,
        recorder: SossRecorder,
        store: Arc<TransactionStore>,
        index: Arc<Index>,
    }

    fn fixture(settings: ArchiveSettings, filter: HostFilter) -> Fixture {
        fixture_with(settings, filter, None)
    }

    fn fixture_with(
        settings: ArchiveSettings,
        filter: HostFilter,
        inband: Option<InbandReceiver>,
    ) -> Fixture {
        let recorder = SossRecorder::default();
        let store = Arc::new(TransactionStore::new());
        let index = Arc::new(Index::default());
        let mut saver = FileSaver::new("obs", settings, store.clone(), index.clone());
        if let Some(rx) = inband {
            saver = saver.with_inband(rx);
        }
        let sender = Arc::new(SossSender::new(
            0x2102_0941,
            LazyClient::new(Box::new(recorder.clone())),
        ));
        Fixture {
            archive: Archive::new(saver, filter, sender),
            recorder,
            store,
            index,
        }
    }

    fn copy_settings(dir: &Path) -> ArchiveSettings {
        ArchiveSettings {
            fits_dir: dir.to_path_buf(),
            method: TransferMethod::Copy,
            group_size: 2,
            data_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn manifest(from: &str, files: Vec<FileSpec>) -> Inbound {
        let body = SossBody::FileManifest { files };
        let m = SossMessage::new(from, "obs", 99, PacketType::Data, body);
        Inbound::parse(&m.format()).unwrap()
    }

    #[tokio::test]
    async fn partial_success_is_reported_per_file() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for i in 1..=5u64 {
            let path = src.path().join(format!("frame{i}.fits"));
            std::fs::write(&path, vec![b'x'; 100 * i as usize]).unwrap();
            files.push(FileSpec {
                path: path.display().to_string(),
                // the manifest misstates the size of the third file
                size: if i == 3 { 1 } else { 100 * i },
                frame_id: format!("IRCA0000000{i}"),
            });
        }
        // a file already in the way gets moved aside
        std::fs::write(dst.path().join("IRCA00000001.fits"), b"old").unwrap();

        let f = fixture(copy_settings(dst.path()), HostFilter::allow_all());
        let mut frames = f.store.events().subscribe(&[FRAMES_CHANNEL]);
        f.archive.handle(manifest("OBCP9", files)).await;

        let bodies = f.recorder.bodies();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], SossBody::Ack { seq: 99, result: 0 });
        assert_eq!(
            bodies[1],
            SossBody::DataEnd {
                seq: 99,
                result: 1,
                statuses: vec![0, 0, 1, 0, 0]
            }
        );
        assert!(f.recorder.messages().iter().all(|(h, m)| h == "obcp9"
            && m.header.packet_type == PacketType::Data));

        assert_eq!(std::fs::read(dst.path().join("IRCA00000005.fits")).unwrap().len(), 500);
        let moved_aside = std::fs::read_dir(dst.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("IRCA00000001.fits."))
            .count();
        assert_eq!(moved_aside, 1);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mode = std::fs::metadata(dst.path().join("IRCA00000002.fits"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o440);
        }

        let index = f.index.0.lock().unwrap();
        assert_eq!(index.len(), 5);
        let third = index.iter().find(|r| r.frame_id == "IRCA00000003").unwrap();
        assert_eq!(third.res_code, -1);
        assert!(third.res_str.contains("size mismatch"));
        assert!(index.iter().filter(|r| r.res_code == 0).count() == 4);
        assert!(index.iter().all(|r| r.xfer_method == "copy" && r.dst_host == "obs"));

        // every frame record was published and then dropped from the store
        assert!(f.store.is_empty());
        let mut done = 0;
        while let Some(ev) = frames.try_recv() {
            if ev.fields.get("done").is_some() {
                done += 1;
            }
        }
        assert_eq!(done, 5);
        assert!(!f.store.contains(&frame_tag("IRCA00000001")));
    }

    #[tokio::test]
    async fn filtered_host_gets_nothing() {
        let dst = tempfile::tempdir().unwrap();
        let f = fixture(copy_settings(dst.path()), HostFilter::new(["obcp1"]));
        let files = vec![FileSpec {
            path: "/nonexistent".into(),
            size: 1,
            frame_id: "IRCA00000001".into(),
        }];
        f.archive.handle(manifest("obcp2", files)).await;
        assert!(f.recorder.messages().is_empty());
        assert!(f.index.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_manifest_is_refused() {
        let dst = tempfile::tempdir().unwrap();
        let f = fixture(copy_settings(dst.path()), HostFilter::allow_all());
        let mut bad = manifest("obcp9", vec![]);
        bad.header.seq_num = 5;
        bad.payload = "/a,12".into();
        bad.body = SossBody::parse("DS", &bad.payload);
        assert!(bad.body.is_err());
        f.archive.handle(bad).await;
        assert_eq!(f.recorder.bodies(), vec![SossBody::Ack { seq: 5, result: 1 }]);
    }

    #[tokio::test]
    async fn group_timeout_fails_pending_files() {
        let dst = tempfile::tempdir().unwrap();
        let settings = ArchiveSettings {
            fits_dir: dst.path().to_path_buf(),
            method: TransferMethod::Rpc,
            data_timeout: Duration::from_millis(50),
            inband_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        // nothing is ever sent to the FITS data program
        let (_program, receiver) = inband_channel(0x2101_0951);
        let f = fixture_with(settings, HostFilter::allow_all(), Some(receiver));
        let files = vec![FileSpec {
            path: super::MEMORY_DATA.into(),
            size: 10,
            frame_id: "IRCA00000001".into(),
        }];
        f.archive.handle(manifest("obcp9", files)).await;
        assert_eq!(
            f.recorder.bodies()[1],
            SossBody::DataEnd {
                seq: 99,
                result: 1,
                statuses: vec![1]
            }
        );
    }

    #[tokio::test]
    async fn group_timeout_keeps_finished_siblings() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let local = src.path().join("frame2.fits");
        std::fs::write(&local, [b'x'; 64]).unwrap();
        let settings = ArchiveSettings {
            data_timeout: Duration::from_millis(300),
            inband_timeout: Duration::from_secs(30),
            ..copy_settings(dst.path())
        };
        // the in-band frame never arrives
        let (_program, receiver) = inband_channel(0x2101_0951);
        let f = fixture_with(settings, HostFilter::allow_all(), Some(receiver));
        let files = vec![
            FileSpec {
                path: super::MEMORY_DATA.into(),
                size: 10,
                frame_id: "IRCA00000001".into(),
            },
            FileSpec {
                path: local.display().to_string(),
                size: 64,
                frame_id: "IRCA00000002".into(),
            },
        ];
        f.archive.handle(manifest("obcp9", files)).await;
        assert_eq!(
            f.recorder.bodies()[1],
            SossBody::DataEnd {
                seq: 99,
                result: 1,
                statuses: vec![1, 0]
            }
        );
        assert!(dst.path().join("IRCA00000002.fits").exists());
    }

    #[tokio::test]
    async fn handler_on_a_single_worker_pool_completes() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for i in 1..=3u64 {
            let path = src.path().join(format!("frame{i}.fits"));
            std::fs::write(&path, vec![b'x'; 10]).unwrap();
            files.push(FileSpec {
                path: path.display().to_string(),
                size: 10,
                frame_id: format!("IRCA0000000{i}"),
            });
        }
        let Fixture {
            archive, recorder, ..
        } = fixture(copy_settings(dst.path()), HostFilter::allow_all());
        let archive = Arc::new(archive);

        let pool = WorkerPool::new(1);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let message = manifest("obcp9", files);
        pool.submit(async move {
            archive.handle(message).await;
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            recorder.bodies()[1],
            SossBody::DataEnd {
                seq: 99,
                result: 0,
                statuses: vec![0, 0, 0]
            }
        );
        pool.shutdown().await;
    }
}
