//! Background parquet writer for the analytics store.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use arrow::record_batch::RecordBatch;
use chrono::{NaiveDate, TimeZone, Utc};
use parquet::arrow::AsyncArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use tokio::fs::{self, File};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::encoding::{
    delta_schema, deltas_to_batch, snapshot_schema, snapshots_to_batch, DeltaRow, SnapshotRow,
};

/// Configuration for the columnar sink worker.
#[derive(Clone, Debug)]
pub struct SinkConfig {
    /// Root directory holding the partitioned parquet tree.
    pub root: PathBuf,
    /// Rows buffered in memory before a forced flush.
    pub max_buffered_rows: usize,
    /// Interval flush under low traffic.
    pub flush_interval: Duration,
    /// Rows per file before rotating.
    pub max_rows_per_file: usize,
    /// Capacity of the inbound channel.
    pub channel_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/orderbooks"),
            max_buffered_rows: 1024,
            flush_interval: Duration::from_secs(5),
            max_rows_per_file: 250_000,
            channel_capacity: 4096,
        }
    }
}

/// Owner side of the sink; keep it alive for the worker's lifetime and
/// call [`ColumnarSink::shutdown`] to drain buffers.
pub struct ColumnarSink {
    handle: SinkHandle,
    task: Option<JoinHandle<Result<()>>>,
}

impl ColumnarSink {
    pub async fn spawn(config: SinkConfig) -> Result<Self> {
        fs::create_dir_all(&config.root)
            .await
            .with_context(|| format!("failed to create {}", config.root.display()))?;
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let worker = SinkWorker::new(config, rx).await?;
        let task = tokio::spawn(async move { worker.run().await });
        Ok(Self {
            handle: SinkHandle { sender: tx },
            task: Some(task),
        })
    }

    #[must_use]
    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    /// Stop the worker and wait for the final flush.
    pub async fn shutdown(mut self) -> Result<()> {
        drop(self.handle);
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(result) => result?,
                Err(err) => return Err(anyhow!("columnar sink task aborted: {err}")),
            }
        }
        Ok(())
    }
}

static DELTA_SATURATION: AtomicBool = AtomicBool::new(false);
static SNAPSHOT_SATURATION: AtomicBool = AtomicBool::new(false);

/// Clonable enqueue side used by the monitor subscriber.
#[derive(Clone)]
pub struct SinkHandle {
    sender: mpsc::Sender<SinkMessage>,
}

impl SinkHandle {
    pub fn record_delta(&self, row: DeltaRow) {
        self.enqueue(SinkMessage::Delta(row), "delta", &DELTA_SATURATION);
    }

    pub fn record_snapshot(&self, row: SnapshotRow) {
        self.enqueue(SinkMessage::Snapshot(row), "snapshot", &SNAPSHOT_SATURATION);
    }

    fn enqueue(&self, message: SinkMessage, label: &'static str, flag: &'static AtomicBool) {
        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !flag.swap(true, Ordering::Relaxed) {
                    warn!("columnar sink channel saturated; dropping {label} rows");
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!("columnar sink channel closed; ignoring {label} row");
            }
        }
    }
}

enum SinkMessage {
    Delta(DeltaRow),
    Snapshot(SnapshotRow),
}

trait RowEncoder {
    type Row: Send + 'static;
    const KIND: &'static str;

    fn schema() -> arrow::datatypes::SchemaRef;
    fn encode(rows: &[Self::Row]) -> Result<RecordBatch>;
    fn partition_for(row: &Self::Row) -> NaiveDate;
}

struct DeltaEncoder;
struct SnapshotEncoder;

impl RowEncoder for DeltaEncoder {
    type Row = DeltaRow;
    const KIND: &'static str = "deltas";

    fn schema() -> arrow::datatypes::SchemaRef {
        delta_schema()
    }

    fn encode(rows: &[Self::Row]) -> Result<RecordBatch> {
        deltas_to_batch(rows)
    }

    fn partition_for(row: &Self::Row) -> NaiveDate {
        date_of_millis(row.timestamp_ms)
    }
}

impl RowEncoder for SnapshotEncoder {
    type Row = SnapshotRow;
    const KIND: &'static str = "snapshots";

    fn schema() -> arrow::datatypes::SchemaRef {
        snapshot_schema()
    }

    fn encode(rows: &[Self::Row]) -> Result<RecordBatch> {
        snapshots_to_batch(rows)
    }

    fn partition_for(row: &Self::Row) -> NaiveDate {
        date_of_millis(row.timestamp_ms)
    }
}

fn date_of_millis(millis: i64) -> NaiveDate {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
        .date_naive()
}

struct SinkWorker {
    rx: mpsc::Receiver<SinkMessage>,
    delta_sink: DataSink<DeltaEncoder>,
    snapshot_sink: DataSink<SnapshotEncoder>,
    flush_interval: Duration,
}

impl SinkWorker {
    async fn new(config: SinkConfig, rx: mpsc::Receiver<SinkMessage>) -> Result<Self> {
        let props = Arc::new(
            WriterProperties::builder()
                .set_compression(Compression::ZSTD(ZstdLevel::default()))
                .build(),
        );
        let delta_dir = ensure_subdir(&config.root, DeltaEncoder::KIND).await?;
        let snapshot_dir = ensure_subdir(&config.root, SnapshotEncoder::KIND).await?;
        Ok(Self {
            rx,
            delta_sink: DataSink::new(
                delta_dir,
                config.max_buffered_rows,
                config.max_rows_per_file,
                config.flush_interval,
                props.clone(),
            ),
            snapshot_sink: DataSink::new(
                snapshot_dir,
                config.max_buffered_rows,
                config.max_rows_per_file,
                config.flush_interval,
                props,
            ),
            flush_interval: config.flush_interval,
        })
    }

    async fn run(mut self) -> Result<()> {
        let mut timer = interval(self.flush_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = self.rx.recv() => {
                    match message {
                        Some(SinkMessage::Delta(row)) => self.delta_sink.push(row).await?,
                        Some(SinkMessage::Snapshot(row)) => self.snapshot_sink.push(row).await?,
                        None => break,
                    }
                }
                _ = timer.tick() => {
                    self.delta_sink.maybe_flush_due_time().await?;
                    self.snapshot_sink.maybe_flush_due_time().await?;
                }
            }
        }
        self.delta_sink.shutdown().await?;
        self.snapshot_sink.shutdown().await?;
        Ok(())
    }
}

async fn ensure_subdir(root: &Path, kind: &str) -> Result<PathBuf> {
    let path = root.join(kind);
    fs::create_dir_all(&path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    Ok(path)
}

struct DataSink<E: RowEncoder> {
    dir: PathBuf,
    buffer: Vec<E::Row>,
    writer: Option<ActiveWriter>,
    partition: Option<NaiveDate>,
    max_buffered_rows: usize,
    max_rows_per_file: usize,
    flush_interval: Duration,
    last_flush: Instant,
    properties: Arc<WriterProperties>,
    file_seq: u64,
    _marker: PhantomData<E>,
}

impl<E: RowEncoder> DataSink<E> {
    fn new(
        dir: PathBuf,
        max_buffered_rows: usize,
        max_rows_per_file: usize,
        flush_interval: Duration,
        properties: Arc<WriterProperties>,
    ) -> Self {
        Self {
            dir,
            buffer: Vec::with_capacity(max_buffered_rows.max(1)),
            writer: None,
            partition: None,
            max_buffered_rows: max_buffered_rows.max(1),
            max_rows_per_file: max_rows_per_file.max(1),
            flush_interval,
            last_flush: Instant::now(),
            properties,
            file_seq: 0,
            _marker: PhantomData,
        }
    }

    async fn push(&mut self, row: E::Row) -> Result<()> {
        let partition = E::partition_for(&row);
        if self.partition != Some(partition) {
            self.flush().await?;
            self.close_writer().await?;
            self.partition = Some(partition);
        }
        self.buffer.push(row);
        if self.buffer.len() >= self.max_buffered_rows {
            self.flush().await?;
        }
        Ok(())
    }

    async fn maybe_flush_due_time(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.last_flush.elapsed() >= self.flush_interval {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let partition = match self.partition {
            Some(partition) => partition,
            None => E::partition_for(&self.buffer[0]),
        };
        self.ensure_writer(partition).await?;
        let rows = std::mem::take(&mut self.buffer);
        let batch = match E::encode(&rows) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(
                    kind = E::KIND,
                    error = %err,
                    dropped = rows.len(),
                    "failed to encode columnar batch"
                );
                self.last_flush = Instant::now();
                return Ok(());
            }
        };
        if batch.num_rows() == 0 {
            return Ok(());
        }
        if let Some(writer) = &mut self.writer {
            writer.write(&batch).await?;
            if writer.rows_written >= self.max_rows_per_file {
                if let Some(writer) = self.writer.take() {
                    writer.finish().await?;
                }
            }
        }
        self.last_flush = Instant::now();
        Ok(())
    }

    async fn ensure_writer(&mut self, partition: NaiveDate) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let date_dir = self.dir.join(partition.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&date_dir)
            .await
            .with_context(|| format!("failed to create {}", date_dir.display()))?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let file_name = format!("{}-{}-{:04}.parquet", E::KIND, stamp, self.file_seq);
        self.file_seq = self.file_seq.wrapping_add(1);
        let path = date_dir.join(file_name);
        let file = File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        let writer = AsyncArrowWriter::try_new(
            file,
            E::schema(),
            Some(self.properties.as_ref().clone()),
        )?;
        debug!(kind = E::KIND, path = %path.display(), "opened columnar file");
        self.writer = Some(ActiveWriter {
            writer,
            rows_written: 0,
            path,
        });
        Ok(())
    }

    async fn close_writer(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finish().await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        self.close_writer().await?;
        Ok(())
    }
}

struct ActiveWriter {
    writer: AsyncArrowWriter<File>,
    rows_written: usize,
    path: PathBuf,
}

impl ActiveWriter {
    async fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.writer.write(batch).await?;
        self.rows_written += batch.num_rows();
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        self.writer.finish().await?;
        debug!(path = %self.path.display(), "closed columnar file");
        Ok(())
    }
}
