//! Monitor role: batched columnar persistence of live order books.

mod encoding;
mod recorder;
mod ring;
mod sink;

pub use encoding::{DeltaRow, LevelAction, SnapshotRow};
pub use recorder::BookRecorder;
pub use ring::Ring;
pub use sink::{ColumnarSink, SinkConfig, SinkHandle};
