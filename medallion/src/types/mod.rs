//! Domain types flowing through the pipeline stages.

mod batch;
mod dimension;
mod event;
mod fact;
mod quarantine;
mod record;

pub use batch::{Batch, STAGED_OBJECT_FORMAT_VERSION, STAGED_PREFIX, StagedBatch, StagedObjectName};
pub use dimension::{DimensionChange, DimensionVersion, SurrogateKey};
pub use event::{Cell, ChangeEvent, Offset, Operation, PartitionKey, RowImage};
pub use fact::{DimensionReference, FactRecord, FactSource};
pub use quarantine::{QuarantineReason, QuarantineStage, QuarantinedRecord};
pub use record::{ConformedRecord, LoadCursor, RawRecord, RecordVersion, Watermark};
