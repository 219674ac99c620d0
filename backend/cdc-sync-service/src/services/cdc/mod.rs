mod consumer;
mod dead_letter;
mod discovery;
mod mapping;
mod models;
mod sink;
mod source;
pub mod transforms;

pub use consumer::{BatchReport, CdcConsumer, ConsumerErrorState, MessageOutcome, SkipReason};
pub use dead_letter::{DeadLetterSink, KafkaDeadLetterPublisher};
pub use discovery::{discover_new_topics, DiscoverySchedule};
pub use mapping::{FieldMapping, MappingRegistry, SinkRow, TableMapping, ETL_TIMESTAMP_COLUMN};
pub use models::{decode, CdcOperation, ChangeEvent, RawMessage};
pub use sink::{insert_sql, AnalyticsSink};
pub use source::{ChangeSource, CommitOffset, KafkaChangeSource};
pub use transforms::{FieldTransform, SinkValue};
