pub mod cdc;

pub use cdc::{CdcConsumer, MappingRegistry};
