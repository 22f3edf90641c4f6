pub mod db;
pub mod model;

pub use db::{Disposition, Retrieved, Store};
pub use model::{Content, Kind, Record, RecordSummary};
