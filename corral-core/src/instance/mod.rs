//! Domain model: instance keys, log coordinates, identifier sets and the
//! cached instance snapshot.

mod binlog;
mod gtid;
#[allow(clippy::module_inception)]
mod instance;
mod key;

pub use binlog::{BinlogCoordinates, BinlogType};
pub use gtid::GtidSet;
pub use instance::{BinlogFormat, Instance, PromotionRule};
pub use key::InstanceKey;
