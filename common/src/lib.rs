pub mod clock;
pub mod kv;
pub mod util;

pub use clock::Clock;
pub use kv::{
    BatchOp, FamilyHandle, Kv, KvError, KvIterator, KvProperty, KvResult, KvSnapshot,
    KvWriteOptions, L0FileInfo, WriteBatch,
};
pub use util::BytesRange;
