pub mod atomic;
pub mod checkpoint;
pub mod records;
