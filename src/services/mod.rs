pub mod detector;
pub mod job_store;
pub mod media;
pub mod notify;
pub mod queue;
pub mod storage;
pub mod transfer;
pub mod transfer_record;
