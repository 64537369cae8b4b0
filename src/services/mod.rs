pub mod classifier;
pub mod dispatcher;
pub mod queue;
pub mod reaper;
pub mod retry;
pub mod storage;
pub mod worker;
