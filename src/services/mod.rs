pub mod captions;
pub mod chunker;
pub mod driver;
pub mod heartbeat;
pub mod ledger;
pub mod messenger;
pub mod poller;
pub mod processor;
pub mod rate_limiter;
pub mod retry_scheduler;
pub mod sigv4;
pub mod storage_client;

#[cfg(test)]
pub mod testing;
