pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod jobs;
pub mod loki;
pub mod metrics;
pub mod qfile;
pub mod tail;
pub mod xferlog;

#[cfg(test)]
mod testing;
