pub mod executor;
pub mod poller;
pub mod pool;
pub mod progress;
pub mod rclone;
pub mod scanner;
