pub mod cron;
pub mod engine;

pub use self::cron::Ticker;
pub use self::engine::run_watch_loop;
