pub mod quota_window;
pub mod retries;
