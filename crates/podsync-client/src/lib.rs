pub mod backoff;
pub mod connection;
pub mod handlers;
pub mod startup;
pub mod sync;
pub mod toast;
