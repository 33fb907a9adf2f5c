pub mod buffer;
pub mod bus;
pub mod config;
pub mod crawler;
pub mod decode;
pub mod error;
pub mod events;
pub mod loader;
pub mod render;
pub mod scan;
pub mod store;
pub mod tasks {
    pub mod manager;
    pub mod prefetch;
    pub mod viewer;
}

pub use tasks::manager::{SessionHandle, start_session, stop_session};
