pub mod album;
pub mod app_dir;
pub mod blob_store;
pub mod catalog;
pub mod config;
pub mod document_store;
pub mod download;
pub mod id_token;
pub mod identity;
pub mod live_sync;
pub mod model;
pub mod navigator;
pub mod notification;
pub mod screen;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
pub mod timeline;
pub mod upload;
pub mod util;
