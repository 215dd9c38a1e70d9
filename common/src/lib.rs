pub mod api_error;
pub mod cluster;
pub mod constants;
pub mod discovery;
pub mod hrw;
pub mod keepalive;
pub mod msgs;
pub mod owner;
pub mod redirects;
pub mod retry;
pub mod url_utils;
pub mod vote;
