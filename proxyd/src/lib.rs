pub mod broadcast;
pub mod keepalive;
pub mod persist;
pub mod routes;
pub mod state;
pub mod vote;
