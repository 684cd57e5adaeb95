pub mod messages;
pub mod connection;
pub mod peer;
pub mod peer_manager;
