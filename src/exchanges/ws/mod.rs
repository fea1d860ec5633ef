//! Streaming sessions. Each venue-symbol gets dedicated OS threads that
//! own the socket lifecycle end to end: token acquisition, subscription,
//! replication into [`StreamShared`](super::StreamShared), and reconnect
//! with backoff. Trading threads never touch a socket.

pub mod binance;
pub mod bybit;
