//! Client 模块 - 实时事件的客户端视图
//!
//! - `reconciler`：回填 + 实时订阅 + 去重 + 重连
//! - `transport`：传输抽象与选择
//! - `bus`：进程内传输
//! - `socket`：HTTP + WebSocket 传输（`client` feature）

mod bus;
mod dedup;
mod reconciler;
#[cfg(feature = "client")]
mod socket;
mod transport;

pub use bus::BusTransport;
pub use dedup::{SeenSet, DEFAULT_SEEN_CAPACITY};
pub use reconciler::{ConnectionState, Reconciler, ReconcilerListener};
#[cfg(feature = "client")]
pub use socket::SocketTransport;
pub use transport::{select_transport, LiveStream, Transport};
