pub mod codec;
pub mod endpoint;
pub mod reactor;

pub use codec::{DstRemote, Frame, HEADER_LEN};
pub use endpoint::{ConnState, DequeuePosition, Endpoint, FlushedFrame, IoDirection, UnsentFrame};
pub use reactor::{Interest, Reactor};
