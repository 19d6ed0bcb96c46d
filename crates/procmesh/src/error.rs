use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("attempted to send a message to self (pid {0})")]
    Loopback(u32),
    #[error("I/O error on endpoint {pid}: {source}")]
    Io { pid: u32, #[source] source: std::io::Error },
    #[error("alias {alias:?} collides with neighbour {holder}'s existing alias")]
    AliasCollision { alias: String, holder: u32 },
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("fork() failed: {0}")]
    Fork(#[source] std::io::Error),
    #[error("socketpair() failed: {0}")]
    SocketPair(#[source] std::io::Error),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("reactor error: {0}")]
    Reactor(#[source] std::io::Error),
}

/// Which direction an I/O failure occurred in, reported to
/// `onRouterError(op, …)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Send,
    Recv,
    Alias,
}
