extern crate self as procmesh;

mod config;
mod error;
mod executor;
mod interceptor;
mod listener;
mod router;

pub use config::{DispatchMode, ExecutorConfig, RouterConfig, ShutdownFlags};
pub use error::{ExecutorError, Op, RouterError};
pub use executor::{ChildInfo, Executor, TerminationType};
pub use interceptor::{Interceptor, InterceptorChain, RouterEvent};
pub use listener::{Listener, MessageEvent};
pub use router::{Router, ServiceOutcome, Target};

pub use procmesh_communication as communication;
pub use procmesh_network as network;
pub use procmesh_utils as utils;
pub use tracing;
