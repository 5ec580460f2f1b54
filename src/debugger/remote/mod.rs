//! Remote agent protocol: frame codec, request channel, agent and program deployment.
pub mod agent;
pub mod channel;
pub mod codec;
pub mod deploy;
pub mod proto;

pub use agent::{Agent, BackendFactory};
pub use channel::RemoteChannel;
pub use deploy::deploy;
