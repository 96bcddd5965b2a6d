pub mod audio;
pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transport;

pub use client::AgentClient;
pub use config::{ClientConfig, EndpointSource};
pub use error::{ClientError, Result};
pub use events::{AgentEvent, ProductItem};
pub use session::ConnectionState;
