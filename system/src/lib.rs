pub extern crate chrono;
pub extern crate serde;
pub extern crate serde_json;

mod codec;
mod error;
mod graph_store;
mod lifecycle;
mod message;
mod presence;
mod repository;
mod types;

pub use codec::*;
pub use error::*;
pub use graph_store::*;
pub use lifecycle::*;
pub use message::*;
pub use presence::*;
pub use repository::*;
pub use types::*;
