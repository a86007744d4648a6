pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod hub;
pub mod model;
pub mod reconnect;

pub mod prelude {
    pub use crate::client::session::LinkState;
    pub use crate::client::{Client, ClientBuilder, Context};
    pub use crate::config::Config;
    pub use crate::error::BridgeError;
    pub use crate::event::{Notification, NotificationSink, Snapshot};
    pub use crate::hub::{BindScope, BroadcastHub};
    pub use crate::model::*;
    pub use crate::reconnect::Reconnector;
}
