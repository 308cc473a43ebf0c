mod client;
mod error;
mod reply;

pub use client::{DavClient, RemoteEntry};
pub use error::{DavError, ErrorClass};
pub use reply::{Progress, Reply, ReplyEvent, ReplyMeta, ReplySender};
