pub mod database;
pub mod image;
pub mod listener;
pub mod mock;
pub mod sse;

pub use database::{build_insert, ArgMarkers, DatabaseFuture, DatabaseRegistry, NamedDatabase, Row, SqlDatabase};
pub use image::{Component, ComponentFuture, Handles, Image, StaticImage};
pub use listener::{ChannelListener, EventBuffer, Listener, ListenerFactory, ListenerRegistry};
pub use mock::{MockFuture, MockService};
pub use sse::{sse, SseListener};
