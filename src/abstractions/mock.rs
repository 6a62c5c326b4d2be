use crate::domain::Value;
use std::future::Future;
use std::pin::Pin;

pub type MockFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Mock HTTP service the suite can program between requests.
pub trait MockService: Send + Sync {
    /// Install the (fully resolved) mock definition.
    fn setup(&self, definition: Value) -> MockFuture<'_>;

    /// Remove every installed definition.
    fn clear(&self) -> MockFuture<'_>;
}
