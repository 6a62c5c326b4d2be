pub mod config;
pub mod frame;
pub mod types;
pub mod value;

pub use config::HarnessConfig;
pub use frame::Frame;
pub use types::{response_cookies, Cookie, EndpointRef, MethodRef, RequestRecord};
pub use value::{array, object, Map, Value, ValueKind};
