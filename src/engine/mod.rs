pub mod bridge;
pub mod cancel;
pub mod capture;
pub mod compare;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod expect;
pub mod http;
pub mod jsonpath;
pub mod method;
pub mod resolvables;
pub mod resolve;
pub mod suite;
pub mod timing;

pub use bridge::{RecordingBridge, StepRecord, TestBridge};
pub use cancel::CancelToken;
pub use capture::{Action, Capture, CaptureFuture, Phase, Staged, When};
pub use compare::{compare, CompareKind, Comparison};
pub use context::Context;
pub use endpoint::{endpoint, Endpoint};
pub use error::{
    CaptureError, ConfigError, HarnessError, Operand, ResolveError, Result, TransportError,
    UnmetError,
};
pub use expect::{Expectation, Verdict};
pub use self::http::{NoTransport, ReqwestTransport, Transport, TransportFuture};
pub use jsonpath::Step;
pub use method::{Method, PostOp};
pub use resolve::{render_template, resolve, Resolvable};
pub use suite::Suite;
pub use timing::TimingStats;
