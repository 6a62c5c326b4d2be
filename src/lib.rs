//! Declarative integration-testing harness for HTTP APIs.
//!
//! A [`Suite`](engine::Suite) owns a tree of [`Endpoint`](engine::Endpoint)s,
//! each carrying [`Method`](engine::Method)s with captures and expectations.
//! Values in a declaration may be deferred: variables, templates, response
//! accessors, JSON paths, database queries and listener snapshots are
//! resolved against the run context when the method executes.
//!
//! ```no_run
//! use getman_probe::prelude::*;
//!
//! # async fn demo() -> getman_probe::engine::Result<()> {
//! let suite = Suite::new("pets")
//!     .with_host("http://localhost:8080")
//!     .endpoint(
//!         endpoint("/pets/{id}", "a single pet").method(
//!             Method::get("fetch")
//!                 .path_param(1)
//!                 .require(expect_status(200))
//!                 .assert(expect_equal(body_path("name"), "rex"))
//!                 .capture(set_var("owner", body_path("owner.id"))),
//!         ),
//!     );
//! let report = suite.run().await?;
//! println!("{}", report.render(OutputFormat::Text));
//! # Ok(())
//! # }
//! ```

pub mod abstractions;
pub mod coverage;
pub mod domain;
pub mod engine;
pub mod report;
pub mod store;

/// Everything needed to declare and run a suite.
pub mod prelude {
    pub use crate::abstractions::{
        sse, ArgMarkers, ChannelListener, Component, ComponentFuture, Handles, Image, Listener,
        MockFuture, MockService, NamedDatabase, SqlDatabase, StaticImage,
    };
    pub use crate::coverage::{CoverageCollector, OpenApi, PathStatus};
    pub use crate::domain::{array, object, HarnessConfig, Value, ValueKind};
    pub use crate::engine::capture::{
        call, clear_all_vars, clear_listener, clear_vars, db_clear_table, db_exec, db_insert,
        listen, mock_clear, mock_setup, set_cookie, set_var, store_cookie, wait, when,
    };
    pub use crate::engine::expect::{
        expect_equal, expect_greater, expect_greater_or_equal, expect_has_properties,
        expect_len, expect_less, expect_less_or_equal, expect_match, expect_nil, expect_not,
        expect_not_equal, expect_not_nil, expect_only_has_properties, expect_status,
        expect_that, expect_type, expect_type_of,
    };
    pub use crate::engine::resolvables::{
        all_of, any_of, body, body_fn, body_path, computed, db_query, db_rows, env, first,
        header, image_env, json_path, just, last, len, listener_count, listener_events, nth,
        raw_query, response_cookie, satisfied, status_code, template, traverse, var,
    };
    pub use crate::engine::{
        endpoint, CancelToken, CompareKind, Context, Endpoint, HarnessError, Method,
        RecordingBridge, Suite, TestBridge,
    };
    pub use crate::report::{OutputFormat, RunReport};
    pub use crate::store::SqliteDatabase;
}
