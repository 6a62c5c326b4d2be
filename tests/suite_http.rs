use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use getman_probe::coverage::normalize_path;
use getman_probe::prelude::*;
use getman_probe::report::Outcome;
use httpmock::prelude::*;
use httpmock::Method::HEAD;
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn create_then_fetch_with_captured_id_and_cookie() {
    init_tracing();
    let server = MockServer::start_async().await;
    let login = server
        .mock_async(|when, then| {
            when.method(POST).path("/login");
            then.status(204).header("set-cookie", "session=abc; Path=/; HttpOnly");
        })
        .await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/pets")
                .header("cookie", "session=abc")
                .header("content-type", "application/json")
                .json_body(json!({"name": "rex", "tags": ["good"]}));
            then.status(201).json_body(json!({"id": 12, "name": "rex"}));
        })
        .await;
    let fetch = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/pets/12")
                .query_param("expand", "owner")
                .header("cookie", "session=abc");
            then.status(200)
                .header("x-version", "3")
                .json_body(json!({"id": 12, "name": "rex", "price": 12.5, "owner": {"id": "o-1"}}));
        })
        .await;

    let suite = Suite::new("pets")
        .with_host(server.base_url())
        .endpoint(
            endpoint("/login", "session")
                .method(Method::post("login").require(expect_status(204)).capture(store_cookie("session"))),
        )
        .endpoint(
            endpoint("/pets", "collection")
                .method(
                    Method::post("create")
                        .use_cookie("session")
                        .body(object([("name", Value::from("rex")), ("tags", array(["good"]))]))
                        .require(expect_status(201))
                        .capture(set_var("pet", body_path("id"))),
                )
                .child(
                    endpoint("/{id}", "single pet").method(
                        Method::get("fetch")
                            .path_param(var("pet"))
                            .query("expand", "owner")
                            .use_cookie("session")
                            .require(expect_status(200))
                            .assert(expect_equal(body_path("id"), var("pet")))
                            .assert(expect_equal(header("X-Version"), 3))
                            .assert(expect_greater(body_path("price"), "12"))
                            .assert(expect_match(body_path("owner.id"), "^o-\\d$"))
                            .assert(expect_has_properties(body(), ["id", "name", "owner"]))
                            .assert(expect_that("pet name", |ctx| {
                                Ok(ctx.body().as_object().is_some_and(|pet| pet.contains_key("name")))
                            })),
                    ),
                ),
        );

    let report = suite.run().await.expect("clean run");
    login.assert_async().await;
    create.assert_async().await;
    fetch.assert_async().await;
    assert_eq!((report.met, report.unmet, report.skipped, report.failures), (9, 0, 0, 0));
}

#[tokio::test]
async fn required_status_unmet_skips_the_rest_of_the_method() {
    init_tracing();
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/pets/1");
            then.status(404).json_body(json!({"error": "not found"}));
        })
        .await;
    let later = server
        .mock_async(|when, then| {
            when.method(GET).path("/pets");
            then.status(200).json_body(json!([]));
        })
        .await;

    let suite = Suite::new("missing pet")
        .with_host(server.base_url())
        .endpoint(
            endpoint("/pets", "collection")
                .child(
                    endpoint("/1", "one").method(
                        Method::get("fetch")
                            .require(expect_status(200))
                            .assert(expect_equal(header("X"), "y"))
                            .assert(expect_equal(body_path("foo"), 1)),
                    ),
                )
                .method(Method::get("list").assert(expect_len(body(), 0))),
        );

    let err = suite.run().await.unwrap_err();
    let report = err.report().expect("report").clone();
    assert_eq!((report.met, report.unmet, report.skipped), (1, 1, 2));
    later.assert_async().await;

    let skipped: Vec<_> = report.entries_with(Outcome::Skipped).collect();
    assert!(skipped.iter().all(|entry| entry.endpoint == "/pets/1"));
    let text = report.render(OutputFormat::Text);
    assert!(text.contains("[UNMET] GET /pets/1"));
    assert!(text.contains("expected status 200 OK, got 404 Not Found"));

    let json: serde_json::Value =
        serde_json::from_str(&report.render(OutputFormat::Json)).expect("json report");
    assert_eq!(json["unmet"], 1);
    assert_eq!(json["entries"][0]["outcome"], "unmet");
}

#[tokio::test]
async fn database_rows_feed_requests_and_expectations() {
    init_tracing();
    let db = SqliteDatabase::open_in_memory().expect("sqlite");
    db.execute_batch(
        "CREATE TABLE owners (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE pets (id TEXT PRIMARY KEY, owner_id INTEGER, name TEXT);
         INSERT INTO owners (id, name) VALUES (3, 'ana');",
    )
    .expect("schema");

    let server = MockServer::start_async().await;
    let update = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/pets/p-1")
                .json_body(json!({"owner": 3, "name": "rex"}));
            then.status(200).json_body(json!({"ok": true}));
        })
        .await;

    let suite = Suite::new("db")
        .with_host(server.base_url())
        .with_database("main", db.into_named())
        .endpoint(
            endpoint("/pets/{id}", "pet")
                .before(db_insert(
                    "",
                    "pets",
                    object([
                        ("id", Value::from("p-1")),
                        ("owner_id", raw_query("(SELECT id FROM owners LIMIT 1)")),
                        ("name", Value::from("rex")),
                    ]),
                ))
                .method(
                    Method::put("rename")
                        .path_param(db_query("main", "SELECT id FROM pets WHERE name = ?", ["rex"]))
                        .body(object([
                            ("owner", db_query("", "SELECT owner_id FROM pets", Vec::<Value>::new())),
                            ("name", Value::from("rex")),
                        ]))
                        .require(expect_status(200))
                        .capture(db_exec("main", "UPDATE pets SET name = ? WHERE id = ?", ["max", "p-1"]))
                        .assert(expect_equal(
                            db_query("main", "SELECT name FROM pets WHERE id = ?", ["p-1"]),
                            "max",
                        )),
                )
                .after(db_clear_table("main", "pets")),
        );

    let report = suite.run().await.expect("clean run");
    update.assert_async().await;
    assert_eq!(report.met, 2);
}

#[tokio::test]
async fn coverage_is_cross_referenced_with_an_openapi_file() {
    init_tracing();
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/pets/1");
            then.status(200).json_body(json!({"id": 1}));
        })
        .await;

    let mut definition = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        definition,
        "openapi: 3.0.0\npaths:\n  /api/pets/{{petId}}:\n    get: {{}}\n    delete: {{}}\n  /api/owners:\n    get: {{}}\n"
    )
    .expect("write definition");

    let coverage = Arc::new(CoverageCollector::new(false));
    let mut config = HarnessConfig::default();
    config.openapi_path = Some(definition.path().display().to_string());

    let suite = Suite::new("coverage")
        .with_config(config)
        .with_host(server.base_url())
        .with_coverage(coverage.clone())
        .repeat(2)
        .endpoint(
            endpoint("/api/pets/{id}", "pet")
                .method(Method::get("fetch").path_param(1).assert(expect_status(200))),
        )
        .endpoint(
            endpoint("/api/toys", "undocumented")
                .method(Method::get("list").assert(expect_status(404))),
        );

    let report = suite.run().await.expect("clean run");
    assert_eq!(report.repeats, 2);

    let bucket = coverage.method("/api/pets/{id}", "get").expect("bucket");
    assert_eq!(bucket.met, 2);
    assert_eq!(bucket.timings.len(), 2);
    let stats = bucket.stats(false).expect("stats");
    assert!(stats.min <= stats.p50 && stats.p50 <= stats.max);
    assert_eq!(bucket.last_request.map(|request| request.path), Some("/api/pets/1".to_string()));
    assert_eq!(
        coverage.literal_paths(&normalize_path("/api/pets/{petId}")),
        vec!["/api/pets/{id}".to_string()]
    );

    let spec = report.coverage.expect("spec coverage");
    assert_eq!(spec.path("/api/pets/{petId}").map(|p| p.status), Some(PathStatus::Covered));
    assert_eq!(spec.path("/api/owners").map(|p| p.status), Some(PathStatus::NonCovered));
    assert_eq!(spec.path("/api/toys").map(|p| p.status), Some(PathStatus::Unknown));
}

#[tokio::test]
async fn bridge_receives_steps_and_fatal_failures() {
    init_tracing();
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(503);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(HEAD).path("/health");
            then.status(200);
        })
        .await;

    let bridge = Arc::new(RecordingBridge::new());
    let suite = Suite::new("bridge")
        .with_host(server.base_url())
        .with_bridge(bridge.clone())
        .endpoint(
            endpoint("/health", "health")
                .method(Method::get("check").require(expect_status(200)))
                .method(Method::head("light check").assert(expect_status(200))),
        );

    assert!(suite.run().await.is_err());
    let steps = bridge.steps();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].name, "GET /health");
    assert_eq!(steps[0].fatal.len(), 1);
    assert!(steps[0].fatal[0].contains("declared at"));
    assert!(steps[1].passed());

    let strict = Arc::new(RecordingBridge::new().stop_on_fatal());
    let suite = Suite::new("strict bridge")
        .with_host(server.base_url())
        .with_bridge(strict.clone())
        .endpoint(
            endpoint("/health", "health")
                .method(Method::get("check").require(expect_status(200)))
                .method(Method::head("light check").assert(expect_status(200))),
        );
    assert!(suite.run().await.is_err());
    assert_eq!(strict.steps().len(), 1);
}

#[tokio::test]
async fn configuration_file_seeds_host_and_variables() {
    init_tracing();
    let server = MockServer::start_async().await;
    let search = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/search")
                .query_param("q", "cats & dogs")
                .query_param("limit", "5");
            then.status(200).json_body(json!({"hits": [1, 2, 3]}));
        })
        .await;

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        "{}",
        json!({
            "host": server.base_url(),
            "timeoutMs": 5000,
            "variables": {"term": "cats & dogs", "limit": 5}
        })
    )
    .expect("write config");
    let config = HarnessConfig::from_path(file.path()).expect("config");

    let suite = Suite::new("config").with_config(config).endpoint(
        endpoint("/search", "search").method(
            Method::get("query")
                .query("q", var("term"))
                .query("limit", var("limit"))
                .assert(expect_len(body_path("hits"), 3))
                .assert(expect_equal(body_path("hits.LAST"), 3))
                .assert(expect_equal(template("{$term}!"), "cats & dogs!")),
        ),
    );

    let report = suite.run().await.expect("clean run");
    search.assert_async().await;
    assert_eq!(report.met, 3);
}

#[tokio::test]
async fn listeners_are_registered_again_on_every_repeat() {
    init_tracing();
    let server = MockServer::start_async().await;
    let ping = server
        .mock_async(|when, then| {
            when.method(GET).path("/ping");
            then.status(200);
        })
        .await;

    let (sender, receiver) = tokio::sync::mpsc::channel(16);
    let suite = Suite::new("listeners")
        .with_host(server.base_url())
        .repeat(2)
        .endpoint(
            endpoint("/ping", "ping")
                .before(listen("events", ChannelListener::factory(receiver)))
                .method(
                    Method::get("ping")
                        .require(expect_status(200))
                        .capture(call("publish", move |_| {
                            sender.try_send(Value::from("pong")).map_err(|err| err.to_string())
                        }))
                        .capture(wait(Duration::from_millis(50)))
                        .assert(expect_equal(listener_count("events"), 1)),
                ),
        );

    let report = suite.run().await.expect("clean run");
    ping.assert_hits_async(2).await;
    assert_eq!(report.repeats, 2);
    assert_eq!((report.met, report.unmet, report.failures), (4, 0, 0));
}
