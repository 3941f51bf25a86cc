//! End-to-end pipeline scenarios driven through an in-process thread, no
//! sockets involved: routes register against the global module set, the
//! kernel is brought up to `connect`, and each test hands the module a
//! canned request and asserts on the finished response.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Response, StatusCode};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use strata::basic::Var;
use strata::context::Context;
use strata::defs::Map;
use strata::engine::{Action, Method};
use strata::http::{http_func, Access, FindRule, Router, SignRule, HTTP};
use strata::map;
use strata::ports::http::HttpThread;
use strata::token::{Token, TokenHeader};

struct TestThread {
    name: String,
    method: String,
    path: String,
    query: String,
    headers: HeaderMap,
    body: Bytes,
    responder: Option<oneshot::Sender<Response<Body>>>,
}

#[async_trait]
impl HttpThread for TestThread {
    fn name(&self) -> String {
        self.name.clone()
    }
    fn site(&self) -> String {
        String::new()
    }
    fn params(&self) -> Map {
        Map::new()
    }
    fn method(&self) -> String {
        self.method.clone()
    }
    fn uri(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
    fn path(&self) -> String {
        self.path.clone()
    }
    fn query(&self) -> String {
        self.query.clone()
    }
    fn host(&self) -> String {
        "testing.local".into()
    }
    fn remote(&self) -> String {
        "127.0.0.1:9".into()
    }
    fn headers(&self) -> HeaderMap {
        self.headers.clone()
    }
    async fn body(&mut self) -> Result<Bytes> {
        Ok(std::mem::take(&mut self.body))
    }
    async fn finish(&mut self, response: Response<Body>) -> Result<()> {
        self.responder
            .take()
            .expect("finish called once")
            .send(response)
            .map_err(|_| eyre::eyre!("response receiver dropped"))
    }
}

struct Driven {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Driven {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

async fn drive(
    name: &str,
    method: &str,
    path: &str,
    query: &str,
    headers: &[(&str, &str)],
    body: Bytes,
) -> Driven {
    let mut header_map = HeaderMap::new();
    for (k, v) in headers {
        header_map.insert(
            axum::http::header::HeaderName::try_from(*k).unwrap(),
            HeaderValue::from_str(v).unwrap(),
        );
    }

    let (tx, rx) = oneshot::channel();
    let thread = TestThread {
        name: name.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        query: query.to_string(),
        headers: header_map,
        body,
        responder: Some(tx),
    };

    HTTP.serve(Box::new(thread)).await;

    let response = rx.await.expect("response written");
    let (parts, body) = response.into_parts();
    let body = body.collect().await.expect("collect body").to_bytes();
    Driven { status: parts.status, headers: parts.headers, body }
}

static SETUP: tokio::sync::OnceCell<tempfile::TempDir> = tokio::sync::OnceCell::const_new();

async fn setup() {
    SETUP
        .get_or_init(|| async {
            let statics = tempfile::tempdir().expect("static dir");
            std::fs::create_dir_all(statics.path().join("shared")).unwrap();
            std::fs::write(statics.path().join("shared/hello.txt"), b"static!").unwrap();

            strata::configure(map! {
                "name" => "pipeline-tests",
                "http" => json!({
                    "port": 0,
                    "static": statics.path().to_string_lossy(),
                }),
                "token" => json!({ "secret": "pipeline-secret" }),
            });

            register_routes();
            register_methods();

            strata::ready().await.expect("kernel ready");
            statics
        })
        .await;
}

fn register_routes() {
    strata::register(
        "hello",
        Router {
            uri: "/".into(),
            action: Some(http_func(|ctx: &mut Access| {
                Box::pin(async move { ctx.text("hello world", None) })
            })),
            ..Router::default()
        },
    );

    strata::register(
        "add",
        Router {
            uri: "/add".into(),
            args: [("x".to_string(), Var::required("int"))].into_iter().collect(),
            action: Some(http_func(|ctx: &mut Access| {
                Box::pin(async move {
                    let x = strata::defs::get_i64(&ctx.args, "x").unwrap_or(0);
                    ctx.answer(&strata::OK.clone(), Some(map! { "doubled" => x * 2 }));
                })
            })),
            ..Router::default()
        },
    );

    strata::register(
        "me",
        Router {
            uri: "/me".into(),
            token: true,
            action: Some(http_func(|ctx: &mut Access| {
                Box::pin(async move {
                    let ok = strata::OK.clone();
                    ctx.answer(&ok, None);
                })
            })),
            ..Router::default()
        },
    );

    strata::register(
        "upload",
        Router {
            uri: "/upload".into(),
            action: Some(http_func(|ctx: &mut Access| {
                Box::pin(async move {
                    let record = ctx.upload.get("avatar").cloned().unwrap_or(Value::Null);
                    let existed = record
                        .get("file")
                        .and_then(Value::as_str)
                        .map(|p| std::path::Path::new(p).exists())
                        .unwrap_or(false);
                    ctx.json(json!({ "record": record, "existed": existed }), None);
                })
            })),
            ..Router::default()
        },
    );

    strata::register(
        "session-probe",
        Router {
            uri: "/session".into(),
            token: true,
            action: Some(http_func(|ctx: &mut Access| {
                Box::pin(async move {
                    let value = ctx.session("k").cloned().unwrap_or(Value::Null);
                    ctx.json(json!({ "k": value }), None);
                })
            })),
            ..Router::default()
        },
    );

    strata::register(
        "gated",
        Router {
            uri: "/gated".into(),
            token: true,
            args: [("x".to_string(), Var::required("int"))].into_iter().collect(),
            sign: [(
                "user".to_string(),
                SignRule {
                    required: true,
                    method: "account.entity".into(),
                    ..SignRule::default()
                },
            )]
            .into_iter()
            .collect(),
            find: [(
                "record".to_string(),
                FindRule {
                    required: true,
                    method: "account.entity".into(),
                    ..FindRule::default()
                },
            )]
            .into_iter()
            .collect(),
            action: Some(http_func(|ctx: &mut Access| {
                Box::pin(async move {
                    let user = ctx.sign.get("user").cloned().unwrap_or(Value::Null);
                    let record = ctx.item.get("record").cloned().unwrap_or(Value::Null);
                    ctx.json(json!({ "user": user, "record": record }), None);
                })
            })),
            ..Router::default()
        },
    );
}

fn register_methods() {
    strata::register(
        "account.entity",
        Method {
            action: Some(Action::record(|ctx: &mut Context| {
                Box::pin(async move {
                    let id = ctx
                        .args
                        .get("id")
                        .map(strata::defs::text_of)
                        .unwrap_or_default();
                    if id == "1" {
                        (map! { "id" => 1, "name" => "neo" }, strata::OK.clone())
                    } else {
                        (Map::new(), strata::FAIL.clone())
                    }
                })
            })),
            args: [("id".to_string(), Var::required("string"))].into_iter().collect(),
            ..Method::default()
        },
    );
}

fn auth_token(payload: Map) -> String {
    // distinct identities keep the session store from leaking state
    // between concurrently running scenarios
    let token = Token {
        header: TokenHeader {
            id: strata::codec::generate("act-"),
            auth: true,
            ..TokenHeader::default()
        },
        payload,
    };
    strata::token::sign(&token).expect("sign token")
}

#[tokio::test]
async fn text_echo_route() {
    setup().await;

    let got = drive(".hello.*", "GET", "/", "", &[], Bytes::new()).await;
    assert_eq!(got.status, StatusCode::OK);
    assert_eq!(
        got.headers.get("content-type").unwrap().to_str().unwrap(),
        "text/plain; charset=utf-8"
    );
    assert_eq!(got.text(), "hello world");
}

#[tokio::test]
async fn missing_required_arg_fails_with_envelope() {
    setup().await;

    let got = drive(
        ".add.*",
        "POST",
        "/add",
        "",
        &[("ajax", "1")],
        Bytes::new(),
    )
    .await;
    assert_eq!(got.status, StatusCode::BAD_REQUEST);

    let envelope = got.json();
    assert_ne!(envelope["code"], json!(0));
    assert!(envelope["text"].as_str().unwrap().contains('x'));
}

#[tokio::test]
async fn arg_coercion_reaches_action() {
    setup().await;

    let got = drive(
        ".add.*",
        "POST",
        "/add",
        "x=21",
        &[("ajax", "1")],
        Bytes::new(),
    )
    .await;
    assert_eq!(got.status, StatusCode::OK);

    let envelope = got.json();
    assert_eq!(envelope["code"], json!(0));
    assert_eq!(envelope["data"]["doubled"], json!(42));
}

#[tokio::test]
async fn json_bodies_merge_into_value() {
    setup().await;

    let got = drive(
        ".add.*",
        "POST",
        "/add",
        "",
        &[("ajax", "1"), ("content-type", "application/json")],
        Bytes::from(r#"{"x": 7}"#),
    )
    .await;
    assert_eq!(got.status, StatusCode::OK);
    assert_eq!(got.json()["data"]["doubled"], json!(14));
}

#[tokio::test]
async fn token_gate_rejects_anonymous() {
    setup().await;

    let got = drive(".me.*", "GET", "/me", "", &[("ajax", "1")], Bytes::new()).await;
    assert_eq!(got.status, StatusCode::UNAUTHORIZED);

    let envelope = got.json();
    assert_eq!(envelope["text"], json!("unauthorized"));
}

#[tokio::test]
async fn token_gate_admits_bearer() {
    setup().await;

    let token = auth_token(Map::new());
    let got = drive(
        ".me.*",
        "GET",
        "/me",
        "",
        &[("ajax", "1"), ("authorization", &token)],
        Bytes::new(),
    )
    .await;
    assert_eq!(got.status, StatusCode::OK);
    assert_eq!(got.json()["code"], json!(0));
}

#[tokio::test]
async fn session_hydrates_from_token_payload() {
    setup().await;

    let token = auth_token(map! { "k" => "v" });
    let got = drive(
        ".session-probe.*",
        "GET",
        "/session",
        "",
        &[("authorization", &token)],
        Bytes::new(),
    )
    .await;
    assert_eq!(got.status, StatusCode::OK);
    assert_eq!(got.json()["k"], json!("v"));
}

#[tokio::test]
async fn multipart_upload_records_hash_and_type() {
    setup().await;

    let payload = b"PNGxyz123456";
    let body = format!(
        "--BOUND\r\nContent-Disposition: form-data; name=\"avatar\"; \
         filename=\"avatar.png\"\r\nContent-Type: image/png\r\n\r\n{}\r\n--BOUND--\r\n",
        String::from_utf8_lossy(payload),
    );

    let got = drive(
        ".upload.*",
        "POST",
        "/upload",
        "",
        &[("content-type", "multipart/form-data; boundary=BOUND")],
        Bytes::from(body),
    )
    .await;
    assert_eq!(got.status, StatusCode::OK);

    let parsed = got.json();
    let record = &parsed["record"];
    assert_eq!(record["name"], json!("avatar.png"));
    assert_eq!(record["type"], json!("png"));
    assert_eq!(record["mime"], json!("image/png"));
    assert_eq!(record["size"], json!(12));
    assert_eq!(
        record["hash"],
        json!(strata::utils::sha1_hex(payload))
    );
    // the spooled file is alive during the action and removed afterwards
    assert_eq!(parsed["existed"], json!(true));
    let path = record["file"].as_str().unwrap();
    assert!(!std::path::Path::new(path).exists());
}

#[tokio::test]
async fn staged_gates_fire_in_order() {
    setup().await;

    // args gate first: no token either, but the failure is a 400
    let got = drive(".gated.*", "GET", "/gated", "", &[("ajax", "1")], Bytes::new()).await;
    assert_eq!(got.status, StatusCode::BAD_REQUEST);

    // args pass, token missing: denied
    let got = drive(
        ".gated.*",
        "GET",
        "/gated",
        "x=1",
        &[("ajax", "1")],
        Bytes::new(),
    )
    .await;
    assert_eq!(got.status, StatusCode::UNAUTHORIZED);

    // token ok but not signed in: denied by the sign gate
    let token = auth_token(Map::new());
    let got = drive(
        ".gated.*",
        "GET",
        "/gated",
        "x=1",
        &[("ajax", "1"), ("authorization", &token)],
        Bytes::new(),
    )
    .await;
    assert_eq!(got.status, StatusCode::UNAUTHORIZED);
    assert_eq!(got.json()["text"], json!("_auth_empty_user"));

    // signed in (sign state rides the token payload) but no lookup value:
    // the find gate fails the request
    let signed = auth_token(map! { "$.sign.user" => json!({ "id": "1", "name": "neo" }) });
    let got = drive(
        ".gated.*",
        "GET",
        "/gated",
        "x=1",
        &[("ajax", "1"), ("authorization", &signed)],
        Bytes::new(),
    )
    .await;
    assert_eq!(got.status, StatusCode::BAD_REQUEST);
    assert_eq!(got.json()["text"], json!("_item_empty_record"));

    // everything lined up: both gates load their records
    let got = drive(
        ".gated.*",
        "GET",
        "/gated",
        "x=1&id=1",
        &[("ajax", "1"), ("authorization", &signed)],
        Bytes::new(),
    )
    .await;
    assert_eq!(got.status, StatusCode::OK);
    let parsed = got.json();
    assert_eq!(parsed["user"]["name"], json!("neo"));
    assert_eq!(parsed["record"]["id"], json!(1));
}

#[tokio::test]
async fn unmatched_requests_serve_static_files() {
    setup().await;

    let got = drive("", "GET", "/hello.txt", "", &[], Bytes::new()).await;
    assert_eq!(got.status, StatusCode::OK);
    assert_eq!(got.text(), "static!");

    let got = drive("", "GET", "/nope.txt", "", &[("ajax", "1")], Bytes::new()).await;
    assert_eq!(got.status, StatusCode::NOT_FOUND);
}
