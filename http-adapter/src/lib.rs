//! HTTP/JSON facade over the issuance engine (spec section 4.5): parses
//! `{name, amount, class}`, checks out a pooled connection, speaks the
//! binary wire protocol to the engine, and renders the result as JSON —
//! in the idiom of the teacher's `authenticator` Rocket service.

#[macro_use]
extern crate rocket;

use certissue_logging::{info, Logger};
use certissue_pool::Pool;
use certissue_wire::{ErrorCode, GrantReply, GrantRequest};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{Build, Request, Rocket, State};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize)]
pub struct AdapterConfig {
    pub engine_addr: SocketAddr,
    pub listen_addr: SocketAddr,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,
    #[serde(default)]
    pub log: certissue_logging::LogConfig,
}

fn default_pool_size() -> usize {
    20
}

fn default_checkout_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Deserialize)]
struct IssueRequest {
    name: String,
    amount: i64,
    class: String,
}

#[derive(Debug, Serialize)]
struct IssueResponse {
    id: String,
    name: String,
    amount: i64,
    class: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

pub struct AdapterState {
    pool: Pool,
    checkout_timeout: Duration,
    log: Logger,
}

impl AdapterState {
    pub fn new(engine_addr: SocketAddr, pool_size: usize, checkout_timeout: Duration, log: Logger) -> Self {
        AdapterState {
            pool: Pool::new(engine_addr, pool_size),
            checkout_timeout,
            log,
        }
    }
}

#[post("/<_path..>", data = "<body>")]
fn issue(
    _path: PathBuf,
    body: Json<IssueRequest>,
    state: &State<Arc<AdapterState>>,
) -> (Status, Json<serde_json::Value>) {
    let started = Instant::now();
    let body = body.into_inner();
    let class = body.class.clone();

    let (status, response) = if body.amount < 1 || body.amount > u32::MAX as i64 {
        error_response(Status::BadRequest, "INVALID_AMOUNT")
    } else {
        issue_inner(state, body)
    };

    info!(state.log, "request";
        "class" => &class, "status" => status.code, "elapsed_us" => started.elapsed().as_micros() as u64);
    (status, response)
}

fn issue_inner(
    state: &State<Arc<AdapterState>>,
    body: IssueRequest,
) -> (Status, Json<serde_json::Value>) {
    let mut conn = match state.pool.checkout_timeout(Some(state.checkout_timeout)) {
        Ok(c) => c,
        Err(_) => return error_response(Status::ServiceUnavailable, "BACKEND_UNAVAILABLE"),
    };

    let request = GrantRequest {
        class_tag: body.class.clone(),
        amount: body.amount as u32,
        holder_name: body.name.clone(),
    };

    match send_grant(&mut conn, &request) {
        Ok(GrantReply::Ok(certificate_number)) => {
            state.pool.return_conn(conn, true);
            let id = format!("{}-{}", body.class, certificate_number);
            (
                Status::Ok,
                Json(
                    serde_json::to_value(IssueResponse {
                        id,
                        name: body.name,
                        amount: body.amount,
                        class: body.class,
                    })
                    .unwrap(),
                ),
            )
        }
        Ok(GrantReply::Err(code)) => {
            state.pool.return_conn(conn, true);
            let (status, reason) = match code {
                ErrorCode::UnknownClass => (Status::BadRequest, "UNKNOWN_CLASS"),
                ErrorCode::InvalidAmount => (Status::BadRequest, "INVALID_AMOUNT"),
                ErrorCode::InsufficientShares => (Status::Forbidden, "INSUFFICIENT_SHARES"),
                ErrorCode::Malformed => (Status::BadRequest, "MALFORMED"),
            };
            error_response(status, reason)
        }
        Err(_) => {
            state.pool.return_conn(conn, false);
            error_response(Status::ServiceUnavailable, "BACKEND_UNAVAILABLE")
        }
    }
}

fn send_grant(conn: &mut std::net::TcpStream, request: &GrantRequest) -> io::Result<GrantReply> {
    request
        .write_frame(conn)
        .map_err(|_| io::Error::other("encode failed"))?;
    conn.flush()?;
    GrantReply::read_frame(conn).map_err(|_| io::Error::other("decode failed"))
}

fn error_response(status: Status, reason: &'static str) -> (Status, Json<serde_json::Value>) {
    (status, Json(serde_json::to_value(ErrorBody { error: reason }).unwrap()))
}

/// Rocket's `Json<T>` data guard rejects a body that is syntactically
/// invalid JSON, or that doesn't match `IssueRequest`'s schema (missing or
/// wrong-typed fields), with its own 400/422 error page before the route
/// body ever runs. Catch both and normalize them to the same
/// `{"error":"MALFORMED"}` body spec section 7 requires for a malformed
/// request, rather than leaking Rocket's default HTML error page.
#[catch(422)]
fn unprocessable_entity(_req: &Request) -> (Status, Json<serde_json::Value>) {
    error_response(Status::BadRequest, "MALFORMED")
}

#[catch(400)]
fn bad_request(_req: &Request) -> (Status, Json<serde_json::Value>) {
    error_response(Status::BadRequest, "MALFORMED")
}

/// Build the Rocket app, wired to `state`. Split out from `main` so tests
/// can mount it against an in-process engine without going through config
/// loading or network binding.
pub fn build(state: Arc<AdapterState>) -> Rocket<Build> {
    rocket::build()
        .manage(state)
        .mount("/", routes![issue])
        .register("/", catchers![unprocessable_entity, bad_request])
}

#[cfg(test)]
mod tests {
    use super::*;
    use certissue_engine::{ClassConfig, Engine};
    use certissue_journal::Journal;
    use rocket::local::blocking::Client;
    use sloggers::terminal::{Destination, TerminalLoggerBuilder};
    use sloggers::types::Severity;
    use sloggers::Build as _;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    fn quiet_log() -> Logger {
        let mut builder = TerminalLoggerBuilder::new();
        builder.level(Severity::Critical);
        builder.destination(Destination::Stderr);
        builder.build().unwrap()
    }

    /// Spin up a real in-process engine (journal + single decision thread +
    /// one accept loop) the way `engine-server` does, and return its address.
    fn start_engine(classes: Vec<ClassConfig>) -> SocketAddr {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (journal, records) = Journal::open(tmp.path()).unwrap();
        let engine = Engine::recover(&classes, &records).unwrap();
        let log = quiet_log();
        thread::spawn(move || engine_server::serve(listener, engine, journal, log).unwrap());
        thread::sleep(Duration::from_millis(20));
        std::mem::forget(tmp);
        addr
    }

    fn client_for(engine_addr: SocketAddr) -> Client {
        let state = Arc::new(AdapterState::new(
            engine_addr,
            4,
            Duration::from_millis(500),
            quiet_log(),
        ));
        Client::tracked(build(state)).unwrap()
    }

    #[test]
    fn issues_certificate_and_returns_200() {
        let addr = start_engine(vec![ClassConfig { tag: "CS".into(), authorized: 100 }]);
        let client = client_for(addr);

        let response = client
            .post("/issue")
            .json(&serde_json::json!({"name": "Alice", "amount": 10, "class": "CS"}))
            .dispatch();

        assert_eq!(response.status(), Status::Ok);
        let body: serde_json::Value = response.into_json().unwrap();
        assert_eq!(body["id"], "CS-1");
        assert_eq!(body["name"], "Alice");
        assert_eq!(body["amount"], 10);
    }

    #[test]
    fn rejects_unknown_class_with_400() {
        let addr = start_engine(vec![ClassConfig { tag: "CS".into(), authorized: 100 }]);
        let client = client_for(addr);

        let response = client
            .post("/issue")
            .json(&serde_json::json!({"name": "Alice", "amount": 10, "class": "XX"}))
            .dispatch();

        assert_eq!(response.status(), Status::BadRequest);
        let body: serde_json::Value = response.into_json().unwrap();
        assert_eq!(body["error"], "UNKNOWN_CLASS");
    }

    #[test]
    fn rejects_insufficient_shares_with_403() {
        let addr = start_engine(vec![ClassConfig { tag: "CS".into(), authorized: 5 }]);
        let client = client_for(addr);

        let response = client
            .post("/issue")
            .json(&serde_json::json!({"name": "Alice", "amount": 6, "class": "CS"}))
            .dispatch();

        assert_eq!(response.status(), Status::Forbidden);
        let body: serde_json::Value = response.into_json().unwrap();
        assert_eq!(body["error"], "INSUFFICIENT_SHARES");
    }

    #[test]
    fn rejects_non_positive_amount_locally_without_contacting_engine() {
        // Bind a listener but never accept: if the adapter reached the
        // engine at all, this request would hang until the pool's
        // checkout/connect attempt, not fail fast.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::mem::forget(listener);

        let client = client_for(addr);
        let response = client
            .post("/issue")
            .json(&serde_json::json!({"name": "Alice", "amount": 0, "class": "CS"}))
            .dispatch();

        assert_eq!(response.status(), Status::BadRequest);
        let body: serde_json::Value = response.into_json().unwrap();
        assert_eq!(body["error"], "INVALID_AMOUNT");
    }

    #[test]
    fn rejects_syntactically_invalid_json_body_with_400() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::mem::forget(listener);

        let client = client_for(addr);
        let response = client
            .post("/issue")
            .header(rocket::http::ContentType::JSON)
            .body("{not valid json")
            .dispatch();

        assert_eq!(response.status(), Status::BadRequest);
        let body: serde_json::Value = response.into_json().unwrap();
        assert_eq!(body["error"], "MALFORMED");
    }

    #[test]
    fn rejects_schema_invalid_json_body_with_400() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::mem::forget(listener);

        let client = client_for(addr);
        let response = client
            .post("/issue")
            .json(&serde_json::json!({"name": "Alice", "amount": "not-a-number", "class": "CS"}))
            .dispatch();

        assert_eq!(response.status(), Status::BadRequest);
        let body: serde_json::Value = response.into_json().unwrap();
        assert_eq!(body["error"], "MALFORMED");
    }

    #[test]
    fn rejects_missing_field_json_body_with_400() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::mem::forget(listener);

        let client = client_for(addr);
        let response = client
            .post("/issue")
            .json(&serde_json::json!({"name": "Alice", "amount": 10}))
            .dispatch();

        assert_eq!(response.status(), Status::BadRequest);
        let body: serde_json::Value = response.into_json().unwrap();
        assert_eq!(body["error"], "MALFORMED");
    }

    /// Rocket's blocking test client isn't `Sync`, so each racing thread
    /// builds its own client against the same (real, socket-backed) engine
    /// rather than sharing one — that still exercises the engine's
    /// single-writer exhaustion boundary over HTTP.
    #[test]
    fn concurrent_requests_exact_split_over_http() {
        let addr = start_engine(vec![ClassConfig { tag: "CS".into(), authorized: 10 }]);

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let client = client_for(addr);
                let response = client
                    .post("/issue")
                    .json(&serde_json::json!({"name": "Racer", "amount": 1, "class": "CS"}))
                    .dispatch();
                tx.send(response.status()).unwrap();
            }));
        }
        drop(tx);
        for h in handles {
            h.join().unwrap();
        }

        let statuses: Vec<Status> = rx.iter().collect();
        let ok_count = statuses.iter().filter(|s| **s == Status::Ok).count();
        let forbidden_count = statuses.iter().filter(|s| **s == Status::Forbidden).count();
        assert_eq!(ok_count, 10);
        assert_eq!(forbidden_count, 10);
    }
}
