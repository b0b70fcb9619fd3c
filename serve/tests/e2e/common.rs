//! Shared harness: spins up a fake JWKS endpoint and a real orchestrator
//! instance on `127.0.0.1:0`, then hands the caller a signed token and a
//! `ws://` URL to drive with `tokio-tungstenite`.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::routing::get;
use axum::{Json, Router};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// `spawn()` pokes process-global env vars to steer `AppConfig::from_env()`;
/// this keeps concurrently-running tests in this binary from stomping on
/// each other's JWKS endpoint. A `tokio::sync::Mutex` because the guard is
/// held across an `.await`.
fn env_guard() -> &'static Mutex<()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD.get_or_init(|| Mutex::new(()))
}

/// A fixed RSA-2048 test keypair. Never used outside this harness.
const TEST_PRIVATE_KEY_PEM: &str = include_str!("test_key.pem");
const TEST_KID: &str = "test-key-1";
const TEST_N: &str = "k1sUjZ9FcIoemMYI2tOyZCH29V_HdbB5POUWBv4x4ht_RuEqT7qCvImeVUuCvuGlVJkiL4xAAV1pZTZ2fE-8T9yOSJlkGyzOHh0EhybFh5skNG_fgBpPZmd-DBLr30XXwE1HF4WZfAw2TPtYdKs4iYzCqPR2ts3Qo5DptpIMGUcb2JTX9UPieP02srtKwX_TTOSBZbVO_27PJuovOGZgVUBnUutp6eswPKFBpht5KA8upNw-BMfOR_CIwR_QsOXYtidVmDgOxsqshjzpWJDnVDb7WylDmpQKAapswsmX4Or1wv82kh6Y8wED_XUyGv5aExgt5QF-QrBfuOvAckvcpQ";
const TEST_E: &str = "AQAB";

#[derive(Serialize)]
struct JwkEntry<'a> {
    kty: &'a str,
    kid: &'a str,
    n: &'a str,
    e: &'a str,
    alg: &'a str,
}

#[derive(Serialize)]
struct Claims {
    sub: String,
    exp: i64,
}

pub struct Harness {
    pub ws_addr: SocketAddr,
    pub token: String,
    _jwks_addr: SocketAddr,
}

impl Harness {
    pub fn ws_url(&self, conversation_id: &str) -> String {
        format!("ws://{}/ws?token={}&conversationId={}", self.ws_addr, self.token, conversation_id)
    }
}

/// Starts the fake JWKS server and the orchestrator binary on ephemeral
/// ports, returning a harness with a freshly signed bearer token.
pub async fn spawn() -> Harness {
    let jwks_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let jwks_addr = jwks_listener.local_addr().unwrap();
    let jwks_app = Router::new().route(
        "/.well-known/jwks.json",
        get(|| async {
            Json(serde_json::json!({
                "keys": [JwkEntry { kty: "RSA", kid: TEST_KID, n: TEST_N, e: TEST_E, alg: "RS256" }]
            }))
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(jwks_listener, jwks_app).await;
    });

    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();

    // `build_runtime` reads `JWKS_URL` straight out of the process env at
    // startup, so the env vars have to stay put until that read has happened
    // inside the spawned task, not just until `from_env()` returns here.
    let guard = env_guard().lock().await;
    std::env::set_var("JWKS_URL", format!("http://{jwks_addr}/.well-known/jwks.json"));
    std::env::set_var("JWT_VERIFY_ISSUER", "false");
    std::env::set_var("JWT_VERIFY_AUDIENCE", "false");
    std::env::remove_var("LLM_API_KEY");
    let config = config::AppConfig::from_env();
    tokio::spawn(serve::run_serve_on_listener(ws_listener, config));

    // Give the spawned task a chance to run past its synchronous setup
    // (which reads the env vars above) before this function releases the lock.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    drop(guard);

    let token = sign_token("user-1");

    Harness { ws_addr, token, _jwks_addr: jwks_addr }
}

fn sign_token(sub: &str) -> String {
    let mut header = Header::new(jsonwebtoken::Algorithm::RS256);
    header.kid = Some(TEST_KID.to_string());
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64;
    let claims = Claims {
        sub: sub.to_string(),
        exp: now + 3600,
    };
    let key = EncodingKey::from_rsa_pem(TEST_PRIVATE_KEY_PEM.as_bytes()).unwrap();
    encode(&header, &claims, &key).unwrap()
}
