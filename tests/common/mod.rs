//! Shared fixtures: a fake order backend + stand, a fake motor controller,
//! and an orchestrator wired to both with short timings.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use delivery_bot::config::{BotConfig, FileConfigStore};
use delivery_bot::link::{self, CommandLink};
use delivery_bot::orchestrator::{Orchestrator, RestartHandle};
use delivery_bot::reader::TagEvent;

pub const SNAPSHOT: &str = r#"{"orderId":"p1","apple":["abcd1234",2],"banana":["ef001122",1]}"#;
pub const ADMIN_TAG: &str = "a1b2c3d4";
pub const TEST_TAG: &str = "34e0ef03";

// ============================================================================
// Fake backend + stand
// ============================================================================

pub struct BackendLog {
    pub payment_body: Mutex<String>,
    pub confirm_first_set: AtomicBool,
    pub confirm_add: AtomicBool,
    pub confirm_reset: AtomicBool,
    pub stand_status: AtomicU16,
    pub payment_calls: AtomicU32,
    pub first_set_calls: AtomicU32,
    pub reset_calls: AtomicU32,
    pub stand_calls: AtomicU32,
    pub added: Mutex<Vec<String>>,
    pub forwarded: Mutex<Vec<String>>,
}

impl BackendLog {
    fn new() -> Self {
        Self {
            payment_body: Mutex::new(SNAPSHOT.to_string()),
            confirm_first_set: AtomicBool::new(true),
            confirm_add: AtomicBool::new(true),
            confirm_reset: AtomicBool::new(true),
            stand_status: AtomicU16::new(200),
            payment_calls: AtomicU32::new(0),
            first_set_calls: AtomicU32::new(0),
            reset_calls: AtomicU32::new(0),
            stand_calls: AtomicU32::new(0),
            added: Mutex::new(Vec::new()),
            forwarded: Mutex::new(Vec::new()),
        }
    }

    pub fn set_payment(&self, body: &str) {
        *self.payment_body.lock().unwrap() = body.to_string();
    }

    pub fn added(&self) -> Vec<String> {
        self.added.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> u32 {
        self.payment_calls.load(Ordering::SeqCst)
            + self.first_set_calls.load(Ordering::SeqCst)
            + self.reset_calls.load(Ordering::SeqCst)
            + self.stand_calls.load(Ordering::SeqCst)
            + self.added.lock().unwrap().len() as u32
            + self.forwarded.lock().unwrap().len() as u32
    }
}

type Uid = Query<HashMap<String, String>>;

fn uid_of(q: &Uid) -> String {
    q.get("uid").cloned().unwrap_or_default()
}

/// Serve the backend and stand routes on one ephemeral port.
pub async fn spawn_backend() -> (Arc<BackendLog>, u16) {
    let log = Arc::new(BackendLog::new());

    let app = Router::new()
        .route(
            "/bot/payment",
            get(|State(log): State<Arc<BackendLog>>| async move {
                log.payment_calls.fetch_add(1, Ordering::SeqCst);
                let body = log.payment_body.lock().unwrap().clone();
                body
            }),
        )
        .route(
            "/bot/first-set-working-list",
            get(|State(log): State<Arc<BackendLog>>| async move {
                log.first_set_calls.fetch_add(1, Ordering::SeqCst);
                if log.confirm_first_set.load(Ordering::SeqCst) {
                    (StatusCode::OK, "초기 작업 리스트 생성 완료")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "busy")
                }
            }),
        )
        .route(
            "/bot/reset-working-list",
            get(|State(log): State<Arc<BackendLog>>| async move {
                log.reset_calls.fetch_add(1, Ordering::SeqCst);
                if log.confirm_reset.load(Ordering::SeqCst) {
                    (StatusCode::OK, "작업 리스트를 초기화했습니다")
                } else {
                    (StatusCode::BAD_GATEWAY, "upstream error")
                }
            }),
        )
        .route(
            "/bot/add-working-list",
            get(|State(log): State<Arc<BackendLog>>, q: Uid| async move {
                log.added.lock().unwrap().push(uid_of(&q));
                if log.confirm_add.load(Ordering::SeqCst) {
                    (StatusCode::OK, "작업 리스트에 추가")
                } else {
                    (StatusCode::CONFLICT, "item not in order")
                }
            }),
        )
        .route(
            "/up-rfid",
            get(|State(log): State<Arc<BackendLog>>, _q: Uid| async move {
                log.stand_calls.fetch_add(1, Ordering::SeqCst);
                StatusCode::from_u16(log.stand_status.load(Ordering::SeqCst))
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }),
        )
        .route(
            "/bot/log",
            post(|State(log): State<Arc<BackendLog>>, body: String| async move {
                log.forwarded.lock().unwrap().push(body);
                "logged"
            }),
        )
        .with_state(log.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (log, port)
}

// ============================================================================
// Fake motor controller
// ============================================================================

pub struct Controller {
    pub received: Mutex<Vec<String>>,
    pub ack: AtomicBool,
}

impl Controller {
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.received().iter().filter(|l| *l == command).count()
    }
}

/// Record every line, then ACK it while `ack` is set.
pub fn spawn_controller(mut link: CommandLink) -> Arc<Controller> {
    let controller = Arc::new(Controller {
        received: Mutex::new(Vec::new()),
        ack: AtomicBool::new(true),
    });
    let ctl = controller.clone();
    tokio::spawn(async move {
        while link.wait_for_line().await {
            while let Some(line) = link.receive_line() {
                ctl.received.lock().unwrap().push(line.trim().to_string());
                if ctl.ack.load(Ordering::SeqCst) && link.send_ack().is_err() {
                    return;
                }
            }
        }
    });
    controller
}

// ============================================================================
// Orchestrator harness
// ============================================================================

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub controller: Arc<Controller>,
    pub backend: Arc<BackendLog>,
    pub restart: RestartHandle,
    pub store_path: std::path::PathBuf,
    _dir: TempDir,
}

pub fn test_config(port: u16) -> BotConfig {
    let mut config = BotConfig::default();
    config.backend.host = "127.0.0.1".to_string();
    config.backend.port = port;
    config.backend.timeout_ms = 2_000;
    config.stand.host = "127.0.0.1".to_string();
    config.stand.port = port;
    config.stand.retry_delay_ms = 1;
    config.link.ack_window_ms = 30;
    config.link.backoff_ms = 1;
    config.ledger.refresh_delay_ms = 1;
    config.control.restart_delay_ms = 10;
    config
}

pub async fn harness_with(tweak: impl FnOnce(&mut BotConfig)) -> Harness {
    let (backend, port) = spawn_backend().await;
    let mut config = test_config(port);
    tweak(&mut config);

    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("bot_config.toml");
    let store = Arc::new(FileConfigStore::new(&store_path));

    let (bot_side, controller_side) = link::pair();
    let controller = spawn_controller(controller_side);
    let restart = RestartHandle::new(CancellationToken::new());

    let orchestrator =
        Orchestrator::new(Arc::new(config), bot_side, store, restart.clone()).unwrap();

    Harness {
        orchestrator,
        controller,
        backend,
        restart,
        store_path,
        _dir: dir,
    }
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub fn tag(id: &str) -> TagEvent {
    TagEvent {
        tag_id: id.to_string(),
        read_at: Utc::now(),
    }
}
