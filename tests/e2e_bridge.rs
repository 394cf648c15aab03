#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use autofill_vault::accounts::{Account, AuthMethod};
use autofill_vault::bridge::cache::{AgentSession, MappingCache};
use autofill_vault::bridge::client::{BridgeClient, BridgeClientError};
use autofill_vault::bridge::server;
use autofill_vault::config::BridgeConfig;
use autofill_vault::error::ErrorCode;
use autofill_vault::presence::{PresenceCheck, PresenceVerdict, StaticPresence};
use autofill_vault::service::{OutcomeSummary, Service};
use tempfile::TempDir;
use tokio::sync::oneshot;

/// Daemon on its own thread and runtime. Stopping it drops the runtime, which closes every
/// open session the way a process exit would.
struct TestDaemon {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestDaemon {
    fn start(socket_path: &Path, service: Arc<Service>, config: BridgeConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
        let socket_path = socket_path.to_path_buf();
        let thread = thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .expect("build daemon runtime");
            runtime.block_on(async move {
                let listener = server::bind(&socket_path).expect("bind bridge socket");
                let _ = ready_tx.send(());
                server::serve_listener(listener, service, config, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            });
            runtime.shutdown_timeout(Duration::from_secs(2));
        });
        ready_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("daemon did not become ready");
        Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Approves after a pause, so a credentials request stays in flight for a while.
struct SlowApproval(Duration);

impl PresenceCheck for SlowApproval {
    fn check(&self, _reason: &str) -> PresenceVerdict {
        thread::sleep(self.0);
        PresenceVerdict::Approved
    }
}

struct Fixture {
    dir: TempDir,
    service: Arc<Service>,
    presence: Arc<StaticPresence>,
}

impl Fixture {
    fn new(presence: StaticPresence) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let presence = Arc::new(presence);
        let service = Service::open(dir.path(), presence.clone(), Duration::from_secs(60))
            .expect("open service");
        Self {
            dir,
            service: Arc::new(service),
            presence,
        }
    }

    fn with_check(check: Arc<dyn PresenceCheck>) -> (TempDir, Arc<Service>) {
        let dir = TempDir::new().expect("temp dir");
        let service = Service::open(dir.path(), check, Duration::from_secs(60)).expect("open");
        (dir, Arc::new(service))
    }

    fn socket(&self) -> PathBuf {
        self.dir.path().join("run").join("bridge.sock")
    }
}

fn fast_config() -> BridgeConfig {
    BridgeConfig {
        request_timeout: Duration::from_secs(5),
        settle_delay: Duration::from_millis(50),
        ..BridgeConfig::default()
    }
}

fn account_with_secret(service: &Service, name: &str, username: &str, password: &str) -> Account {
    let account = service
        .add_account(name, username, AuthMethod::Otp)
        .expect("add account");
    service
        .save_secret(&account.id, password, Some(format!("SEED-{}", name)))
        .expect("save secret");
    account
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_match_resolves_and_releases_credentials_after_presence() {
    let f = Fixture::new(StaticPresence::approving());
    let work = account_with_secret(&f.service, "Work", "alice@contoso.com", "pw-work");
    f.service
        .add_mapping("*.contoso.com", &work.id, false)
        .expect("add mapping");
    let daemon = TestDaemon::start(&f.socket(), f.service.clone(), fast_config());

    let client = BridgeClient::new(f.socket(), fast_config());
    let outcome = client.resolve_origin("login.contoso.com").await.expect("resolve");
    assert_eq!(
        outcome,
        OutcomeSummary::Resolved {
            account_id: work.id.clone(),
            display_name: "Work".to_string(),
        }
    );
    assert_eq!(f.presence.checks(), 0);

    let credentials = client.get_credentials(&work.id).await.expect("credentials");
    assert_eq!(credentials.username, "alice@contoso.com");
    assert_eq!(credentials.password, "pw-work");
    assert_eq!(credentials.method_detail.as_deref(), Some("SEED-Work"));
    assert_eq!(f.presence.checks(), 1);

    let nothing = client.resolve_origin("example.org").await.expect("resolve");
    assert_eq!(nothing, OutcomeSummary::NotFound);
    daemon.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ambiguous_match_needs_a_selection_that_is_consumed_once() {
    let f = Fixture::new(StaticPresence::approving());
    let personal = account_with_secret(&f.service, "Personal", "me@example.com", "pw-p");
    let work = account_with_secret(&f.service, "Work", "me@contoso.com", "pw-w");
    let stranger = account_with_secret(&f.service, "Other", "x@example.com", "pw-x");
    f.service.add_mapping("*.contoso.com", &personal.id, false).unwrap();
    f.service.add_mapping("login.contoso.com", &work.id, false).unwrap();
    let daemon = TestDaemon::start(&f.socket(), f.service.clone(), fast_config());

    let client = BridgeClient::new(f.socket(), fast_config());
    let OutcomeSummary::NeedsSelection {
        selection_id,
        candidates,
    } = client.resolve_origin("login.contoso.com").await.unwrap()
    else {
        panic!("expected a selection");
    };
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].account_id, personal.id);
    assert_eq!(candidates[1].display_name, "Work");

    let err = client
        .select_account(&selection_id, &stranger.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSelection);

    let chosen = client.select_account(&selection_id, &work.id).await.unwrap();
    assert_eq!(
        chosen,
        OutcomeSummary::Resolved {
            account_id: work.id.clone(),
            display_name: "Work".to_string(),
        }
    );

    let again = client
        .select_account(&selection_id, &work.id)
        .await
        .unwrap_err();
    assert_eq!(again.code(), ErrorCode::InvalidSelection);

    let credentials = client.get_credentials(&work.id).await.unwrap();
    assert_eq!(credentials.password, "pw-w");
    daemon.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_presence_and_missing_secret_are_reported_by_code() {
    let f = Fixture::new(StaticPresence::denying());
    let work = account_with_secret(&f.service, "Work", "alice@contoso.com", "pw-work");
    let empty = f
        .service
        .add_account("Empty", "nobody@contoso.com", AuthMethod::Otp)
        .unwrap();
    let daemon = TestDaemon::start(&f.socket(), f.service.clone(), fast_config());

    let client = BridgeClient::new(f.socket(), fast_config());
    let err = client.get_credentials(&work.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PresenceDenied);
    assert_eq!(f.presence.checks(), 1);

    let err = client.get_credentials(&empty.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    // No record, no prompt.
    assert_eq!(f.presence.checks(), 1);

    let err = client.resolve_origin("   ").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);
    daemon.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replies_are_matched_by_id_when_they_complete_out_of_order() {
    let (dir, service) = Fixture::with_check(Arc::new(SlowApproval(Duration::from_millis(400))));
    let work = account_with_secret(&service, "Work", "alice@contoso.com", "pw-work");
    service.add_mapping("*.contoso.com", &work.id, false).unwrap();
    let socket = dir.path().join("bridge.sock");
    let daemon = TestDaemon::start(&socket, service.clone(), fast_config());

    let client = BridgeClient::new(&socket, fast_config());
    // Establish the session first so both requests share it.
    client.get_all_mappings().await.unwrap();

    let started = Instant::now();
    let (credentials, mappings) = tokio::join!(
        async {
            let r = client.get_credentials(&work.id).await;
            (r, started.elapsed())
        },
        async {
            let r = client.get_all_mappings().await;
            (r, started.elapsed())
        },
    );
    let (credentials, slow_done) = credentials;
    let (mappings, fast_done) = mappings;
    assert_eq!(credentials.unwrap().password, "pw-work");
    assert_eq!(mappings.unwrap().len(), 1);
    assert!(fast_done < slow_done, "mappings reply waited behind the presence check");
    daemon.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_client_identity_is_refused() {
    let f = Fixture::new(StaticPresence::approving());
    let daemon = TestDaemon::start(&f.socket(), f.service.clone(), fast_config());

    let intruder = BridgeClient::new(
        f.socket(),
        BridgeConfig {
            client_id: "com.example.intruder".to_string(),
            ..fast_config()
        },
    );
    let err = intruder.get_all_mappings().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnauthorizedClient);
    assert!(!intruder.is_connected().await);

    let agent = BridgeClient::new(f.socket(), fast_config());
    assert!(agent.get_all_mappings().await.unwrap().is_empty());
    daemon.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reconnects_once_after_the_daemon_restarts() {
    let f = Fixture::new(StaticPresence::approving());
    let work = account_with_secret(&f.service, "Work", "alice@contoso.com", "pw-work");
    f.service.add_mapping("*.contoso.com", &work.id, false).unwrap();
    let client = BridgeClient::new(f.socket(), fast_config());

    let daemon = TestDaemon::start(&f.socket(), f.service.clone(), fast_config());
    assert_eq!(client.get_all_mappings().await.unwrap().len(), 1);
    assert!(client.is_connected().await);
    daemon.stop();

    let deadline = Instant::now() + Duration::from_secs(3);
    while client.is_connected().await {
        assert!(Instant::now() < deadline, "client never noticed the daemon going away");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Daemon still down: one settle delay, one attempt, then a clean failure.
    let started = Instant::now();
    let err = client.get_all_mappings().await.unwrap_err();
    assert_eq!(err, BridgeClientError::ConnectionLost);
    assert!(started.elapsed() >= Duration::from_millis(50));

    let daemon = TestDaemon::start(&f.socket(), f.service.clone(), fast_config());
    let outcome = client.resolve_origin("app.contoso.com").await.unwrap();
    assert!(matches!(outcome, OutcomeSummary::Resolved { .. }));
    assert!(client.is_connected().await);
    daemon.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_flight_request_fails_when_the_daemon_exits_and_a_retry_succeeds() {
    let (dir, service) = Fixture::with_check(Arc::new(SlowApproval(Duration::from_millis(800))));
    let work = account_with_secret(&service, "Work", "alice@contoso.com", "pw-work");
    service.add_mapping("*.contoso.com", &work.id, false).unwrap();
    let socket = dir.path().join("bridge.sock");
    let daemon = TestDaemon::start(&socket, service.clone(), fast_config());

    let client = BridgeClient::new(&socket, fast_config());
    client.get_all_mappings().await.unwrap();

    // The daemon goes away while the presence check is still waiting on the user.
    let (outcome, stopped) = tokio::join!(client.get_credentials(&work.id), async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::spawn_blocking(move || daemon.stop()).await
    });
    stopped.expect("daemon stop");
    assert_eq!(outcome.unwrap_err(), BridgeClientError::ConnectionLost);
    assert!(!client.is_connected().await);

    let daemon = TestDaemon::start(&socket, service.clone(), fast_config());
    let credentials = client.get_credentials(&work.id).await.unwrap();
    assert_eq!(credentials.username, "alice@contoso.com");
    assert_eq!(credentials.password, "pw-work");
    assert!(client.is_connected().await);
    daemon.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_matches_from_its_cache_while_the_daemon_is_down() {
    let f = Fixture::new(StaticPresence::approving());
    let personal = account_with_secret(&f.service, "Personal", "me@example.com", "pw-p");
    let work = account_with_secret(&f.service, "Work", "me@contoso.com", "pw-w");
    f.service.add_mapping("*.contoso.com", &personal.id, false).unwrap();
    f.service.add_mapping("login.contoso.com", &work.id, false).unwrap();
    let cache_root = f.dir.path().join("agent-state");

    let daemon = TestDaemon::start(&f.socket(), f.service.clone(), fast_config());
    let session = AgentSession::new(
        BridgeClient::new(f.socket(), fast_config()),
        MappingCache::under(&cache_root),
    );
    assert_eq!(session.mappings(true).await.unwrap().len(), 2);
    daemon.stop();

    // A fresh agent process: empty memory, same cache file.
    let restarted = AgentSession::new(
        BridgeClient::new(f.socket(), fast_config()),
        MappingCache::under(&cache_root),
    );
    let candidates = restarted.candidates_for("login.contoso.com").await.unwrap();
    let ids: Vec<_> = candidates.iter().map(|c| c.account_id.clone()).collect();
    assert_eq!(ids, vec![personal.id.clone(), work.id.clone()]);
    assert!(restarted
        .candidates_for("unrelated.example.org")
        .await
        .unwrap()
        .is_empty());

    let err = restarted.credentials(&work.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionLost);
}
