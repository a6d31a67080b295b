//! §4.6: the per-user spawn/stop state machine. The only writer of
//! `user.server_id` and `user.state`, and the only place concurrent
//! spawns/stops for the same user are serialized.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::HubError;
use crate::model::{Hub, Server, User};
use crate::proxy_client::ProxyClient;
use crate::spawner::{LocalProcessSpawner, Spawner, SpawnerConfig};
use crate::store::Store;

type LiveSpawner = Arc<Mutex<Box<dyn Spawner>>>;

/// Builds the `Spawner` a given spawn attempt should use. Defaults to
/// `LocalProcessSpawner::new`; tests substitute a fake so the state machine
/// can be exercised without launching real processes.
type SpawnerFactory = Arc<dyn Fn(&User, &Hub, String, SpawnerConfig) -> Box<dyn Spawner> + Send + Sync>;

/// At most one in-flight spawn or stop per user, mirroring the teacher's
/// `RwLock`-guarded per-key map (`AppState.window_resets`) rather than
/// reaching for an external per-key-lock crate. `live` is this process's
/// attachment of `user.spawner`: the actual running `Child` handle a
/// `Server` row points at while the Hub that spawned it is still up.
#[derive(Clone)]
pub struct SpawnController {
    store: Store,
    proxy: Arc<ProxyClient>,
    spawner_config: SpawnerConfig,
    spawner_factory: SpawnerFactory,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    live: Arc<Mutex<HashMap<String, LiveSpawner>>>,
}

impl SpawnController {
    pub fn new(store: Store, proxy: ProxyClient, spawner_config: SpawnerConfig) -> Self {
        Self::with_factory(
            store,
            proxy,
            spawner_config,
            Arc::new(|user, hub, api_token, config| {
                Box::new(LocalProcessSpawner::new(user, hub, api_token, config)) as Box<dyn Spawner>
            }),
        )
    }

    pub fn with_factory(
        store: Store,
        proxy: ProxyClient,
        spawner_config: SpawnerConfig,
        spawner_factory: SpawnerFactory,
    ) -> Self {
        Self {
            store,
            proxy: Arc::new(proxy),
            spawner_config,
            spawner_factory,
            locks: Arc::new(Mutex::new(HashMap::new())),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_for(&self, user_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(user_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn take_live(&self, user_name: &str) -> Option<LiveSpawner> {
        self.live.lock().await.remove(user_name)
    }

    /// Idle -> Spawning -> Running (§4.6). Awaits the proxy register before
    /// returning, so a caller never redirects to a route that doesn't exist
    /// yet.
    pub async fn spawn(&self, user: &User, hub: &Hub) -> Result<Server, HubError> {
        let user_lock = self.lock_for(&user.name).await;
        let _guard = user_lock.lock().await;

        if let Some(server) = self.store.get_user_server(user).await? {
            return Ok(server);
        }

        let api_token = self.store.mint_api_token(user.id).await?;
        let mut spawner = (self.spawner_factory)(user, hub, api_token, self.spawner_config.clone());

        if let Err(e) = spawner.start().await {
            warn!(user = %user.name, error = %e, "spawn failed, tearing down");
            let _ = spawner.stop().await;
            self.store.clear_api_tokens(user.id).await?;
            return Err(e);
        }

        let host = spawner.host();
        let ip = host.split(':').next().unwrap_or("127.0.0.1").to_string();
        let port = host.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap_or(0);

        let mut new_server = Server::derive_for_user(&hub.server, &user.name);
        new_server.ip = ip;
        new_server.port = port;

        let server = match self.store.set_user_server(user.id, &new_server).await {
            Ok(server) => server,
            Err(e) => {
                let _ = spawner.stop().await;
                self.store.clear_api_tokens(user.id).await?;
                return Err(e);
            }
        };

        self.store
            .set_user_state(user.id, &spawner.get_state())
            .await?;

        if let Err(e) = self.proxy.register(&server.base_url, &host, &user.name).await {
            warn!(user = %user.name, error = %e, "proxy register failed, tearing down spawn");
            let _ = spawner.stop().await;
            self.store.clear_user_server(user.id).await?;
            self.store.clear_api_tokens(user.id).await?;
            return Err(e);
        }

        self.live
            .lock()
            .await
            .insert(user.name.clone(), Arc::new(Mutex::new(spawner)));

        info!(user = %user.name, host = %host, "user server running");
        Ok(server)
    }

    /// Running -> Stopping -> Idle (§4.6). Idempotent: returns immediately
    /// if the user has no active server.
    pub async fn stop(&self, user: &User) -> Result<(), HubError> {
        let user_lock = self.lock_for(&user.name).await;
        let _guard = user_lock.lock().await;

        let Some(server) = self.store.get_user_server(user).await? else {
            return Ok(());
        };

        if let Some(spawner) = self.take_live(&user.name).await {
            let mut spawner = spawner.lock().await;
            if spawner.poll().await?.is_none() {
                spawner.stop().await?;
            }
        }

        if let Err(e) = self.proxy.unregister(&server.base_url).await {
            warn!(user = %user.name, error = %e, "proxy unregister failed, continuing teardown");
        }

        self.store.clear_user_server(user.id).await?;
        self.store
            .set_user_state(user.id, &serde_json::json!({}))
            .await?;
        self.store.clear_api_tokens(user.id).await?;

        info!(user = %user.name, "user server stopped");
        Ok(())
    }

    /// Ensures the user has a live server, re-spawning (replacing the
    /// `Server`/`APIToken`) if the process died out-of-band. A dead process
    /// is detected either by `poll()` on this Hub's own live handle, or —
    /// if this Hub process never held one (e.g. it restarted) — by the
    /// readiness probe failing against the persisted address.
    pub async fn ensure_running(&self, user: &User, hub: &Hub) -> Result<Server, HubError> {
        let Some(server) = self.store.get_user_server(user).await? else {
            return self.spawn(user, hub).await;
        };

        let still_up = match self.live.lock().await.get(&user.name).cloned() {
            Some(spawner) => spawner.lock().await.poll().await?.is_none(),
            None => {
                crate::spawner::readiness::wait_for_server(
                    &server.ip,
                    server.port,
                    std::time::Duration::from_millis(200),
                )
                .await
                .is_ok()
            }
        };

        if still_up {
            return Ok(server);
        }

        warn!(user = %user.name, "server process appears dead, re-spawning");
        self.take_live(&user.name).await;
        self.store.clear_user_server(user.id).await?;
        self.store.clear_api_tokens(user.id).await?;
        self.spawn(user, hub).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::Router;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;
    use crate::model::NewServer;

    /// Never touches a real process; `alive` lets a test simulate the
    /// process dying out from under the controller.
    struct FakeSpawner {
        alive: Arc<AtomicBool>,
        host: String,
    }

    #[async_trait]
    impl Spawner for FakeSpawner {
        async fn start(&mut self) -> Result<(), HubError> {
            self.alive.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), HubError> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn poll(&mut self) -> Result<Option<i32>, HubError> {
            Ok(if self.alive.load(Ordering::SeqCst) { None } else { Some(0) })
        }

        fn get_state(&self) -> serde_json::Value {
            json!({ "fake": true })
        }

        fn host(&self) -> String {
            self.host.clone()
        }
    }

    /// A fake Proxy API: accepts any POST/DELETE and counts them, so tests
    /// can assert `register`/`unregister` were actually called without a
    /// real proxy process.
    async fn spawn_fake_proxy() -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let app = Router::new().fallback(move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                axum::http::StatusCode::OK
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), calls)
    }

    /// Builds a controller over a fresh temp-file database and a fake proxy,
    /// whose spawns always use `FakeSpawner`s keyed by username so a test can
    /// reach in and flip a user's `alive` flag to simulate a crash. Also
    /// records each minted api token by username, so a test can check it was
    /// actually dropped from the store on teardown/respawn.
    type ControllerFixture = (
        SpawnController,
        Store,
        Hub,
        Arc<Mutex<StdHashMap<String, Arc<AtomicBool>>>>,
        Arc<AtomicUsize>,
        Arc<Mutex<StdHashMap<String, String>>>,
    );

    async fn test_controller() -> ControllerFixture {
        let path = tempfile::NamedTempFile::new().unwrap().path().to_path_buf();
        let database = crate::db::open(&path).await.unwrap();
        let store = Store::new(Arc::new(database));
        let hub = store.put_hub(&NewServer::default()).await.unwrap();

        let (proxy_url, calls) = spawn_fake_proxy().await;
        let http = reqwest::Client::new();
        let proxy = ProxyClient::new(http, proxy_url, "test-proxy-token");

        let alive_flags: Arc<Mutex<StdHashMap<String, Arc<AtomicBool>>>> = Arc::new(Mutex::new(StdHashMap::new()));
        let issued_tokens: Arc<Mutex<StdHashMap<String, String>>> = Arc::new(Mutex::new(StdHashMap::new()));
        let flags_for_factory = alive_flags.clone();
        let tokens_for_factory = issued_tokens.clone();
        let factory: SpawnerFactory = Arc::new(move |user, _hub, api_token, _config| {
            let alive = Arc::new(AtomicBool::new(false));
            flags_for_factory
                .try_lock()
                .expect("factory invoked without contention in tests")
                .insert(user.name.clone(), alive.clone());
            tokens_for_factory
                .try_lock()
                .expect("factory invoked without contention in tests")
                .insert(user.name.clone(), api_token);
            Box::new(FakeSpawner {
                alive,
                host: format!("127.0.0.1:{}", 40000 + (user.id as u16) % 1000),
            }) as Box<dyn Spawner>
        });

        let controller = SpawnController::with_factory(store.clone(), proxy, SpawnerConfig::default(), factory);
        (controller, store, hub, alive_flags, calls, issued_tokens)
    }

    #[tokio::test]
    async fn spawn_happy_path_persists_server_and_registers_with_proxy() {
        let (controller, store, hub, _flags, calls, _tokens) = test_controller().await;
        let user = store.get_or_create_user("alice").await.unwrap();

        let server = controller.spawn(&user, &hub).await.unwrap();
        assert_eq!(server.base_url, format!("{}/user/alice", hub.server.base_url));

        let reloaded = store.get_user_by_id(user.id).await.unwrap();
        assert_eq!(reloaded.server_id, Some(server.id));
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn concurrent_spawns_for_the_same_user_do_not_double_spawn() {
        let (controller, store, hub, _flags, _calls, _tokens) = test_controller().await;
        let user = store.get_or_create_user("bob").await.unwrap();

        let (a, b) = tokio::join!(controller.spawn(&user, &hub), controller.spawn(&user, &hub));
        let (server_a, server_b) = (a.unwrap(), b.unwrap());
        assert_eq!(server_a.id, server_b.id);
    }

    #[tokio::test]
    async fn ensure_running_respawns_after_the_process_dies() {
        let (controller, store, hub, flags, _calls, tokens) = test_controller().await;
        let user = store.get_or_create_user("carol").await.unwrap();

        let first = controller.spawn(&user, &hub).await.unwrap();
        let first_token = tokens.lock().await.get("carol").unwrap().clone();

        flags
            .lock()
            .await
            .get("carol")
            .unwrap()
            .store(false, Ordering::SeqCst);

        let user = store.get_user_by_id(user.id).await.unwrap();
        let second = controller.ensure_running(&user, &hub).await.unwrap();
        let second_token = tokens.lock().await.get("carol").unwrap().clone();

        assert_ne!(first.id, second.id);
        assert_ne!(first_token, second_token);
        assert!(store.find_api_token(&first_token).await.unwrap().is_none());
        assert!(store.find_api_token(&second_token).await.unwrap().is_some());
        assert!(flags.lock().await.get("carol").unwrap().load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_is_idempotent_for_a_user_with_no_server() {
        let (controller, store, _hub, _flags, _calls, _tokens) = test_controller().await;
        let user = store.get_or_create_user("dora").await.unwrap();
        controller.stop(&user).await.unwrap();
        controller.stop(&user).await.unwrap();
    }

    #[tokio::test]
    async fn stop_drops_the_spawn_s_api_token() {
        let (controller, store, hub, _flags, _calls, tokens) = test_controller().await;
        let user = store.get_or_create_user("erin").await.unwrap();

        controller.spawn(&user, &hub).await.unwrap();
        let token = tokens.lock().await.get("erin").unwrap().clone();
        assert!(store.find_api_token(&token).await.unwrap().is_some());

        let user = store.get_user_by_id(user.id).await.unwrap();
        controller.stop(&user).await.unwrap();

        assert!(store.find_api_token(&token).await.unwrap().is_none());
    }
}
