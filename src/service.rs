//! SignInService implementing FgpService trait.
//!
//! Requests are parsed into a [`ServiceRequest`] and answered on the
//! service's own tokio runtime. The browser is launched on first use.

use anyhow::{Context, Result};
use chrono::Local;
use fgp_daemon::service::MethodInfo;
use fgp_daemon::FgpService;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::browser::executor::SignInExecutor;
use crate::browser::BrowserClient;
use crate::interactive::{InteractiveFlow, SignInOptions};
use crate::models::{ConfigEvent, SiteConfig};
use crate::orchestrator::BatchOrchestrator;
use crate::settings::Settings;
use crate::store::{AppState, JsonFileStore, StatusStore};

/// Config a test runs against.
#[derive(Debug, Clone, PartialEq)]
pub enum TestTarget {
    /// A stored site, by id
    Saved(String),
    /// Unsaved form values; nothing is written
    Inline(SiteConfig),
}

/// A daemon request decoded from an FGP method and its params.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    Health,
    /// Sign in everywhere; `None` uses the stored preference
    RunAll { show_process: Option<bool> },
    SignInSite {
        id: String,
        show_process: Option<bool>,
        verbose: bool,
    },
    TestConfig { target: TestTarget, need_details: bool },
    ListSites,
    SaveSite { config: SiteConfig },
    DeleteSite { id: String },
    Status,
    /// Read the preference, or set it when `value` is given
    ShowProcess { value: Option<bool> },
    Refresh,
}

fn string_param(params: &HashMap<String, Value>, name: &str) -> Result<String> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .with_context(|| format!("Missing '{}' parameter", name))
}

fn bool_param(params: &HashMap<String, Value>, name: &str) -> Option<bool> {
    params.get(name).and_then(|v| v.as_bool())
}

impl ServiceRequest {
    pub fn parse(method: &str, params: &HashMap<String, Value>) -> Result<Self> {
        let request = match method {
            "health" => Self::Health,
            "signin.run_all" | "run_all" => Self::RunAll {
                show_process: bool_param(params, "show_process"),
            },
            "signin.site" | "site" => Self::SignInSite {
                id: string_param(params, "id")?,
                show_process: bool_param(params, "show_process"),
                verbose: bool_param(params, "verbose").unwrap_or(false),
            },
            "signin.test" | "test" => Self::TestConfig {
                target: match params.get("config") {
                    Some(config) => TestTarget::Inline(
                        serde_json::from_value(config.clone()).context("Invalid 'config' parameter")?,
                    ),
                    None => TestTarget::Saved(string_param(params, "id")?),
                },
                need_details: bool_param(params, "need_details").unwrap_or(false),
            },
            "signin.sites.list" | "sites.list" => Self::ListSites,
            "signin.sites.save" | "sites.save" => {
                let config = params
                    .get("config")
                    .cloned()
                    .context("Missing 'config' parameter")?;
                Self::SaveSite {
                    config: serde_json::from_value(config).context("Invalid 'config' parameter")?,
                }
            }
            "signin.sites.delete" | "sites.delete" => Self::DeleteSite {
                id: string_param(params, "id")?,
            },
            "signin.status" | "status" => Self::Status,
            "signin.show_process" | "show_process" => Self::ShowProcess {
                value: bool_param(params, "value"),
            },
            "signin.refresh" | "refresh" => Self::Refresh,
            _ => anyhow::bail!("Unknown method: {}", method),
        };
        Ok(request)
    }
}

/// Sign-in automation service.
pub struct SignInService {
    runtime: Runtime,
    client: Arc<RwLock<Option<Arc<BrowserClient>>>>,
    store: Arc<StatusStore<JsonFileStore>>,
    state: Arc<RwLock<AppState>>,
    events: broadcast::Sender<ConfigEvent>,
    settings: Settings,
    user_data_dir: PathBuf,
    headless: bool,
    shutdown: CancellationToken,
}

impl SignInService {
    /// Directory holding the browser profile and the store file.
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".fgp")
            .join("services")
            .join("signin")
    }

    pub fn new(headless: bool, settings: Settings) -> Result<Self> {
        Self::with_base_dir(Self::default_base_dir(), headless, settings)
    }

    pub fn with_base_dir(base_dir: PathBuf, headless: bool, settings: Settings) -> Result<Self> {
        let runtime = Runtime::new().context("Failed to create tokio runtime")?;

        let user_data_dir = base_dir.join("user-data");
        std::fs::create_dir_all(&user_data_dir)?;

        let store = Arc::new(StatusStore::new(JsonFileStore::new(base_dir.join("store.json"))));
        let state = Arc::new(RwLock::new(
            AppState::load(&store).context("Failed to load stored sign-in state")?,
        ));
        tracing::info!(
            "Loaded {} site configs from {}",
            runtime.block_on(state.read()).configs.len(),
            base_dir.display()
        );

        let (events, receiver) = broadcast::channel(16);
        runtime.spawn(Self::listen_for_config_updates(receiver, state.clone()));

        Ok(Self {
            runtime,
            client: Arc::new(RwLock::new(None)),
            store,
            state,
            events,
            settings,
            user_data_dir,
            headless,
            shutdown: CancellationToken::new(),
        })
    }

    async fn listen_for_config_updates(
        mut receiver: broadcast::Receiver<ConfigEvent>,
        state: Arc<RwLock<AppState>>,
    ) {
        loop {
            match receiver.recv().await {
                Ok(ConfigEvent::ConfigUpdated { configs }) => {
                    tracing::debug!("Config update: {} sites", configs.len());
                    state.write().await.configs = configs;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} config updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn get_or_init_client(
        client: &Arc<RwLock<Option<Arc<BrowserClient>>>>,
        user_data_dir: &Path,
        headless: bool,
        settings: &Settings,
    ) -> Result<Arc<BrowserClient>> {
        if let Some(existing) = client.read().await.as_ref() {
            return Ok(Arc::clone(existing));
        }

        let mut client_lock = client.write().await;
        if client_lock.is_none() {
            tracing::info!("Launching browser...");
            let new_client = BrowserClient::new(
                user_data_dir.to_path_buf(),
                headless,
                SignInExecutor::new(settings),
            )
            .await?;
            *client_lock = Some(Arc::new(new_client));
        }

        client_lock
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| anyhow::anyhow!("Failed to get browser client"))
    }

    fn browser(&self) -> Result<Arc<BrowserClient>> {
        self.runtime.block_on(Self::get_or_init_client(
            &self.client,
            &self.user_data_dir,
            self.headless,
            &self.settings,
        ))
    }

    fn publish(&self, event: ConfigEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("No listener for config update");
        }
    }

    fn find_site(&self, id: &str) -> Result<SiteConfig> {
        if let Some(config) = self.runtime.block_on(self.state.read()).configs.get(id) {
            return Ok(config.clone());
        }
        // The listener may not have applied a fresh save yet.
        self.store
            .site_configs()?
            .get(id)
            .cloned()
            .with_context(|| format!("Unknown site '{}'", id))
    }

    fn reload_state(&self) -> Result<AppState> {
        let loaded = AppState::load(&self.store)?;
        *self.runtime.block_on(self.state.write()) = loaded.clone();
        Ok(loaded)
    }

    fn handle(&self, request: ServiceRequest) -> Result<Value> {
        match request {
            ServiceRequest::Health => self.handle_health(),
            ServiceRequest::RunAll { show_process } => self.handle_run_all(show_process),
            ServiceRequest::SignInSite {
                id,
                show_process,
                verbose,
            } => self.handle_sign_in_site(&id, show_process, verbose),
            ServiceRequest::TestConfig {
                target,
                need_details,
            } => self.handle_test_config(target, need_details),
            ServiceRequest::ListSites => self.handle_list_sites(),
            ServiceRequest::SaveSite { config } => self.handle_save_site(config),
            ServiceRequest::DeleteSite { id } => self.handle_delete_site(&id),
            ServiceRequest::Status => self.handle_status(),
            ServiceRequest::ShowProcess { value } => self.handle_show_process(value),
            ServiceRequest::Refresh => {
                let state = self.reload_state()?;
                Ok(json!({"success": true, "sites": state.configs.len()}))
            }
        }
    }

    fn handle_health(&self) -> Result<Value> {
        let client = self.client.clone();

        let healthy = self.runtime.block_on(async {
            let client_lock = client.read().await;
            if let Some(ref browser_client) = *client_lock {
                browser_client.health_check().await.unwrap_or(false)
            } else {
                true // No browser yet is OK
            }
        });
        let sites = self.runtime.block_on(self.state.read()).configs.len();

        Ok(json!({
            "healthy": healthy,
            "service": "signin",
            "version": env!("CARGO_PKG_VERSION"),
            "sites": sites
        }))
    }

    fn handle_run_all(&self, show_process: Option<bool>) -> Result<Value> {
        let show_process = match show_process {
            Some(show) => show,
            None => self.store.show_process()?,
        };
        let client = self.browser()?;
        let orchestrator = BatchOrchestrator::new(client, self.settings.clone());

        let result = self.runtime.block_on(orchestrator.run_and_record(
            &self.store,
            show_process,
            &self.shutdown,
        ));
        if let Err(e) = self.reload_state() {
            tracing::warn!("Could not refresh state after batch: {:#}", e);
        }

        Ok(serde_json::to_value(result)?)
    }

    fn handle_sign_in_site(&self, id: &str, show_process: Option<bool>, verbose: bool) -> Result<Value> {
        let config = self.find_site(id)?;
        let options = SignInOptions {
            show_process: match show_process {
                Some(show) => show,
                None => self.store.show_process()?,
            },
            verbose,
        };
        let flow = InteractiveFlow::new(self.browser()?, self.settings.clone());

        let outcome = self.runtime.block_on(flow.sign_in_and_record(
            &self.store,
            &config,
            options,
            &self.shutdown,
        ));
        if let Err(e) = self.reload_state() {
            tracing::warn!("Could not refresh state after sign-in: {:#}", e);
        }

        Ok(serde_json::to_value(outcome?)?)
    }

    fn handle_test_config(&self, target: TestTarget, need_details: bool) -> Result<Value> {
        let config = match target {
            TestTarget::Saved(id) => self.find_site(&id)?,
            TestTarget::Inline(config) => config,
        };
        // Validate before the browser is launched.
        config.validate()?;
        let flow = InteractiveFlow::new(self.browser()?, self.settings.clone());

        let result = self
            .runtime
            .block_on(flow.test_config(&config, need_details, &self.shutdown))?;
        Ok(serde_json::to_value(result)?)
    }

    fn handle_list_sites(&self) -> Result<Value> {
        let configs = self.store.site_configs()?;
        Ok(json!({ "sites": configs.iter().collect::<Vec<_>>() }))
    }

    fn handle_save_site(&self, mut config: SiteConfig) -> Result<Value> {
        config.ensure_id();
        let id = config.id.clone();
        let configs = self.store.save_site_config(config)?;
        tracing::info!("Saved site {}", id);
        self.publish(ConfigEvent::ConfigUpdated { configs });

        Ok(json!({"success": true, "id": id}))
    }

    fn handle_delete_site(&self, id: &str) -> Result<Value> {
        let (configs, removed) = self.store.delete_site_config(id)?;
        if removed {
            tracing::info!("Deleted site {}", id);
            self.publish(ConfigEvent::ConfigUpdated { configs });
        }

        Ok(json!({"success": removed, "id": id}))
    }

    fn handle_status(&self) -> Result<Value> {
        let report = self
            .runtime
            .block_on(self.state.read())
            .status_report(Local::now());
        Ok(json!({ "statuses": report }))
    }

    fn handle_show_process(&self, value: Option<bool>) -> Result<Value> {
        if let Some(show) = value {
            self.store.set_show_process(show)?;
        }
        Ok(json!({"show_process": self.store.show_process()?}))
    }
}

impl Drop for SignInService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl FgpService for SignInService {
    fn name(&self) -> &str {
        "signin"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn dispatch(&self, method: &str, params: HashMap<String, Value>) -> Result<Value> {
        let request = ServiceRequest::parse(method, &params)?;
        self.handle(request)
    }

    fn method_list(&self) -> Vec<MethodInfo> {
        [
            ("signin.run_all", "Sign in on every configured site, one after another"),
            ("signin.site", "Sign in on one site by id"),
            ("signin.test", "Walk through a saved or unsaved site config without clicking"),
            ("signin.sites.list", "List configured sites"),
            ("signin.sites.save", "Add or update a site config"),
            ("signin.sites.delete", "Remove a site config"),
            ("signin.status", "Per-site status with signed-in-today flag"),
            ("signin.show_process", "Get or set the show-process preference"),
            ("signin.refresh", "Reload configs and statuses from the store"),
        ]
        .into_iter()
        .map(|(name, description)| MethodInfo {
            name: name.to_string(),
            description: description.to_string(),
            params: vec![],
        })
        .collect()
    }
}
