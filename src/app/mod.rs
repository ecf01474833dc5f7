pub mod config;
pub mod handler;

use std::io;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::app::config::AppConfig;
use crate::app::handler::AppHandler;
use crate::net::server::Server;
use crate::registry::{DeviceRegistry, PortRegistry};
use crate::runtime::Runtime;
use crate::session::session_manager::SessionManager;

#[derive(Clone)]
pub enum AppState {
    Running,
    Stopping,
    Stopped,
}

pub struct App {
    server: Server,
    context: Arc<AppContext>,
    runtime: Arc<Runtime>,
    state: Arc<Mutex<AppState>>,
}

impl App {
    pub async fn start(config: AppConfig) -> Result<App, io::Error> {
        let runtime = Arc::new(Runtime::new());
        let device_registry = Arc::new(DeviceRegistry::new());
        let port_registry = Arc::new(PortRegistry::new());
        let session_manager = Arc::new(
            SessionManager::start(
                runtime.clone(),
                port_registry.clone(),
                config.session_options(),
            )
            .await,
        );

        let context = Arc::new(AppContext {
            config,
            device_registry,
            port_registry,
            session_manager,
        });

        let handler = AppHandler::new(context.clone());
        let server = Server::start(
            &context.config.server.host,
            context.config.server.port,
            handler,
            context.session_manager.clone(),
            runtime.clone(),
        )
        .await?;

        Ok(Self {
            server,
            context,
            runtime,
            state: Arc::new(Mutex::new(AppState::Running)),
        })
    }

    pub async fn stop(&mut self) {
        // Hold the state guard across the whole transition; re-locking from
        // inside the match would wait on our own guard.
        let mut state = self.state.lock().await;
        match *state {
            AppState::Running => {
                *state = AppState::Stopping;
                self.server.stop().await;
                self.context.session_manager.stop().await;
                self.runtime.stop().await;
                *state = AppState::Stopped;
            }
            AppState::Stopping | AppState::Stopped => {
                panic!("app is already stopped");
            }
        };
    }

    pub async fn state(&self) -> AppState {
        self.state.lock().await.clone()
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    /// The shared context, through which an embedding device bridge keeps
    /// the device and port registries current.
    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }
}

pub struct AppContext {
    pub config: AppConfig,
    pub device_registry: Arc<DeviceRegistry>,
    pub port_registry: Arc<PortRegistry>,
    pub session_manager: Arc<SessionManager>,
}

#[cfg(test)]
impl App {
    pub(crate) async fn start_for_tests(auth_key: &str) -> App {
        let mut config = AppConfig::for_tests(auth_key);
        config.server.port = 0;
        App::start(config).await.expect("bind test listener")
    }
}

#[cfg(test)]
impl AppContext {
    pub(crate) async fn for_tests(auth_key: &str) -> AppContext {
        let config = AppConfig::for_tests(auth_key);
        let runtime = Arc::new(Runtime::new());
        let port_registry = Arc::new(PortRegistry::new());
        let session_manager = Arc::new(
            SessionManager::start(
                runtime.clone(),
                port_registry.clone(),
                config.session_options(),
            )
            .await,
        );

        AppContext {
            config,
            device_registry: Arc::new(DeviceRegistry::new()),
            port_registry,
            session_manager,
        }
    }
}

#[cfg(test)]
impl AppConfig {
    pub(crate) fn for_tests(auth_key: &str) -> AppConfig {
        AppConfig {
            server: Default::default(),
            auth_key: auth_key.to_string(),
            source_host: "127.0.0.1".to_string(),
            relay: Default::default(),
            idle_timeout_secs: 900,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::{App, AppState};

    #[tokio::test]
    async fn stop_transitions_to_stopped_without_hanging() {
        let mut app = App::start_for_tests("secret").await;
        time::timeout(Duration::from_secs(5), app.stop())
            .await
            .expect("stop must complete");
        assert!(matches!(app.state().await, AppState::Stopped));
    }
}
