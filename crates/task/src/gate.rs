//! Component wiring
//!
//! [`TaskGate`] builds every coordination component from one
//! [`ClientSettings`] value and one shared event bus. Tests swap the launcher,
//! transport, session factory or confirmer through [`TaskGateBuilder`].

use crate::catalog::{CatalogSnapshot, TaskCatalog};
use crate::client::BuildServerClient;
use crate::connection::{ConnectionManager, ServerLauncher};
use crate::daemons::DaemonMonitor;
use crate::lifecycle::LifecycleTracker;
use crate::protocol::{BuildServerTransport, ExecutableLauncher, UnixSocketTransport};
use crate::runner::{AlwaysConfirm, Confirmer, RunOutcome, RunnerOptions, TaskRunner};
use crate::sessions::{ConsoleSessionFactory, SessionFactory, SessionStore};
use std::sync::Arc;
use taskgate_config::ClientSettings;
use taskgate_core::events::EventEmitter;
use taskgate_core::{Error, InvocationRecord, Result, TaskDefinition};
use tracing::debug;

pub struct TaskGateBuilder {
    settings: ClientSettings,
    events: Option<Arc<EventEmitter>>,
    launcher: Option<Arc<dyn ServerLauncher>>,
    transport: Option<Arc<dyn BuildServerTransport>>,
    sessions: Option<Arc<dyn SessionFactory>>,
    confirmer: Option<Arc<dyn Confirmer>>,
}

impl TaskGateBuilder {
    pub fn events(mut self, events: Arc<EventEmitter>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn ServerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn BuildServerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn sessions(mut self, sessions: Arc<dyn SessionFactory>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    /// Must be called inside a tokio runtime.
    pub fn build(self) -> TaskGate {
        let settings = self.settings;
        let events = self.events.unwrap_or_default();
        let launcher = self.launcher.unwrap_or_else(|| {
            Arc::new(ExecutableLauncher::new(
                settings.server_executable.clone(),
                settings.socket_path.clone(),
            ))
        });
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(UnixSocketTransport::new(settings.socket_path.clone())));

        let connection = Arc::new(ConnectionManager::new(
            launcher,
            settings.connect_timeout(),
            events.clone(),
        ));
        let client = Arc::new(BuildServerClient::new(
            transport,
            connection.clone(),
            events.clone(),
        ));
        let catalog = TaskCatalog::new(
            client.clone(),
            settings.project_roots.clone(),
            events.clone(),
        );
        let daemons = DaemonMonitor::new(client.clone(), events.clone());
        let tracker = Arc::new(LifecycleTracker::new(client.clone(), events.clone()));
        let runner = TaskRunner::new(
            client,
            tracker,
            Arc::new(SessionStore::new(events.clone())),
            self.sessions
                .unwrap_or_else(|| Arc::new(ConsoleSessionFactory)),
            self.confirmer.unwrap_or_else(|| Arc::new(AlwaysConfirm)),
            RunnerOptions {
                reuse_policy: settings.reuse_policy,
                suppress_confirmation: settings.suppress_confirmation,
            },
            events.clone(),
        );

        debug!(
            socket = %settings.socket_path.display(),
            roots = settings.project_roots.len(),
            "task gate assembled"
        );
        TaskGate {
            settings,
            events,
            connection,
            catalog,
            daemons,
            runner,
        }
    }
}

/// Entry point owning one instance of every component.
pub struct TaskGate {
    settings: ClientSettings,
    events: Arc<EventEmitter>,
    connection: Arc<ConnectionManager>,
    catalog: TaskCatalog,
    daemons: DaemonMonitor,
    runner: Arc<TaskRunner>,
}

impl TaskGate {
    pub fn builder(settings: ClientSettings) -> TaskGateBuilder {
        TaskGateBuilder {
            settings,
            events: None,
            launcher: None,
            transport: None,
            sessions: None,
            confirmer: None,
        }
    }

    pub fn new(settings: ClientSettings) -> Self {
        Self::builder(settings).build()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.events
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    pub fn daemons(&self) -> &DaemonMonitor {
        &self.daemons
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    pub async fn start(&self) -> Result<()> {
        self.connection.start().await
    }

    pub async fn tasks(&self) -> Result<CatalogSnapshot> {
        self.connection.wait_until_ready().await?;
        Ok(self.catalog.load().await)
    }

    /// Find a task by task path or script path in the loaded catalog.
    pub async fn resolve(&self, name: &str) -> Result<TaskDefinition> {
        self.tasks().await?;
        self.catalog.find_by_name(name).ok_or_else(|| {
            Error::configuration(format!("no task named '{name}' in the configured roots"))
        })
    }

    pub async fn run(&self, definition: &TaskDefinition, args: &str, debug: bool) -> Result<RunOutcome> {
        let record = InvocationRecord::new(definition.identity.clone(), args, debug);
        self.runner.run(record).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.connection.shutdown().await
    }
}
