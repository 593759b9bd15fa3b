//! Lifecycle of one supervised tor instance.
//!
//! [`Torify`] ties the pieces together: install files, launch the daemon,
//! wait for its cookie, open the control session and wait for bootstrap.
//! Shutdown can be requested at any point; an in-flight start notices it at
//! its next step and unwinds.

use crate::config::TorifyConfig;
use crate::error::{Error, Result};
use crate::install::{FileInstaller, Installer, LocalBinary, Platform, TorLayout, DEFAULT_HS_DIR};
use crate::shutdown::ShutdownSignal;
use crate::tor::{
    wait_for_cookie, EventDispatcher, LaunchSpec, OnionService, SocksProxy, TorConnection, TorConnector,
    TorController, TorProcess, TorProxyClient,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// Resources of a (possibly half-built) session.
#[derive(Default)]
struct Session {
    process: Option<TorProcess>,
    controller: Option<Arc<TorController>>,
}

impl Session {
    /// Shut down whatever was built. Idempotent.
    async fn close(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.shutdown().await;
        }
        if let Some(mut process) = self.process.take() {
            process.terminate().await;
        }
    }
}

/// A supervised tor daemon.
pub struct Torify {
    config: TorifyConfig,
    installer: Arc<dyn Installer>,
    dispatcher: EventDispatcher,
    shutdown: ShutdownSignal,
    /// Held for the whole of a start; shutdown takes it to wait for one.
    session: tokio::sync::Mutex<Session>,
    /// Controller of a completed start, readable without the startup lock.
    ready: Mutex<Option<Arc<TorController>>>,
}

impl std::fmt::Debug for Torify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Torify")
            .field("tor_dir", &self.config.tor_dir)
            .field("shutdown_requested", &self.shutdown.is_requested())
            .finish_non_exhaustive()
    }
}

impl Torify {
    /// Supervisor staging the configured tor binary (or the one on `PATH`).
    pub fn new(config: TorifyConfig) -> Result<Self> {
        config.validate()?;
        let platform = Platform::detect();
        let source = match &config.tor_binary {
            Some(path) => LocalBinary::new(path),
            None => LocalBinary::find_on_path(platform).ok_or_else(|| {
                Error::Install(format!("no {} found on PATH, set tor_binary", platform.binary_name()))
            })?,
        };
        tracing::debug!(binary = %source.path().display(), %platform, "Using tor binary");

        let installer = FileInstaller::new(TorLayout::new(&config.tor_dir), Arc::new(source))
            .with_platform(platform)
            .with_bridges(config.bridges.clone());
        Ok(Self::with_installer(config, Arc::new(installer)))
    }

    /// Supervisor using a custom installer.
    pub fn with_installer(config: TorifyConfig, installer: Arc<dyn Installer>) -> Self {
        Self {
            config,
            installer,
            dispatcher: EventDispatcher::new(),
            shutdown: ShutdownSignal::new(),
            session: tokio::sync::Mutex::new(Session::default()),
            ready: Mutex::new(None),
        }
    }

    /// Start tor and wait until it has bootstrapped.
    ///
    /// Returns the existing session if already started.
    pub async fn start(&self) -> Result<Arc<TorController>> {
        if self.shutdown.is_requested() {
            return Err(Error::AlreadyShutdown);
        }
        let mut session = self.session.lock().await;
        if self.shutdown.is_requested() {
            return Err(Error::AlreadyShutdown);
        }
        if let Some(controller) = &session.controller {
            return Ok(controller.clone());
        }

        match self.launch(&mut session).await {
            Ok(controller) => {
                *self.ready.lock().unwrap_or_else(PoisonError::into_inner) = Some(controller.clone());
                tracing::info!(tor_dir = %self.config.tor_dir.display(), "Tor started");
                Ok(controller)
            }
            Err(e) => {
                if e.is_cancellation() {
                    tracing::info!("Tor start cancelled");
                } else {
                    tracing::error!(error = %e, "Tor start failed");
                }
                session.close().await;
                if let Err(marker_err) = self.installer.invalidate() {
                    tracing::warn!(error = %marker_err, "Failed to remove version marker");
                }
                Err(e)
            }
        }
    }

    async fn launch(&self, session: &mut Session) -> Result<Arc<TorController>> {
        self.shutdown.check()?;
        let installer = self.installer.clone();
        let installed = tokio::task::spawn_blocking(move || {
            installer.cleanup_cookie()?;
            installer.install_if_needed()
        })
        .await
        .map_err(|e| Error::Install(format!("install task failed: {}", e)))??;
        tracing::debug!(installed, "Tor files ready");

        self.shutdown.check()?;
        let layout = self.installer.layout();
        let spec = LaunchSpec::from_layout(layout, self.installer.platform());
        let process = TorProcess::start(&spec, &self.shutdown).await?;
        let control_port = process.control_port();
        session.process = Some(process);

        self.shutdown.check()?;
        let cookie = wait_for_cookie(&layout.cookie_file(), self.config.cookie_timeout(), &self.shutdown).await?;

        self.shutdown.check()?;
        let controller = Arc::new(TorController::connect(control_port, &cookie, self.shutdown.clone()).await?);
        session.controller = Some(controller.clone());
        controller.set_event_handler(self.dispatcher.clone())?;

        self.shutdown.check()?;
        controller.wait_bootstrapped(self.config.bootstrap_timeout()).await?;
        self.shutdown.check()?;
        Ok(controller)
    }

    /// Run [`start`](Self::start) on a task.
    pub fn start_in_background(self: &Arc<Self>) -> JoinHandle<Result<Arc<TorController>>> {
        let torify = self.clone();
        tokio::spawn(async move { torify.start().await })
    }

    /// Stop tor. Waits for an in-flight start to unwind first. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.request();
        let mut session = self.session.lock().await;
        self.ready.lock().unwrap_or_else(PoisonError::into_inner).take();
        session.close().await;
        tracing::info!("Tor shut down");
    }

    /// Whether shutdown was requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }

    /// Control session of a completed start.
    pub fn controller(&self) -> Result<Arc<TorController>> {
        if self.shutdown.is_requested() {
            return Err(Error::AlreadyShutdown);
        }
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotStarted)
    }

    /// Registry of onion service readiness listeners.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Data directory layout.
    pub fn layout(&self) -> &TorLayout {
        self.installer.layout()
    }

    /// Configuration in use.
    pub fn config(&self) -> &TorifyConfig {
        &self.config
    }

    /// SOCKS client for the running daemon.
    pub fn proxy_client(&self) -> Result<TorProxyClient> {
        match self.controller() {
            Ok(controller) => Ok(TorProxyClient::new(controller)),
            Err(Error::NotStarted) => Err(Error::ProxyUnavailable("tor is not started".into())),
            Err(e) => Err(e),
        }
    }

    /// Proxy descriptor, isolated when `stream_id` is set.
    pub async fn proxy(&self, stream_id: Option<&str>) -> Result<SocksProxy> {
        self.proxy_client()?.proxy(stream_id).await
    }

    /// Connected stream to `host:port` through tor.
    pub async fn socks_stream(&self, host: &str, port: u16, stream_id: Option<&str>) -> Result<TorConnection> {
        self.proxy_client()?.socks_stream(host, port, stream_id).await
    }

    /// Connector bound to one isolation class.
    pub async fn connector(&self, stream_id: Option<&str>) -> Result<TorConnector> {
        self.proxy_client()?.connector(stream_id).await
    }

    /// New onion service on the running daemon, defaulting to
    /// `<tor_dir>/hiddenservice`.
    pub fn onion_service(&self) -> Result<OnionService> {
        let controller = self.controller()?;
        Ok(OnionService::new(controller, self.dispatcher.clone())
            .with_publish_timeout(self.config.publish_timeout())
            .with_default_dir(self.layout().hidden_service_dir(DEFAULT_HS_DIR)))
    }
}
