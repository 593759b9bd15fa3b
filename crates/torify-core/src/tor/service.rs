//! Tor onion service management.
//!
//! An [`OnionService`] publishes one v3 onion service through the control
//! session and only opens its local socket once tor reports that the service
//! descriptor has been uploaded. Keys are persisted next to the hostname so
//! the service keeps its address across restarts.

use super::controller::TorController;
use super::events::EventDispatcher;
use super::{HOSTNAME_FILE, LOCALHOST, PRIVATE_KEY_FILE};
use crate::error::{Error, Result};
use crate::logging::RedactedOnion;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

/// Length of a v3 service id (without `.onion`).
pub const SERVICE_ID_LEN: usize = 56;

/// Version byte at the end of a decoded v3 service id.
const ONION_V3_VERSION: u8 = 3;

/// Check that `service_id` is a lowercase base32 v3 onion service id.
pub fn validate_service_id(service_id: &str) -> Result<()> {
    let invalid = || Error::Protocol(format!("invalid onion service id {:?}", service_id));

    if service_id.len() != SERVICE_ID_LEN
        || !service_id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b))
    {
        return Err(invalid());
    }
    let decoded = base32::decode(
        base32::Alphabet::RFC4648 { padding: false },
        &service_id.to_ascii_uppercase(),
    )
    .ok_or_else(invalid)?;
    if decoded.last() != Some(&ONION_V3_VERSION) {
        return Err(invalid());
    }
    Ok(())
}

/// Private key blob in tor's `<TYPE>:<base64>` form.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(Zeroizing<String>);

impl PrivateKey {
    /// Parse and validate a key blob.
    pub fn parse(blob: &str) -> Result<Self> {
        let blob = blob.trim();
        let (key_type, key) = blob
            .split_once(':')
            .ok_or_else(|| Error::Protocol("private key without type prefix".into()))?;
        if key_type.is_empty() || key_type.contains(char::is_whitespace) {
            return Err(Error::Protocol("private key with invalid type".into()));
        }
        if key.is_empty() || BASE64.decode(key).is_err() {
            return Err(Error::Protocol("private key is not valid base64".into()));
        }
        Ok(Self(Zeroizing::new(blob.to_string())))
    }

    /// The raw blob, as sent in `ADD_ONION`.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Key type, e.g. `ED25519-V3`.
    pub fn key_type(&self) -> &str {
        self.0.split_once(':').map(|(t, _)| t).unwrap_or_default()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({}:[REDACTED])", self.key_type())
    }
}

/// Public address of a published onion service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OnionAddress {
    host: String,
    port: u16,
}

impl OnionAddress {
    /// Address for a validated service id.
    pub fn new(service_id: &str, port: u16) -> Result<Self> {
        validate_service_id(service_id)?;
        Ok(Self {
            host: format!("{}.onion", service_id),
            port,
        })
    }

    /// `<service_id>.onion`
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Virtual port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Service id without the `.onion` suffix.
    pub fn service_id(&self) -> &str {
        self.host.trim_end_matches(".onion")
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An onion service as created on the control port.
#[derive(Debug, Clone)]
pub struct HiddenServiceRecord {
    /// Service id without `.onion`.
    pub service_id: String,
    /// Port exposed on the onion address.
    pub virtual_port: u16,
    /// Local port tor forwards to.
    pub local_port: u16,
    /// Key the service was created with.
    pub private_key: PrivateKey,
    /// Where the hostname is persisted, once known.
    pub hostname_file: Option<PathBuf>,
    /// Where the key is persisted, once known.
    pub private_key_file: Option<PathBuf>,
}

impl HiddenServiceRecord {
    /// Record for a freshly created service.
    pub fn new(service_id: String, virtual_port: u16, local_port: u16, private_key: PrivateKey) -> Self {
        Self {
            service_id,
            virtual_port,
            local_port,
            private_key,
            hostname_file: None,
            private_key_file: None,
        }
    }

    /// Attach the files kept in `hs_dir`.
    pub fn with_files(mut self, hs_dir: &Path) -> Self {
        self.hostname_file = Some(hs_dir.join(HOSTNAME_FILE));
        self.private_key_file = Some(hs_dir.join(PRIVATE_KEY_FILE));
        self
    }

    /// `<service_id>.onion`
    pub fn hostname(&self) -> String {
        format!("{}.onion", self.service_id)
    }
}

/// Progress of an [`OnionService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinderState {
    /// Nothing done yet.
    Idle,
    /// Existing key loaded, or none found.
    KeyResolved,
    /// `ADD_ONION` issued.
    ServiceRequested,
    /// Waiting for the descriptor upload event.
    AwaitingPublication,
    /// Published and accepting locally.
    Bound,
    /// Closed by the owner.
    Closed,
    /// A step failed.
    Failed(String),
}

struct BinderInner {
    state: BinderState,
    /// Id of a service that still needs `DEL_ONION`.
    service_id: Option<String>,
    record: Option<HiddenServiceRecord>,
    address: Option<OnionAddress>,
    listener: Option<Arc<TcpListener>>,
    local_addr: Option<SocketAddr>,
}

struct Shared {
    controller: Arc<TorController>,
    dispatcher: EventDispatcher,
    publish_timeout: Option<Duration>,
    default_dir: Option<PathBuf>,
    inner: Mutex<BinderInner>,
    closed: watch::Sender<bool>,
}

/// One onion service bound to a local port.
///
/// Cheap to clone; clones share the same service.
#[derive(Clone)]
pub struct OnionService {
    shared: Arc<Shared>,
}

impl fmt::Debug for OnionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnionService")
            .field("state", &self.state())
            .field("address", &self.onion_address())
            .finish()
    }
}

impl OnionService {
    /// Service using `controller` for creation and `dispatcher` for the
    /// publication event.
    pub fn new(controller: Arc<TorController>, dispatcher: EventDispatcher) -> Self {
        Self::build(controller, dispatcher, None, None)
    }

    /// Give up waiting for publication after `timeout`.
    pub fn with_publish_timeout(self, timeout: Option<Duration>) -> Self {
        let shared = &self.shared;
        Self::build(
            shared.controller.clone(),
            shared.dispatcher.clone(),
            timeout,
            shared.default_dir.clone(),
        )
    }

    /// Directory used by [`bind_default`](Self::bind_default).
    pub fn with_default_dir(self, hs_dir: impl Into<PathBuf>) -> Self {
        let shared = &self.shared;
        Self::build(
            shared.controller.clone(),
            shared.dispatcher.clone(),
            shared.publish_timeout,
            Some(hs_dir.into()),
        )
    }

    fn build(
        controller: Arc<TorController>,
        dispatcher: EventDispatcher,
        publish_timeout: Option<Duration>,
        default_dir: Option<PathBuf>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                controller,
                dispatcher,
                publish_timeout,
                default_dir,
                inner: Mutex::new(BinderInner {
                    state: BinderState::Idle,
                    service_id: None,
                    record: None,
                    address: None,
                    listener: None,
                    local_addr: None,
                }),
                closed,
            }),
        }
    }

    /// Publish the service and bind `127.0.0.1:local_port` once it is
    /// reachable.
    ///
    /// A key in `hs_dir/private_key` is reused; otherwise tor generates one
    /// and it is written there.
    pub async fn bind(&self, virtual_port: u16, local_port: u16, hs_dir: &Path) -> Result<OnionAddress> {
        {
            let mut inner = self.lock();
            match inner.state {
                BinderState::Idle => {}
                BinderState::Closed => return Err(Error::Cancelled),
                _ => return Err(Error::Protocol("onion service bind already attempted".into())),
            }
            inner.state = BinderState::KeyResolved;
        }

        match self.publish(virtual_port, local_port, hs_dir).await {
            Ok(address) => Ok(address),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// [`bind`](Self::bind) with the default directory and the same port on
    /// both sides.
    pub async fn bind_default(&self, port: u16) -> Result<OnionAddress> {
        let hs_dir = self
            .shared
            .default_dir
            .clone()
            .ok_or_else(|| Error::Config("no default onion service directory".into()))?;
        self.bind(port, port, &hs_dir).await
    }

    /// Run [`bind`](Self::bind) on a task and report through callbacks.
    pub fn bind_in_background<C, F>(
        &self,
        virtual_port: u16,
        local_port: u16,
        hs_dir: PathBuf,
        on_complete: C,
        on_failure: F,
    ) -> JoinHandle<()>
    where
        C: FnOnce(OnionAddress) + Send + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        let service = self.clone();
        tokio::spawn(async move {
            match service.bind(virtual_port, local_port, &hs_dir).await {
                Ok(address) => on_complete(address),
                Err(e) => on_failure(e),
            }
        })
    }

    async fn publish(&self, virtual_port: u16, local_port: u16, hs_dir: &Path) -> Result<OnionAddress> {
        let controller = &self.shared.controller;
        controller.shutdown_signal().check()?;

        std::fs::create_dir_all(hs_dir).map_err(|e| Error::persistence(hs_dir, e))?;
        let key_file = hs_dir.join(PRIVATE_KEY_FILE);
        let existing_key = read_private_key(&key_file)?;
        tracing::debug!(reused_key = existing_key.is_some(), "Onion service key resolved");

        self.set_state(BinderState::ServiceRequested)?;
        let window = self.shared.dispatcher.open_window();
        let record = match &existing_key {
            Some(key) => {
                controller
                    .create_hidden_service_with_key(virtual_port, local_port, key)
                    .await?
            }
            None => controller.create_hidden_service(virtual_port, local_port).await?,
        };
        let service_id = record.service_id.clone();
        self.lock().service_id = Some(service_id.clone());

        let (ready_tx, ready_rx) = oneshot::channel();
        self.shared.dispatcher.register(&service_id, move || {
            let _ = ready_tx.send(());
        })?;
        drop(window);

        let record = record.with_files(hs_dir);
        let hostname_file = hs_dir.join(HOSTNAME_FILE);
        std::fs::write(&hostname_file, format!("{}\n", record.hostname()))
            .map_err(|e| Error::persistence(&hostname_file, e))?;
        if existing_key.is_none() {
            write_private_key(&key_file, &record.private_key)?;
        }
        self.lock().record = Some(record);

        self.set_state(BinderState::AwaitingPublication)?;
        tracing::info!(service = %RedactedOnion(&service_id), "Waiting for onion service publication");
        self.await_publication(ready_rx).await?;

        let listener = TcpListener::bind((LOCALHOST, local_port)).await?;
        let local_addr = listener.local_addr()?;
        let address = OnionAddress::new(&service_id, virtual_port)?;
        {
            let mut inner = self.lock();
            if inner.state == BinderState::Closed {
                return Err(Error::Cancelled);
            }
            inner.listener = Some(Arc::new(listener));
            inner.local_addr = Some(local_addr);
            inner.address = Some(address.clone());
            inner.state = BinderState::Bound;
        }

        tracing::info!(
            service = %RedactedOnion(address.host()),
            virtual_port,
            %local_addr,
            "Onion service published"
        );
        Ok(address)
    }

    async fn await_publication(&self, ready: oneshot::Receiver<()>) -> Result<()> {
        let mut closed = self.shared.closed.subscribe();
        let shutdown = self.shared.controller.shutdown_signal().clone();

        let wait = async {
            tokio::select! {
                // Sender dropped: the listener was removed or the event queue ended.
                ready = ready => ready.map_err(|_| Error::Cancelled),
                _ = closed.wait_for(|closed| *closed) => Err(Error::Cancelled),
                _ = shutdown.requested() => Err(Error::Cancelled),
            }
        };
        match self.shared.publish_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .unwrap_or(Err(Error::PublicationTimeout)),
            None => wait.await,
        }
    }

    /// Accept the next connection forwarded by tor.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let listener = {
            let inner = self.lock();
            match (&inner.state, &inner.listener) {
                (BinderState::Closed, _) => return Err(Error::Cancelled),
                (_, Some(listener)) => listener.clone(),
                (_, None) => return Err(Error::NotBound),
            }
        };

        let mut closed = self.shared.closed.subscribe();
        tokio::select! {
            accepted = listener.accept() => Ok(accepted?),
            _ = closed.wait_for(|closed| *closed) => Err(Error::Cancelled),
        }
    }

    /// Close the local socket and remove the service from tor. Idempotent.
    pub async fn close(&self) {
        let service_id = {
            let mut inner = self.lock();
            if inner.state == BinderState::Closed {
                return;
            }
            inner.state = BinderState::Closed;
            inner.listener = None;
            self.shared.closed.send_replace(true);
            inner.service_id.take()
        };

        if let Some(service_id) = service_id {
            self.remove_service(&service_id).await;
        }
        tracing::debug!("Onion service closed");
    }

    async fn fail(&self, error: &Error) {
        let service_id = {
            let mut inner = self.lock();
            if inner.state != BinderState::Closed {
                inner.state = BinderState::Failed(error.to_string());
            }
            inner.listener = None;
            inner.service_id.take()
        };
        tracing::warn!(error = %error, "Onion service bind failed");

        if let Some(service_id) = service_id {
            self.remove_service(&service_id).await;
        }
    }

    async fn remove_service(&self, service_id: &str) {
        self.shared.dispatcher.remove(service_id);
        let controller = &self.shared.controller;
        if controller.is_closed() {
            return;
        }
        if let Err(e) = controller.destroy_hidden_service(service_id).await {
            tracing::warn!(service = %RedactedOnion(service_id), error = %e, "DEL_ONION failed");
        }
    }

    /// Advance the state unless the service was closed meanwhile.
    fn set_state(&self, next: BinderState) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == BinderState::Closed {
            return Err(Error::Cancelled);
        }
        inner.state = next;
        Ok(())
    }

    /// Address once published.
    pub fn onion_address(&self) -> Option<OnionAddress> {
        self.lock().address.clone()
    }

    /// Current state.
    pub fn state(&self) -> BinderState {
        self.lock().state.clone()
    }

    /// Creation record once the service exists.
    pub fn record(&self) -> Option<HiddenServiceRecord> {
        self.lock().record.clone()
    }

    /// Local socket address once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    fn lock(&self) -> MutexGuard<'_, BinderInner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Existing key, `None` if there is no key file. A key file that exists but
/// cannot be used is an error, never a reason to generate a new key.
fn read_private_key(path: &Path) -> Result<Option<PrivateKey>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => Zeroizing::new(contents),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::persistence(path, e)),
    };
    if contents.trim().is_empty() {
        return Err(Error::persistence(
            path,
            std::io::Error::new(ErrorKind::InvalidData, "private key file is empty"),
        ));
    }
    PrivateKey::parse(&contents).map(Some).map_err(|e| {
        Error::persistence(path, std::io::Error::new(ErrorKind::InvalidData, e.to_string()))
    })
}

/// Write a new key file, never replacing an existing one.
fn write_private_key(path: &Path, key: &PrivateKey) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| Error::persistence(path, e))?;
    file.write_all(key.expose().as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|e| Error::persistence(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "pg6mmjiyjmcrsslvykfwnntlaru7p5svn6y2ymmju6nubxndf4pscryd";

    #[test]
    fn test_validate_service_id() {
        assert!(validate_service_id(ID).is_ok());
        assert!(validate_service_id(&ID.to_uppercase()).is_err());
        assert!(validate_service_id(&ID[1..]).is_err());
        assert!(validate_service_id("duskgytldkxiuqc6.onion").is_err());
        // Right length and alphabet, wrong version byte.
        let v2ish = format!("{}a", &ID[..55]);
        assert!(validate_service_id(&v2ish).is_err());
    }

    #[test]
    fn test_onion_address() {
        let address = OnionAddress::new(ID, 80).unwrap();
        assert_eq!(address.host(), format!("{}.onion", ID));
        assert_eq!(address.service_id(), ID);
        assert_eq!(address.to_string(), format!("{}.onion:80", ID));
    }

    #[test]
    fn test_private_key_parse() {
        let key = PrivateKey::parse("ED25519-V3:c2VjcmV0\n").unwrap();
        assert_eq!(key.expose(), "ED25519-V3:c2VjcmV0");
        assert_eq!(key.key_type(), "ED25519-V3");
        assert_eq!(format!("{:?}", key), "PrivateKey(ED25519-V3:[REDACTED])");

        assert!(PrivateKey::parse("c2VjcmV0").is_err());
        assert!(PrivateKey::parse("ED25519-V3:").is_err());
        assert!(PrivateKey::parse("ED25519-V3:not base64!").is_err());
    }

    #[test]
    fn test_read_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PRIVATE_KEY_FILE);
        assert!(read_private_key(&path).unwrap().is_none());

        std::fs::write(&path, "").unwrap();
        assert!(matches!(read_private_key(&path), Err(Error::Persistence { .. })));

        std::fs::write(&path, "garbage").unwrap();
        assert!(matches!(read_private_key(&path), Err(Error::Persistence { .. })));

        std::fs::write(&path, "ED25519-V3:c2VjcmV0").unwrap();
        assert_eq!(read_private_key(&path).unwrap().unwrap().expose(), "ED25519-V3:c2VjcmV0");
    }

    #[test]
    fn test_write_private_key_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PRIVATE_KEY_FILE);
        let key = PrivateKey::parse("ED25519-V3:c2VjcmV0").unwrap();

        write_private_key(&path, &key).unwrap();
        assert!(write_private_key(&path, &key).is_err());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_record_files() {
        let key = PrivateKey::parse("ED25519-V3:c2VjcmV0").unwrap();
        let record = HiddenServiceRecord::new(ID.into(), 80, 8080, key).with_files(Path::new("/hs"));
        assert_eq!(record.hostname(), format!("{}.onion", ID));
        assert_eq!(record.hostname_file, Some(PathBuf::from("/hs/hostname")));
        assert_eq!(record.private_key_file, Some(PathBuf::from("/hs/private_key")));
    }
}
