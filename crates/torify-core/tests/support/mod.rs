//! Shared fixtures: a scripted tor control port, a SOCKS5 echo proxy, and an
//! installer that stages a shell script posing as the tor binary.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha512};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use torify_core::install::{Installer, Platform, TorLayout};

/// Cookie the mock daemon writes and the mock control port accepts.
pub const COOKIE: &[u8; 32] = b"0123456789abcdef0123456789abcdef";

/// Behaviour of the scripted control port.
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Bootstrap progress reported by successive polls; the last repeats.
    pub bootstrap: Vec<u8>,
    /// Port reported for `net/listeners/socks`; 0 reports no listener.
    pub socks_port: u16,
    /// Emit `HS_DESC UPLOADED` after `ADD_ONION`.
    pub publish: bool,
    /// Delay before the upload event.
    pub publish_delay: Duration,
    /// Send the single upload event in the same write as the `ADD_ONION`
    /// reply instead of after `publish_delay`.
    pub upload_with_reply: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            bootstrap: vec![100],
            socks_port: 9050,
            publish: true,
            publish_delay: Duration::from_millis(50),
            upload_with_reply: false,
        }
    }
}

/// A control port on localhost answering from a script.
pub struct MockControlPort {
    pub port: u16,
    commands: Arc<Mutex<Vec<String>>>,
}

impl MockControlPort {
    pub async fn spawn(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock control port");
        let port = listener.local_addr().expect("local addr").port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let options = Arc::new(options);
        let keys = Arc::new(AtomicU64::new(0));

        let recorded = commands.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_control(stream, options.clone(), recorded.clone(), keys.clone()));
            }
        });

        Self { port, commands }
    }

    /// Every command received, across connections.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }

    /// Number of commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

/// Service id the mock derives from a key blob: 34 hash bytes plus the v3
/// version byte, base32 encoded.
pub fn service_id_for(key_blob: &str) -> String {
    let digest = Sha512::digest(key_blob.as_bytes());
    let mut raw = digest[..34].to_vec();
    raw.push(3);
    base32::encode(base32::Alphabet::RFC4648 { padding: false }, &raw).to_ascii_lowercase()
}

async fn serve_control(
    stream: TcpStream,
    options: Arc<MockOptions>,
    commands: Arc<Mutex<Vec<String>>>,
    keys: Arc<AtomicU64>,
) {
    let (read, write) = stream.into_split();
    let write = Arc::new(tokio::sync::Mutex::new(write));
    let mut lines = BufReader::new(read).lines();
    let mut polls = 0usize;

    while let Ok(Some(line)) = lines.next_line().await {
        commands.lock().expect("commands lock").push(line.clone());
        let (verb, args) = line.split_once(' ').unwrap_or((line.as_str(), ""));

        let reply = match verb {
            "AUTHENTICATE" if args == hex::encode(COOKIE) => "250 OK\r\n".to_string(),
            "AUTHENTICATE" => {
                send(&write, "515 Authentication failed: Authentication cookie did not match expected value.\r\n").await;
                return;
            }
            "SETEVENTS" | "TAKEOWNERSHIP" | "RESETCONF" | "SETCONF" | "DEL_ONION" => "250 OK\r\n".to_string(),
            "GETINFO" if args == "status/bootstrap-phase" => {
                let progress = options
                    .bootstrap
                    .get(polls)
                    .or_else(|| options.bootstrap.last())
                    .copied()
                    .unwrap_or(100);
                polls += 1;
                format!(
                    "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS={} TAG=mock SUMMARY=\"Mock\"\r\n250 OK\r\n",
                    progress
                )
            }
            "GETINFO" if args == "net/listeners/socks" => match options.socks_port {
                0 => "250-net/listeners/socks=\r\n250 OK\r\n".to_string(),
                port => format!("250-net/listeners/socks=\"127.0.0.1:{}\"\r\n250 OK\r\n", port),
            },
            "ADD_ONION" => {
                let key_arg = args.split(' ').next().unwrap_or_default();
                let (key, fresh) = if key_arg == "NEW:ED25519-V3" {
                    let n = keys.fetch_add(1, Ordering::SeqCst);
                    let secret = Sha512::digest(format!("mock key {} {:?}", n, std::time::SystemTime::now()));
                    (format!("ED25519-V3:{}", BASE64.encode(secret)), true)
                } else {
                    (key_arg.to_string(), false)
                };
                let service_id = service_id_for(&key);

                let event = format!(
                    "650 HS_DESC UPLOADED {} UNKNOWN $0123456789ABCDEF0123456789ABCDEF01234567~hsdir HSDIR_INDEX=00\r\n",
                    service_id
                );
                let reply = if fresh {
                    format!("250-ServiceID={}\r\n250-PrivateKey={}\r\n250 OK\r\n", service_id, key)
                } else {
                    format!("250-ServiceID={}\r\n250 OK\r\n", service_id)
                };

                if options.publish && options.upload_with_reply {
                    send(&write, &format!("{}{}", reply, event)).await;
                    continue;
                }
                if options.publish {
                    let write = write.clone();
                    let delay = options.publish_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        send(&write, &event).await;
                    });
                }
                reply
            }
            "SIGNAL" => {
                send(&write, "250 OK\r\n").await;
                return;
            }
            _ => "510 Unrecognized command\r\n".to_string(),
        };
        send(&write, &reply).await;
    }
}

async fn send(write: &tokio::sync::Mutex<OwnedWriteHalf>, text: &str) {
    let _ = write.lock().await.write_all(text.as_bytes()).await;
}

/// SOCKS5 proxy that records credentials and echoes stream data.
pub struct MockSocks {
    pub port: u16,
    credentials: Arc<Mutex<Vec<Option<(String, String)>>>>,
}

impl MockSocks {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock socks");
        let port = listener.local_addr().expect("local addr").port();
        let credentials = Arc::new(Mutex::new(Vec::new()));

        let recorded = credentials.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    let _ = socks_handshake(&mut stream, &recorded).await;
                });
            }
        });

        Self { port, credentials }
    }

    /// Credentials of every handshake so far, `None` for anonymous ones.
    pub fn credentials(&self) -> Vec<Option<(String, String)>> {
        self.credentials.lock().expect("credentials lock").clone()
    }
}

async fn socks_handshake(
    stream: &mut TcpStream,
    recorded: &Mutex<Vec<Option<(String, String)>>>,
) -> std::io::Result<()> {
    let mut greeting = [0u8; 3];
    stream.read_exact(&mut greeting).await?;
    let method = greeting[2];
    stream.write_all(&[0x05, method]).await?;

    let mut credential = None;
    if method == 0x02 {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        let mut user = vec![0u8; head[1] as usize];
        stream.read_exact(&mut user).await?;
        let mut len = [0u8; 1];
        stream.read_exact(&mut len).await?;
        let mut pass = vec![0u8; len[0] as usize];
        stream.read_exact(&mut pass).await?;
        stream.write_all(&[0x01, 0x00]).await?;
        credential = Some((
            String::from_utf8_lossy(&user).into_owned(),
            String::from_utf8_lossy(&pass).into_owned(),
        ));
    }
    recorded.lock().expect("credentials lock").push(credential);

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let address_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        _ => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
    };
    let mut rest = vec![0u8; address_len + 2];
    stream.read_exact(&mut rest).await?;
    stream.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0]).await?;

    let (mut reader, mut writer) = stream.split();
    tokio::io::copy(&mut reader, &mut writer).await?;
    Ok(())
}

/// A localhost port that was free a moment ago.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr").port()
}

/// Script that writes the cookie, announces `control_port`, and exits 0.
pub fn daemon_script(control_port: u16) -> String {
    format!(
        "#!/bin/sh\n\
         mkdir -p .tor\n\
         printf '%s' '{}' > .tor/control_auth_cookie\n\
         echo '[notice] Tor 0.4.8 running on Linux.'\n\
         echo '[notice] Control listener listening on port {}.'\n\
         exit 0\n",
        String::from_utf8_lossy(COOKIE),
        control_port
    )
}

/// Script leaving a background process behind that records its pid in the
/// pid file, like a daemonizing tor. `cookie` is written when given.
pub fn detached_script(control_port: u16, cookie: Option<&str>) -> String {
    let cookie = cookie
        .map(|cookie| format!("mkdir -p .tor\nprintf '%s' '{}' > .tor/control_auth_cookie\n", cookie))
        .unwrap_or_default();
    format!(
        "#!/bin/sh\n\
         sleep 300 >/dev/null 2>&1 &\n\
         echo $! > pid\n\
         {}\
         echo '[notice] Control listener listening on port {}.'\n\
         exit 0\n",
        cookie, control_port
    )
}

/// Whether `pid` is a live (not zombie) process.
#[cfg(unix)]
pub fn running(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        return std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|stat| !stat.contains(") Z "))
            .unwrap_or(false);
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Pid recorded by a [`detached_script`] daemon.
pub fn recorded_pid(layout: &TorLayout) -> u32 {
    std::fs::read_to_string(layout.pid_file())
        .expect("pid file")
        .trim()
        .parse()
        .expect("pid")
}

/// Installer staging a shell script that behaves like a daemonizing tor:
/// writes the cookie, announces the control port, and exits 0.
pub struct ScriptInstaller {
    layout: TorLayout,
    script: String,
    delay: Duration,
}

impl ScriptInstaller {
    /// Fake daemon announcing `control_port`.
    pub fn new(tor_dir: &Path, control_port: u16) -> Self {
        Self::with_script(tor_dir, daemon_script(control_port))
    }

    /// Fake daemon running `script`.
    pub fn with_script(tor_dir: &Path, script: String) -> Self {
        Self {
            layout: TorLayout::new(tor_dir),
            script,
            delay: Duration::ZERO,
        }
    }

    /// Make installation take `delay`.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Installer for ScriptInstaller {
    fn layout(&self) -> &TorLayout {
        &self.layout
    }

    fn platform(&self) -> Platform {
        Platform::Linux64
    }

    fn install_if_needed(&self) -> torify_core::Result<bool> {
        std::thread::sleep(self.delay);
        std::fs::create_dir_all(self.layout.dot_tor_dir())?;

        let binary = self.layout.binary(self.platform());
        let _ = std::fs::remove_file(&binary);
        std::fs::write(&binary, &self.script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))?;
        }
        std::fs::write(self.layout.version_file(), torify_core::VERSION)?;
        Ok(true)
    }
}
