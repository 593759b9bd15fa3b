//! CLI command implementations.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use torify_core::install::DEFAULT_HS_DIR;
use torify_core::{Torify, TorifyConfig};

/// Start tor in the background and shut it down on Ctrl+C, whether or not
/// the start has finished.
async fn start_with_interrupt(config: TorifyConfig) -> Result<Option<Arc<Torify>>> {
    let torify = Arc::new(Torify::new(config).context("Failed to set up tor")?);

    println!("Starting tor in {} ...", torify.layout().tor_dir().display());
    let mut starting = torify.start_in_background();

    tokio::select! {
        result = &mut starting => {
            result.context("Start task panicked")?.context("Failed to start tor")?;
            Ok(Some(torify))
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted, shutting down...");
            torify.shutdown().await;
            // Unwinds with `Cancelled`.
            let _ = starting.await;
            Ok(None)
        }
    }
}

/// Run tor until Ctrl+C.
pub async fn start(config: TorifyConfig) -> Result<()> {
    let Some(torify) = start_with_interrupt(config).await? else {
        return Ok(());
    };

    let proxy = torify.proxy(None).await.context("Failed to query SOCKS port")?;
    println!("\nTor is ready.");
    println!("  SOCKS proxy: {}", proxy.url());
    println!("\nPress Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    torify.shutdown().await;
    Ok(())
}

/// Publish an echo onion service until Ctrl+C.
pub async fn serve(
    config: TorifyConfig,
    virtual_port: u16,
    local_port: u16,
    hs_dir: Option<PathBuf>,
) -> Result<()> {
    let Some(torify) = start_with_interrupt(config).await? else {
        return Ok(());
    };

    let service = torify.onion_service().context("Tor is not running")?;
    let hs_dir = hs_dir.unwrap_or_else(|| torify.layout().hidden_service_dir(DEFAULT_HS_DIR));

    println!("\nPublishing onion service (this can take a minute)...");
    let address = tokio::select! {
        bound = service.bind(virtual_port, local_port, &hs_dir) => {
            bound.context("Failed to publish onion service")?
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted, shutting down...");
            service.close().await;
            torify.shutdown().await;
            return Ok(());
        }
    };

    println!("\nOnion service running!");
    println!("  Address: {}", address);
    println!("  Forwarding to 127.0.0.1:{}", local_port);
    println!("  Key kept in {}", hs_dir.display());
    println!("\nEchoing lines back to every client. Press Ctrl+C to stop.");

    let accepting = {
        let service = service.clone();
        tokio::spawn(async move {
            loop {
                match service.accept().await {
                    Ok((stream, peer)) => {
                        tracing::info!(%peer, "Incoming connection");
                        tokio::spawn(echo(stream));
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Accept loop stopped");
                        break;
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    service.close().await;
    let _ = accepting.await;
    torify.shutdown().await;
    Ok(())
}

/// Send each received line back to the client.
async fn echo(stream: TcpStream) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Err(e) = write.write_all(format!("{}\n", line).as_bytes()).await {
                    tracing::debug!(error = %e, "Echo write failed");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Echo read failed");
                break;
            }
        }
    }
}

/// Send one line to `host:port` through tor and print the reply.
pub async fn connect(
    config: TorifyConfig,
    host: &str,
    port: u16,
    message: &str,
    stream_id: Option<&str>,
) -> Result<()> {
    if message.contains('\n') {
        bail!("Message must be a single line");
    }
    let Some(torify) = start_with_interrupt(config).await? else {
        return Ok(());
    };

    let result = round_trip(&torify, host, port, message, stream_id).await;
    torify.shutdown().await;

    let reply = result?;
    println!("{}", reply);
    Ok(())
}

async fn round_trip(
    torify: &Torify,
    host: &str,
    port: u16,
    message: &str,
    stream_id: Option<&str>,
) -> Result<String> {
    let stream = torify
        .socks_stream(host, port, stream_id)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

    let (read, mut write) = stream.split();
    write
        .write_all(format!("{}\n", message).as_bytes())
        .await
        .context("Failed to send message")?;

    let mut reply = String::new();
    BufReader::new(read)
        .read_line(&mut reply)
        .await
        .context("Failed to read reply")?;
    if reply.is_empty() {
        bail!("Connection closed without a reply");
    }
    Ok(reply.trim_end().to_string())
}
