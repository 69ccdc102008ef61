//! Client loader: relaunches saved clients detached from the daemon.
//!
//! The daemon forks one long-lived helper process (a re-exec of its own
//! binary with the hidden `loader-helper` subcommand) and keeps a private
//! control channel to it over the helper's stdin/stdout. The channel
//! carries `Exec` frames in, length-prefixed [`LoadReply`] frames out —
//! nothing else.
//!
//! The helper detaches each target with `setsid()` in `pre_exec` so a
//! relaunched client lives in its own session and survives a daemon
//! restart, and reaps exited children asynchronously so none accumulate as
//! zombies. A failed exec is reported back as an error reply; the helper
//! stays alive for subsequent load requests.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use lashproto::{wire, CommEvent, ExecParams, ProtoError};

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("loader helper is gone")]
    HelperGone,

    #[error("load failed: {0}")]
    Exec(String),

    #[error("control channel error: {0}")]
    Proto(#[from] ProtoError),

    #[error("reply decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("reply encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Helper's answer to one load request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoadReply {
    Launched { pid: u32 },
    Failed { message: String },
}

/// Daemon-side end of the control channel, generic over the transport so
/// tests can run the helper loop in-process.
pub struct LoaderChannel<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> LoaderChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Send one relaunch request and wait for the helper's verdict.
    pub async fn load(&mut self, params: &ExecParams) -> Result<u32, LoaderError> {
        wire::write_event(&mut self.writer, &CommEvent::Exec(params.clone())).await?;
        match read_reply(&mut self.reader).await? {
            LoadReply::Launched { pid } => {
                info!("loader launched {:?} as pid {pid}", params.argv.first());
                Ok(pid)
            }
            LoadReply::Failed { message } => Err(LoaderError::Exec(message)),
        }
    }
}

/// The forked helper process plus its control channel.
pub struct Loader {
    child: Child,
    channel: LoaderChannel<ChildStdout, ChildStdin>,
}

impl Loader {
    /// Fork the long-lived helper once. Subsequent loads reuse it.
    pub fn fork() -> Result<Self, LoaderError> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .arg("loader-helper")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take().ok_or(LoaderError::HelperGone)?;
        let stdout = child.stdout.take().ok_or(LoaderError::HelperGone)?;
        info!("loader helper forked (pid {:?})", child.id());

        Ok(Self {
            child,
            channel: LoaderChannel::new(stdout, stdin),
        })
    }

    pub async fn load(&mut self, params: &ExecParams) -> Result<u32, LoaderError> {
        self.channel.load(params).await
    }

    /// Close the control channel and wait for the helper to exit.
    pub async fn shutdown(mut self) -> Result<(), LoaderError> {
        drop(self.channel);
        let status = self.child.wait().await?;
        debug!("loader helper exited: {status}");
        Ok(())
    }
}

/// Helper-process main loop: read `Exec` frames, spawn detached, reply.
///
/// Exits cleanly when the daemon closes the channel. A spawn failure is an
/// error *reply*, never a helper exit.
pub async fn run_helper<R, W>(mut reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let event = match wire::read_event(&mut reader).await {
            Ok(event) => event,
            Err(e) if e.is_disconnect() => {
                debug!("control channel closed, helper exiting");
                return Ok(());
            }
            Err(e) => {
                warn!("control channel error, helper exiting: {e}");
                return Err(e.into());
            }
        };

        let Some(params) = event.into_exec() else {
            warn!("non-exec frame on loader control channel, ignoring");
            continue;
        };

        let reply = match spawn_detached(&params) {
            Ok(pid) => LoadReply::Launched { pid },
            Err(e) => {
                warn!("failed to launch {:?}: {e}", params.argv.first());
                LoadReply::Failed {
                    message: e.to_string(),
                }
            }
        };
        write_reply(&mut writer, &reply).await?;
    }
}

/// Spawn the target in its own session, fully detached from the helper's
/// terminal and stdio, and reap it in the background.
fn spawn_detached(params: &ExecParams) -> std::io::Result<u32> {
    let (program, args) = params.argv.split_first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv")
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&params.working_dir)
        .env("LASH_SERVER", &params.server)
        .env("LASH_PROJECT", &params.project)
        .env("LASH_CLIENT_ID", params.id.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);

    #[cfg(unix)]
    {
        // SAFETY: setsid() is async-signal-safe and makes the child the
        // leader of a new session, detaching it from our process group.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or_default();

    // Reap asynchronously; the helper never blocks on a client's lifetime.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    Ok(pid)
}

async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: &LoadReply,
) -> Result<(), LoaderError> {
    let body = rmp_serde::to_vec(reply)?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<LoadReply, LoaderError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|_| LoaderError::HelperGone)?;
    let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| LoaderError::HelperGone)?;
    Ok(rmp_serde::from_slice(&body)?)
}
