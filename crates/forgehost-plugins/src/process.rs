use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use forgehost_plugin_proto::{HandshakeConfig, HANDSHAKE_VERSION_KEY, MAX_FRAME_BYTES};
use tracing::debug;

use crate::error::{Error, Result};

const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One duplex frame channel to a running plugin process.
///
/// `send` takes a fully framed message (length prefix included, as produced
/// by `forgehost_plugin_proto::write_frame`); `recv` hands back one frame
/// payload with the prefix already stripped.
pub trait PluginTransport: Send + std::fmt::Debug {
    fn send(&mut self, frame: &[u8]) -> Result<()>;
    fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>>;
    fn terminate(&mut self, grace: Duration) -> Result<()>;
}

/// Seam between the manager and the OS. The default implementation spawns
/// real child processes; tests inject in-process fakes.
pub trait PluginLauncher: Send + Sync {
    fn launch(&self, path: &Path, handshake: &HandshakeConfig)
        -> Result<Box<dyn PluginTransport>>;
}

/// Launches plugin executables as child processes speaking frames over
/// stdio, with the handshake cookie injected through the environment.
#[derive(Debug, Default)]
pub struct CommandLauncher;

impl PluginLauncher for CommandLauncher {
    fn launch(
        &self,
        path: &Path,
        handshake: &HandshakeConfig,
    ) -> Result<Box<dyn PluginTransport>> {
        if !handshake.is_version_compatible() {
            return Err(Error::handshake(format!(
                "configured protocol version {} does not match compiled version {}",
                handshake.protocol_version,
                forgehost_plugin_proto::PROTOCOL_VERSION
            )));
        }

        let mut command = Command::new(path);
        command.env(&handshake.cookie_key, &handshake.cookie_value);
        command.env(HANDSHAKE_VERSION_KEY, handshake.protocol_version.to_string());
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::null());

        let mut child = command.spawn().map_err(|error| Error::spawn(path, error))?;
        let stdin = child.stdin.take().ok_or_else(|| {
            Error::spawn(
                path,
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "missing stdin pipe"),
            )
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::spawn(
                path,
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "missing stdout pipe"),
            )
        })?;

        debug!(
            target: "forgehost_plugins::process",
            path = %path.display(),
            pid = child.id(),
            "plugin process spawned"
        );

        Ok(Box::new(ChildTransport::new(child, stdin, stdout)))
    }
}

#[derive(Debug)]
struct ChildTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    frames: Receiver<std::io::Result<Vec<u8>>>,
}

impl ChildTransport {
    fn new(child: Child, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        // Blocking pipe reads cannot carry a deadline, so a dedicated thread
        // decodes frames and the host side waits with `recv_timeout`. The
        // thread exits on EOF or the first read error and is not joined; it
        // holds nothing but the stdout handle.
        let (tx, rx) = crossbeam_channel::unbounded::<std::io::Result<Vec<u8>>>();
        thread::spawn(move || {
            let mut stdout = stdout;
            loop {
                match read_raw_frame(&mut stdout) {
                    Ok(payload) => {
                        if tx.send(Ok(payload)).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        let _ = tx.send(Err(error));
                        break;
                    }
                }
            }
        });
        Self {
            child,
            stdin: Some(stdin),
            frames: rx,
        }
    }
}

fn read_raw_frame(r: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

impl PluginTransport for ChildTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::rpc("send", "channel is closed"))?;
        stdin
            .write_all(frame)
            .and_then(|()| stdin.flush())
            .map_err(|error| Error::rpc("send", error.to_string()))
    }

    fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        match self.frames.recv_timeout(timeout) {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(error)) => Err(Error::rpc("recv", error.to_string())),
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::rpc("recv", format!("timed out after {timeout:?}")))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::rpc("recv", "plugin closed the channel"))
            }
        }
    }

    fn terminate(&mut self, grace: Duration) -> Result<()> {
        // Closing stdin asks a well-behaved plugin to exit on its own.
        drop(self.stdin.take());

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(
                        target: "forgehost_plugins::process",
                        pid = self.child.id(),
                        code = status.code(),
                        "plugin process exited"
                    );
                    return Ok(());
                }
                Ok(None) => {}
                Err(error) => return Err(Error::rpc("terminate", error.to_string())),
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(TERMINATE_POLL_INTERVAL);
        }

        self.child
            .kill()
            .map_err(|error| Error::rpc("terminate", error.to_string()))?;
        let _ = self.child.wait();
        debug!(
            target: "forgehost_plugins::process",
            pid = self.child.id(),
            "plugin process killed after grace period"
        );
        Ok(())
    }
}

impl Drop for ChildTransport {
    fn drop(&mut self) {
        let _ = self.terminate(Duration::ZERO);
    }
}
