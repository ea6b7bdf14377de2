use std::time::Duration;

use forgehost_plugin_proto::{
    write_frame, Call, PluginDetails, Request, Response, PROTOCOL_VERSION,
};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::process::PluginTransport;

/// RPC channel to one running plugin process.
///
/// All capability proxies share a single client; the transport lock makes
/// every request a whole round-trip, so concurrent callers serialize
/// naturally at the channel (frames never interleave).
pub struct PluginClient {
    transport: Mutex<Box<dyn PluginTransport>>,
    call_timeout: Duration,
}

impl PluginClient {
    pub fn new(transport: Box<dyn PluginTransport>, call_timeout: Duration) -> Self {
        Self {
            transport: Mutex::new(transport),
            call_timeout,
        }
    }

    /// Version-gated hello exchange. Any failure here, transport-level or a
    /// version mismatch, means the spawned process is not a usable plugin.
    pub fn handshake(&self, timeout: Duration) -> Result<()> {
        let response = self
            .round_trip("handshake", &Request::Hello { version: PROTOCOL_VERSION }, timeout)
            .map_err(|error| Error::handshake(error.to_string()))?;
        match response {
            Response::HelloOk { version } if version == PROTOCOL_VERSION => Ok(()),
            Response::HelloOk { version } => Err(Error::handshake(format!(
                "protocol version mismatch: host={PROTOCOL_VERSION}, plugin={version}"
            ))),
            Response::Err { message } => Err(Error::handshake(message)),
            other => Err(Error::handshake(format!("unexpected response: {other:?}"))),
        }
    }

    /// One capability call. `Response::Err` becomes [`Error::Remote`];
    /// anything wrong with the channel itself becomes [`Error::Rpc`].
    pub fn call(&self, call: Call) -> Result<Response> {
        let operation = call.rpc_name();
        let response =
            self.round_trip(operation, &Request::Call(call), self.call_timeout)?;
        match response {
            Response::Err { message } => Err(Error::remote(operation, message)),
            other => Ok(other),
        }
    }

    pub fn details(&self) -> Result<PluginDetails> {
        match self.call(Call::Details)? {
            Response::Details(details) => Ok(details),
            other => Err(Error::rpc(
                Call::Details.rpc_name(),
                format!("unexpected response: {other:?}"),
            )),
        }
    }

    pub fn expect_keys(&self, call: Call) -> Result<Vec<String>> {
        let operation = call.rpc_name();
        match self.call(call)? {
            Response::Keys(keys) => Ok(keys),
            other => Err(Error::rpc(
                operation,
                format!("unexpected response: {other:?}"),
            )),
        }
    }

    pub fn expect_done(&self, call: Call) -> Result<()> {
        let operation = call.rpc_name();
        match self.call(call)? {
            Response::Done => Ok(()),
            other => Err(Error::rpc(
                operation,
                format!("unexpected response: {other:?}"),
            )),
        }
    }

    /// Best-effort shutdown request; the plugin may already be gone.
    pub fn shutdown(&self) {
        let mut buf = Vec::<u8>::new();
        if write_frame(&mut buf, &Request::Shutdown).is_ok() {
            let mut transport = self.transport.lock();
            let _ = transport.send(&buf);
        }
    }

    pub fn terminate(&self, grace: Duration) -> Result<()> {
        self.transport.lock().terminate(grace)
    }

    fn round_trip(
        &self,
        operation: &'static str,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        let mut buf = Vec::<u8>::new();
        write_frame(&mut buf, request)
            .map_err(|error| Error::rpc(operation, error.to_string()))?;

        let mut transport = self.transport.lock();
        transport.send(&buf)?;
        let payload = transport.recv(timeout)?;
        postcard::from_bytes(&payload).map_err(|error| Error::rpc(operation, error.to_string()))
    }
}
