//! JSON-RPC method table and worker pool.
//!
//! [`Method`] is the closed set of callable names; [`Dispatcher::handle`]
//! resolves a call, runs its handler and builds the response. Workers pull
//! calls from the shared queue and push responses on the high-priority
//! outbound queue.

pub mod methods;

use crate::channel::Outbound;
use crate::context::DaemonContext;
use crate::signal::Signal;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uplink_core::jsonrpc::JSONRPC_VERSION;
use uplink_core::{Request, Response, RpcError, UplinkError, UplinkResult};

/// Declares [`Method`] with its wire names and the `ALL` table.
macro_rules! methods {
    ($($variant:ident => $name:literal,)+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Method {
            $($variant,)+
        }

        impl Method {
            pub const ALL: &'static [Method] = &[$(Method::$variant,)+];

            pub fn name(self) -> &'static str {
                match self {
                    $(Method::$variant => $name,)+
                }
            }
        }
    };
}

methods! {
    Echo => "echo",
    GetMessage => "getMessage",
    GetVersion => "getVersion",
    SetNavDestination => "setNavDestination",
    ListDataDirectory => "listDataDirectory",
    UploadFileToUrl => "uploadFileToUrl",
    UploadFilesToUrls => "uploadFilesToUrls",
    ListUploadQueue => "listUploadQueue",
    CancelUpload => "cancelUpload",
    SetRouteViewed => "setRouteViewed",
    StartLocalProxy => "startLocalProxy",
    GetPublicKey => "getPublicKey",
    GetSshAuthorizedKeys => "getSshAuthorizedKeys",
    GetGithubUsername => "getGithubUsername",
    GetSimInfo => "getSimInfo",
    GetNetworkType => "getNetworkType",
    GetNetworkMetered => "getNetworkMetered",
    GetNetworks => "getNetworks",
    TakeSnapshot => "takeSnapshot",
    RemotePinStatus => "remotePinStatus",
    RemotePinVerify => "remotePinVerify",
    RemotePinSet => "remotePinSet",
    RemotePinChange => "remotePinChange",
    RemotePinClear => "remotePinClear",
    RemoteSshStart => "remoteSshStart",
    RemoteSshWrite => "remoteSshWrite",
    RemoteSshRead => "remoteSshRead",
    RemoteSshResize => "remoteSshResize",
    RemoteSshStop => "remoteSshStop",
    SetSdpAnswer => "setSdpAnswer",
    GetSdp => "getSdp",
    GetIce => "getIce",
}

impl Method {
    pub fn from_name(name: &str) -> Option<Method> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }
}

/// Typed parameters of one method.
///
/// `NAMES` gives the order of positional arguments.
pub trait MethodParams: DeserializeOwned {
    const NAMES: &'static [&'static str];
}

/// Accept named (object) or positional (array) params; null means none.
pub fn parse_params<T: MethodParams>(params: Value) -> UplinkResult<T> {
    let named = match params {
        Value::Null => Value::Object(Map::new()),
        Value::Object(map) => Value::Object(map),
        Value::Array(items) => {
            if items.len() > T::NAMES.len() {
                return Err(UplinkError::InvalidParams(format!(
                    "expected at most {} positional params, got {}",
                    T::NAMES.len(),
                    items.len()
                )));
            }
            Value::Object(
                T::NAMES
                    .iter()
                    .map(|n| n.to_string())
                    .zip(items)
                    .collect(),
            )
        }
        other => {
            return Err(UplinkError::InvalidParams(format!(
                "params must be an object or array, got {other}"
            )))
        }
    };
    serde_json::from_value(named).map_err(|e| UplinkError::InvalidParams(e.to_string()))
}

/// Resolves calls against one connection.
pub struct Dispatcher {
    ctx: Arc<DaemonContext>,
    /// Connection end; work spawned by a call (local proxy) stops with it.
    end: Signal,
}

impl Dispatcher {
    pub fn new(ctx: Arc<DaemonContext>, end: Signal) -> Self {
        Self { ctx, end }
    }

    /// Run one call. Notifications yield no response.
    pub async fn handle(&self, req: Request) -> Option<Response> {
        let Request {
            jsonrpc,
            method,
            params,
            id,
        } = req;

        let result = if jsonrpc != JSONRPC_VERSION {
            Err(RpcError::invalid_request(format!("unsupported jsonrpc version {jsonrpc:?}")))
        } else {
            match Method::from_name(&method) {
                None => Err(RpcError::method_not_found(&method)),
                Some(m) => {
                    debug!(method = m.name(), "rpc call");
                    methods::call(&self.ctx, &self.end, m, params)
                        .await
                        .map_err(|e| {
                            warn!(method = m.name(), error = %e, "rpc call failed");
                            RpcError::from(e)
                        })
                }
            }
        };

        let id = id?;
        Some(match result {
            Ok(value) => Response::success(id, value),
            Err(err) => Response::failure(id, err),
        })
    }
}

/// One RPC worker: take a call, answer it, repeat until `end`.
pub async fn run_worker(
    id: usize,
    dispatcher: Arc<Dispatcher>,
    calls: Arc<Mutex<mpsc::UnboundedReceiver<Request>>>,
    outbound: Outbound,
    end: Signal,
) -> UplinkResult<()> {
    debug!(worker = id, "rpc worker started");
    loop {
        let req = {
            let mut rx = calls.lock().await;
            tokio::select! {
                _ = end.wait() => break,
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            }
        };
        if let Some(resp) = dispatcher.handle(req).await {
            outbound.send_high(resp.to_json());
        }
    }
    debug!(worker = id, "rpc worker stopped");
    Ok(())
}
