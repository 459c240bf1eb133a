//! Handlers for every [`Method`], with their parameter types.

use super::{parse_params, Method, MethodParams};
use crate::channel::proxy;
use crate::context::DaemonContext;
use crate::params::{
    GITHUB_SSH_KEYS, GITHUB_USERNAME, GIT_BRANCH, GIT_COMMIT, GIT_REMOTE, NAV_DESTINATION,
    RECENTLY_VIEWED_ROUTES,
};
use crate::shell::DEFAULT_READ_BYTES;
use crate::signal::Signal;
use crate::upload::{self, worker::now_ms, UploadRequest};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uplink_core::{UplinkError, UplinkResult};

const RECENT_ROUTES: usize = 10;

macro_rules! method_params {
    ($ty:ty, [$($name:literal),*]) => {
        impl MethodParams for $ty {
            const NAMES: &'static [&'static str] = &[$($name),*];
        }
    };
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoParams {}
method_params!(NoParams, []);

#[derive(Deserialize)]
struct EchoParams {
    s: Value,
}
method_params!(EchoParams, ["s"]);

fn default_message_timeout() -> u64 {
    1000
}

#[derive(Deserialize)]
struct GetMessageParams {
    service: String,
    #[serde(default = "default_message_timeout")]
    timeout: u64,
}
method_params!(GetMessageParams, ["service", "timeout"]);

#[derive(Deserialize, serde::Serialize)]
struct NavDestination {
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
    #[serde(default)]
    place_name: Option<String>,
    #[serde(default)]
    place_details: Option<String>,
}
method_params!(NavDestination, ["latitude", "longitude", "place_name", "place_details"]);

#[derive(Deserialize)]
struct ListDataDirectoryParams {
    #[serde(default)]
    prefix: String,
}
method_params!(ListDataDirectoryParams, ["prefix"]);

#[derive(Deserialize)]
struct UploadFileToUrlParams {
    #[serde(rename = "fn")]
    file_name: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}
method_params!(UploadFileToUrlParams, ["fn", "url", "headers"]);

#[derive(Deserialize)]
struct UploadFilesToUrlsParams {
    files_data: Vec<UploadRequest>,
}
method_params!(UploadFilesToUrlsParams, ["files_data"]);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct CancelUploadParams {
    upload_id: OneOrMany,
}
method_params!(CancelUploadParams, ["upload_id"]);

#[derive(Deserialize)]
struct RouteParams {
    route: String,
}
method_params!(RouteParams, ["route"]);

#[derive(Deserialize)]
struct LocalProxyParams {
    remote_ws_uri: String,
    local_port: i64,
}
method_params!(LocalProxyParams, ["remote_ws_uri", "local_port"]);

#[derive(Deserialize)]
struct PinParams {
    pin: String,
}
method_params!(PinParams, ["pin"]);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PinChangeParams {
    old_pin: String,
    new_pin: String,
}
method_params!(PinChangeParams, ["oldPin", "newPin"]);

#[derive(Deserialize)]
struct PinClearParams {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    pin: Option<String>,
}
method_params!(PinClearParams, ["force", "pin"]);

fn default_cols() -> i64 {
    120
}

fn default_rows() -> i64 {
    32
}

fn default_max_bytes() -> i64 {
    DEFAULT_READ_BYTES
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshStartParams {
    #[serde(default = "default_cols")]
    cols: i64,
    #[serde(default = "default_rows")]
    rows: i64,
    #[serde(default)]
    auth_token: Option<String>,
}
method_params!(SshStartParams, ["cols", "rows", "authToken"]);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshWriteParams {
    session_id: String,
    data: String,
    #[serde(default)]
    auth_token: Option<String>,
}
method_params!(SshWriteParams, ["sessionId", "data", "authToken"]);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshReadParams {
    session_id: String,
    #[serde(default = "default_max_bytes")]
    max_bytes: i64,
    #[serde(default)]
    auth_token: Option<String>,
}
method_params!(SshReadParams, ["sessionId", "maxBytes", "authToken"]);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshResizeParams {
    session_id: String,
    #[serde(default = "default_cols")]
    cols: i64,
    #[serde(default = "default_rows")]
    rows: i64,
    #[serde(default)]
    auth_token: Option<String>,
}
method_params!(SshResizeParams, ["sessionId", "cols", "rows", "authToken"]);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshStopParams {
    session_id: String,
    #[serde(default)]
    auth_token: Option<String>,
}
method_params!(SshStopParams, ["sessionId", "authToken"]);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SdpAnswerParams {
    answer: Value,
    #[serde(default)]
    auth_token: Option<String>,
}
method_params!(SdpAnswerParams, ["answer", "authToken"]);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthParams {
    #[serde(default)]
    auth_token: Option<String>,
}
method_params!(AuthParams, ["authToken"]);

/// Run a synchronous handler on the blocking pool.
async fn blocking<F>(f: F) -> UplinkResult<Value>
where
    F: FnOnce() -> UplinkResult<Value> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| UplinkError::Other(format!("handler failed: {e}")))?
}

fn none(params: Value) -> UplinkResult<()> {
    parse_params::<NoParams>(params).map(|_| ())
}

pub async fn call(
    ctx: &Arc<DaemonContext>,
    end: &Signal,
    method: Method,
    params: Value,
) -> UplinkResult<Value> {
    match method {
        Method::Echo => Ok(parse_params::<EchoParams>(params)?.s),
        Method::GetMessage => {
            let p: GetMessageParams = parse_params(params)?;
            ctx.bus
                .next_message(&p.service, Duration::from_millis(p.timeout))
                .await
        }
        Method::GetVersion => {
            none(params)?;
            Ok(get_version(ctx))
        }
        Method::SetNavDestination => {
            let dest: NavDestination = parse_params(params)?;
            ctx.params.put_json(NAV_DESTINATION, &dest)?;
            Ok(json!({"success": 1}))
        }
        Method::ListDataDirectory => {
            let p: ListDataDirectoryParams = parse_params(params)?;
            let roots = ctx.log_roots();
            blocking(move || Ok(json!(list_data_directory(&roots, &p.prefix)?))).await
        }
        Method::UploadFileToUrl => {
            let p: UploadFileToUrlParams = parse_params(params)?;
            let req = UploadRequest {
                file_name: p.file_name,
                url: p.url,
                headers: p.headers,
                allow_cellular: false,
                priority: upload::DEFAULT_UPLOAD_PRIORITY,
            };
            upload_files(ctx, vec![req])
        }
        Method::UploadFilesToUrls => {
            let p: UploadFilesToUrlsParams = parse_params(params)?;
            upload_files(ctx, p.files_data)
        }
        Method::ListUploadQueue => {
            none(params)?;
            Ok(serde_json::to_value(ctx.uploads.list())?)
        }
        Method::CancelUpload => {
            let p: CancelUploadParams = parse_params(params)?;
            let ids = match p.upload_id {
                OneOrMany::One(id) => vec![id],
                OneOrMany::Many(ids) => ids,
            };
            if ctx.uploads.cancel(&ids) {
                Ok(json!({"success": 1}))
            } else {
                Ok(json!({"success": 0, "error": "not found"}))
            }
        }
        Method::SetRouteViewed => {
            let p: RouteParams = parse_params(params)?;
            let current = ctx.params.get_string(RECENTLY_VIEWED_ROUTES);
            let routes = record_route_viewed(current.as_deref(), &p.route);
            ctx.params.put_string(RECENTLY_VIEWED_ROUTES, &routes)?;
            Ok(json!({"success": 1}))
        }
        Method::StartLocalProxy => {
            let p: LocalProxyParams = parse_params(params)?;
            let token = ctx.identity.token(&ctx.dongle_id)?;
            proxy::start_local_proxy(&p.remote_ws_uri, p.local_port, &token, end.clone()).await
        }
        Method::GetPublicKey => {
            none(params)?;
            Ok(json!(ctx.identity.public_key_openssh()))
        }
        Method::GetSshAuthorizedKeys => {
            none(params)?;
            Ok(json!(ctx.params.get_string(GITHUB_SSH_KEYS).unwrap_or_default()))
        }
        Method::GetGithubUsername => {
            none(params)?;
            Ok(json!(ctx.params.get_string(GITHUB_USERNAME).unwrap_or_default()))
        }
        Method::GetSimInfo => {
            none(params)?;
            let device = ctx.device.clone();
            blocking(move || Ok(device.sim_info())).await
        }
        Method::GetNetworkType => {
            none(params)?;
            let device = ctx.device.clone();
            blocking(move || Ok(serde_json::to_value(device.network_type())?)).await
        }
        Method::GetNetworkMetered => {
            none(params)?;
            let device = ctx.device.clone();
            blocking(move || Ok(json!(device.network_metered()))).await
        }
        Method::GetNetworks => {
            none(params)?;
            let device = ctx.device.clone();
            blocking(move || Ok(device.networks())).await
        }
        Method::TakeSnapshot => {
            none(params)?;
            let device = ctx.device.clone();
            blocking(move || {
                let snap = device.snapshot()?;
                let b64 = |img: Option<Vec<u8>>| img.map(|bytes| STANDARD.encode(bytes));
                Ok(json!({"jpegBack": b64(snap.back), "jpegFront": b64(snap.front)}))
            })
            .await
        }

        Method::RemotePinStatus => {
            none(params)?;
            Ok(serde_json::to_value(ctx.pin.status())?)
        }
        Method::RemotePinVerify => {
            let p: PinParams = parse_params(params)?;
            let pin = ctx.pin.clone();
            blocking(move || Ok(pin.verify(&p.pin)?.to_json())).await
        }
        Method::RemotePinSet => {
            let p: PinParams = parse_params(params)?;
            let pin = ctx.pin.clone();
            blocking(move || {
                pin.set(&p.pin)?;
                Ok(json!({"success": true}))
            })
            .await
        }
        Method::RemotePinChange => {
            let p: PinChangeParams = parse_params(params)?;
            let pin = ctx.pin.clone();
            blocking(move || {
                pin.change(&p.old_pin, &p.new_pin)?;
                Ok(json!({"success": true}))
            })
            .await
        }
        Method::RemotePinClear => {
            let p: PinClearParams = parse_params(params)?;
            let pin = ctx.pin.clone();
            blocking(move || {
                pin.clear(p.force, p.pin.as_deref())?;
                Ok(json!({"success": true}))
            })
            .await
        }

        Method::RemoteSshStart => {
            let p: SshStartParams = parse_params(params)?;
            ctx.pin.require_auth(p.auth_token.as_deref())?;
            let shells = ctx.shells.clone();
            blocking(move || shells.start(p.cols, p.rows)).await
        }
        Method::RemoteSshWrite => {
            let p: SshWriteParams = parse_params(params)?;
            ctx.pin.require_auth(p.auth_token.as_deref())?;
            let shells = ctx.shells.clone();
            blocking(move || shells.write(&p.session_id, &p.data)).await
        }
        Method::RemoteSshRead => {
            let p: SshReadParams = parse_params(params)?;
            ctx.pin.require_auth(p.auth_token.as_deref())?;
            let shells = ctx.shells.clone();
            blocking(move || shells.read(&p.session_id, p.max_bytes)).await
        }
        Method::RemoteSshResize => {
            let p: SshResizeParams = parse_params(params)?;
            ctx.pin.require_auth(p.auth_token.as_deref())?;
            let shells = ctx.shells.clone();
            blocking(move || shells.resize(&p.session_id, p.cols, p.rows)).await
        }
        Method::RemoteSshStop => {
            let p: SshStopParams = parse_params(params)?;
            ctx.pin.require_auth(p.auth_token.as_deref())?;
            let shells = ctx.shells.clone();
            blocking(move || shells.stop(&p.session_id)).await
        }

        Method::SetSdpAnswer => {
            let p: SdpAnswerParams = parse_params(params)?;
            ctx.pin.require_auth(p.auth_token.as_deref())?;
            ctx.signaling.push_answer(p.answer);
            Ok(Value::Null)
        }
        Method::GetSdp => {
            let p: AuthParams = parse_params(params)?;
            ctx.pin.require_auth(p.auth_token.as_deref())?;
            Ok(ctx
                .signaling
                .next_sdp(ctx.config.sdp_timeout)
                .await
                .unwrap_or_else(|| json!({"error": "timeout"})))
        }
        Method::GetIce => {
            let p: AuthParams = parse_params(params)?;
            ctx.pin.require_auth(p.auth_token.as_deref())?;
            let candidates = ctx.signaling.drain_ice();
            if candidates.is_empty() {
                Ok(json!({"error": true}))
            } else {
                Ok(Value::Array(candidates))
            }
        }
    }
}

fn get_version(ctx: &DaemonContext) -> Value {
    let param = |key: &str| ctx.params.get_string(key).unwrap_or_default();
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "remote": param(GIT_REMOTE),
        "branch": param(GIT_BRANCH),
        "commit": param(GIT_COMMIT),
    })
}

fn upload_files(ctx: &DaemonContext, requests: Vec<UploadRequest>) -> UplinkResult<Value> {
    let prepared = upload::prepare(requests, &ctx.log_roots(), now_ms());
    let items = ctx.uploads.enqueue_unique(prepared.items);
    info!(enqueued = items.len(), "uploads enqueued");

    let mut resp = json!({
        "enqueued": items.len(),
        "items": serde_json::to_value(&items)?,
    });
    if !prepared.failed.is_empty() {
        warn!(failed = ?prepared.failed, "some uploads were refused");
        resp["failed"] = json!(prepared.failed);
    }
    Ok(resp)
}

/// Append `route`, drop repeats (first occurrence wins), keep the last ten.
fn record_route_viewed(current: Option<&str>, route: &str) -> String {
    let mut routes: Vec<&str> = Vec::new();
    for r in current
        .unwrap_or_default()
        .split(',')
        .filter(|r| !r.is_empty())
        .chain(std::iter::once(route))
    {
        if !routes.contains(&r) {
            routes.push(r);
        }
    }
    let skip = routes.len().saturating_sub(RECENT_ROUTES);
    routes[skip..].join(",")
}

/// Relative paths under either root that start with `prefix`. The external
/// root may be absent.
fn list_data_directory(roots: &[PathBuf], prefix: &str) -> UplinkResult<Vec<String>> {
    let mut files = BTreeSet::new();
    for (i, root) in roots.iter().enumerate() {
        match scan_dir(root, root, prefix, &mut files) {
            Ok(()) => {}
            Err(e) if i > 0 && e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(files.into_iter().collect())
}

/// Walk only the directories that can contain a match for `prefix`.
fn scan_dir(dir: &Path, base: &Path, prefix: &str, out: &mut BTreeSet<String>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(base) else {
            continue;
        };
        let mut rel = rel.to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            rel.push('/');
            if rel.starts_with(prefix) || prefix.starts_with(&rel) {
                scan_dir(&path, base, prefix, out)?;
            }
        } else if rel.starts_with(prefix) {
            out.insert(rel);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::params::REMOTE_SSH_ENABLED;
    use crate::signaling::{PayloadKind, PipelineMessage};
    use std::time::Instant;

    async fn rpc(ctx: &Arc<DaemonContext>, method: Method, params: Value) -> UplinkResult<Value> {
        call(ctx, &Signal::new(), method, params).await
    }

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"data").unwrap();
    }

    #[test]
    fn route_history() {
        assert_eq!(record_route_viewed(None, "a"), "a");
        assert_eq!(record_route_viewed(Some("a,b"), "a"), "a,b");
        assert_eq!(record_route_viewed(Some(""), "c"), "c");
        let many = (0..10).map(|i| format!("r{i}")).collect::<Vec<_>>().join(",");
        let next = record_route_viewed(Some(&many), "new");
        assert_eq!(next.split(',').count(), 10);
        assert!(next.starts_with("r1,"));
        assert!(next.ends_with(",new"));
    }

    #[tokio::test]
    async fn echo_and_version() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        assert_eq!(rpc(&ctx, Method::Echo, json!(["hi"])).await.unwrap(), json!("hi"));
        ctx.params.put_string(GIT_BRANCH, "release").unwrap();
        let v = rpc(&ctx, Method::GetVersion, Value::Null).await.unwrap();
        assert_eq!(v["branch"], json!("release"));
        assert_eq!(v["version"], json!(env!("CARGO_PKG_VERSION")));
        assert_eq!(v["commit"], json!(""));
    }

    #[tokio::test]
    async fn nav_destination_is_stored() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        let r = rpc(
            &ctx,
            Method::SetNavDestination,
            json!({"latitude": 32.5, "longitude": -117.25, "place_name": "Home"}),
        )
        .await
        .unwrap();
        assert_eq!(r, json!({"success": 1}));
        let stored: Value = ctx.params.get_json(NAV_DESTINATION).unwrap();
        assert_eq!(stored["place_name"], json!("Home"));
        assert_eq!(stored["place_details"], Value::Null);
        assert_eq!(stored["longitude"], json!(-117.25));
    }

    #[tokio::test]
    async fn data_directory_listing() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        touch(&ctx.config.log_root, "2024-01-01--00-00-00--0/rlog");
        touch(&ctx.config.log_root, "2024-01-01--00-00-00--1/qlog");
        touch(&ctx.config.log_root, "boot/1");

        let all = rpc(&ctx, Method::ListDataDirectory, Value::Null).await.unwrap();
        assert_eq!(
            all,
            json!([
                "2024-01-01--00-00-00--0/rlog",
                "2024-01-01--00-00-00--1/qlog",
                "boot/1"
            ])
        );
        let some = rpc(&ctx, Method::ListDataDirectory, json!(["2024-01-01--00-00-00--1"]))
            .await
            .unwrap();
        assert_eq!(some, json!(["2024-01-01--00-00-00--1/qlog"]));
    }

    #[tokio::test]
    async fn upload_enqueue_list_and_cancel() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        touch(&ctx.config.log_root, "r/rlog");

        let r = rpc(
            &ctx,
            Method::UploadFilesToUrls,
            json!([[
                {"fn": "r/rlog", "url": "https://h/rlog?sig=1", "headers": {"x": "y"}},
                {"fn": "../etc", "url": "https://h/etc"}
            ]]),
        )
        .await
        .unwrap();
        assert_eq!(r["enqueued"], json!(1));
        assert_eq!(r["failed"], json!(["../etc"]));
        let id = r["items"][0]["id"].as_str().unwrap().to_string();

        // Same URL with a different query is a duplicate.
        let r = rpc(
            &ctx,
            Method::UploadFileToUrl,
            json!({"fn": "r/rlog", "url": "https://h/rlog?sig=2", "headers": {}}),
        )
        .await
        .unwrap();
        assert_eq!(r, json!({"enqueued": 0, "items": []}));

        let listed = rpc(&ctx, Method::ListUploadQueue, Value::Null).await.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        assert_eq!(
            rpc(&ctx, Method::CancelUpload, json!(["nope"])).await.unwrap(),
            json!({"success": 0, "error": "not found"})
        );
        assert_eq!(
            rpc(&ctx, Method::CancelUpload, json!({"upload_id": [id]})).await.unwrap(),
            json!({"success": 1})
        );
        let listed = rpc(&ctx, Method::ListUploadQueue, Value::Null).await.unwrap();
        assert_eq!(listed, json!([]));
    }

    #[tokio::test]
    async fn shell_is_gated_by_pin() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        rpc(&ctx, Method::RemotePinSet, json!({"pin": "2468"})).await.unwrap();

        let err = rpc(&ctx, Method::RemoteSshStart, Value::Null).await.unwrap_err();
        assert!(matches!(err, UplinkError::PinRequired));

        let v = rpc(&ctx, Method::RemotePinVerify, json!(["2468"])).await.unwrap();
        let token = v["token"].as_str().unwrap().to_string();

        let started = rpc(&ctx, Method::RemoteSshStart, json!({"authToken": token}))
            .await
            .unwrap();
        let sid = started["sessionId"].as_str().unwrap().to_string();
        let wrote = rpc(
            &ctx,
            Method::RemoteSshWrite,
            json!({"sessionId": sid, "data": "echo hi\n", "authToken": token}),
        )
        .await
        .unwrap();
        assert_eq!(wrote, json!({"success": true, "written": 8}));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while Instant::now() < deadline && !String::from_utf8_lossy(&out).contains("hi\r\n") {
            let r = rpc(
                &ctx,
                Method::RemoteSshRead,
                json!({"sessionId": sid, "authToken": token}),
            )
            .await
            .unwrap();
            out.extend(STANDARD.decode(r["data"].as_str().unwrap()).unwrap());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(String::from_utf8_lossy(&out).contains("hi"));

        let stopped = rpc(
            &ctx,
            Method::RemoteSshStop,
            json!({"sessionId": sid, "authToken": token}),
        )
        .await
        .unwrap();
        assert_eq!(stopped, json!({"success": true}));
    }

    #[tokio::test]
    async fn shell_disabled_answers_without_session() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        ctx.params.put_bool(REMOTE_SSH_ENABLED, false).unwrap();
        let r = rpc(&ctx, Method::RemoteSshStart, json!([80, 24])).await.unwrap();
        assert_eq!(r, json!({"success": false, "error": "Remote SSH disabled"}));
        assert_eq!(ctx.shells.active_count(), 0);
    }

    #[tokio::test]
    async fn pin_status_and_force_clear() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        rpc(&ctx, Method::RemotePinSet, json!(["1357"])).await.unwrap();
        let status = rpc(&ctx, Method::RemotePinStatus, Value::Null).await.unwrap();
        assert_eq!(status, json!({"set": true, "locked": false, "lockRemainingS": 0}));

        let r = rpc(&ctx, Method::RemotePinChange, json!({"oldPin": "0000", "newPin": "9999"})).await;
        assert_eq!(r.unwrap_err().to_string(), "Incorrect PIN");

        rpc(&ctx, Method::RemotePinClear, json!({"force": true})).await.unwrap();
        let status = rpc(&ctx, Method::RemotePinStatus, Value::Null).await.unwrap();
        assert_eq!(status["set"], json!(false));
        rpc(&ctx, Method::GetIce, Value::Null).await.unwrap();
    }

    #[tokio::test]
    async fn signaling_methods() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        assert_eq!(
            rpc(&ctx, Method::GetIce, Value::Null).await.unwrap(),
            json!({"error": true})
        );
        ctx.signaling.publish(PipelineMessage {
            kind: PayloadKind::Ice,
            payload: json!(r#"{"candidate":"c1"}"#),
        });
        assert_eq!(
            rpc(&ctx, Method::GetIce, Value::Null).await.unwrap(),
            json!([{"candidate": "c1"}])
        );

        ctx.signaling.publish(PipelineMessage {
            kind: PayloadKind::Sdp,
            payload: json!({"type": "offer"}),
        });
        assert_eq!(
            rpc(&ctx, Method::GetSdp, json!({})).await.unwrap(),
            json!({"type": "offer"})
        );

        rpc(&ctx, Method::SetSdpAnswer, json!({"answer": {"type": "answer"}}))
            .await
            .unwrap();
        assert_eq!(ctx.signaling.next_inbound().await, json!({"type": "answer"}));
    }

    #[tokio::test]
    async fn device_queries() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        assert_eq!(
            rpc(&ctx, Method::GetNetworkType, Value::Null).await.unwrap(),
            json!("wifi")
        );
        assert_eq!(
            rpc(&ctx, Method::GetNetworkMetered, Value::Null).await.unwrap(),
            json!(false)
        );
        let snap = rpc(&ctx, Method::TakeSnapshot, Value::Null).await.unwrap();
        assert_eq!(snap["jpegBack"], json!(STANDARD.encode(b"jpeg")));
        assert_eq!(snap["jpegFront"], Value::Null);
        let key = rpc(&ctx, Method::GetPublicKey, Value::Null).await.unwrap();
        assert!(key.as_str().unwrap().starts_with("ssh-ed25519 "));
        assert_eq!(
            rpc(&ctx, Method::GetSshAuthorizedKeys, Value::Null).await.unwrap(),
            json!("")
        );
    }

    #[tokio::test]
    async fn local_proxy_refuses_other_ports() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(ctx);
        let err = rpc(
            &ctx,
            Method::StartLocalProxy,
            json!({"remote_ws_uri": "ws://127.0.0.1:1/proxy", "local_port": 80}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Requested local port not whitelisted");
    }
}
