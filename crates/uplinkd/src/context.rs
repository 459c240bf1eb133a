//! Process-wide shared state.
//!
//! Built once in `main` and handed to every connection. All fields are
//! either cheap handles or already synchronized.

use crate::bus::Bus;
use crate::config::Config;
use crate::device::{Device, DeviceStatus, HostDevice};
use crate::identity::Identity;
use crate::params::{Params, DONGLE_ID};
use crate::pin::AccessControl;
use crate::shell::{ShellCommand, ShellManager};
use crate::signaling::SignalingRelay;
use crate::upload::{HttpUploader, UploadQueue, Uploader};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use uplink_core::{UplinkError, UplinkResult};

pub struct DaemonContext {
    pub config: Config,
    pub params: Params,
    pub dongle_id: String,
    pub identity: Arc<Identity>,
    pub device: Arc<dyn Device>,
    pub device_status_tx: Arc<watch::Sender<DeviceStatus>>,
    pub bus: Arc<Bus>,
    pub uploads: Arc<UploadQueue>,
    pub uploader: Arc<dyn Uploader>,
    pub shells: Arc<ShellManager>,
    pub pin: Arc<AccessControl>,
    pub signaling: Arc<SignalingRelay>,
}

impl DaemonContext {
    pub fn new(config: Config) -> UplinkResult<Self> {
        let params = Params::open(&config.params_dir)?;
        let dongle_id = params
            .get_string(DONGLE_ID)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| UplinkError::Other("DongleId is not set".into()))?;
        let identity = Arc::new(Identity::load_or_generate(&config.key_path)?);
        let device: Arc<dyn Device> = Arc::new(HostDevice::new(config.snapshot_dir.clone()));
        let uploader = HttpUploader::new()
            .map_err(|e| UplinkError::Other(format!("http client: {e}")))?;
        Ok(Self::assemble(
            config,
            params,
            dongle_id,
            identity,
            device,
            Arc::new(uploader),
        ))
    }

    /// Wire the shared models together around the given edges.
    pub fn assemble(
        config: Config,
        params: Params,
        dongle_id: String,
        identity: Arc<Identity>,
        device: Arc<dyn Device>,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        let (device_status_tx, _) = watch::channel(DeviceStatus::default());
        let device_status_tx = Arc::new(device_status_tx);
        let shell_command = ShellCommand {
            program: config.shell_command.clone(),
            args: config.shell_args.clone(),
            term: config.shell_term.clone(),
        };
        Self {
            uploads: Arc::new(UploadQueue::load(params.clone())),
            shells: Arc::new(ShellManager::new(
                params.clone(),
                shell_command,
                config.shell_idle_timeout,
            )),
            pin: Arc::new(AccessControl::new(params.clone())),
            signaling: Arc::new(SignalingRelay::new()),
            bus: Arc::new(Bus::new()),
            device_status_tx,
            device,
            uploader,
            identity,
            dongle_id,
            params,
            config,
        }
    }

    pub fn device_status(&self) -> watch::Receiver<DeviceStatus> {
        self.device_status_tx.subscribe()
    }

    /// Internal log root first, then the external one.
    pub fn log_roots(&self) -> Vec<PathBuf> {
        vec![
            self.config.log_root.clone(),
            self.config.external_log_root.clone(),
        ]
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::device::testing::FakeDevice;
    use crate::params::REMOTE_SSH_ENABLED;
    use crate::pin::AccessControl;
    use crate::upload::transfer::{ProgressFn, TransferError};
    use crate::upload::UploadItem;
    use std::future::Future;
    use std::pin::Pin;

    /// Accepts every upload without touching the network.
    pub struct NullUploader;

    impl Uploader for NullUploader {
        fn put<'a>(
            &'a self,
            _item: &'a UploadItem,
            _progress: ProgressFn,
        ) -> Pin<Box<dyn Future<Output = Result<u16, TransferError>> + Send + 'a>> {
            Box::pin(async { Ok(200) })
        }
    }

    /// Context rooted in a temp dir: params, key and both log roots inside it.
    pub fn context() -> (tempfile::TempDir, DaemonContext) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let mut config = Config::default();
        config.params_dir = root.join("params");
        config.key_path = root.join("id_ed25519");
        config.log_root = root.join("realdata");
        config.external_log_root = root.join("external");
        config.swaglog_dir = root.join("swaglog");
        config.stats_dir = root.join("stats");
        config.shell_command = "/bin/sh".into();
        config.shell_args = Vec::new();
        for d in [&config.log_root, &config.swaglog_dir, &config.stats_dir] {
            std::fs::create_dir_all(d).unwrap();
        }

        let params = Params::open(&config.params_dir).unwrap();
        params.put_bool(REMOTE_SSH_ENABLED, true).unwrap();
        let identity = Arc::new(Identity::load_or_generate(&config.key_path).unwrap());
        let mut ctx = DaemonContext::assemble(
            config,
            params.clone(),
            "0123456789abcdef".into(),
            identity,
            Arc::new(FakeDevice::default()),
            Arc::new(NullUploader),
        );
        ctx.pin = Arc::new(AccessControl::with_iterations(params, 1_000));
        (dir, ctx)
    }
}
