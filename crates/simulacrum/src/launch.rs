//! Process kinds and how each one is started

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Subcommand;

use simulacrum_runtime::{
    PvClient, Service, ServiceHandle, ServiceManager, ServiceState, SharedCommandClient,
};

use crate::authority::{AuthoritySettings, Lattice, LatticeEngine, ModelService};
use crate::config::SimulacrumConfig;
use crate::devices::{BlackHole, BpmDevice, DeviceService, MagnetDevice, StaticPvs};

/// How long a service may take to bind its sockets and register its channels
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// The process kinds this binary can run
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Process {
    /// The model authority
    Model {
        /// Lattice definition (TOML); overrides the configured one
        #[arg(long)]
        lattice: Option<PathBuf>,

        /// Perturb the launch position on every broadcast tick
        #[arg(long)]
        jitter: bool,
    },

    /// Beam position monitors
    Bpm,

    /// Correctors, quadrupoles and bends
    Magnet,

    /// Channels listed in a `NAME TYPE [INITIAL]` file
    StaticPvs {
        #[arg(long)]
        file: PathBuf,
    },

    /// Answers for every name with a default channel
    BlackHole,
}

impl Process {
    pub fn name(&self) -> &'static str {
        match self {
            Process::Model { .. } => "model",
            Process::Bpm => "bpm",
            Process::Magnet => "magnet",
            Process::StaticPvs { .. } => "static-pvs",
            Process::BlackHole => "black-hole",
        }
    }
}

/// Start `process` and return access to its routing table once it is running
pub async fn launch(manager: &ServiceManager, process: &Process, config: &SimulacrumConfig) -> Result<PvClient> {
    match process {
        Process::Model { lattice, jitter } => {
            let lattice = match lattice.as_ref().or(config.lattice.as_ref()) {
                Some(path) => Lattice::load(path)
                    .await
                    .with_context(|| format!("loading lattice {}", path.display()))?,
                None => Lattice::demo()?,
            };
            tracing::info!(lattice = %lattice.name, elements = lattice.elements.len(), "Lattice loaded");

            let mut settings = AuthoritySettings::from_config(config);
            if *jitter {
                settings.jitter = Some(config.jitter.sigma);
            }
            start(manager, ModelService::new(LatticeEngine::new(lattice), settings)).await
        }
        Process::Bpm => {
            let client = connect(config).await?;
            let service = DeviceService::new(BpmDevice::new(client)).with_broadcast(config.model.broadcast_addr.clone());
            start(manager, service).await
        }
        Process::Magnet => {
            let client = connect(config).await?;
            start(manager, DeviceService::new(MagnetDevice::new(client, config.magnet.settle()))).await
        }
        Process::StaticPvs { file } => {
            let device = StaticPvs::load(file)
                .await
                .with_context(|| format!("loading PV file {}", file.display()))?;
            start(manager, DeviceService::new(device)).await
        }
        Process::BlackHole => start(manager, DeviceService::new(BlackHole)).await,
    }
}

async fn connect(config: &SimulacrumConfig) -> Result<SharedCommandClient> {
    SharedCommandClient::connect(config.model.command_addr.as_str())
        .await
        .with_context(|| format!("connecting to model authority at {}", config.model.command_addr))
}

async fn start<S>(manager: &ServiceManager, service: S) -> Result<PvClient>
where
    S: Service,
    S::Message: From<simulacrum_runtime::PvRequest>,
{
    let handle = manager.spawn(service).await?;
    tokio::time::timeout(STARTUP_TIMEOUT, wait_until_running(&handle))
        .await
        .with_context(|| format!("{} did not start in time", handle.service_id()))??;
    Ok(PvClient::from_mailbox(handle.mailbox()))
}

async fn wait_until_running<M: Send + 'static>(handle: &ServiceHandle<M>) -> Result<()> {
    loop {
        match handle.state() {
            ServiceState::Running => return Ok(()),
            ServiceState::Failed | ServiceState::Stopped => bail!("{} failed to start", handle.service_id()),
            ServiceState::Starting | ServiceState::Stopping => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simulacrum_runtime::ChannelValue;

    #[tokio::test]
    async fn test_launch_black_hole() {
        let manager = ServiceManager::new();
        let pv = launch(&manager, &Process::BlackHole, &SimulacrumConfig::default()).await.unwrap();
        assert_eq!(pv.read("X").await.unwrap(), ChannelValue::Float(0.0));
        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_bpm_without_authority_fails() {
        let mut config = SimulacrumConfig::default();
        config.model.command_addr = "127.0.0.1:1".to_string();
        let manager = ServiceManager::new();
        assert!(launch(&manager, &Process::Bpm, &config).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_pv_file_aborts_startup() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "A:B complex 1\n").unwrap();

        let manager = ServiceManager::new();
        let process = Process::StaticPvs {
            file: file.path().to_path_buf(),
        };
        assert!(launch(&manager, &process, &SimulacrumConfig::default()).await.is_err());
        assert!(manager.is_empty());
    }
}
