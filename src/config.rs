use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::controllers::poller::WaitConfig;
use crate::telemetry::LogFormat;

/// Runtime settings of the extension controller.
#[derive(Parser, Debug, Clone)]
#[command(name = "gardener-extension-shoot-flux", version, about)]
pub struct Settings {
    /// Address the metrics and health endpoints listen on.
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub bind_address: String,

    /// Path to the `flux` binary used to render install manifests.
    #[arg(long, env = "FLUX_CLI", default_value = "flux")]
    pub flux_cli: PathBuf,

    /// Directory with Flux release manifests, passed to `flux install --manifests`.
    #[arg(long, env = "FLUX_MANIFESTS_BASE")]
    pub manifests_base: Option<PathBuf>,

    #[arg(
        long,
        env = "INSTALL_POLL_INTERVAL_SECONDS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub install_poll_interval_seconds: u64,

    #[arg(long, env = "INSTALL_TIMEOUT_SECONDS", default_value_t = 60)]
    pub install_timeout_seconds: u64,

    #[arg(
        long,
        env = "BOOTSTRAP_POLL_INTERVAL_SECONDS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub bootstrap_poll_interval_seconds: u64,

    #[arg(long, env = "BOOTSTRAP_TIMEOUT_SECONDS", default_value_t = 300)]
    pub bootstrap_timeout_seconds: u64,

    /// Delay before a failed reconcile is retried.
    #[arg(long, env = "ERROR_REQUEUE_SECONDS", default_value_t = 60)]
    pub error_requeue_seconds: u64,

    /// Period after which a successfully reconciled Extension is checked again.
    #[arg(long, env = "RESYNC_SECONDS", default_value_t = 3600)]
    pub resync_seconds: u64,

    /// Field manager for server-side apply of the install manifest.
    #[arg(long, env = "FIELD_MANAGER", default_value = "gardener-extension-shoot-flux")]
    pub field_manager: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

impl Settings {
    #[must_use]
    pub fn install_wait(&self) -> WaitConfig {
        WaitConfig {
            interval: Duration::from_secs(self.install_poll_interval_seconds),
            timeout: Duration::from_secs(self.install_timeout_seconds),
        }
    }

    #[must_use]
    pub fn bootstrap_wait(&self) -> WaitConfig {
        WaitConfig {
            interval: Duration::from_secs(self.bootstrap_poll_interval_seconds),
            timeout: Duration::from_secs(self.bootstrap_timeout_seconds),
        }
    }

    #[must_use]
    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_seconds)
    }

    #[must_use]
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }
}
