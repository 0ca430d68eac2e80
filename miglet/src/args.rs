use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use common::{DEFAULT_CONTROL_PORT, DEFAULT_REGISTRATION_PORT, DEFAULT_TRANSFER_PORT};
use libtransfer::TransferOptions;

#[derive(Parser, Debug, Clone)]
#[command(name = "miglet", version, about = "Live migration agent")]
pub struct Args {
    /// Container root the overlay stack is bound onto
    #[arg(value_name = "ROOT_DIR")]
    pub root_dir: PathBuf,

    /// Layers to add when extending an existing stack
    #[arg(value_name = "LAYER_COUNT", default_value_t = 1)]
    pub layer_count: u32,

    /// Pod name the agent registers under
    #[arg(long, env = "name")]
    pub name: String,

    /// Pod IP other agents reach this one on
    #[arg(long, env = "ip")]
    pub ip: String,

    /// Directory holding the u<N>/w<N>/m<N> level directories
    #[arg(long, env = "MIGLET_LAYER_ROOT", default_value = "/data")]
    pub layer_root: PathBuf,

    /// Read-only image root under the lowest level. When unset, ROOT_DIR is
    /// captured into LAYER_ROOT/base at startup
    #[arg(long, env = "MIGLET_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// Controller registration address
    #[arg(
        long,
        env = "MIGLET_CONTROLLER",
        default_value_t = format!("127.0.0.1:{DEFAULT_REGISTRATION_PORT}")
    )]
    pub controller: String,

    #[arg(long, env = "MIGLET_TRANSFER_PORT", default_value_t = DEFAULT_TRANSFER_PORT)]
    pub transfer_port: u16,

    #[arg(long, env = "MIGLET_CONTROL_PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    pub control_port: u16,

    /// Seconds to wait for the controller connection and reply
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Seconds a destination waits for every layer to arrive
    #[arg(long, default_value_t = 600)]
    pub receive_timeout: u64,

    /// Per-read/per-write socket timeout on transfers, in seconds
    #[arg(long, default_value_t = 30)]
    pub io_timeout: u64,
}

impl Args {
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| self.layer_root.join("base"))
    }

    /// The base is taken from ROOT_DIR itself rather than given.
    pub fn captures_base(&self) -> bool {
        self.base_dir.is_none()
    }

    /// Address registered with the controller: where this agent receives layers.
    pub fn pod_address(&self) -> String {
        format!("{}:{}", self.ip, self.transfer_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout)
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            connect_timeout: self.connect_timeout(),
            io_timeout: Duration::from_secs(self.io_timeout),
            ..TransferOptions::default()
        }
    }
}
