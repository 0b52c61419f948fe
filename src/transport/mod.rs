mod factory;

pub use factory::{build_transport_config, create_client_endpoint, create_server_endpoint};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// 拥塞控制算法（由 quinn 实现）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CongestionControl {
    #[default]
    Cubic,
    NewReno,
    Bbr,
}

impl std::fmt::Display for CongestionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CongestionControl::Cubic => write!(f, "cubic"),
            CongestionControl::NewReno => write!(f, "newreno"),
            CongestionControl::Bbr => write!(f, "bbr"),
        }
    }
}

impl std::str::FromStr for CongestionControl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cubic" => Ok(Self::Cubic),
            "newreno" | "reno" => Ok(Self::NewReno),
            "bbr" => Ok(Self::Bbr),
            _ => anyhow::bail!("Unknown congestion controller: {}", s),
        }
    }
}
