/// 性能监视器
///
/// 周期性地把每个被跟踪主机的原始字节计数转换为速率与累计值
use crate::stats::{
    format_bytes, Statistics, INFO_UPDATE, PERF_DW_COUNT, PERF_DW_SPEED, PERF_DW_TOTAL,
    PERF_UP_COUNT, PERF_UP_SPEED, PERF_UP_TOTAL,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// 默认采样间隔
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

pub struct PerformanceWatcher {
    stats: Arc<Statistics>,
    interval: Duration,
}

impl PerformanceWatcher {
    pub fn new(stats: Arc<Statistics>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        Self { stats, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 运行直到取消
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Performance watcher started ({:?} interval)", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即返回，跳过
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        info!("Performance watcher stopped");
    }

    /// 处理一次采样，返回本次有流量的主机数
    ///
    /// 除当前跟踪的主机外，也会取走刚结束跟踪的主机的剩余计数。
    pub fn tick(&self) -> usize {
        let secs = self.interval.as_secs_f64();
        let mut active = 0;

        let mut hosts = self.stats.hosts();
        for host in self.stats.take_draining_hosts() {
            if !hosts.iter().any(|h| h.eq_ignore_ascii_case(&host)) {
                hosts.push(host);
            }
        }

        for host in hosts {
            let up = self
                .stats
                .get_and_clear(PERF_UP_COUNT, &[host.as_str()])
                .unwrap_or(0.0);
            let down = self
                .stats
                .get_and_clear(PERF_DW_COUNT, &[host.as_str()])
                .unwrap_or(0.0);
            if up <= 0.0 && down <= 0.0 {
                continue;
            }
            active += 1;

            let up_speed = up / secs;
            let down_speed = down / secs;
            // 取出的值非负，写回不会失败
            let _ = self.stats.set(up_speed, PERF_UP_SPEED, &[host.as_str()]);
            let _ = self.stats.set(down_speed, PERF_DW_SPEED, &[host.as_str()]);
            let _ = self.stats.increment_by(up, PERF_UP_TOTAL, &[host.as_str()]);
            let _ = self.stats.increment_by(down, PERF_DW_TOTAL, &[host.as_str()]);
            self.stats.set_state(unix_timestamp(), INFO_UPDATE, &[host.as_str()]);

            trace!(
                "{}: up {}/s, down {}/s",
                host,
                format_bytes(up_speed),
                format_bytes(down_speed)
            );
        }

        if active > 0 {
            debug!("Performance tick updated {} host(s)", active);
        }
        active
    }
}

fn unix_timestamp() -> String {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .to_string()
}
