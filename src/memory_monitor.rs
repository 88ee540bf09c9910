use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::debug;

/// Process RSS thresholds (MiB) splitting the adaptive controller's memory
/// tiers 0..=3. Tier 2 and up demands a detail-mode demotion.
#[derive(Debug, Clone)]
pub struct MemoryTierThresholds {
    pub tier1_mib: u64,
    pub tier2_mib: u64,
    pub tier3_mib: u64,
}

impl Default for MemoryTierThresholds {
    fn default() -> Self {
        Self {
            tier1_mib: 512,
            tier2_mib: 1_024,
            tier3_mib: 2_048,
        }
    }
}

/// Samples this process's resident memory once per cycle and maps it onto
/// the tier ladder.
pub struct MemoryMonitor {
    system: Mutex<System>,
    thresholds: MemoryTierThresholds,
    pid: Pid,
}

impl MemoryMonitor {
    pub fn new(thresholds: MemoryTierThresholds) -> Self {
        Self {
            system: Mutex::new(System::new()),
            thresholds,
            pid: Pid::from_u32(std::process::id()),
        }
    }

    pub fn sample_rss_mib(&self) -> u64 {
        let mut sys = self.system.lock();
        sys.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[self.pid]),
            ProcessRefreshKind::new().with_memory(),
        );
        let bytes = sys.process(self.pid).map(|p| p.memory()).unwrap_or(0);
        bytes / (1024 * 1024)
    }

    pub fn tier(&self) -> u8 {
        let rss = self.sample_rss_mib();
        let tier = self.tier_for(rss);
        debug!("memory sample: {} MiB -> tier {}", rss, tier);
        tier
    }

    pub fn tier_for(&self, rss_mib: u64) -> u8 {
        if rss_mib >= self.thresholds.tier3_mib {
            3
        } else if rss_mib >= self.thresholds.tier2_mib {
            2
        } else if rss_mib >= self.thresholds.tier1_mib {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ladder_boundaries() {
        let m = MemoryMonitor::new(MemoryTierThresholds::default());
        assert_eq!(m.tier_for(0), 0);
        assert_eq!(m.tier_for(511), 0);
        assert_eq!(m.tier_for(512), 1);
        assert_eq!(m.tier_for(1_024), 2);
        assert_eq!(m.tier_for(4_096), 3);
    }

    #[test]
    fn live_sample_is_reasonable() {
        let m = MemoryMonitor::new(MemoryTierThresholds::default());
        // A test binary should comfortably sit below tier 3.
        assert!(m.tier() <= 3);
    }
}
