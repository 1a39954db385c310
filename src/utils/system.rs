// src/utils/system.rs: System functions

use std::time::Duration;

use log::{debug, warn};
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;

/// Determines number of cores available to the run
///
/// # Returns
///
/// (physical cores, current cpu usage in percent)
pub async fn detect_cores_and_load() -> (usize, f32) {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    sleep(Duration::from_millis(100)).await;
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    let cpu_load = system.global_cpu_usage();
    (physical_cores, cpu_load)
}

/// Logs the machine state and warns when the budget oversubscribes it.
/// The budget is never changed.
///
/// # Returns
///
/// Warning text when `nb_cpus` exceeds the physical core count.
pub async fn check_cpu_budget(nb_cpus: usize) -> Option<String> {
    let (physical_cores, cpu_load) = detect_cores_and_load().await;
    debug!("Detected {} physical cores; CPU load {:.1}%; {} requested", physical_cores, cpu_load, nb_cpus);
    budget_warning(nb_cpus, physical_cores).inspect(|msg| warn!("{}", msg))
}

fn budget_warning(nb_cpus: usize, physical_cores: usize) -> Option<String> {
    if nb_cpus > physical_cores {
        Some(format!(
            "--nb-cpus {} is above the {} physical cores of this machine.",
            nb_cpus, physical_cores
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_warning() {
        assert!(budget_warning(4, 8).is_none());
        assert!(budget_warning(8, 8).is_none());
        let msg = budget_warning(16, 8);
        assert!(msg.is_some_and(|m| m.contains("16") && m.contains("8 physical")));
    }

    #[tokio::test]
    async fn test_detect_cores() {
        let (cores, _load) = detect_cores_and_load().await;
        assert!(cores >= 1);
    }
}
