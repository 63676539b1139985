//! Host telemetry for get-node-info. Sampled at call time; nothing cached.

use chrono::Utc;
use nacc_protocol::{NodeInfo, NodeMetrics, NodePlatform};
use sysinfo::{Disks, System};

use crate::context::RootContext;

pub fn node_info(ctx: &RootContext) -> NodeInfo {
    let mut sys = System::new_all();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let memory_total = sys.total_memory();
    let memory_percent = if memory_total > 0 {
        (sys.used_memory() as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let (disk_percent, disk_total) = disk_usage_for(&ctx.root_dir);

    NodeInfo {
        node_id: ctx.node_id.clone(),
        tags: ctx.tags.clone(),
        description: ctx.description.clone(),
        allowed_commands: ctx.allowed_commands.clone(),
        sync_targets: ctx.sync_targets.keys().cloned().collect(),
        metrics: NodeMetrics {
            cpu_percent: sys.global_cpu_usage(),
            memory_percent,
            memory_total_bytes: memory_total,
            disk_percent,
            disk_total_bytes: disk_total,
            uptime_seconds: System::uptime(),
        },
        platform: NodePlatform {
            os: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            arch: std::env::consts::ARCH.to_string(),
            kernel: System::kernel_version(),
        },
        timestamp: Utc::now(),
    }
}

/// Usage of the disk holding the node root: (percent used, total bytes).
fn disk_usage_for(root: &std::path::Path) -> (f32, u64) {
    let disks = Disks::new_with_refreshed_list();
    // Longest mount-point prefix wins.
    let best = disks
        .list()
        .iter()
        .filter(|disk| root.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len());
    match best {
        Some(disk) => {
            let total = disk.total_space();
            let used = total.saturating_sub(disk.available_space());
            let percent = if total > 0 {
                (used as f64 / total as f64 * 100.0) as f32
            } else {
                0.0
            };
            (percent, total)
        }
        None => (0.0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_echoes_identity_and_never_mutates() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = crate::context::RootContext::for_root(
            "info-node",
            dir.path().to_path_buf(),
            vec!["echo".to_string()],
        )
        .unwrap()
        .with_tags(vec!["gpu".to_string()]);

        let first = node_info(&ctx);
        let second = node_info(&ctx);
        assert_eq!(first.node_id, "info-node");
        assert_eq!(first.tags, vec!["gpu"]);
        assert_eq!(first.allowed_commands, second.allowed_commands);
        assert_eq!(first.platform.os, second.platform.os);
        assert!(first.metrics.memory_percent >= 0.0);
    }
}
