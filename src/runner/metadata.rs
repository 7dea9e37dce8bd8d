use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use sysinfo::System;

/// Host facts recorded next to every run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetadata {
    pub platform: String,
    pub arch: String,
    pub os_release: Option<String>,
    pub os_version: Option<String>,
    pub hostname: Option<String>,
    pub cpu_count: usize,
    pub cpu_model: Option<String>,
    pub total_memory: u64,
    pub collected_at: String,
}

impl HostMetadata {
    pub fn collect() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();

        let cpu_model = system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty());

        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os_release: System::kernel_version(),
            os_version: System::long_os_version(),
            hostname: System::host_name(),
            cpu_count: system.cpus().len(),
            cpu_model,
            total_memory: system.total_memory(),
            collected_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn into_map(self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Shorthand for freshly collected host metadata as a JSON object.
pub fn collect_metadata() -> Map<String, Value> {
    HostMetadata::collect().into_map()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_reports_platform() {
        let metadata = collect_metadata();
        assert_eq!(metadata["platform"], std::env::consts::OS);
        assert_eq!(metadata["arch"], std::env::consts::ARCH);
        assert!(metadata.contains_key("cpuCount"));
        assert!(metadata.contains_key("totalMemory"));
    }
}
