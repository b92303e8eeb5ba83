use once_cell::sync::Lazy;
use serde_json::{json, Value};

const OSES: &[&str] = &["linux", "macos", "windows", "freebsd", "unknown"];
const ARCHES: &[&str] = &[
    "aarch64", "arm", "armeb", "i386", "mips", "mips64", "mipsel", "mipsel64", "powerpc", "ppc64",
    "x86_64", "unknown",
];

fn canonical_os(raw: &str) -> &'static str {
    match raw {
        "linux" => "linux",
        "macos" => "macos",
        "windows" => "windows",
        "freebsd" => "freebsd",
        _ => "unknown",
    }
}

fn canonical_arch(raw: &str) -> &'static str {
    match raw {
        "amd64" | "x86_64" => "x86_64",
        "arm64" | "aarch64" => "aarch64",
        "arm" => "arm",
        "armeb" => "armeb",
        "i386" | "x86" => "i386",
        "mips" => "mips",
        "mips64" => "mips64",
        "mipsel" => "mipsel",
        "mipsel64" => "mipsel64",
        "powerpc" => "powerpc",
        "ppc64" => "ppc64",
        _ => "unknown",
    }
}

/// `host_info()` (§4.F): computed once per worker from `std::env::consts`.
pub static HOST_INFO: Lazy<Value> = Lazy::new(|| build_host_info(std::env::consts::OS, std::env::consts::ARCH));

fn build_host_info(raw_os: &str, raw_arch: &str) -> Value {
    let os = canonical_os(raw_os);
    let arch = canonical_arch(raw_arch);
    let mut os_fields = serde_json::Map::new();
    for candidate in OSES {
        os_fields.insert(format!("is_{candidate}"), Value::Bool(*candidate == os));
    }
    let mut arch_fields = serde_json::Map::new();
    for candidate in ARCHES {
        arch_fields.insert(format!("is_{candidate}"), Value::Bool(*candidate == arch));
    }
    json!({ "os": os_fields, "arch": arch_fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_x86_64_flags() {
        let info = build_host_info("linux", "x86_64");
        assert_eq!(info["os"]["is_linux"], true);
        assert_eq!(info["os"]["is_macos"], false);
        assert_eq!(info["arch"]["is_x86_64"], true);
    }

    #[test]
    fn amd64_maps_to_x86_64() {
        let info = build_host_info("linux", "amd64");
        assert_eq!(info["arch"]["is_x86_64"], true);
    }

    #[test]
    fn arm64_maps_to_aarch64() {
        let info = build_host_info("macos", "arm64");
        assert_eq!(info["arch"]["is_aarch64"], true);
        assert_eq!(info["os"]["is_macos"], true);
    }

    #[test]
    fn unknown_os_falls_back() {
        let info = build_host_info("plan9", "x86_64");
        assert_eq!(info["os"]["is_unknown"], true);
    }
}
