//! Parsing of `virsh dominfo` and `virsh dumpxml` output

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

/// `virsh dominfo` state of a powered-off domain
pub const STATE_SHUT_OFF: &str = "shut off";

static DISK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<disk\b([^>]*)>(.*?)</disk>").expect("disk pattern"));
static DEVICE_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bdevice\s*=\s*['"]([^'"]*)['"]"#).expect("device pattern"));
static SOURCE_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<source\b[^>]*?\bfile\s*=\s*['"]([^'"]*)['"]"#).expect("source pattern")
});

/// `Key: value` pairs from `virsh dominfo`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainInfo {
    fields: BTreeMap<String, String>,
}

impl DomainInfo {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// `State` field, e.g. `running` or `shut off`
    pub fn state(&self) -> Option<&str> {
        self.get("State")
    }

    pub fn is_shut_off(&self) -> bool {
        self.state() == Some(STATE_SHUT_OFF)
    }
}

/// Split every `key: value` line; the value may itself contain colons
pub fn parse_dominfo(output: &str) -> DomainInfo {
    let fields = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect();
    DomainInfo { fields }
}

/// One file-backed disk of a domain definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSource {
    /// `device` attribute (`disk`, `cdrom`, `floppy`, `lun`)
    pub device: String,
    /// Path on the host, XML entities decoded
    pub file: String,
    /// Attribute value exactly as it appears in the XML
    pub raw: String,
}

/// Disks worth copying: file-backed and not a CD-ROM
pub fn parse_disk_sources(xml: &str) -> Result<Vec<DiskSource>, String> {
    if !xml.contains("<domain") {
        return Err("no <domain> element in definition".to_string());
    }

    let mut disks = Vec::new();
    for cap in DISK_RE.captures_iter(xml) {
        let attrs = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        let body = cap.get(2).map(|m| m.as_str()).unwrap_or_default();

        let device = DEVICE_ATTR_RE
            .captures(attrs)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "disk".to_string());
        if device == "cdrom" {
            continue;
        }

        let Some(raw) = SOURCE_FILE_RE
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        else {
            continue;
        };
        if raw.is_empty() {
            continue;
        }

        disks.push(DiskSource {
            device,
            file: xml_unescape(&raw),
            raw,
        });
    }
    Ok(disks)
}

/// `<base>/<vm>_<file name>` so disks of different VMs never collide
pub fn destination_path(base: &str, vm: &str, source: &str) -> String {
    let file_name = source.rsplit('/').next().unwrap_or(source);
    format!("{}/{}_{}", base.trim_end_matches('/'), vm, file_name)
}

/// Destination paths for all disks of one VM.
///
/// Disks whose file names clash get their index in the definition added,
/// `<base>/<vm>_<i>_<file name>`. Fails if names still collide.
pub fn destination_paths(base: &str, vm: &str, sources: &[&str]) -> Result<Vec<String>, String> {
    let plain: Vec<String> = sources
        .iter()
        .map(|src| destination_path(base, vm, src))
        .collect();

    let paths: Vec<String> = plain
        .iter()
        .enumerate()
        .map(|(i, path)| {
            if plain.iter().filter(|p| *p == path).count() > 1 {
                destination_path(base, &format!("{}_{}", vm, i), sources[i])
            } else {
                path.clone()
            }
        })
        .collect();

    let mut seen = HashSet::new();
    for path in &paths {
        if !seen.insert(path.as_str()) {
            return Err(format!("two disks map to destination {}", path));
        }
    }
    Ok(paths)
}

/// Substitute every `(from, to)` host path in a domain definition
pub fn rewrite_disk_paths<'a>(xml: &str, paths: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    paths
        .into_iter()
        .fold(xml.to_string(), |acc, (from, to)| acc.replace(from, to))
}

pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMINFO: &str = "Id:             -\n\
Name:           web-01\n\
UUID:           6f1c7a2e-4b1d-4c1e-9f55-0d9c1f3e2a10\n\
OS Type:        hvm\n\
State:          shut off\n\
CPU(s):         2\n\
Max memory:     2097152 KiB\n\
Security label: system_u:system_r:svirt_t:s0:c1,c2 (enforcing)\n";

    const DOMAIN_XML: &str = r#"<domain type='kvm'>
  <name>web-01</name>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/data/vms/web-01.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/isos/seed.iso'/>
      <target dev='sda' bus='sata'/>
    </disk>
    <disk type='file' device='disk'>
      <source file='/data/vms/web-01-data.raw' index='2'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <disk type='block' device='disk'>
      <source dev='/dev/vg0/web'/>
      <target dev='vdc' bus='virtio'/>
    </disk>
  </devices>
</domain>"#;

    #[test]
    fn test_parse_dominfo() {
        let info = parse_dominfo(DOMINFO);
        assert_eq!(info.get("Name"), Some("web-01"));
        assert_eq!(info.state(), Some("shut off"));
        assert!(info.is_shut_off());
        assert_eq!(info.get("CPU(s)"), Some("2"));
        // Only the first colon splits
        assert_eq!(
            info.get("Security label"),
            Some("system_u:system_r:svirt_t:s0:c1,c2 (enforcing)")
        );
    }

    #[test]
    fn test_running_is_not_shut_off() {
        let info = parse_dominfo("Name: db\nState:          running\n");
        assert!(!info.is_shut_off());
        assert!(!parse_dominfo("").is_shut_off());
    }

    #[test]
    fn test_parse_disk_sources_skips_cdrom_and_block() {
        let disks = parse_disk_sources(DOMAIN_XML).unwrap();
        let files: Vec<&str> = disks.iter().map(|d| d.file.as_str()).collect();
        assert_eq!(files, vec!["/data/vms/web-01.qcow2", "/data/vms/web-01-data.raw"]);
        assert!(disks.iter().all(|d| d.device == "disk"));
    }

    #[test]
    fn test_parse_disk_sources_rejects_non_domain() {
        assert!(parse_disk_sources("error: failed to get domain 'x'").is_err());
    }

    #[test]
    fn test_escaped_source_path() {
        let xml = "<domain><devices><disk device=\"disk\"><source file=\"/vm/a&amp;b.img\"/></disk></devices></domain>";
        let disks = parse_disk_sources(xml).unwrap();
        assert_eq!(disks[0].file, "/vm/a&b.img");
        assert_eq!(disks[0].raw, "/vm/a&amp;b.img");
    }

    #[test]
    fn test_destination_path() {
        assert_eq!(
            destination_path("/var/lib/libvirt/images", "web-01", "/data/vms/disk.qcow2"),
            "/var/lib/libvirt/images/web-01_disk.qcow2"
        );
        assert_eq!(
            destination_path("/var/lib/libvirt/images/", "db", "root.img"),
            "/var/lib/libvirt/images/db_root.img"
        );
    }

    #[test]
    fn test_destination_paths_same_file_name() {
        let paths = destination_paths(
            "/var/lib/libvirt/images",
            "web",
            &["/a/disk.img", "/b/disk.img", "/c/root.img"],
        )
        .unwrap();
        assert_eq!(
            paths,
            vec![
                "/var/lib/libvirt/images/web_0_disk.img",
                "/var/lib/libvirt/images/web_1_disk.img",
                "/var/lib/libvirt/images/web_root.img",
            ]
        );
    }

    #[test]
    fn test_destination_paths_same_source_twice() {
        // Same file attached twice still gets distinct copies
        let paths = destination_paths("/img", "web", &["/a/disk.img", "/a/disk.img"]).unwrap();
        assert_ne!(paths[0], paths[1]);
    }

    #[test]
    fn test_destination_paths_unresolvable_clash() {
        // `web_0_disk.img` is both a renamed clash and a plain file name
        let err = destination_paths("/img", "web", &["/a/disk.img", "/b/disk.img", "/c/0_disk.img"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_rewrite_disk_paths() {
        let out = rewrite_disk_paths(
            DOMAIN_XML,
            [
                ("/data/vms/web-01.qcow2", "/var/lib/libvirt/images/web-01_web-01.qcow2"),
                ("/data/vms/web-01-data.raw", "/var/lib/libvirt/images/web-01_web-01-data.raw"),
            ],
        );
        assert!(!out.contains("/data/vms/"));
        assert!(out.contains("/var/lib/libvirt/images/web-01_web-01.qcow2"));
        assert!(out.contains("/var/lib/libvirt/images/web-01_web-01-data.raw"));
        assert!(out.contains("/isos/seed.iso"));
    }

    #[test]
    fn test_xml_escape_roundtrip() {
        let s = "/vm/a&b <'x'>.img";
        assert_eq!(xml_unescape(&xml_escape(s)), s);
    }
}
