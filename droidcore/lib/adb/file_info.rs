use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A file on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Base name
    pub name: String,

    /// Full device path
    pub path: String,

    /// Size in bytes
    pub size: u64,

    /// Mode string as printed by `ls`, e.g. `drwxr-xr-x`
    pub mode: String,

    /// Whether the entry is a directory
    pub is_dir: bool,

    /// Whether the entry is a symbolic link
    pub is_symlink: bool,

    /// Owning user
    pub owner: String,

    /// Owning group
    pub group: String,

    /// Modification time as printed by the device
    pub mod_time: String,

    /// Target of a symbolic link
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub link_target: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FileInfo {
    /// Parses one line of `ls -la` output. Returns `None` for headers and short lines.
    ///
    /// Expected shape: `mode links owner group size date time name [-> target]`.
    pub fn parse_ls_line(line: &str, base_path: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return None;
        }

        let mode = fields[0];
        let size = fields[4].parse().unwrap_or(0);

        let (name_idx, link_target) = match fields.iter().position(|f| *f == "->") {
            Some(arrow) if mode.starts_with('l') && arrow > 0 => {
                (arrow - 1, fields.get(arrow + 1).map(|t| t.to_string()))
            }
            _ => (fields.len() - 1, None),
        };
        let name = fields[name_idx].to_string();

        let time_start = name_idx.saturating_sub(3).max(5);
        let mod_time = if time_start < name_idx {
            fields[time_start..name_idx].join(" ")
        } else {
            String::new()
        };

        Some(Self {
            path: join_device_path(base_path, &name),
            name,
            size,
            mode: mode.to_string(),
            is_dir: mode.starts_with('d'),
            is_symlink: mode.starts_with('l'),
            owner: fields[2].to_string(),
            group: fields[3].to_string(),
            mod_time,
            link_target,
        })
    }

    /// Parses the output of `stat -c '%n|%s|%F|%U|%G|%y'`.
    pub fn parse_stat(output: &str) -> Option<Self> {
        let parts: Vec<&str> = output.trim().split('|').collect();
        if parts.len() < 6 {
            return None;
        }

        let path = parts[0].to_string();
        let file_type = parts[2];
        Some(Self {
            name: device_base_name(&path),
            size: parts[1].trim().parse().unwrap_or(0),
            mode: String::new(),
            is_dir: file_type.contains("directory"),
            is_symlink: file_type.contains("symbolic link"),
            owner: parts[3].to_string(),
            group: parts[4].to_string(),
            mod_time: parts[5].to_string(),
            link_target: None,
            path,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Joins a device directory and an entry name with `/`.
pub(crate) fn join_device_path(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// The last component of a device path.
pub(crate) fn device_base_name(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

/// The parent directory of a device path.
pub(crate) fn device_parent(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ls_regular_file() {
        let info = FileInfo::parse_ls_line(
            "-rw-rw---- 1 root sdcard_rw 1024 2025-01-02 10:11 notes.txt",
            "/sdcard",
        )
        .unwrap();

        assert_eq!(info.name, "notes.txt");
        assert_eq!(info.path, "/sdcard/notes.txt");
        assert_eq!(info.size, 1024);
        assert_eq!(info.owner, "root");
        assert_eq!(info.group, "sdcard_rw");
        assert_eq!(info.mod_time, "2025-01-02 10:11");
        assert!(!info.is_dir);
        assert!(!info.is_symlink);
    }

    #[test]
    fn test_parse_ls_directory_and_symlink() {
        let dir = FileInfo::parse_ls_line(
            "drwxrwx--x 4 system system 4096 2025-01-02 10:11 data",
            "/",
        )
        .unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.path, "/data");

        let link = FileInfo::parse_ls_line(
            "lrw-r--r-- 1 root root 21 2025-01-02 10:11 sdcard -> /storage/self/primary",
            "/",
        )
        .unwrap();
        assert!(link.is_symlink);
        assert_eq!(link.name, "sdcard");
        assert_eq!(link.link_target.as_deref(), Some("/storage/self/primary"));
    }

    #[test]
    fn test_parse_ls_skips_headers() {
        assert!(FileInfo::parse_ls_line("total 24", "/").is_none());
        assert!(FileInfo::parse_ls_line("", "/").is_none());
    }

    #[test]
    fn test_parse_stat() {
        let info = FileInfo::parse_stat(
            "/sdcard/Download|4096|directory|u0_a12|media_rw|2025-01-02 10:11:12.000000000 +0000\n",
        )
        .unwrap();

        assert_eq!(info.name, "Download");
        assert_eq!(info.path, "/sdcard/Download");
        assert_eq!(info.size, 4096);
        assert!(info.is_dir);
        assert_eq!(info.owner, "u0_a12");

        assert!(FileInfo::parse_stat("garbage").is_none());
    }

    #[test]
    fn test_device_path_helpers() {
        assert_eq!(device_base_name("/data/local/tmp/x.apk"), "x.apk");
        assert_eq!(device_parent("/data/local/tmp/x.apk"), "/data/local/tmp");
        assert_eq!(device_parent("/data"), "/");
        assert_eq!(join_device_path("/", "data"), "/data");
    }
}
