//! File information returned by [`Resource::stat`](crate::resource::Resource::stat).

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Stat {
    pub name: String,
    pub size: u64,
    pub mtime: Option<chrono::DateTime<chrono::Utc>>,
    pub dir: bool,
    pub file: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Permission string in `ls -l` form, e.g. `rwxr-x---`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perm: Option<String>,
    /// Children, when the endpoint produced them together with the listing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<Stat>>,
}

impl Stat {
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: true,
            ..Default::default()
        }
    }

    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            file: true,
            ..Default::default()
        }
    }

    pub fn with_mtime(mut self, mtime: chrono::DateTime<chrono::Utc>) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn from_metadata(name: impl Into<String>, metadata: &std::fs::Metadata) -> Self {
        Self {
            name: name.into(),
            size: metadata.len(),
            mtime: metadata.modified().ok().map(chrono::DateTime::from),
            dir: metadata.is_dir(),
            file: metadata.is_file(),
            link: None,
            perm: Some(permission_string(metadata)),
            files: None,
        }
    }
}

#[cfg(unix)]
fn permission_string(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    let mode = metadata.permissions().mode();
    let mut perm = String::with_capacity(9);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        perm.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perm.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perm.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    perm
}

#[cfg(not(unix))]
fn permission_string(metadata: &std::fs::Metadata) -> String {
    if metadata.permissions().readonly() {
        "r--r--r--".to_string()
    } else {
        "rw-rw-rw-".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_without_empty_optionals() -> anyhow::Result<()> {
        let stat = Stat::file("a.txt", 10);
        let json = serde_json::to_value(&stat)?;
        assert_eq!(json["size"], 10);
        assert!(json.get("link").is_none());
        assert!(json.get("files").is_none());
        let back: Stat = serde_json::from_value(json)?;
        assert_eq!(back, stat);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn permission_string_from_mode() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f");
        std::fs::write(&path, "x")?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o750))?;
        let stat = Stat::from_metadata("f", &std::fs::metadata(&path)?);
        assert_eq!(stat.perm.as_deref(), Some("rwxr-x---"));
        assert!(stat.file);
        assert_eq!(stat.size, 1);
        Ok(())
    }
}
