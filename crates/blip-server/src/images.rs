use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::short::ShortCode;

/// On-disk home of image payloads. One file per image record, named
/// `<short><ext>`, sharing the record's lifetime.
#[derive(Debug, Clone)]
pub struct ImageDir {
    root: PathBuf,
}

impl ImageDir {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Write a new file. Fails with `AlreadyExists` rather than replacing an
    /// existing one, so a colliding code can never clobber another image.
    pub fn write_new(&self, file_name: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.path_of(file_name)?;
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&path)?;
        if let Err(e) = file.write_all(bytes).and_then(|()| file.sync_all()) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        Ok(())
    }

    pub fn read(&self, file_name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path_of(file_name)?)
    }

    /// Remove a file; a file that is already gone is not an error.
    pub fn remove(&self, file_name: &str) -> io::Result<()> {
        match fs::remove_file(self.path_of(file_name)?) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Regular files last modified more than `min_age` ago.
    pub fn settled_files(&self, min_age: Duration) -> io::Result<Vec<String>> {
        let now = SystemTime::now();
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < min_age {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        Ok(names)
    }

    fn path_of(&self, file_name: &str) -> io::Result<PathBuf> {
        // Only bare names generated by `file_name_for` live here.
        match Path::new(file_name).file_name() {
            Some(name) if name == file_name => Ok(self.root.join(name)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a bare file name: {file_name}"),
            )),
        }
    }
}

/// `<short><ext>`; encrypted images are opaque blobs and always `.bin`.
pub fn file_name_for(short: &ShortCode, content_type: &str, encrypted: bool) -> String {
    let ext = if encrypted {
        ".bin"
    } else {
        match content_type {
            "image/png" => ".png",
            "image/jpeg" => ".jpg",
            "image/gif" => ".gif",
            "image/webp" => ".webp",
            _ => ".bin",
        }
    };
    format!("{short}{ext}")
}

/// Content type from the leading bytes, falling back to what the uploader
/// declared, then to `application/octet-stream`.
pub fn detect_content_type(bytes: &[u8], declared: Option<&str>) -> String {
    let sniffed = if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    };
    match (sniffed, declared) {
        (Some(ct), _) => ct.to_owned(),
        (None, Some(ct)) if !ct.is_empty() && ct != "application/octet-stream" => ct.to_owned(),
        _ => "application/octet-stream".to_owned(),
    }
}

/// The short code a stored file belongs to, if its stem is one.
pub fn short_of(file_name: &str) -> Option<ShortCode> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    ShortCode::parse(stem).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_names_follow_content_type() {
        let short = ShortCode::parse("AbC123").unwrap();
        assert_eq!(file_name_for(&short, "image/png", false), "AbC123.png");
        assert_eq!(file_name_for(&short, "image/jpeg", false), "AbC123.jpg");
        assert_eq!(file_name_for(&short, "image/png", true), "AbC123.bin");
        assert_eq!(file_name_for(&short, "text/plain", false), "AbC123.bin");
    }

    #[test]
    fn content_type_prefers_magic_bytes() {
        assert_eq!(
            detect_content_type(b"\x89PNG\r\n\x1a\nrest", Some("image/gif")),
            "image/png"
        );
        assert_eq!(detect_content_type(b"GIF89a..", None), "image/gif");
        assert_eq!(
            detect_content_type(b"RIFF\0\0\0\0WEBPVP8 ", None),
            "image/webp"
        );
        assert_eq!(
            detect_content_type(b"opaque", Some("image/jpeg")),
            "image/jpeg"
        );
        assert_eq!(
            detect_content_type(b"opaque", Some("application/octet-stream")),
            "application/octet-stream"
        );
        assert_eq!(detect_content_type(b"opaque", None), "application/octet-stream");
    }

    #[test]
    fn short_of_parses_stem() {
        assert_eq!(short_of("AbC123.png").unwrap().as_str(), "AbC123");
        assert!(short_of("AbC123").is_none());
        assert!(short_of("AbC123.").is_none());
        assert!(short_of("toolong1.png").is_none());
    }

    #[test]
    fn write_new_never_replaces() {
        let dir = tempdir().unwrap();
        let images = ImageDir::open(dir.path().join("uploads")).unwrap();
        images.write_new("AbC123.png", b"one").unwrap();
        let err = images.write_new("AbC123.png", b"two").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(images.read("AbC123.png").unwrap(), b"one");
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let images = ImageDir::open(dir.path()).unwrap();
        images.write_new("AbC123.bin", b"x").unwrap();
        images.remove("AbC123.bin").unwrap();
        images.remove("AbC123.bin").unwrap();
        assert!(images.read("AbC123.bin").is_err());
    }

    #[test]
    fn rejects_paths() {
        let dir = tempdir().unwrap();
        let images = ImageDir::open(dir.path()).unwrap();
        assert!(images.read("../etc/passwd").is_err());
        assert!(images.write_new("a/b.png", b"x").is_err());
    }

    #[test]
    fn settled_files_respects_min_age() {
        let dir = tempdir().unwrap();
        let images = ImageDir::open(dir.path()).unwrap();
        images.write_new("AbC123.png", b"x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(images.settled_files(Duration::ZERO).unwrap(), vec!["AbC123.png"]);
        assert!(images
            .settled_files(Duration::from_secs(3600))
            .unwrap()
            .is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let images = ImageDir::open(dir.path()).unwrap();
        images.write_new("AbC123.png", b"x").unwrap();
        let mode = fs::metadata(dir.path().join("AbC123.png"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
