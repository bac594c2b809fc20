//! Pid file guarding against double starts.

use std::path::Path;

pub fn write(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

pub fn read(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn remove(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Signal-0 probe: is a process with this pid still running?
pub fn alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/assist.pid");
        assert_eq!(read(&path), None);
        write(&path).unwrap();
        assert_eq!(read(&path), Some(std::process::id()));
        remove(&path);
        assert_eq!(read(&path), None);
    }

    #[test]
    fn alive_distinguishes_real_processes() {
        assert!(alive(std::process::id()));
        assert!(!alive(u32::MAX));
    }
}
