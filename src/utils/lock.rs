//! 实例互斥锁
//!
//! 同一实例编号同一时刻只允许一个采集进程运行。锁文件内容为持有者 PID，
//! 持有进程已退出或锁文件超过一个周期未更新时视为过期，可被接管。

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::error::Result;

pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    /// 尝试获取实例锁；已被存活进程持有时返回 `None`
    pub fn acquire(dir: &Path, instance: u32, max_age: Duration) -> Result<Option<Self>> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("collector_instance_{}.lock", instance));
        let pid = std::process::id();

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", pid)?;
                    debug!(path = %path.display(), pid, "实例锁已获取");
                    return Ok(Some(Self { path, pid }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !is_stale(&path, max_age) {
                        return Ok(None);
                    }
                    warn!(path = %path.display(), "发现过期的实例锁，正在接管");
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // 仅删除自己持有的锁，避免误删被接管后的新锁
        let owned = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            == Some(self.pid);
        if owned && let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "释放实例锁失败: {}", e);
        }
    }
}

fn is_stale(path: &Path, max_age: Duration) -> bool {
    let expired = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age > max_age);
    if expired {
        return true;
    }

    match std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
    {
        Some(pid) => !pid_alive(pid),
        None => true,
    }
}

fn pid_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.is_dir() {
        // 无 procfs 时只能依赖锁文件年龄判断
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CYCLE: Duration = Duration::from_secs(600);

    #[test]
    fn second_acquire_is_refused_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let first = InstanceLock::acquire(dir.path(), 1, CYCLE).unwrap();
        assert!(first.is_some());
        assert!(InstanceLock::acquire(dir.path(), 1, CYCLE).unwrap().is_none());
        // 其他实例不受影响
        assert!(InstanceLock::acquire(dir.path(), 2, CYCLE).unwrap().is_some());
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let lock = InstanceLock::acquire(dir.path(), 3, CYCLE).unwrap().unwrap();
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
        assert!(InstanceLock::acquire(dir.path(), 3, CYCLE).unwrap().is_some());
    }

    #[test]
    fn unreadable_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("collector_instance_1.lock"), "garbage").unwrap();
        let lock = InstanceLock::acquire(dir.path(), 1, CYCLE).unwrap();
        assert!(lock.is_some());
        let content = std::fs::read_to_string(dir.path().join("collector_instance_1.lock")).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn expired_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        // 当前进程必然存活，只有超龄才能判定为过期
        std::fs::write(
            dir.path().join("collector_instance_1.lock"),
            std::process::id().to_string(),
        )
        .unwrap();
        assert!(InstanceLock::acquire(dir.path(), 1, CYCLE).unwrap().is_none());
        std::thread::sleep(Duration::from_millis(20));
        assert!(InstanceLock::acquire(dir.path(), 1, Duration::from_millis(1)).unwrap().is_some());
    }
}
