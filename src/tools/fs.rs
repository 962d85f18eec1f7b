//! Atomic file replacement and advisory locking.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Error};
use nix::fcntl::{flock, FlockArg};
use nix::sys::stat;
use nix::unistd;

/// Write `data` to `path` atomically: mkstemp sibling, write, fsync, rename.
///
/// mkstemp is used so concurrent processes, threads and tokio tasks never
/// collide on the temporary name. The fsync before the rename guarantees the
/// content is durable before it becomes visible under the final name.
pub fn file_set_contents<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };
    let tmp_path = tmp_path.as_path();

    let mode = stat::Mode::S_IRUSR
        | stat::Mode::S_IWUSR
        | stat::Mode::S_IRGRP
        | stat::Mode::S_IROTH;
    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(tmp_path);
        bail!("fchmod {:?} failed: {}", tmp_path, err);
    }

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        bail!("write to {:?} failed: {}", tmp_path, err);
    }

    if let Err(err) = unistd::fsync(file.as_raw_fd()) {
        let _ = unistd::unlink(tmp_path);
        bail!("fsync {:?} failed: {}", tmp_path, err);
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        bail!("atomic rename to {:?} failed: {}", path, err);
    }

    Ok(())
}

/// Acquire an exclusive advisory lock on `filename`, waiting up to `timeout`.
///
/// The returned handle holds the lock until dropped; the kernel releases it
/// if the holder dies, so a held lock always means a live holder.
pub fn lock_file<P: AsRef<Path>>(filename: P, timeout: Duration) -> Result<File, Error> {
    let path = filename.as_ref();
    let lockfile = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(err) => bail!("unable to open lock {:?} - {}", path, err),
    };

    let fd = lockfile.as_raw_fd();

    let started = std::time::Instant::now();
    loop {
        match flock(fd, FlockArg::LockExclusiveNonblock) {
            Ok(_) => break,
            Err(_) => {
                if started.elapsed() >= timeout {
                    bail!("unable to acquire lock {:?} - got timeout", path);
                }
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    Ok(lockfile)
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("mongo-reindex-fs-test-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn atomic_write_replaces() -> Result<(), Error> {
        let path = scratch_path("replace.json");
        file_set_contents(&path, b"first")?;
        file_set_contents(&path, b"second")?;
        assert_eq!(std::fs::read(&path)?, b"second");
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn second_lock_times_out() -> Result<(), Error> {
        let path = scratch_path("lockfile");
        let _held = lock_file(&path, Duration::from_millis(100))?;
        assert!(lock_file(&path, Duration::from_millis(100)).is_err());
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
