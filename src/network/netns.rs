//! Network namespace plumbing.
//!
//! Namespace switches happen on dedicated OS threads: `setns` changes the
//! calling thread only, and tokio must never observe a worker thread in a
//! foreign namespace. The original namespace is restored on every exit path
//! even though the thread terminates right after.

use crate::core::error::{DriverError, Result};
use nix::mount::{mount, umount, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use std::fs::File;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

/// Where named namespaces are bind-mounted, the place `ip netns` looks.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

fn open_self_netns() -> Result<File> {
    File::open("/proc/self/ns/net").map_err(DriverError::Io)
}

/// Run `body` on a fresh OS thread inside the namespace at `path`, blocking
/// until it finishes.
pub fn with_namespace<T, F>(path: PathBuf, body: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = std::thread::spawn(move || -> Result<T> {
        let original = open_self_netns()?;
        let target = File::open(&path).map_err(|err| {
            DriverError::external("netns", format!("open {}: {err}", path.display()))
        })?;
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|err| DriverError::external("netns", format!("setns: {err}")))?;

        let result = body();

        if let Err(err) = setns(original.as_fd(), CloneFlags::CLONE_NEWNET) {
            tracing::warn!(error = %err, "failed to restore original namespace");
        }
        result
    });

    handle
        .join()
        .map_err(|_| DriverError::external("netns", "namespace thread panicked"))?
}

/// Async wrapper around [`with_namespace`].
pub async fn with_namespace_async<T, F>(path: PathBuf, body: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || with_namespace(path, body))
        .await
        .map_err(|err| DriverError::external("netns", err.to_string()))?
}

/// Path of a named namespace.
pub fn named_path(name: &str) -> PathBuf {
    Path::new(NETNS_RUN_DIR).join(name)
}

/// Create a named network namespace, visible to `ip netns`. Creating a name
/// that already exists succeeds.
pub fn create_named(name: &str) -> Result<()> {
    let path = named_path(name);
    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(NETNS_RUN_DIR)?;
    std::fs::File::create(&path)?;

    let path_clone = path.clone();
    let handle = std::thread::spawn(move || -> Result<()> {
        let original = open_self_netns()?;
        unshare(CloneFlags::CLONE_NEWNET)
            .map_err(|err| DriverError::external("netns", format!("unshare: {err}")))?;
        let mount_result = mount(
            Some("/proc/self/ns/net"),
            &path_clone,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|err| DriverError::external("netns", format!("bind mount: {err}")));

        if let Err(err) = setns(original.as_fd(), CloneFlags::CLONE_NEWNET) {
            tracing::warn!(error = %err, "failed to restore original namespace");
        }
        mount_result
    });

    let result = handle
        .join()
        .map_err(|_| DriverError::external("netns", "namespace thread panicked"))?;
    if result.is_err() {
        let _ = std::fs::remove_file(&path);
    }
    result
}

/// Unmount and remove a named namespace. Missing names succeed.
pub fn delete_named(name: &str) -> Result<()> {
    let path = named_path(name);
    if !path.exists() {
        return Ok(());
    }
    if let Err(err) = umount(&path) {
        tracing::debug!(name, error = %err, "netns umount failed");
    }
    std::fs::remove_file(&path)?;
    Ok(())
}

/// Names of all currently mounted named namespaces.
pub fn list_named() -> Result<Vec<String>> {
    let dir = match std::fs::read_dir(NETNS_RUN_DIR) {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut names = Vec::new();
    for entry in dir {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}
