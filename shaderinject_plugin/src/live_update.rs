//! Recreate tracked pipelines when replacement files change on disk.

use std::{
    collections::hash_map::DefaultHasher,
    fs,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    d3d::PipelineDevice,
    debug_markers,
    intercept::{patch_stream, Tracking},
    replacement::ReplacementPolicy,
};

pub struct LiveUpdater {
    tracking: Arc<Mutex<Tracking>>,
    policy: Arc<dyn ReplacementPolicy>,
    device: Arc<dyn PipelineDevice>,
    insert_debug_markers: bool,
}

impl LiveUpdater {
    pub fn new(
        tracking: Arc<Mutex<Tracking>>,
        policy: Arc<dyn ReplacementPolicy>,
        device: Arc<dyn PipelineDevice>,
        insert_debug_markers: bool,
    ) -> Self {
        Self {
            tracking,
            policy,
            device,
            insert_debug_markers,
        }
    }

    /// Re-apply replacements to every tracked pipeline and swap in a new pipeline state
    /// for each one that changed. Returns how many were swapped.
    ///
    /// Replaced pipeline states are leaked since the renderer may still be using them.
    pub fn apply(&self) -> usize {
        let mut tracking = self.tracking.lock();
        let mut updated = 0;

        for entry in &mut tracking.pipelines {
            let technique = entry.technique.get();
            let name = technique.name();

            match patch_stream(
                &mut entry.copy,
                self.device.as_ref(),
                None,
                self.policy.as_ref(),
                &name,
                technique.id,
            ) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!("Live update: {e}. Shader technique: {:X}.", technique.id);
                    continue;
                }
            }

            let pipeline = match self.device.create_pipeline_state(entry.copy.desc()) {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    tracing::error!(
                        "Live update: Failed to compile pipeline: {:X}. Shader technique: {:X}.",
                        e.hresult().0 as u32,
                        technique.id
                    );
                    continue;
                }
            };
            if self.insert_debug_markers {
                debug_markers::set_object_name(pipeline.as_raw(), &name);
            }
            technique
                .pipeline_state
                .swap(pipeline.into_raw(), Ordering::Relaxed);
            updated += 1;
        }

        if updated > 0 {
            tracing::info!("Live update: Created pipelines for {updated} technique(s).");
        }
        updated
    }
}

pub trait ChangeWatcher {
    /// Block until something under the watched directory changes. Returns `false` when
    /// watching is no longer possible.
    fn wait(&mut self) -> bool;
}

/// Watches by comparing the names, sizes and modification times of every file.
pub struct PollingWatcher {
    root: PathBuf,
    interval: Duration,
    fingerprint: u64,
}

impl PollingWatcher {
    pub fn new(root: impl Into<PathBuf>, interval: Duration) -> Self {
        let root = root.into();
        let fingerprint = Self::fingerprint(&root);
        Self {
            root,
            interval,
            fingerprint,
        }
    }

    /// Whether anything changed since the last call.
    pub fn poll(&mut self) -> bool {
        let fingerprint = Self::fingerprint(&self.root);
        let changed = fingerprint != self.fingerprint;
        self.fingerprint = fingerprint;
        changed
    }

    fn fingerprint(root: &Path) -> u64 {
        fn visit(dir: &Path, files: &mut Vec<(PathBuf, u64, Option<std::time::SystemTime>)>) {
            let Ok(entries) = fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.is_dir() {
                    visit(&entry.path(), files);
                } else {
                    files.push((entry.path(), meta.len(), meta.modified().ok()));
                }
            }
        }

        let mut files = vec![];
        visit(root, &mut files);
        files.sort();
        let mut hasher = DefaultHasher::new();
        files.hash(&mut hasher);
        hasher.finish()
    }
}

impl ChangeWatcher for PollingWatcher {
    fn wait(&mut self) -> bool {
        loop {
            thread::sleep(self.interval);
            if self.poll() {
                return true;
            }
        }
    }
}

#[cfg(windows)]
mod notification {
    use std::path::Path;

    use anyhow::Result;
    use windows::{
        core::HSTRING,
        Win32::{
            Foundation::{HANDLE, WAIT_OBJECT_0},
            Storage::FileSystem::{
                FindCloseChangeNotification, FindFirstChangeNotificationW,
                FindNextChangeNotification, FILE_NOTIFY_CHANGE_LAST_WRITE,
            },
            System::Threading::{WaitForSingleObject, INFINITE},
        },
    };

    use super::ChangeWatcher;

    /// Directory change notifications for writes anywhere under a directory.
    pub struct NotificationWatcher {
        handle: HANDLE,
        armed: bool,
    }

    impl NotificationWatcher {
        pub fn new(root: &Path) -> Result<Self> {
            let handle = unsafe {
                FindFirstChangeNotificationW(
                    &HSTRING::from(root.as_os_str()),
                    true,
                    FILE_NOTIFY_CHANGE_LAST_WRITE,
                )
            }?;
            Ok(Self {
                handle,
                armed: true,
            })
        }
    }

    impl ChangeWatcher for NotificationWatcher {
        fn wait(&mut self) -> bool {
            if !self.armed {
                if let Err(e) = unsafe { FindNextChangeNotification(self.handle) } {
                    tracing::error!("Live update: {e}");
                    return false;
                }
                self.armed = true;
            }
            if unsafe { WaitForSingleObject(self.handle, INFINITE) } != WAIT_OBJECT_0 {
                return false;
            }
            self.armed = false;
            true
        }
    }

    impl Drop for NotificationWatcher {
        fn drop(&mut self) {
            let _ = unsafe { FindCloseChangeNotification(self.handle) };
        }
    }
}

#[cfg(windows)]
fn open_watcher(root: &Path) -> anyhow::Result<Box<dyn ChangeWatcher>> {
    Ok(Box::new(notification::NotificationWatcher::new(root)?))
}

#[cfg(not(windows))]
fn open_watcher(root: &Path) -> anyhow::Result<Box<dyn ChangeWatcher>> {
    Ok(Box::new(PollingWatcher::new(root, Duration::from_millis(500))))
}

/// Apply updates every time `watcher` reports a change.
pub fn run(updater: &LiveUpdater, watcher: &mut dyn ChangeWatcher) {
    while watcher.wait() {
        updater.apply();
    }
}

/// Start the background thread that watches the replacement directory.
pub fn spawn(updater: LiveUpdater) {
    let Some(root) = updater.policy.watch_root().map(Path::to_path_buf) else {
        tracing::warn!("Live update: no directory to watch");
        return;
    };
    let result = thread::Builder::new()
        .name("shaderinject-live-update".into())
        .spawn(move || {
            let mut watcher = match open_watcher(&root) {
                Ok(watcher) => watcher,
                Err(e) => {
                    tracing::error!("Live update: failed to watch {}: {e}", root.display());
                    return;
                }
            };
            tracing::info!("Live update: Initialized.");
            run(&updater, watcher.as_mut());
        });
    if let Err(e) = result {
        tracing::error!("Live update: failed to start watcher thread: {e}");
    }
}
