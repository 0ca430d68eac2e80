use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::iter;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::archive;
use crate::command::CommandRunner;
use crate::error::{LayerError, io_err};
use crate::flatten;

/// Directory naming for one container's layer stack.
///
/// Level `N` owns `u<N>` (upper), `w<N>` (overlay work dir) and `m<N>`
/// (merged mount target) under the layer root. Everything below level 1
/// comes from `base`, the container image root. The base must never be the
/// path the stack is bound onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerLayout {
    root: PathBuf,
    base: PathBuf,
}

impl LayerLayout {
    pub fn new(root: impl Into<PathBuf>, base: impl Into<PathBuf>) -> Self {
        LayerLayout {
            root: root.into(),
            base: base.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn upper(&self, level: u32) -> PathBuf {
        self.root.join(format!("u{level}"))
    }

    pub fn work(&self, level: u32) -> PathBuf {
        self.root.join(format!("w{level}"))
    }

    pub fn merged(&self, level: u32) -> PathBuf {
        self.root.join(format!("m{level}"))
    }

    /// Where the changeset archive of `level` is written before a transfer.
    pub fn archive(&self, level: u32) -> PathBuf {
        self.root.join(format!("layer-{level}.tar"))
    }

    /// Levels present on disk, in ascending numeric order.
    ///
    /// Directory listing order is ignored; levels must form `1..=K`.
    pub fn discover(&self) -> Result<Vec<u32>, LayerError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root)(e)),
        };

        let mut levels = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.root))?;
            let Some(level) = entry
                .file_name()
                .to_str()
                .and_then(|name| parse_level_name(name, 'u'))
            else {
                continue;
            };
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                levels.push(level);
            }
        }
        levels.sort_unstable();

        for (i, level) in levels.iter().enumerate() {
            let expected = i as u32 + 1;
            if *level != expected {
                return Err(LayerError::Gap(expected));
            }
        }
        Ok(levels)
    }

    /// Lower directories of `level`, most recent first, ending with the base.
    pub fn lower_dirs(&self, level: u32) -> Vec<PathBuf> {
        (1..level)
            .rev()
            .map(|l| self.upper(l))
            .chain(iter::once(self.base.clone()))
            .collect()
    }

    pub fn overlay_options(&self, level: u32) -> String {
        let lowers = self
            .lower_dirs(level)
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers,
            self.upper(level).display(),
            self.work(level).display()
        )
    }
}

/// Level number of a `u<N>`, `w<N>` or `m<N>` directory name, by `prefix`.
fn parse_level_name(name: &str, prefix: char) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Uninitialized,
    /// The top level is mounted but the container root is not bound to it yet.
    Initialized { root_layer: u32, level: u32 },
    /// The container root is bound to the merged view of `level`.
    Bound { root_layer: u32, level: u32 },
}

/// Owns the union-mount stack of one container root.
///
/// All mutating operations take `&mut self`: there is exactly one writer per
/// container root.
pub struct LayerManager<R> {
    runner: R,
    layout: LayerLayout,
    root_dir: PathBuf,
    state: LayerState,
}

impl<R: CommandRunner> LayerManager<R> {
    pub fn new(runner: R, layout: LayerLayout, root_dir: impl Into<PathBuf>) -> Self {
        LayerManager {
            runner,
            layout,
            root_dir: root_dir.into(),
            state: LayerState::Uninitialized,
        }
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn level(&self) -> Option<u32> {
        match self.state {
            LayerState::Uninitialized => None,
            LayerState::Initialized { level, .. } | LayerState::Bound { level, .. } => Some(level),
        }
    }

    pub fn root_layer(&self) -> Option<u32> {
        match self.state {
            LayerState::Uninitialized => None,
            LayerState::Initialized { root_layer, .. } | LayerState::Bound { root_layer, .. } => {
                Some(root_layer)
            }
        }
    }

    pub fn layout(&self) -> &LayerLayout {
        &self.layout
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Pin what the container root shows right now as the base of the stack.
    ///
    /// Bind-mounts the root onto the layout's base and makes that mount
    /// private, so later binds over the root never show through the base.
    /// Returns false when the base is already a mount point, which is the
    /// case when an earlier incarnation on this node captured it.
    pub fn capture_base(&self) -> Result<bool, LayerError> {
        if self.state != LayerState::Uninitialized {
            return Err(LayerError::InvalidState {
                op: "capture the base",
                state: self.state,
            });
        }
        let base = self.layout.base();
        if base == self.root_dir {
            return Err(LayerError::BaseIsRoot(base.to_path_buf()));
        }
        if self.is_mounted(base)? {
            info!("[layer] base {} already captured", base.display());
            return Ok(false);
        }

        fs::create_dir_all(base).map_err(io_err(base))?;
        let source = self.root_dir.to_string_lossy();
        let target = base.to_string_lossy();
        let captured = |source: crate::command::CommandError| LayerError::CaptureBase {
            path: base.to_path_buf(),
            source,
        };
        self.runner
            .run("mount", &["--bind", &source, &target])
            .map_err(captured)?;
        if let Err(e) = self.runner.run("mount", &["--make-private", &target]) {
            let _ = self.unmount(base);
            return Err(captured(e));
        }
        info!(
            "[layer] captured {} as base {}",
            self.root_dir.display(),
            base.display()
        );
        Ok(true)
    }

    /// Remove every `u/w/m` level directory under the layer root, unmounting
    /// leftover merged views first. Only valid before `init`.
    ///
    /// Returns the levels that were removed.
    pub fn clear_levels(&self) -> Result<Vec<u32>, LayerError> {
        if self.state != LayerState::Uninitialized {
            return Err(LayerError::InvalidState {
                op: "clear levels",
                state: self.state,
            });
        }
        let root = self.layout.root();
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(root)(e)),
        };
        let mut levels = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(io_err(root))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(level) = ['u', 'w', 'm']
                .into_iter()
                .find_map(|prefix| parse_level_name(name, prefix))
            {
                levels.insert(level);
            }
        }

        for &level in &levels {
            let merged = self.layout.merged(level);
            if merged.is_dir() && self.is_mounted(&merged)? {
                self.unmount(&merged)?;
            }
            self.remove_level_dirs(level)?;
        }
        if !levels.is_empty() {
            warn!(
                "[layer] removed {} stale levels from {}",
                levels.len(),
                root.display()
            );
        }
        Ok(levels.into_iter().collect())
    }

    /// Mount a fresh writable level above every level found on disk.
    ///
    /// The container root is left alone; see [`Self::bind_root`]. A second
    /// call on an initialized manager returns the current level unchanged.
    pub fn init(&mut self) -> Result<u32, LayerError> {
        if let Some(level) = self.level() {
            debug!("[layer] already initialized at level {level}");
            return Ok(level);
        }
        if self.layout.base() == self.root_dir {
            return Err(LayerError::BaseIsRoot(self.root_dir.clone()));
        }
        info!("[layer] init overlay over {}", self.root_dir.display());

        let root_layer = self.layout.discover()?.len() as u32;
        let level = root_layer + 1;
        info!(
            "[layer] found {root_layer} existing layers, new level {level} over {}",
            self.root_dir.display()
        );

        self.prepare_level(level)?;
        if let Err(e) = self.mount_level(level) {
            self.discard_level(level);
            return Err(e);
        }
        self.state = LayerState::Initialized { root_layer, level };
        Ok(level)
    }

    /// Bind the container root to the merged view of the current level.
    pub fn bind_root(&mut self) -> Result<u32, LayerError> {
        match self.state {
            LayerState::Uninitialized => Err(LayerError::InvalidState {
                op: "bind the container root",
                state: self.state,
            }),
            LayerState::Bound { level, .. } => Ok(level),
            LayerState::Initialized { root_layer, level } => {
                self.bind(level)?;
                self.state = LayerState::Bound { root_layer, level };
                Ok(level)
            }
        }
    }

    /// Append one level and move the container root onto it.
    ///
    /// The old root bind is only torn down once the new overlay is verified
    /// as mounted; on any failure the previous level stays current.
    pub fn create_layer(&mut self) -> Result<u32, LayerError> {
        let (root_layer, level, bound) = match self.state {
            LayerState::Uninitialized => {
                return Err(LayerError::InvalidState {
                    op: "create a layer",
                    state: self.state,
                });
            }
            LayerState::Initialized { root_layer, level } => (root_layer, level, false),
            LayerState::Bound { root_layer, level } => (root_layer, level, true),
        };
        let next = level + 1;
        info!(
            "[layer] creating layer at level {next} over {}",
            self.root_dir.display()
        );

        let found = self.layout.discover()?.len() as u32;
        if found != level {
            return Err(LayerError::OutOfSync {
                expected: level,
                found,
            });
        }

        self.prepare_level(next)?;
        if let Err(e) = self.mount_level(next) {
            error!("[layer] level {next} not mounted, keeping level {level}: {e}");
            self.discard_level(next);
            return Err(e);
        }

        if bound {
            if let Err(e) = self.unmount(&self.root_dir) {
                self.discard_level(next);
                return Err(e);
            }
        }

        if let Err(e) = self.bind(next) {
            if bound {
                if let Err(rebind) = self.bind(level) {
                    error!("[layer] failed to restore root onto level {level}: {rebind}");
                }
            }
            self.discard_level(next);
            return Err(e);
        }

        self.state = LayerState::Bound {
            root_layer,
            level: next,
        };
        Ok(next)
    }

    /// Flatten every level above the root layer into a single upper directory.
    ///
    /// The container must be quiescent: the root bind and the intermediate
    /// mounts are removed while the upper directories are merged. On error
    /// the manager returns to `Uninitialized` and must be re-initialized.
    pub fn finish(&mut self) -> Result<u32, LayerError> {
        let (root_layer, level) = match self.state {
            LayerState::Bound { root_layer, level } => (root_layer, level),
            state => {
                return Err(LayerError::InvalidState {
                    op: "finish",
                    state,
                });
            }
        };
        info!(
            "[layer] finish overlay with levels {}..={level} from {}",
            root_layer + 1,
            self.root_dir.display()
        );

        let first = root_layer + 1;
        if level == first {
            return Ok(level);
        }

        match self.flatten_levels(first, level) {
            Ok(()) => {
                self.state = LayerState::Bound {
                    root_layer,
                    level: first,
                };
                Ok(first)
            }
            Err(e) => {
                error!("[layer] flatten failed, stack needs re-init: {e}");
                self.state = LayerState::Uninitialized;
                Err(e)
            }
        }
    }

    fn flatten_levels(&mut self, first: u32, last: u32) -> Result<(), LayerError> {
        self.unmount(&self.root_dir)?;
        for level in (first..=last).rev() {
            self.unmount(&self.layout.merged(level))?;
        }

        let target = self.layout.upper(first);
        for level in first + 1..=last {
            let upper = self.layout.upper(level);
            flatten::merge_upper(&upper, &target).map_err(io_err(&upper))?;
            self.remove_level_dirs(level)?;
        }

        let work = self.layout.work(first);
        fs::remove_dir_all(&work).map_err(io_err(&work))?;
        fs::create_dir_all(&work).map_err(io_err(&work))?;

        self.mount_level(first)?;
        self.bind(first)
    }

    /// Pack the upper directory of `level` into `dest`, returning the archive size.
    pub fn export_layer(&self, level: u32, dest: &Path) -> Result<u64, LayerError> {
        let upper = self.layout.upper(level);
        if level == 0 || !upper.is_dir() {
            return Err(LayerError::UnknownLevel(level));
        }
        archive::pack_dir(&upper, dest)
    }

    /// Unpack a received changeset as `level`. Only valid before `init`, and
    /// only into a level that does not exist yet.
    pub fn import_layer(&self, level: u32, src: &Path) -> Result<(), LayerError> {
        if self.state != LayerState::Uninitialized {
            return Err(LayerError::InvalidState {
                op: "import a layer",
                state: self.state,
            });
        }
        if level == 0 {
            return Err(LayerError::UnknownLevel(level));
        }
        let upper = self.layout.upper(level);
        if upper.exists() {
            return Err(LayerError::LevelExists(level));
        }
        archive::unpack_into(src, &upper)
    }

    fn prepare_level(&self, level: u32) -> Result<(), LayerError> {
        let dirs = [
            self.layout.base().to_path_buf(),
            self.layout.upper(level),
            self.layout.work(level),
            self.layout.merged(level),
        ];
        for dir in dirs.iter() {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        Ok(())
    }

    fn mount_level(&self, level: u32) -> Result<(), LayerError> {
        let merged = self.layout.merged(level);
        let options = self.layout.overlay_options(level);
        let target = merged.to_string_lossy();
        self.runner
            .run(
                "mount",
                &["-t", "overlay", "overlay", "-o", &options, &target],
            )
            .map_err(|source| LayerError::Mount { level, source })?;

        if let Err(e) = self.verify_mounted(&merged) {
            let _ = self.unmount(&merged);
            return Err(e);
        }
        Ok(())
    }

    fn verify_mounted(&self, path: &Path) -> Result<(), LayerError> {
        let target = path.to_string_lossy();
        match self.runner.run("mountpoint", &["-q", &target]) {
            Ok(_) => Ok(()),
            Err(crate::command::CommandError::Failed { .. }) => {
                Err(LayerError::NotMounted(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_mounted(&self, path: &Path) -> Result<bool, LayerError> {
        match self.verify_mounted(path) {
            Ok(()) => Ok(true),
            Err(LayerError::NotMounted(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn bind(&self, level: u32) -> Result<(), LayerError> {
        fs::create_dir_all(&self.root_dir).map_err(io_err(&self.root_dir))?;
        let merged = self.layout.merged(level);
        let source = merged.to_string_lossy();
        let target = self.root_dir.to_string_lossy();
        self.runner
            .run("mount", &["--bind", &source, &target])
            .map_err(|source| LayerError::Mount { level, source })?;
        Ok(())
    }

    fn unmount(&self, path: &Path) -> Result<(), LayerError> {
        let target = path.to_string_lossy();
        match self.runner.run("umount", &["-l", &target]) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_mounted() => {
                warn!("[layer] {} was not mounted", path.display());
                Ok(())
            }
            Err(source) => Err(LayerError::Unmount {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn remove_level_dirs(&self, level: u32) -> Result<(), LayerError> {
        for dir in [
            self.layout.upper(level),
            self.layout.work(level),
            self.layout.merged(level),
        ] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&dir)(e)),
            }
        }
        Ok(())
    }

    /// Best-effort removal of a level that never became current.
    fn discard_level(&self, level: u32) {
        let merged = self.layout.merged(level);
        let target = merged.to_string_lossy();
        let _ = self.runner.run("umount", &["-l", &target]);
        if let Err(e) = self.remove_level_dirs(level) {
            warn!("[layer] failed to clean up level {level}: {e}");
        }
    }
}
