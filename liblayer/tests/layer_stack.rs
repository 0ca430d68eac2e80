use std::fs;
use std::path::Path;
use std::sync::Once;

use liblayer::fake::RecordingRunner;
use liblayer::{CommandRunner, LayerError, LayerLayout, LayerManager, LayerState};
use tempfile::tempdir;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .is_test(true)
            .try_init();
    });
}

fn new_manager(tmp: &Path, runner: &RecordingRunner) -> LayerManager<RecordingRunner> {
    let layout = LayerLayout::new(tmp.join("data"), tmp.join("image"));
    LayerManager::new(runner.clone(), layout, tmp.join("rootfs"))
}

fn path_str(p: impl AsRef<Path>) -> String {
    p.as_ref().to_string_lossy().into_owned()
}

#[test]
fn test_create_layer_levels_increase_by_one() {
    init_logging();
    let tmp = tempdir().unwrap();
    let runner = RecordingRunner::new();
    let mut mgr = new_manager(tmp.path(), &runner);

    let mut last = mgr.init().unwrap();
    mgr.bind_root().unwrap();
    for _ in 0..6 {
        let level = mgr.create_layer().unwrap();
        assert_eq!(level, last + 1);
        last = level;

        let root = path_str(mgr.root_dir());
        assert_eq!(
            runner.source_of(&root),
            Some(path_str(mgr.layout().merged(level)))
        );
    }
    assert_eq!(
        mgr.state(),
        LayerState::Bound {
            root_layer: 0,
            level: 7
        }
    );
    assert_eq!(mgr.layout().discover().unwrap(), (1..=7).collect::<Vec<_>>());
}

#[test]
fn test_create_layer_binds_root_when_only_initialized() {
    init_logging();
    let tmp = tempdir().unwrap();
    let runner = RecordingRunner::new();
    let mut mgr = new_manager(tmp.path(), &runner);
    mgr.init().unwrap();

    assert_eq!(mgr.create_layer().unwrap(), 2);
    let root = path_str(mgr.root_dir());
    assert_eq!(runner.source_of(&root), Some(path_str(mgr.layout().merged(2))));
    // nothing was bound before, so nothing was unmounted
    assert!(runner.calls_to("umount").is_empty());
}

#[test]
fn test_double_init_on_empty_root_yields_level_one_once() {
    init_logging();
    let tmp = tempdir().unwrap();
    let runner = RecordingRunner::new();
    let mut mgr = new_manager(tmp.path(), &runner);

    assert_eq!(mgr.init().unwrap(), 1);
    assert_eq!(mgr.init().unwrap(), 1);
    assert_eq!(mgr.layout().discover().unwrap(), vec![1]);
    assert_eq!(runner.calls_to("mount").len(), 1);
}

#[test]
fn test_reinit_counts_existing_layers() {
    init_logging();
    let tmp = tempdir().unwrap();
    let runner = RecordingRunner::new();

    let mut first = new_manager(tmp.path(), &runner);
    first.init().unwrap();
    first.bind_root().unwrap();
    first.create_layer().unwrap();
    drop(first);

    // a restarted agent rediscovers both levels
    let mut second = new_manager(tmp.path(), &runner);
    assert_eq!(second.init().unwrap(), 3);
    assert_eq!(second.root_layer(), Some(2));

    let data = tmp.path().join("data");
    let expected = format!(
        "lowerdir={}:{}:{}",
        path_str(data.join("u2")),
        path_str(data.join("u1")),
        path_str(tmp.path().join("image"))
    );
    let last_mount = runner.calls_to("mount").pop().unwrap();
    assert!(last_mount.contains(&expected), "{last_mount}");
}

#[test]
fn test_lowerdir_order_ignores_listing_order() {
    init_logging();
    let tmp = tempdir().unwrap();
    let data = tmp.path().join("data");
    // created out of order so directory listing order is not level order
    for level in [3, 11, 1, 7, 2, 10, 5, 4, 9, 6, 8] {
        fs::create_dir_all(data.join(format!("u{level}"))).unwrap();
    }
    let runner = RecordingRunner::new();
    let mut mgr = new_manager(tmp.path(), &runner);
    assert_eq!(mgr.init().unwrap(), 12);

    let lowers: Vec<String> = (1..=11)
        .rev()
        .map(|l| path_str(data.join(format!("u{l}"))))
        .chain(std::iter::once(path_str(tmp.path().join("image"))))
        .collect();
    let mount = runner.calls_to("mount").pop().unwrap();
    assert!(
        mount.contains(&format!("lowerdir={},", lowers.join(":"))),
        "{mount}"
    );
}

#[test]
fn test_export_then_import_on_another_root() {
    init_logging();
    let origin_tmp = tempdir().unwrap();
    let runner = RecordingRunner::new();
    let mut origin = new_manager(origin_tmp.path(), &runner);
    origin.init().unwrap();
    origin.bind_root().unwrap();
    fs::write(origin.layout().upper(1).join("state"), b"counter=41").unwrap();
    let frozen = origin.create_layer().unwrap() - 1;

    let archive = origin.layout().archive(frozen);
    origin.export_layer(frozen, &archive).unwrap();

    let dest_tmp = tempdir().unwrap();
    let dest_runner = RecordingRunner::new();
    let mut dest = new_manager(dest_tmp.path(), &dest_runner);
    dest.import_layer(1, &archive).unwrap();
    assert_eq!(dest.init().unwrap(), 2);
    assert_eq!(
        fs::read(dest.layout().upper(1).join("state")).unwrap(),
        b"counter=41"
    );
}

fn captured_manager(tmp: &Path, runner: &RecordingRunner) -> LayerManager<RecordingRunner> {
    let layout = LayerLayout::new(tmp.join("data"), tmp.join("data/base"));
    LayerManager::new(runner.clone(), layout, tmp.join("rootfs"))
}

#[test]
fn test_captured_base_keeps_root_out_of_lowerdir() {
    init_logging();
    let tmp = tempdir().unwrap();
    let runner = RecordingRunner::new();
    let mut mgr = captured_manager(tmp.path(), &runner);
    let root = path_str(mgr.root_dir());
    let base = path_str(mgr.layout().base());

    assert!(mgr.capture_base().unwrap());
    assert_eq!(runner.source_of(&base), Some(root.clone()));
    assert!(
        runner
            .calls_to("mount")
            .contains(&format!("mount --make-private {base}"))
    );

    mgr.init().unwrap();
    mgr.bind_root().unwrap();
    for _ in 0..3 {
        mgr.create_layer().unwrap();
    }
    let overlays: Vec<String> = runner
        .calls_to("mount")
        .into_iter()
        .filter(|c| c.contains("-t overlay"))
        .collect();
    assert_eq!(overlays.len(), 4);
    for mount in &overlays {
        let lowest_is_base = mount.contains(&format!(":{base},upperdir="))
            || mount.contains(&format!("lowerdir={base},"));
        assert!(lowest_is_base, "{mount}");
        assert!(!mount.contains(&root), "{mount}");
    }
    // the base still shows the image after the root was rebound
    assert_eq!(runner.source_of(&base), Some(root));

    // a later incarnation on the same node finds the base already captured
    let again = captured_manager(tmp.path(), &runner);
    assert!(!again.capture_base().unwrap());
}

#[test]
fn test_base_equal_to_root_is_rejected() {
    init_logging();
    let tmp = tempdir().unwrap();
    let layout = LayerLayout::new(tmp.path().join("data"), tmp.path().join("rootfs"));
    let mut mgr = LayerManager::new(
        RecordingRunner::new(),
        layout,
        tmp.path().join("rootfs"),
    );
    assert!(matches!(mgr.capture_base(), Err(LayerError::BaseIsRoot(_))));
    assert!(matches!(mgr.init(), Err(LayerError::BaseIsRoot(_))));
    assert_eq!(mgr.state(), LayerState::Uninitialized);
}

#[test]
fn test_clear_levels_removes_stale_stack() {
    init_logging();
    let tmp = tempdir().unwrap();
    let runner = RecordingRunner::new();
    let mgr = new_manager(tmp.path(), &runner);
    for level in 1..=3 {
        fs::create_dir_all(mgr.layout().upper(level)).unwrap();
        fs::create_dir_all(mgr.layout().work(level)).unwrap();
        fs::create_dir_all(mgr.layout().merged(level)).unwrap();
        fs::write(mgr.layout().upper(level).join("stale"), b"old").unwrap();
    }
    let incoming = mgr.layout().root().join("incoming");
    fs::create_dir_all(&incoming).unwrap();
    let m3 = path_str(mgr.layout().merged(3));
    runner
        .run("mount", &["-t", "overlay", "overlay", "-o", "x", &m3])
        .unwrap();

    assert_eq!(mgr.clear_levels().unwrap(), vec![1, 2, 3]);
    assert!(mgr.layout().discover().unwrap().is_empty());
    assert!(!mgr.layout().merged(3).exists());
    assert!(!runner.is_mounted(&m3));
    assert!(incoming.is_dir());
    assert!(mgr.clear_levels().unwrap().is_empty());
}

#[test]
fn test_import_refuses_existing_level() {
    init_logging();
    let tmp = tempdir().unwrap();
    let mgr = new_manager(tmp.path(), &RecordingRunner::new());
    fs::create_dir_all(mgr.layout().upper(1)).unwrap();
    let err = mgr
        .import_layer(1, &tmp.path().join("layer-1.tar"))
        .unwrap_err();
    assert!(matches!(err, LayerError::LevelExists(1)), "{err:?}");
}
