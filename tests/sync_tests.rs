//! File sync integration tests: staging trees, symlinks, case fallback

use std::fs;

use tempfile::TempDir;

use taskmill::config::PathMapRule;
use taskmill::sync::{FileSync, PathMapper};
use taskmill::task::{FileMap, OutputTarget, TaskSpec};

#[test]
fn directory_input_stages_recursively() {
    let dir = TempDir::new().unwrap();
    let tree = dir.path().join("tree");
    fs::create_dir_all(tree.join("nested")).unwrap();
    fs::write(tree.join("top.txt"), "top").unwrap();
    fs::write(tree.join("nested/deep.txt"), "deep").unwrap();

    let mut task = TaskSpec::from_command("ls tree");
    task.inputs.push(tree.clone());

    let host = dir.path().join("host");
    let sync = FileSync::new(PathMapper::new(vec![], &host));
    sync.stage(&task).unwrap();

    let staged = sync.mapper().map(&tree);
    assert_eq!(fs::read_to_string(staged.join("top.txt")).unwrap(), "top");
    assert_eq!(
        fs::read_to_string(staged.join("nested/deep.txt")).unwrap(),
        "deep"
    );
}

#[cfg(unix)]
#[test]
fn symlink_inside_staged_directory_survives() {
    let dir = TempDir::new().unwrap();
    let tree = dir.path().join("tree");
    fs::create_dir_all(&tree).unwrap();
    fs::write(tree.join("real.txt"), "payload").unwrap();
    std::os::unix::fs::symlink("real.txt", tree.join("alias.txt")).unwrap();

    let mut task = TaskSpec::from_command("cat tree/alias.txt");
    task.inputs.push(tree.clone());

    let host = dir.path().join("host");
    let sync = FileSync::new(PathMapper::new(vec![], &host));
    sync.stage(&task).unwrap();

    let staged = sync.mapper().map(&tree).join("alias.txt");
    let meta = fs::symlink_metadata(&staged).unwrap();
    assert!(meta.file_type().is_symlink());
    // The link resolves inside the staged tree, not back to the source
    assert_eq!(fs::read_to_string(&staged).unwrap(), "payload");
}

#[test]
fn path_map_rule_redirects_staging() {
    let dir = TempDir::new().unwrap();
    let local_data = dir.path().join("projects/alpha");
    fs::create_dir_all(&local_data).unwrap();
    fs::write(local_data.join("input.csv"), "a,b\n").unwrap();

    let remote_data = dir.path().join("cluster/scratch/alpha");
    let rules = vec![PathMapRule {
        local: local_data.clone(),
        remote: remote_data.clone(),
    }];

    let mut task = TaskSpec::from_command("wc -l input.csv");
    task.inputs.push(local_data.join("input.csv"));

    let sync = FileSync::new(PathMapper::new(rules, dir.path().join("host")));
    let staged = sync.stage(&task).unwrap();
    assert_eq!(staged, vec![remote_data.join("input.csv")]);
    assert!(remote_data.join("input.csv").is_file());
}

#[test]
fn input_recorded_in_wrong_case_still_stages() {
    let dir = TempDir::new().unwrap();
    let real = dir.path().join("Dataset.csv");
    fs::write(&real, "1,2\n").unwrap();

    let mut task = TaskSpec::from_command("head dataset.csv");
    // Declared in lowercase; only Dataset.csv exists
    task.inputs.push(dir.path().join("dataset.csv"));

    let sync = FileSync::new(PathMapper::new(vec![], dir.path().join("host")));
    let staged = sync.stage(&task).unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(fs::read_to_string(&staged[0]).unwrap(), "1,2\n");
}

#[test]
fn retrieve_overwrites_stale_local_output() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("result.txt");
    fs::write(&out, "stale").unwrap();

    let mut task = TaskSpec::from_command("produce result");
    task.outputs.push(OutputTarget::local(&out));

    let sync = FileSync::new(PathMapper::new(vec![], dir.path().join("host")));
    let remote = sync.mapper().map(&out);
    fs::create_dir_all(remote.parent().unwrap()).unwrap();
    fs::write(&remote, "fresh").unwrap();

    sync.retrieve(&task).unwrap();
    assert_eq!(fs::read_to_string(&out).unwrap(), "fresh");
}

#[test]
fn explicit_from_host_fetches_extra_files() {
    let dir = TempDir::new().unwrap();
    let log_local = dir.path().join("run.log");

    let mut task = TaskSpec::from_command("work > run.log");
    task.from_host
        .push(FileMap::new(dir.path().join("run.log"), &log_local));

    let sync = FileSync::new(PathMapper::new(vec![], dir.path().join("host")));
    let remote = sync.mapper().map(&dir.path().join("run.log"));
    fs::create_dir_all(remote.parent().unwrap()).unwrap();
    fs::write(&remote, "log lines\n").unwrap();

    let fetched = sync.retrieve(&task).unwrap();
    assert_eq!(fetched, vec![log_local.clone()]);
    assert_eq!(fs::read_to_string(&log_local).unwrap(), "log lines\n");
}
