use std::path::Path;
use std::process::Command;

const TASK1: &[&str] = &[
    "okruglenie-do-razryada",
    "okruglenie-s-izbytkom",
    "okruglenie-s-nedostatkom",
];

fn fipibank() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("fipibank"));
    cmd.env_remove("FIPIBANK_ENV_FILE")
        .env_remove("FIPIBANK_DATA_DIR")
        .env_remove("FIPIBANK_TAXONOMY")
        .env("RUST_LOG", "warn");
    cmd
}

fn put_labeled(root: &Path, task: u32, sub: &str, n: usize) {
    let dir = root.join("ege/basic").join(task.to_string()).join(sub);
    std::fs::create_dir_all(&dir).unwrap();
    for i in 0..n {
        let v = serde_json::json!({ "taskNo": task, "subtopic": sub });
        std::fs::write(dir.join(format!("r{i}.json")), v.to_string()).unwrap();
    }
}

#[test]
fn gate_passes_when_every_cell_meets_quota_and_fails_otherwise() {
    let tmp = tempfile::tempdir().unwrap();
    for sub in TASK1 {
        put_labeled(tmp.path(), 1, sub, 2);
    }

    let ok = fipibank()
        .args(["gate", "--tasks", "1", "--data-dir"])
        .arg(tmp.path())
        .output()
        .expect("run fipibank gate");
    assert_eq!(ok.status.code(), Some(0), "{}", String::from_utf8_lossy(&ok.stderr));
    let v: serde_json::Value = serde_json::from_slice(&ok.stdout).unwrap();
    assert_eq!(v["passed"], true);

    std::fs::remove_file(tmp.path().join("ege/basic/1/okruglenie-s-izbytkom/r1.json")).unwrap();
    let bad = fipibank()
        .args(["gate", "--tasks", "1", "--data-dir"])
        .arg(tmp.path())
        .output()
        .expect("run fipibank gate");
    assert_eq!(bad.status.code(), Some(1));
    let err = String::from_utf8_lossy(&bad.stderr);
    assert!(err.contains("okruglenie-s-izbytkom: 1/2 (need 1)"), "{err}");
    assert!(bad.stdout.is_empty());
}

#[test]
fn report_writes_artifacts_and_pick_needed_reads_them() {
    let tmp = tempfile::tempdir().unwrap();
    for sub in TASK1 {
        put_labeled(tmp.path(), 1, sub, 2);
    }
    put_labeled(tmp.path(), 2, "perevod-edinic", 1);

    let out = fipibank()
        .args(["report", "--data-dir"])
        .arg(tmp.path())
        .output()
        .expect("run fipibank report");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["totals"]["have"], 7);

    let reports = tmp.path().join("_reports");
    let md = std::fs::read_to_string(reports.join("coverage.md")).unwrap();
    assert!(md.starts_with("# EGE Basic Coverage"));
    assert!(md.contains("- okruglenie-do-razryada: 2/2 (OK)"));
    assert!(md.contains("- perevod-edinic: 1/2 (1/2)"));
    let csv = std::fs::read_to_string(reports.join("wanted.csv")).unwrap();
    assert!(csv.starts_with("taskNo,subtopic,haveCount,needCount\n"));
    assert!(csv.contains("2,perevod-edinic,1,1\n"));
    assert!(!csv.contains("okruglenie"));
    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(reports.join("coverage.json")).unwrap()).unwrap();
    assert_eq!(json["byTask"]["2"]["perevod-edinic"]["need"], 1);
    assert_eq!(json["quota"], 2);

    let pick = fipibank()
        .args(["pick-needed", "--output", "text", "--data-dir"])
        .arg(tmp.path())
        .output()
        .expect("run fipibank pick-needed");
    assert!(pick.status.success());
    let s = String::from_utf8_lossy(&pick.stdout);
    assert!(s.contains("- Task 2 / perevod-edinic: need 1 (have 1)"), "{s}");
    assert!(!s.contains("Task 1 /"));
}

#[test]
fn pick_needed_without_a_report_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let out = fipibank()
        .args(["pick-needed", "--data-dir"])
        .arg(tmp.path())
        .output()
        .expect("run fipibank pick-needed");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("fipibank report"));
}
