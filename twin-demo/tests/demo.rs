#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

#[test]
fn demo_merges_across_processes() {
    assert_cmd::Command::cargo_bin("twin-demo")
        .expect("demo binary")
        .assert()
        .success();
}
