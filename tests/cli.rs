use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use assert_cmd::Command;
use nst_obj::{ORIGIN_SYMBOL, RelocatableObject, write_object};
use predicates::str::contains;

fn temp_root(tag: &str) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should move forward")
        .as_nanos();
    let root = std::env::temp_dir().join(format!("nst-cli-{tag}-{unique}"));
    std::fs::create_dir_all(&root).expect("failed to create temp root");
    root
}

fn write_fixture(path: &Path, object: &RelocatableObject) {
    write_object(path, object).expect("failed to write fixture object");
}

fn main_object() -> RelocatableObject {
    // call util.helper; hlt
    let mut object = RelocatableObject {
        name: "main".to_owned(),
        code: vec![0x77, 0, 0, 0, 0, 0x01],
        ..Default::default()
    };
    object.outgoing.insert(ORIGIN_SYMBOL.to_owned(), 0);
    object.outgoing.insert("start".to_owned(), 0);
    object.incoming.insert("util.helper".to_owned(), vec![1]);
    object
        .libraries
        .insert("util".to_owned(), "util.nst".to_owned());
    object
}

fn util_object() -> RelocatableObject {
    // nop; ret
    let mut object = RelocatableObject {
        name: "util".to_owned(),
        code: vec![0x00, 0x79],
        ..Default::default()
    };
    object.outgoing.insert(ORIGIN_SYMBOL.to_owned(), 0);
    object.outgoing.insert("helper".to_owned(), 1);
    object
}

#[test]
fn no_args_prints_banner_and_help() {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_nst"));
    cmd.assert()
        .success()
        .stdout(contains("NotSoTiny toolchain, version"))
        .stdout(contains("Usage: nst"))
        .stdout(contains("link"))
        .stdout(contains("dump"));
}

#[test]
fn help_flag_prints_help() {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_nst"));
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(contains("Toolchain for the NotSoTiny architecture"))
        .stdout(contains("Usage: nst"))
        .stdout(contains("link"))
        .stdout(contains("dump"));
}

#[test]
fn link_patches_cross_module_references() {
    let root = temp_root("link");
    let main_path = root.join("main.nso");
    let util_path = root.join("util.nso");
    write_fixture(&main_path, &main_object());
    write_fixture(&util_path, &util_object());

    let out_file = root.join("game.bin");
    let mut link = Command::new(env!("CARGO_BIN_EXE_nst"));
    link.arg("link")
        .arg(&main_path)
        .arg(&util_path)
        .arg("-e")
        .arg("main.start")
        .arg("-o")
        .arg(&out_file)
        .assert()
        .success();

    let image = std::fs::read(&out_file).expect("failed to read linked output");
    // util is placed at 6, helper at 7, and the call site is patched.
    assert_eq!(image, vec![0x77, 7, 0, 0, 0, 0x01, 0x00, 0x79]);
    assert!(!root.join("game.lst").exists());
}

#[test]
fn link_takes_entry_from_config_and_writes_listing() {
    let root = temp_root("config");
    let main_path = root.join("main.nso");
    let util_path = root.join("util.nso");
    write_fixture(&main_path, &main_object());
    write_fixture(&util_path, &util_object());

    let config = root.join("layout.nstld.ron");
    std::fs::write(
        &config,
        r#"(
  base: 0x100,
  align: 8,
  entry: Some("main.start"),
)"#,
    )
    .expect("failed to write linker config");

    let out_file = root.join("game.bin");
    let mut link = Command::new(env!("CARGO_BIN_EXE_nst"));
    link.arg("link")
        .arg(&main_path)
        .arg(&util_path)
        .arg("-T")
        .arg(&config)
        .arg("-o")
        .arg(&out_file)
        .arg("--listing")
        .assert()
        .success();

    assert!(out_file.exists());
    let listing =
        std::fs::read_to_string(root.join("game.lst")).expect("failed to read listing");
    assert!(listing.contains("entry: 00000100"));
    assert!(listing.contains("module util at 000108"));
}

#[test]
fn link_without_entry_fails() {
    let root = temp_root("no-entry");
    let main_path = root.join("main.nso");
    let util_path = root.join("util.nso");
    write_fixture(&main_path, &main_object());
    write_fixture(&util_path, &util_object());

    let mut link = Command::new(env!("CARGO_BIN_EXE_nst"));
    link.arg("link")
        .arg(&main_path)
        .arg(&util_path)
        .assert()
        .failure()
        .stderr(contains("entry symbol must be provided"));
}

#[test]
fn link_reports_undefined_symbols() {
    let root = temp_root("undef");
    let main_path = root.join("main.nso");
    write_fixture(&main_path, &main_object());

    let mut link = Command::new(env!("CARGO_BIN_EXE_nst"));
    link.arg("link")
        .arg(&main_path)
        .arg("-e")
        .arg("main.start")
        .assert()
        .failure()
        .stderr(contains("undefined symbol 'util.helper'"));
}

#[test]
fn dump_prints_tables_and_disassembly() {
    let root = temp_root("dump");
    let main_path = root.join("main.nso");
    write_fixture(&main_path, &main_object());

    let mut dump = Command::new(env!("CARGO_BIN_EXE_nst"));
    dump.arg("dump")
        .arg(&main_path)
        .assert()
        .success()
        .stdout(contains("module main"))
        .stdout(contains("000000: start"))
        .stdout(contains("util.helper at 000001"))
        .stdout(contains("util -> util.nst"))
        .stdout(contains("calla"))
        .stdout(contains("hlt"));
}
