use std::env;
use std::path::{Path, PathBuf};

const LIB_DIR_ENV: &str = "LLMODEL_LIB_DIR";
const SOURCE_DIR_ENV: &str = "LLMODEL_SOURCE_DIR";
const STATIC_ENV: &str = "LLMODEL_STATIC";

fn link_kind() -> &'static str {
    if env::var_os(STATIC_ENV).is_some() {
        "static"
    } else {
        "dylib"
    }
}

fn link_prebuilt(lib_dir: &Path) {
    if !lib_dir.is_dir() {
        panic!(
            "{LIB_DIR_ENV} is set to {}, which is not a directory",
            lib_dir.display()
        );
    }

    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib={}=llmodel", link_kind());
}

fn compile_llmodel(source_dir: &Path) {
    if std::fs::read_dir(source_dir).is_err() {
        panic!(
            "Could not find {}. Did you point {SOURCE_DIR_ENV} at a gpt4all-backend checkout?",
            source_dir.display()
        );
    }

    println!("cargo:rerun-if-changed={}", source_dir.display());
    println!("Compiling llmodel from {}..", source_dir.display());

    let dst = cmake::Config::new(source_dir)
        .define("BUILD_SHARED_LIBS", if link_kind() == "static" { "OFF" } else { "ON" })
        .build();

    for sub in ["lib", "lib64", "bin"] {
        let dir = dst.join(sub);
        if dir.is_dir() {
            println!("cargo:rustc-link-search=native={}", dir.display());
        }
    }

    println!("cargo:rustc-link-lib={}=llmodel", link_kind());
}

fn main() {
    println!("cargo:rerun-if-env-changed={LIB_DIR_ENV}");
    println!("cargo:rerun-if-env-changed={SOURCE_DIR_ENV}");
    println!("cargo:rerun-if-env-changed={STATIC_ENV}");

    if let Some(lib_dir) = env::var_os(LIB_DIR_ENV) {
        link_prebuilt(&PathBuf::from(lib_dir));
    } else if let Some(source_dir) = env::var_os(SOURCE_DIR_ENV) {
        compile_llmodel(&PathBuf::from(source_dir));
    } else {
        println!(
            "cargo:warning=Neither {LIB_DIR_ENV} nor {SOURCE_DIR_ENV} is set; llmodel will not be linked"
        );
    }
}
