use std::env;

use cc::Build;

fn main() {
    println!("cargo:rerun-if-changed=bridge.c");

    // the interposition table only exists for dyld
    let target_os = env::var("CARGO_CFG_TARGET_OS").expect("CARGO_CFG_TARGET_OS not set");
    if target_os != "macos" {
        return;
    }
    Build::new().file("bridge.c").compile("bridge");
}
