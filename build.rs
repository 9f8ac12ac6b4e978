fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth lets us scan ─────────────────
    //
    // CBCentralManager stays "unauthorised" for any binary without an embedded
    // Info.plist carrying NSBluetoothAlwaysUsageDescription.  A CLI tool has no
    // bundle, so the plist goes into the __TEXT,__info_plist section of the
    // Mach-O image via the linker's `-sectcreate` flag.
    //
    // `CARGO_CFG_TARGET_OS` is the target OS, so cross builds work as well.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
            println!("cargo:warning=CARGO_MANIFEST_DIR unset, Info.plist not embedded");
            return;
        };
        let plist = format!("{dir}/Info.plist");

        //   ld … -sectcreate __TEXT __info_plist <dir>/Info.plist …
        for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
            println!("cargo:rustc-link-arg={arg}");
        }
        println!("cargo:rerun-if-changed=Info.plist");
    }
}
