fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let version_script = format!("{manifest_dir}/version_scripts/tysan.map");
    if std::path::Path::new(&version_script).exists() {
        println!("cargo:rustc-cdylib-link-arg=-Wl,--version-script={version_script}");
        // Interceptor symbols are only exported (`no_mangle`) without
        // debug_assertions; tolerate their absence from debug builds.
        if std::env::var_os("CARGO_CFG_DEBUG_ASSERTIONS").is_some() {
            println!("cargo:rustc-cdylib-link-arg=-Wl,--undefined-version");
        }
    }
    println!("cargo:rerun-if-changed=version_scripts/tysan.map");
}
