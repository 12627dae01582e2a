fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Packaged builds (no .git directory) pass the commit hash in explicitly
    println!("cargo:rerun-if-env-changed=REVHOOK_GIT_HASH");
    if let Ok(hash) = std::env::var("REVHOOK_GIT_HASH") {
        println!("cargo:rustc-env=REVHOOK_GIT_HASH={}", hash);
    }
}
