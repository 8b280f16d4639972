fn main() {
    // BUILD_DATE and built.rs both feed `eb version`
    let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    println!("cargo:rustc-env=BUILD_DATE={stamp}");

    built::write_built_file().expect("Failed to acquire build-time information");
}
