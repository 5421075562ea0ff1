fn main() {
    // Build metadata (git commit, versions) for `--version` and `/health`.
    if let Err(err) = built::write_built_file() {
        panic!("Failed to acquire build-time information: {err}");
    }
}
