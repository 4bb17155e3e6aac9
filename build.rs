use std::env;

fn find_libfuse(lib: &str) {
    if pkg_config::Config::new()
        .atleast_version("2.6.0")
        .probe(lib)
        .is_err()
    {
        panic!(
            "libfuse is not installed. For OS X use `osxfuse`, for Linux use the \
             `libfuse-dev` package, or build without the `libfuse` feature."
        );
    }
}

fn main() {
    // The mount helper is the only part that links against libfuse.
    if env::var_os("CARGO_FEATURE_LIBFUSE").is_none() {
        return;
    }
    let target = env::var("TARGET").unwrap();
    if target.ends_with("-apple-darwin") {
        // Use libosxfuse on OS X
        find_libfuse("osxfuse");
    } else if target.contains("-linux-") || target.ends_with("-unknown-freebsd") {
        // Use libfuse on Linux and FreeBSD
        find_libfuse("fuse");
    } else {
        // Fail on unsupported platforms (e.g. Windows)
        panic!("Unsupported target platform");
    }
}
