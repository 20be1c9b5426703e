use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=ASCEND_TOOLKIT_HOME");
    println!("cargo:rerun-if-env-changed=ASCEND_HOME_PATH");

    // The simulated driver needs nothing from the host toolkit.
    if env::var_os("CARGO_FEATURE_ACL").is_none() {
        return;
    }

    let toolkit_root = env::var("ASCEND_TOOLKIT_HOME")
        .or_else(|_| env::var("ASCEND_HOME_PATH"))
        .unwrap_or_else(|_| "/usr/local/Ascend/ascend-toolkit/latest".to_string());

    let lib_dir = format!("{}/lib64", toolkit_root);
    if !std::path::Path::new(&lib_dir).exists() {
        println!(
            "cargo:warning=Ascend toolkit libraries not found at {}. Linking may fail.",
            lib_dir
        );
    }

    println!("cargo:rustc-link-search=native={}", lib_dir);
    println!("cargo:rustc-link-lib=dylib=ascendcl");
}
