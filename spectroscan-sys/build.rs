#[cfg(feature = "vendor-sdk")]
use std::env;
#[cfg(feature = "vendor-sdk")]
use std::path::PathBuf;

/// Check for common SDK installation paths
#[cfg(feature = "vendor-sdk")]
fn find_sdk_dir() -> Option<PathBuf> {
    let candidates = [
        "/opt/spectroscan/lib",
        "/usr/local/lib/spectroscan",
        "C:\\Program Files\\SpectroScan\\lib",
    ];

    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

fn main() {
    // Linking only happens with the `vendor-sdk` feature so the crate builds
    // on machines without the vendor libraries.
    #[cfg(feature = "vendor-sdk")]
    {
        println!("cargo:rerun-if-env-changed=SPECTROSCAN_SDK_DIR");
        println!("cargo:rerun-if-env-changed=SPECTROSCAN_DSP_LIB");

        let sdk_dir = match env::var("SPECTROSCAN_SDK_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => match find_sdk_dir() {
                Some(found) => {
                    println!(
                        "cargo:warning=SPECTROSCAN_SDK_DIR not set, auto-detected: {}",
                        found.display()
                    );
                    found
                }
                None => {
                    eprintln!("SPECTROSCAN_SDK_DIR must point at the directory holding ftd2xx and the DSP library");
                    std::process::exit(1);
                }
            },
        };

        if !sdk_dir.exists() {
            println!(
                "cargo:warning=SpectroScan SDK path does not exist: {}",
                sdk_dir.display()
            );
            println!("cargo:warning=Linker will search LIBRARY_PATH and standard paths");
        }

        println!("cargo:rustc-link-search=native={}", sdk_dir.display());

        // The DSP library has been shipped under versioned names (SpectroScanDLL_V6.a).
        let dsp_lib = env::var("SPECTROSCAN_DSP_LIB").unwrap_or_else(|_| "SpectroScanDLL".to_string());
        println!("cargo:rustc-link-lib=dylib={}", dsp_lib);

        // build scripts run on the host; ask cargo about the target
        let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
        if target_os == "windows" {
            println!("cargo:rustc-link-lib=dylib=ftd2xx64");
        } else {
            println!("cargo:rustc-link-lib=dylib=ftd2xx");
        }
    }
}
