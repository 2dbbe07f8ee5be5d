use std::env::{self, VarError};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const DEFAULT_STATIC_ARENA_SIZE_BYTES: u32 = 1024 * 1024 * 32;
const SEGFIT_STATIC_ARENA_BYTES: &str = "SEGFIT_STATIC_ARENA_BYTES";

fn main() {
    create_static_arena_size_bytes_file();
    export_rerun_rules();
}

fn create_static_arena_size_bytes_file() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR environment variable not provided");
    let dest_path = Path::new(&out_dir).join("segfit_static_arena_size_bytes.txt");
    let size: u32 = match env::var(SEGFIT_STATIC_ARENA_BYTES) {
        Ok(s) => s.parse().expect(
            "Could not interpret SEGFIT_STATIC_ARENA_BYTES as a 32 bit unsigned integer",
        ),
        Err(ve) => match ve {
            VarError::NotPresent => DEFAULT_STATIC_ARENA_SIZE_BYTES,
            VarError::NotUnicode(_) => panic!(
                "Could not interpret SEGFIT_STATIC_ARENA_BYTES as a string representing a 32 bit \
                 unsigned integer"
            ),
        },
    };
    let mut f = File::create(&dest_path)
        .expect("Could not create file to store segfit static arena size metadata.");
    write!(f, "{}", size).expect("Could not write to segfit static arena size metadata file");
    f.flush()
        .expect("Could not flush write to segfit static arena size metadata file");
}

fn export_rerun_rules() {
    println!("cargo:rerun-if-env-changed={}", SEGFIT_STATIC_ARENA_BYTES);
    for path in [
        "./Cargo.toml",
        "./build.rs",
        "./src/lib.rs",
        "./src/imp_static_array.rs",
    ]
    .iter()
    {
        println!("cargo:rerun-if-changed={}", path);
    }
}
