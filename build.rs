use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

const DEFAULT_HAZARD_PTR_COUNT: usize = 8;
const MAX_HAZARD_PTR_COUNT: usize = 1024;

const DEFAULT_MAX_THREAD_COUNT: usize = 100;
const MAX_MAX_THREAD_COUNT: usize = 1 << 16;

fn main() {
    println!("cargo:rerun-if-env-changed=HPSMR_HAZARD_PTR_COUNT");
    println!("cargo:rerun-if-env-changed=HPSMR_MAX_THREAD_COUNT");

    let out_dir = env::var("OUT_DIR").expect("no out directory");
    let dest = Path::new(&out_dir).join("build_constants.rs");

    let mut file = File::create(&dest).expect("could not create file");

    let hazard_ptrs = read_var("HPSMR_HAZARD_PTR_COUNT", DEFAULT_HAZARD_PTR_COUNT);
    if hazard_ptrs == 0 || hazard_ptrs > MAX_HAZARD_PTR_COUNT {
        panic!("invalid HPSMR_HAZARD_PTR_COUNT value ({})", hazard_ptrs);
    }

    let threads = read_var("HPSMR_MAX_THREAD_COUNT", DEFAULT_MAX_THREAD_COUNT);
    if threads == 0 || threads > MAX_MAX_THREAD_COUNT {
        panic!("invalid HPSMR_MAX_THREAD_COUNT value ({})", threads);
    }

    writeln!(&mut file, "const DEFAULT_HAZARD_PTR_COUNT: usize = {};", hazard_ptrs)
        .expect("could not write to file");
    writeln!(&mut file, "const DEFAULT_MAX_THREAD_COUNT: usize = {};", threads)
        .expect("could not write to file");
}

fn read_var(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .map_or(Ok(default), |val| val.parse())
        .unwrap_or_else(|_| panic!("failed to parse env variable {}", name))
}
