use std::{io, ptr};

use anyhow::bail;
use args::Args;
use getopts::Occur;
use malloc_canary::{CanaryAllocator as Canary, Origin};

const PROGRAM_DESC: &str = "Run malloc_canary against a canned misuse scenario";
const PROGRAM_NAME: &str = "mc_demo";

const SCENARIOS: &str = "clean, leak, zero, scan, overflow-free, overflow-realloc, \
                         double-free, unknown-ignore, capacity, segv";

fn run(scenario: &str) -> Result<(), anyhow::Error> {
    match scenario {
        "clean" => {
            let p = Canary::malloc(32, Origin::here());
            let q = Canary::strdup(b"clean", Origin::here());
            let (r, _) = malloc_canary::canary_format!("{}:{}", "clean", 1);
            unsafe {
                let p = Canary::realloc(p, 64, Origin::here());
                Canary::free(p, Origin::here());
                Canary::free(q, Origin::here());
                Canary::free(r, Origin::here());
                Canary::free(ptr::null_mut::<u8>(), Origin::here());
            }
        }
        "leak" => {
            let a = Canary::malloc(10, Origin::here());
            let b = Canary::calloc(4, 25, Origin::here());
            let c = Canary::strndup(b"ignored buffer", 7, Origin::here());
            Canary::comment(b, Some("buffer A"), Origin::here());
            Canary::comment(b, Some("buffer B"), Origin::here());
            Canary::ignore(c, Origin::here());
            Canary::query(b, Origin::here());
            let _ = a;
        }
        "zero" => {
            let p = Canary::malloc(0, Origin::here());
            println!("zero-size result is null: {}", p.is_null());
        }
        "scan" => {
            let p = Canary::malloc(10, Origin::here());
            Canary::ignore(p, Origin::here());
            unsafe { ptr::write_bytes(p, b'x', 11) };
            let count = Canary::check_overflow();
            println!("overflowed: {}", count);
        }
        "overflow-free" => {
            let p = Canary::malloc(10, Origin::here());
            Canary::comment(p, Some("off by one"), Origin::here());
            unsafe {
                ptr::write_bytes(p, 0, 11);
                Canary::free(p, Origin::here());
            }
        }
        "overflow-realloc" => {
            let p = Canary::malloc(10, Origin::here());
            unsafe {
                *p.add(12) = 1;
                Canary::realloc(p, 20, Origin::here());
            }
        }
        "double-free" => {
            let p = Canary::malloc(10, Origin::here());
            unsafe {
                Canary::free(p, Origin::here());
                Canary::free(p, Origin::here());
            }
        }
        "unknown-ignore" => {
            let local = 0u64;
            Canary::ignore(&local as *const u64, Origin::here());
        }
        "capacity" => {
            for _ in 0..1024 {
                Canary::malloc(1, Origin::here());
            }
        }
        "segv" => {
            malloc_canary::install_signal_handlers();
            let p = Canary::malloc(3, Origin::here());
            Canary::comment(p, Some("before crash"), Origin::here());
            Canary::exit_segv();
        }
        other => bail!("unknown scenario `{}`; expected one of: {}", other, SCENARIOS),
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "s",
        "scenario",
        "Scenario to run",
        "SCENARIO",
        Occur::Req,
        None,
    );
    args.flag("y", "yaml", "Print the live registry as YAML after the scenario");

    args.parse_from_cli()?;

    let scenario: String = args.value_of("scenario")?;
    let yaml: bool = args.value_of("yaml")?;

    run(&scenario)?;

    if yaml {
        serde_yaml::to_writer(io::stdout(), &Canary::snapshot())?;
    }

    Ok(())
}
