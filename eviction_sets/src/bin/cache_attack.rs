//! Finds a minimal last level cache eviction set among pages that share the
//! low physical address bits.

use cache_side_channel::HardwareOracle;
use cache_utils::sched::{set_affinity, try_set_realtime_priority};
use clap::Parser;
use eviction_sets::config::{
    detected_cache_ways, FRACTION_OF_PHYSICAL_MEMORY, L3_NUM_WAYS, L3_THRESH_CYCLES, MAX_BIT,
    NUM_READS, REALTIME_PRIORITY,
};
use eviction_sets::{AddressSpace, Error, EvictionSetFinder, ProbeConfig};
use log::{error, info, warn};
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of candidate pages to select
    min_count: usize,

    /// Fraction of the physical memory to map
    #[arg(short = 'p', long, default_value_t = FRACTION_OF_PHYSICAL_MEMORY)]
    fraction: f64,

    /// Cycles per access above which the chain is considered evicted
    #[arg(short, long, default_value_t = L3_THRESH_CYCLES)]
    threshold: u64,

    /// Chain hops per measurement
    #[arg(short, long, default_value_t = NUM_READS)]
    reads: usize,

    /// Physical address bits the candidates must agree on
    #[arg(short, long, default_value_t = MAX_BIT)]
    max_bit: u32,

    /// CPU to pin the measuring thread on
    #[arg(short, long)]
    cpu: Option<usize>,

    /// Measurements per eviction test, majority vote
    #[arg(long, default_value_t = 1)]
    repetitions: u32,
}

impl Args {
    fn config(&self) -> ProbeConfig {
        ProbeConfig {
            fraction_of_physical_memory: self.fraction,
            threshold_cycles: self.threshold,
            num_reads: self.reads,
            repetitions: self.repetitions,
            max_bit: self.max_bit,
        }
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let config = args.config();
    if let Some(cpu) = args.cpu {
        if let Err(e) = set_affinity(cpu) {
            warn!("could not pin to cpu {}: {}", cpu, e);
        }
    }

    let ways = detected_cache_ways().unwrap_or(L3_NUM_WAYS);
    if args.min_count <= ways {
        warn!(
            "{} candidates cannot hold a {} way eviction set and the test address",
            args.min_count, ways
        );
    }

    let space = AddressSpace::setup(config.fraction_of_physical_memory)?;
    let candidates = space.find_candidates(0, config.max_bit, Some(args.min_count))?;
    info!("{} candidates", candidates.len());

    try_set_realtime_priority(REALTIME_PRIORITY);

    let oracle = HardwareOracle::new(config.threshold_cycles);
    let mut finder = EvictionSetFinder::new(&space, oracle, &config);
    match finder.find(&candidates)? {
        Some(ev) => {
            println!("test address: {:#x}", ev.test_address);
            println!("EV ({}):", ev.len());
            println!("{}", ev.members);
        }
        None => println!("no eviction set found"),
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        if e.is_fatal() {
            error!("{}", e);
            process::abort();
        }
        println!("{}", e);
        process::exit(1);
    }
}
