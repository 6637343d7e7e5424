//! Measures the latency and bandwidth of chains whose pages share a physical
//! address bit, to find the bits used by the DRAM bank mapping.

use cache_side_channel::HardwareOracle;
use cache_utils::sched::{set_affinity, try_set_realtime_priority};
use clap::Parser;
use eviction_sets::config::{
    detected_cache_ways, FRACTION_OF_PHYSICAL_MEMORY, L3_THRESH_CYCLES, REALTIME_PRIORITY,
    SWEEP_ITERATIONS, SWEEP_NUM_WAYS,
};
use eviction_sets::{AddressSpace, BankMappingSweeper, CorunnerGroup, Error, SweepConfig};
use log::{error, info, warn};
use std::ops::RangeInclusive;
use std::process;
use std::thread;
use std::time::Duration;

const CORUNNER_WARMUP: Duration = Duration::from_secs(1);

fn parse_range(s: &str) -> Result<RangeInclusive<u32>, String> {
    let (start, end) = s
        .split_once("..=")
        .ok_or_else(|| format!("expected START..=END, got {}", s))?;
    let start: u32 = start.trim().parse().map_err(|e| format!("{}: {}", start, e))?;
    let end: u32 = end.trim().parse().map_err(|e| format!("{}: {}", end, e))?;
    if start > end {
        return Err(format!("empty range {}", s));
    }
    Ok(start..=end)
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache associativity, the chains get one more page
    #[arg(short, long, default_value_t = SWEEP_NUM_WAYS)]
    ways: usize,

    /// Fraction of the physical memory to map
    #[arg(short = 'p', long, default_value_t = FRACTION_OF_PHYSICAL_MEMORY)]
    fraction: f64,

    /// CPU to pin the measuring thread on
    #[arg(short, long)]
    cpu: Option<usize>,

    /// Number of corunner threads generating memory traffic
    #[arg(short = 'n', long, default_value_t = 0)]
    corunners: usize,

    /// CPUs for the corunners, round robin
    #[arg(long, value_delimiter = ',')]
    corunner_cpus: Vec<usize>,

    /// Size of each corunner buffer in MB
    #[arg(long, default_value_t = 16)]
    corunner_mb: usize,

    /// Chain hops per measurement
    #[arg(short, long, default_value_t = SWEEP_ITERATIONS)]
    iterations: usize,

    /// Bank bit to measure
    #[arg(short, long)]
    bank_bit: Option<u32>,

    /// Second bit, set together with the bank bit
    #[arg(short = 's', long, requires = "bank_bit")]
    xor_bit: Option<u32>,

    /// Measure every bit of START..=END against the baseline, the default mode
    #[arg(long, value_parser = parse_range, conflicts_with_all = ["bank_bit", "pairs"])]
    sweep: Option<RangeInclusive<u32>>,

    /// Measure every pair of these bits against the baseline
    #[arg(long, num_args = 2.., conflicts_with = "bank_bit")]
    pairs: Vec<u32>,

    /// Relative latency change from the baseline reported as a bank bit
    #[arg(long, default_value_t = 0.1)]
    tolerance: f64,
}

impl Args {
    fn config(&self) -> SweepConfig {
        let mut config = SweepConfig::with_ways(self.ways);
        config.iterations = self.iterations;
        if let Some(bits) = &self.sweep {
            config.bits = bits.clone();
        }
        config
    }
}

fn run(args: &Args) -> Result<(), Error> {
    if let Some(cpu) = args.cpu {
        if let Err(e) = set_affinity(cpu) {
            warn!("could not pin to cpu {}: {}", cpu, e);
        }
    }

    if let Some(ways) = detected_cache_ways().filter(|&w| w != args.ways) {
        info!("cpuid reports {} ways, using {}", ways, args.ways);
    }

    let space = AddressSpace::setup(args.fraction)?;
    let oracle = HardwareOracle::new(L3_THRESH_CYCLES);
    let mut sweeper = BankMappingSweeper::new(&space, oracle, args.config())?;

    let corunner_size = args.corunner_mb << 20;
    let corunners = CorunnerGroup::spawn_on(args.corunners, corunner_size, &args.corunner_cpus)?;
    if !corunners.is_empty() {
        info!("{} corunners started", corunners.len());
        thread::sleep(CORUNNER_WARMUP);
    }

    try_set_realtime_priority(REALTIME_PRIORITY);

    println!("size: {} MB", space.size() >> 20);
    if !args.pairs.is_empty() {
        let table = sweeper.sweep_pairs(&args.pairs)?;
        print!("{}", table);
        println!("deviating: {:?}", table.deviating_bits(args.tolerance));
    } else if let Some(bit) = args.bank_bit {
        let sample = match args.xor_bit {
            Some(xor_bit) => sweeper.measure_pair(bit, xor_bit)?,
            None => sweeper.measure_bit(bit)?,
        };
        println!("pshift: {}, XOR-pshift: {}", bit, args.xor_bit.unwrap_or(0));
        println!("{}", sample);
    } else {
        let table = sweeper.sweep()?;
        print!("{}", table);
        println!("deviating: {:?}", table.deviating_bits(args.tolerance));
    }

    let hops = corunners.stop();
    if !hops.is_empty() {
        info!("corunner hops: {:?}", hops);
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
