//! tritone-emu: tick-level model of the Tritone TPU control core

use std::env;

use anyhow::{anyhow, bail, Context};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use tritone_emu::config::{Config, CoreConfig};
use tritone_emu::device::compute::pack_trits;
use tritone_emu::device::{BufferClass, CommandDescriptor, ReduceOp, SystolicArray};
use tritone_emu::emu::Orchestrator;

/// External memory layout used by the `gemm` command.
const WEIGHT_BASE: u32 = 0x0100;
const ACTIVATION_BASE: u32 = 0x1_0000;
const OUTPUT_BASE: u32 = 0x10_0000;

/// Upper bound on ticks for a single command.
const TICK_LIMIT: u64 = 10_000_000;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1) else {
        print_usage();
        return Ok(());
    };
    let rest = &args[2..];

    match command.as_str() {
        "gemm" => run_gemm(rest),
        "decode" => run_decode(rest),
        "reduce" => run_reduce(rest),
        "--sample-config" => {
            print!("{}", Config::sample_config());
            Ok(())
        }
        "--show-config" => show_config(),
        "-h" | "--help" | "help" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            bail!("unknown command '{}'", other)
        }
    }
}

fn print_usage() {
    println!("tritone-emu: Tritone TPU control core emulator");
    println!();
    println!("Usage:");
    println!("  tritone-emu gemm [--m M] [--n N] [--k K] [--seed S] [--packed] [--wide]");
    println!("  tritone-emu decode <hex descriptor>");
    println!("  tritone-emu reduce <sum|max|min|abssum> <values...>");
    println!("  tritone-emu --sample-config");
    println!("  tritone-emu --show-config");
    println!();
    println!("Set RUST_LOG=debug (or trace) for per-phase (per-beat) logging.");
}

fn core_config() -> anyhow::Result<CoreConfig> {
    Config::get().core_config().context("invalid configuration")
}

fn build_core(config: CoreConfig) -> anyhow::Result<Orchestrator> {
    Orchestrator::new(config, Box::new(SystolicArray::new(config.array_size))).context("invalid configuration")
}

fn show_config() -> anyhow::Result<()> {
    let core = core_config()?;
    println!("Effective configuration");
    println!("=======================");
    println!("array_size       = {}", core.array_size);
    println!("num_banks        = {}", core.num_banks);
    println!("bank_depth       = {}", core.bank_depth);
    println!("max_burst_beats  = {}", core.max_burst_beats);
    println!("bytes_per_beat   = {}", core.bytes_per_beat);
    println!("dma_priority     = {}", core.dma_priority);
    println!("compute_priority = {}", core.compute_priority);
    if let Some(path) = Config::user_config_path() {
        println!();
        println!("User config file: {}", path.display());
    }
    Ok(())
}

/// Value following a `--flag`.
fn flag_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> anyhow::Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(|s| s.as_str())
        .ok_or_else(|| anyhow!("{} needs a value", flag))
}

fn run_gemm(args: &[String]) -> anyhow::Result<()> {
    let config = core_config()?;
    let size = config.array_size;

    let mut m = size;
    let mut n = size;
    let mut k = size;
    let mut seed = 1u64;
    let mut packed = false;
    let mut wide = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--m" => m = flag_value(args, &mut i, "--m")?.parse().context("--m")?,
            "--n" => n = flag_value(args, &mut i, "--n")?.parse().context("--n")?,
            "--k" => k = flag_value(args, &mut i, "--k")?.parse().context("--k")?,
            "--seed" => seed = flag_value(args, &mut i, "--seed")?.parse().context("--seed")?,
            "--packed" => packed = true,
            "--wide" => wide = true,
            other => bail!("unknown gemm option '{}'", other),
        }
        i += 1;
    }

    if m == 0 || n == 0 || m % size != 0 || n % size != 0 {
        bail!("M and N must be non-zero multiples of the array size ({})", size);
    }
    let (m_sel, n_sel) = (m / size, n / size);
    if m_sel > 15 || n_sel > 15 {
        bail!("M and N are limited to 15 x {}", size);
    }
    if k == 0 || k > size {
        bail!("K must be in 1..={}", size);
    }

    let mut rng = SmallRng::seed_from_u64(seed);
    let a: Vec<i32> = (0..m * k).map(|_| rng.random_range(-8..=8)).collect();
    let w: Vec<i32> = (0..n * k)
        .map(|_| if packed { rng.random_range(-1..=1) } else { rng.random_range(-8..=8) })
        .collect();

    let mut core = build_core(config)?;
    let host = core.host_memory_mut();
    host.allocate_region("weights", WEIGHT_BASE as u64, n * k * 4)?;
    host.allocate_region("activations", ACTIVATION_BASE as u64, m * k * 4)?;
    host.allocate_region("output", OUTPUT_BASE as u64, m * n * 4)?;
    if packed {
        let words: Vec<i32> = w.chunks(k).flat_map(pack_trits).collect();
        host.write_words(WEIGHT_BASE as u64, &words);
    } else {
        host.write_words(WEIGHT_BASE as u64, &w);
    }
    host.write_words(ACTIVATION_BASE as u64, &a);

    let mut descriptor = CommandDescriptor::compute_tile(k as u8, m_sel as u8, n_sel as u8)
        .with_transfer()
        .with_irq()
        .with_bases(WEIGHT_BASE as u16, ACTIVATION_BASE, OUTPUT_BASE);
    if packed {
        descriptor = descriptor.with_packed_weights();
    }
    if wide {
        descriptor = descriptor.with_wide_accumulator();
    }
    println!("Descriptor: {}", descriptor);
    println!("Raw:        0x{:032X}", descriptor.encode());

    core.push(descriptor)?;
    core.start();
    let ticks = core.run_until_idle(TICK_LIMIT);

    let status = core.status();
    if !status.done {
        bail!("core did not finish within {} ticks", TICK_LIMIT);
    }
    if let Some(err) = core.last_error() {
        bail!("descriptor failed: {}", err);
    }

    let (lo, hi) = if wide {
        (i32::MIN as i64, i32::MAX as i64)
    } else {
        (i16::MIN as i64, i16::MAX as i64)
    };
    let expected: Vec<i32> = (0..m * n)
        .map(|idx| {
            let (row, col) = (idx / n, idx % n);
            let sum: i64 = (0..k).map(|x| a[row * k + x] as i64 * w[col * k + x] as i64).sum();
            sum.clamp(lo, hi) as i32
        })
        .collect();
    let actual = core.host_memory().read_words(OUTPUT_BASE as u64, m * n);
    let mismatches = expected.iter().zip(&actual).filter(|(e, a)| e != a).count();

    println!();
    println!("GEMM {}x{}x{} on a {}x{} array", m, n, k, size, size);
    println!("  Ticks:            {}", ticks);
    println!("  Tiles:            {}", core.scheduler().stats().tiles_completed);
    println!("  MACs:             {}", core.scheduler().array().mac_count());
    println!("  Zero skips:       {}", core.scheduler().array().zero_skip_count());
    println!("  Bursts:           {}", core.dma().stats().bursts);
    println!("  DMA stall ticks:  {}", core.dma().stats().stall_ticks);
    for class in BufferClass::ALL {
        println!(
            "  {:<10} conflicts={} grants={}",
            class.to_string(),
            core.arbiter(class).stats().total_conflicts,
            core.arbiter(class).stats().grants
        );
    }

    if mismatches > 0 {
        bail!("{} of {} outputs differ from the reference", mismatches, m * n);
    }
    println!("  Result matches the reference.");
    Ok(())
}

fn run_decode(args: &[String]) -> anyhow::Result<()> {
    let Some(text) = args.first() else {
        bail!("decode needs a hex descriptor");
    };
    let d = CommandDescriptor::parse_hex(text)?;
    println!("{}", d);
    println!();
    println!("  opcode           {} (0x{:02X})", d.opcode, d.opcode.to_bits());
    println!("  chain            {}", d.chain);
    println!("  irq              {}", d.irq_enable);
    println!("  use_transfer     {}", d.use_transfer);
    println!("  pack_weights     {}", d.pack_weights);
    println!("  wide_accumulator {}", d.wide_accumulator);
    println!("  dataflow         {:?}", d.dataflow);
    println!("  tile_id          {}", d.tile_id);
    println!("  output_base      0x{:08X}", d.output_base);
    println!("  activation_base  0x{:08X}", d.activation_base);
    println!("  weight_base      0x{:04X}", d.weight_base);
    println!("  k_tile           {}", d.k_tile);
    println!("  m_sel            {}", d.m_sel);
    println!("  n_sel            {}", d.n_sel);
    let words = d.to_words();
    println!(
        "  words            {:08X} {:08X} {:08X} {:08X}",
        words[0], words[1], words[2], words[3]
    );
    Ok(())
}

fn run_reduce(args: &[String]) -> anyhow::Result<()> {
    let Some((op, values)) = args.split_first() else {
        bail!("reduce needs an operation and values");
    };
    let op: ReduceOp = op.parse().map_err(|e: String| anyhow!(e))?;
    let values = values
        .iter()
        .map(|v| v.parse::<i32>().with_context(|| format!("bad value '{}'", v)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if values.is_empty() || values.len() > u8::MAX as usize {
        bail!("reduce takes 1..={} values", u8::MAX);
    }

    let mut core = build_core(core_config()?)?;
    core.buffers_mut()
        .get_mut(BufferClass::Activation)
        .preload_active(0, &values)?;
    core.push(CommandDescriptor::reduce(values.len() as u8, op.to_bits()))?;
    core.start();
    let ticks = core.run_until_idle(TICK_LIMIT);
    if let Some(err) = core.last_error() {
        bail!("reduction failed: {}", err);
    }

    let result = core.buffers().output().snapshot_active(0, 1)?[0];
    println!("{}({} values) = {}  [{} ticks]", op, values.len(), result, ticks);
    if result != op.apply(&values) {
        bail!("unit result {} differs from reference {}", result, op.apply(&values));
    }
    Ok(())
}
