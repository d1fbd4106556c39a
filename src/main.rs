//! tlx-afu-sim: software model of a TLX-attached accelerator function unit

use std::env;

use tlx_afu_sim::afu::descriptor::{control, ctx, reg};
use tlx_afu_sim::afu::AfuController;
use tlx_afu_sim::config::Config;
use tlx_afu_sim::tlx::{HostAction, ScriptedHost};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    let mut seed = None;
    let mut max_cycles = None;
    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--sample-config" => {
                print!("{}", Config::sample_config());
                return Ok(());
            }
            "--seed" => {
                seed = Some(parse_number(iter.next(), "--seed")?);
            }
            "--cycles" => {
                max_cycles = Some(parse_number(iter.next(), "--cycles")?);
            }
            other => {
                anyhow::bail!("unknown option {:?} (try --help)", other);
            }
        }
    }

    let config = Config::get();
    let seed = seed.unwrap_or_else(|| config.seed());
    let max_cycles = max_cycles.unwrap_or_else(|| config.max_cycles());

    println!("tlx-afu-sim self-test");
    println!("seed={} max_cycles={}", seed, max_cycles);
    println!();

    let mut host = ScriptedHost::new(config.host_latency());
    host.script(bring_up_script());

    let mut afu = AfuController::new(host, config.send_credit_max(), seed);
    let cycles = afu.run(max_cycles)?;

    let stats = afu.stats();
    println!("Run Summary");
    println!("===========");
    println!("Final state:       {:?}", afu.state());
    println!("Cycles:            {}", cycles);
    println!("Commands issued:   {}", stats.commands_issued);
    println!("Responses handled: {}", stats.responses_handled);
    println!("Host commands:     {}", stats.host_commands);
    println!("Config operations: {}", stats.config_ops);
    println!("Retries:           {}", stats.retries);
    println!("Status flushes:    {}", stats.status_flushes);
    println!();
    println!("Host memory image: {:?}", afu.transport().memory_bytes(STATUS_ADDR, 8));

    Ok(())
}

/// Host address the self-test context flushes its status to.
const STATUS_ADDR: u64 = 0x0001_0000;

/// The canned bring-up: enable, configure three machine slots in context 0
/// (a load, a store and a one-shot interrupt), start the context, let it
/// run, then tear everything down through the external reset.
fn bring_up_script() -> Vec<HostAction> {
    // word0 = enable | opcode<<8 | size_class<<16, delays zero
    let load_always = 2 | (0x10 << 8) | (6 << 16);
    let store_always = 2 | (0x20 << 8) | (6 << 16);
    let interrupt_once = 1 | (0x58 << 8);
    let slot = |n: u64| n * ctx::MACHINE_CONFIG_STRIDE;

    vec![
        HostAction::AnnounceCredits { cmd: 8, data: 8 },
        HostAction::ConfigRead { offset: reg::AFU_IDENT },
        HostAction::ConfigWrite { offset: reg::CONTEXT_COUNT, value: 1 },
        HostAction::ConfigWrite { offset: reg::AFU_CONTROL, value: control::ENABLE },
        // Slot 0: 64-byte loads from a 4 KiB window
        HostAction::MmioWrite { offset: slot(0) + 8, value: 0x0010_0000 },
        HostAction::MmioWrite { offset: slot(0) + 16, value: 0x1000 },
        HostAction::MmioWrite { offset: slot(0), value: load_always },
        // Slot 1: 64-byte stores into a second window
        HostAction::MmioWrite { offset: slot(1) + 8, value: 0x0020_0000 },
        HostAction::MmioWrite { offset: slot(1) + 16, value: 0x1000 },
        HostAction::MmioWrite { offset: slot(1), value: store_always },
        // Slot 2: a single interrupt
        HostAction::MmioWrite { offset: slot(2), value: interrupt_once },
        HostAction::MmioWrite { offset: ctx::STATUS_ADDRESS, value: STATUS_ADDR },
        HostAction::MmioWrite { offset: ctx::CONTEXT_CONTROL, value: ctx::GO },
        HostAction::Idle(200),
        // Wind down: machines off, drain, halt
        HostAction::Reset,
    ]
}

fn parse_number(arg: Option<&String>, flag: &str) -> anyhow::Result<u64> {
    let arg = arg.ok_or_else(|| anyhow::anyhow!("{} needs a value", flag))?;
    arg.parse()
        .map_err(|_| anyhow::anyhow!("{} needs a number, got {:?}", flag, arg))
}

fn print_usage() {
    println!("tlx-afu-sim [options]");
    println!();
    println!("Options:");
    println!("  --seed N         Seed for all pseudo-random draws");
    println!("  --cycles N       Cycle budget for the run");
    println!("  --sample-config  Print a sample config file and exit");
    println!("  -h, --help       Show this help");
    println!();
    println!("Logging is controlled through RUST_LOG (error/warn/info/debug/trace).");
}
